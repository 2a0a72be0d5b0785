//! Per-connection protocol engine.
//!
//! A [`Connection`] owns one upgraded stream, one scratch
//! [`FrameHeader`], and one [`PayloadArena`]. The read loop decodes
//! frames in arrival order, interleaves control frames inside
//! fragmented data messages, and drives the two-sided close handshake.
//! Received application messages are echoed back, re-fragmented on the
//! writer's own frame budget rather than the peer's fragmentation.
//!
//! Everything runs on a single task, so the buffers and state are never
//! touched concurrently; the only suspension points are socket reads and
//! the per-frame flush.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, trace, warn};

use crate::arena::PayloadArena;
use crate::error::{Error, Result};
use crate::frame::{apply_mask, CloseCode, FrameHeader, OpCode};
use crate::{handshake, Config, DEFAULT_READ_BUFFER_SIZE, SMALL_PAYLOAD_LIMIT};

/// Close-handshake state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Normal operation
    Open,
    /// We sent a Close and are waiting for the peer's acknowledgment
    Closing,
    /// The peer sent a Close and we are sending ours back
    PeerClosing,
    /// Terminal state; the socket is closed on drop
    Closed,
}

/// A server-side WebSocket connection over an upgraded stream.
pub struct Connection<S> {
    stream: BufStream<S>,
    header: FrameHeader,
    arena: PayloadArena,
    state: ConnectionState,
    /// Opcode of the first frame of an in-progress fragmented message.
    last_message_op: Option<OpCode>,
    /// Largest payload that fits one outbound frame within the writer buffer.
    max_frame_payload: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the HTTP upgrade handshake and return a ready connection.
    pub async fn accept(stream: S, config: &Config) -> Result<Self> {
        let mut stream = BufStream::with_capacity(
            DEFAULT_READ_BUFFER_SIZE,
            config.writer_buffer_size,
            stream,
        );
        handshake::accept(&mut stream).await?;
        Ok(Self::from_parts(stream, config))
    }

    /// Wrap a stream that has already completed the upgrade handshake.
    pub fn from_upgraded(stream: S, config: &Config) -> Self {
        let stream = BufStream::with_capacity(
            DEFAULT_READ_BUFFER_SIZE,
            config.writer_buffer_size,
            stream,
        );
        Self::from_parts(stream, config)
    }

    fn from_parts(stream: BufStream<S>, config: &Config) -> Self {
        let max_frame_payload = config
            .writer_buffer_size
            .saturating_sub(FrameHeader::size_for(config.writer_buffer_size as u64, false))
            .max(1);

        Self {
            stream,
            header: FrameHeader::default(),
            arena: PayloadArena::new(config.arena_capacity),
            state: ConnectionState::Open,
            last_message_op: None,
            max_frame_payload,
        }
    }

    /// Current close-handshake state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the connection has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Service the connection until it closes.
    ///
    /// Returns `Ok` for every protocol-level outcome, including peer
    /// disconnects and failed connections that were answered with a
    /// Close frame. Only write failures and arena invariant violations
    /// surface as errors.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.read_loop().await;
        if self.state == ConnectionState::Closing {
            self.drain().await;
        }
        result
    }

    async fn read_loop(&mut self) -> Result<()> {
        while self.state == ConnectionState::Open {
            if let Err(e) = self.header.read(&mut self.stream).await {
                match e {
                    e if e.is_eof() => {
                        debug!("peer disconnected");
                        self.state = ConnectionState::Closed;
                        return Ok(());
                    }
                    Error::Protocol(reason) => {
                        self.fail(CloseCode::PROTOCOL_ERROR, reason).await;
                        continue;
                    }
                    other => {
                        warn!(error = %other, "failed to read frame header");
                        self.state = ConnectionState::Closed;
                        return Ok(());
                    }
                }
            }

            trace!(
                fin = self.header.fin,
                op = %self.header.op,
                masked = self.header.mask.is_some(),
                length = self.header.length,
                "frame received"
            );

            // A fragmented message admits only continuation frames until
            // its final fragment; control frames may interleave.
            if self.last_message_op.is_some()
                && self.header.op != OpCode::Continuation
                && !self.header.op.is_control()
            {
                self.fail(CloseCode::PROTOCOL_ERROR, "expected continuation frame")
                    .await;
                continue;
            }

            // Control frames are bounded by the codec; data frames are
            // bounded by what the arena still has room for.
            if !self.header.op.is_control()
                && self.header.length > self.arena.remaining_capacity() as u64
            {
                self.fail(
                    CloseCode::MESSAGE_TOO_BIG,
                    "message exceeds payload arena capacity",
                )
                .await;
                continue;
            }

            let length = self.header.length as usize;
            if let Err(e) = self.arena.read(&mut self.stream, length).await {
                if e.is_eof() {
                    debug!("peer disconnected during payload read");
                    self.state = ConnectionState::Closed;
                    return Ok(());
                }
                warn!(error = %e, "failed to read payload frame");
                self.state = ConnectionState::Closed;
                return Err(e);
            }

            match self.header.mask {
                Some(key) => {
                    if let Some(frame) = self.arena.last_mut() {
                        apply_mask(frame, key);
                    }
                }
                None => {
                    self.fail(CloseCode::PROTOCOL_ERROR, "client frame is not masked")
                        .await;
                    continue;
                }
            }

            if self.header.op.is_control() {
                match self.handle_control_frame().await {
                    Ok(()) => {}
                    Err(Error::Protocol(reason)) => {
                        self.fail(CloseCode::PROTOCOL_ERROR, reason).await;
                        continue;
                    }
                    Err(other) => {
                        warn!(error = %other, "failed to handle control frame");
                        self.state = ConnectionState::Closed;
                        return Err(other);
                    }
                }
                // A control frame that arrived inside a fragmented message
                // must not stay in the arena, or reassembly would pick it up.
                if self.last_message_op.is_some() {
                    self.arena.pop();
                }
                continue;
            }

            if !self.header.fin {
                if self.last_message_op.is_none() {
                    self.last_message_op = Some(self.header.op);
                    debug!(op = %self.header.op, "fragmented message started");
                }
                continue;
            }

            // Final fragment: the message carries the opcode of its first
            // frame, not the continuation opcode.
            if let Some(op) = self.last_message_op.take() {
                self.header.op = op;
            }

            match self.send(false).await {
                Ok(()) => self.arena.reset(),
                Err(Error::Protocol(reason)) => {
                    self.fail(CloseCode::PROTOCOL_ERROR, reason).await;
                    continue;
                }
                Err(other) => {
                    warn!(error = %other, "failed to send echo");
                    self.state = ConnectionState::Closed;
                    return Err(other);
                }
            }
        }

        Ok(())
    }

    /// After we initiate a close, read until the peer's acknowledging
    /// Close frame (or EOF) before tearing the connection down.
    async fn drain(&mut self) {
        while self.state == ConnectionState::Closing {
            if self.header.read(&mut self.stream).await.is_err() {
                self.state = ConnectionState::Closed;
                break;
            }

            // Discard the payload; only the opcode matters now.
            let mut payload = (&mut self.stream).take(self.header.length);
            match tokio::io::copy(&mut payload, &mut tokio::io::sink()).await {
                Ok(n) if n == self.header.length => {}
                _ => {
                    self.state = ConnectionState::Closed;
                    break;
                }
            }

            if self.header.op == OpCode::Close {
                debug!("peer acknowledged close");
                self.state = ConnectionState::Closed;
            }
        }
    }

    async fn handle_control_frame(&mut self) -> Result<()> {
        match self.header.op {
            OpCode::Ping => self.header.op = OpCode::Pong,
            // Unsolicited pongs are permitted; answer with a probe of the
            // same shape.
            OpCode::Pong => self.header.op = OpCode::Ping,
            OpCode::Close => {
                if self.state == ConnectionState::Closing {
                    // The peer acknowledged a close we initiated.
                    self.state = ConnectionState::Closed;
                    return Ok(());
                }
                if self.state == ConnectionState::Open {
                    self.state = ConnectionState::PeerClosing;
                }
                return self.send_close(CloseCode::NORMAL).await;
            }
            _ => {}
        }

        // Echo the control payload that was just read into the arena.
        self.send(true).await
    }

    /// Send a Close frame carrying the 2-octet big-endian status.
    ///
    /// Transitions `Open -> Closing` (we initiate) or
    /// `PeerClosing -> Closed` (final acknowledgment of a peer-initiated
    /// close). Any other starting state is invalid.
    pub async fn send_close(&mut self, status: CloseCode) -> Result<()> {
        match self.state {
            ConnectionState::Open => self.state = ConnectionState::Closing,
            ConnectionState::PeerClosing => self.state = ConnectionState::Closed,
            _ => return Err(Error::InvalidState("close handshake already finished")),
        }
        debug!(status = %status, state = ?self.state, "sending close frame");

        self.header.op = OpCode::Close;
        self.header.fin = true;
        self.header.masked = false;
        self.header.mask = None;
        self.header.length = 2;

        self.header.write(&mut self.stream).await?;
        self.stream.write_all(&status.0.to_be_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Answer a peer fault with a Close frame.
    ///
    /// A failed close write aborts the connection outright; no further
    /// writes are attempted.
    async fn fail(&mut self, status: CloseCode, reason: &'static str) {
        warn!(status = %status, reason, "failing connection");
        if let Err(e) = self.send_close(status).await {
            debug!(error = %e, "could not deliver close frame");
            self.state = ConnectionState::Closed;
        }
    }

    /// Write the payload currently in the arena using the scratch header.
    ///
    /// `last_only` sends just the most recently recorded frame (control
    /// replies); otherwise the combined arena contents are sent. The
    /// payload is re-fragmented into frames that fit the writer buffer,
    /// with the continuation opcode on every frame after the first and
    /// FIN on the frame that carries the remainder. Outbound frames are
    /// never masked.
    async fn send(&mut self, last_only: bool) -> Result<()> {
        self.header.masked = false;
        self.header.mask = None;
        self.header.fin = false;

        if self.header.op.is_control() {
            if self.header.length > SMALL_PAYLOAD_LIMIT as u64 {
                return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
            }
            self.header.fin = true;
        }

        if self.header.length == 0 {
            self.header.fin = true;
            self.header.write(&mut self.stream).await?;
            self.stream.flush().await?;
            return Ok(());
        }

        let payload = if last_only {
            self.arena
                .last()
                .ok_or(Error::InvalidState("no frame recorded for last-only send"))?
        } else {
            self.arena.combine()
        };

        let total = payload.len();
        let mut offset = 0usize;
        while offset < total {
            let remaining = total - offset;
            let chunk = remaining.min(self.max_frame_payload);

            self.header.length = chunk as u64;
            if offset > 0 {
                self.header.op = OpCode::Continuation;
            }
            if remaining <= self.max_frame_payload {
                self.header.fin = true;
            }

            trace!(
                fin = self.header.fin,
                op = %self.header.op,
                length = self.header.length,
                "sending frame"
            );

            self.header.write(&mut self.stream).await?;
            self.stream.write_all(&payload[offset..offset + chunk]).await?;
            self.stream.flush().await?;

            offset += chunk;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use super::*;

    /// Encode a client-to-server frame with the given masking key.
    fn client_frame(op: u8, fin: bool, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.push(if fin { 0x80 | op } else { op });
        if payload.len() <= 125 {
            out.push(0x80 | payload.len() as u8);
        } else {
            assert!(payload.len() <= u16::MAX as usize);
            out.push(0x80 | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
        out
    }

    type Finished = (Connection<DuplexStream>, Result<()>);

    fn spawn_connection(server: DuplexStream) -> JoinHandle<Finished> {
        let mut conn = Connection::from_upgraded(server, &Config::default());
        tokio::spawn(async move {
            let result = conn.run().await;
            (conn, result)
        })
    }

    #[tokio::test]
    async fn echoes_single_masked_text_frame() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);

        client
            .write_all(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
            .await
            .unwrap();

        let mut echoed = [0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        drop(client);
        let (conn, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn interleaved_ping_inside_fragmented_message() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);
        let key = [0x01, 0x02, 0x03, 0x04];

        client
            .write_all(&client_frame(0x1, false, b"Hel", key))
            .await
            .unwrap();
        client
            .write_all(&client_frame(0x9, true, b"pp", key))
            .await
            .unwrap();
        client
            .write_all(&client_frame(0x0, true, b"lo", key))
            .await
            .unwrap();

        // The pong echoes the ping body and is never masked.
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x02, b'p', b'p']);

        // The reassembled message comes back as a single text frame.
        let mut text = [0u8; 7];
        client.read_exact(&mut text).await.unwrap();
        assert_eq!(text, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        drop(client);
        let (_, result) = task.await.unwrap();
        result.unwrap();
    }

    #[tokio::test]
    async fn reserved_bit_fails_connection_with_1002() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);

        client.write_all(&[0xC1, 0x00]).await.unwrap();

        let mut close = [0u8; 4];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]);

        drop(client);
        let (conn, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn oversized_announcement_closes_with_1009() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);

        // A 3 MiB text frame against the default 2 MiB arena.
        let mut frame = vec![0x81, 0x80 | 127];
        frame.extend_from_slice(&(3u64 * 1024 * 1024).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        client.write_all(&frame).await.unwrap();

        let mut close = [0u8; 4];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xF1]);

        drop(client);
        let (conn, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn server_initiated_close_completes_on_peer_ack() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::from_upgraded(server, &Config::default());

        conn.send_close(CloseCode::NORMAL).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);

        let task = tokio::spawn(async move {
            let result = conn.run().await;
            (conn, result)
        });

        let mut close = [0u8; 4];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xE8]);

        client
            .write_all(&client_frame(0x8, true, &1000u16.to_be_bytes(), [9, 9, 9, 9]))
            .await
            .unwrap();

        let (conn, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn peer_initiated_close_is_acknowledged_once() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);

        client
            .write_all(&client_frame(0x8, true, &1000u16.to_be_bytes(), [2, 4, 6, 8]))
            .await
            .unwrap();

        let mut close = [0u8; 4];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xE8]);

        let (conn, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Exactly one Close frame: nothing follows it on the stream.
        drop(conn);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn unmasked_client_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);

        client
            .write_all(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'])
            .await
            .unwrap();

        let mut close = [0u8; 4];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]);

        drop(client);
        let (conn, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn new_data_opcode_during_fragmentation_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);
        let key = [0x0a, 0x0b, 0x0c, 0x0d];

        client
            .write_all(&client_frame(0x1, false, b"He", key))
            .await
            .unwrap();
        client
            .write_all(&client_frame(0x1, true, b"y", key))
            .await
            .unwrap();

        let mut close = [0u8; 4];
        client.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xEA]);

        drop(client);
        let (_, result) = task.await.unwrap();
        result.unwrap();
    }

    #[tokio::test]
    async fn large_echo_refragments_on_writer_budget() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = spawn_connection(server);

        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        client
            .write_all(&client_frame(0x2, true, &payload, [5, 6, 7, 8]))
            .await
            .unwrap();

        // A 4096-byte writer buffer leaves 4092 bytes of payload per
        // frame: two full fragments and a final one with the remainder.
        let mut out = Vec::new();
        for (b0, len) in [(0x02u8, 4092u16), (0x00, 4092), (0x80, 1816)] {
            let mut head = [0u8; 4];
            client.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], b0);
            // The mask bit is never set on server frames.
            assert_eq!(head[1], 126);
            assert_eq!(u16::from_be_bytes([head[2], head[3]]), len);

            let mut body = vec![0u8; len as usize];
            client.read_exact(&mut body).await.unwrap();
            out.extend_from_slice(&body);
        }
        assert_eq!(out, payload);

        drop(client);
        let (_, result) = task.await.unwrap();
        result.unwrap();
    }

    #[tokio::test]
    async fn empty_ping_gets_empty_pong() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = spawn_connection(server);

        client
            .write_all(&client_frame(0x9, true, b"", [1, 1, 1, 1]))
            .await
            .unwrap();

        let mut pong = [0u8; 2];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x00]);

        drop(client);
        let (_, result) = task.await.unwrap();
        result.unwrap();
    }
}
