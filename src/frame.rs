//! RFC 6455 frame header codec.
//!
//! The header is 2 to 14 bytes: flags + opcode, a 7-bit length with
//! optional 16/64-bit extension, and an optional 4-byte masking key.
//! Reading validates the wire invariants (reserved bits, reserved
//! opcodes, control-frame limits) so that a successfully decoded header
//! is always well formed.

use std::fmt;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::{MAX_FRAME_HEADER_SIZE, MEDIUM_PAYLOAD_LIMIT, SMALL_PAYLOAD_LIMIT};

// Bit masks for the first two header bytes.
const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OP_BITS: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7f;

/// WebSocket opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame of a fragmented message
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode from the low nibble of the first header byte.
    ///
    /// Returns `None` for the reserved values 0x3-0x7 and 0xB-0xF.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame (Close, Ping, Pong).
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "connection close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// Check whether a raw opcode value is reserved by RFC 6455.
#[inline]
pub fn is_reserved_opcode(value: u8) -> bool {
    matches!(value, 0x3..=0x7 | 0xB..=0xF)
}

/// Close status code carried in the first two bytes of a Close payload.
///
/// Unknown codes are accepted on read and passed through on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Endpoint is going away
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Protocol error
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    /// Data of an unacceptable kind
    pub const UNACCEPTABLE_DATA: CloseCode = CloseCode(1003);
    /// Payload violated its declared type
    pub const VIOLATION: CloseCode = CloseCode(1007);
    /// Message too big to process
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    /// Unexpected condition during processing
    pub const UNEXPECTED_CONDITION: CloseCode = CloseCode(1011);

    /// Diagnostic name for the named codes.
    pub fn name(&self) -> &'static str {
        match *self {
            CloseCode::NORMAL => "normal",
            CloseCode::GOING_AWAY => "going away",
            CloseCode::PROTOCOL_ERROR => "protocol error",
            CloseCode::UNACCEPTABLE_DATA => "unacceptable data",
            CloseCode::VIOLATION => "violation",
            CloseCode::MESSAGE_TOO_BIG => "message too big to process",
            CloseCode::UNEXPECTED_CONDITION => "unexpected error during processing",
            _ => "unknown",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// A WebSocket frame header.
///
/// The connection engine keeps one of these as a scratch record: `read`
/// fills it from the socket and the send path mutates it in place before
/// writing it back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message
    pub fin: bool,
    /// Reserved bits, must be zero without a negotiated extension
    pub rsv: u8,
    /// Frame opcode
    pub op: OpCode,
    /// Mask flag as seen on the wire
    pub masked: bool,
    /// Payload length in octets
    pub length: u64,
    /// Masking key, present iff `masked`
    pub mask: Option<[u8; 4]>,
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            fin: false,
            rsv: 0,
            op: OpCode::Continuation,
            masked: false,
            length: 0,
            mask: None,
        }
    }
}

impl FrameHeader {
    /// Size in bytes of a header with the given payload length and mask flag.
    #[inline]
    pub fn size_for(length: u64, masked: bool) -> usize {
        let ext = if length <= SMALL_PAYLOAD_LIMIT as u64 {
            0
        } else if length <= MEDIUM_PAYLOAD_LIMIT as u64 {
            2
        } else {
            8
        };
        2 + ext + if masked { 4 } else { 0 }
    }

    /// Size in bytes this header occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        Self::size_for(self.length, self.mask.is_some())
    }

    /// Read a header from `src`, replacing the contents of `self`.
    ///
    /// On return the source's cursor sits at the first payload octet.
    /// Fails with [`Error::Protocol`] when the reserved bits are set, the
    /// opcode is reserved, or a control frame is fragmented or longer
    /// than 125 octets; with `Error::Io(UnexpectedEof)` when the source
    /// ends mid-header.
    pub async fn read<R>(&mut self, src: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        src.read_exact(&mut head).await?;

        self.fin = head[0] & FIN_BIT != 0;
        self.rsv = (head[0] & RSV_BITS) >> 4;
        if self.rsv != 0 {
            return Err(Error::Protocol("reserved bits must be zero"));
        }
        self.op = OpCode::from_u8(head[0] & OP_BITS).ok_or(Error::Protocol("reserved opcode"))?;

        self.masked = head[1] & MASK_BIT != 0;
        self.length = match head[1] & LEN_BITS {
            126 => {
                let mut ext = [0u8; 2];
                src.read_exact(&mut ext).await?;
                u16::from_be_bytes(ext) as u64
            }
            127 => {
                let mut ext = [0u8; 8];
                src.read_exact(&mut ext).await?;
                u64::from_be_bytes(ext)
            }
            small => small as u64,
        };

        if self.op.is_control() {
            if !self.fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if self.length > SMALL_PAYLOAD_LIMIT as u64 {
                return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
            }
        }

        self.mask = if self.masked {
            let mut key = [0u8; 4];
            src.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        Ok(())
    }

    /// Encode the header into `buf` in RFC 6455 byte order.
    ///
    /// The mask bit and key are emitted iff `mask` is set; the length
    /// uses the smallest valid encoding.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.op as u8;
        if self.fin {
            b0 |= FIN_BIT;
        }
        buf.put_u8(b0);

        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        if self.length <= SMALL_PAYLOAD_LIMIT as u64 {
            buf.put_u8(mask_bit | self.length as u8);
        } else if self.length <= MEDIUM_PAYLOAD_LIMIT as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.length as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.length);
        }

        if let Some(key) = self.mask {
            buf.put_slice(&key);
        }
    }

    /// Encode and write the header to a buffered sink.
    pub async fn write<W>(&self, dst: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE);
        self.encode(&mut buf);
        dst.write_all(&buf).await?;
        Ok(())
    }
}

/// XOR `data` in place with the repeating 4-byte masking key.
///
/// Applying the same key twice restores the original payload.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
