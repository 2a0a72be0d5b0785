//! HTTP/1.1 upgrade handshake (server side).
//!
//! Reads the request headers line by line up to the terminating blank
//! line, derives the `Sec-WebSocket-Accept` key, and writes the 101
//! response. Lines without a `:` separator are skipped; the only header
//! the acceptor requires is `Sec-WebSocket-Key`.

use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Derive the `Sec-WebSocket-Accept` value for a client key.
///
/// Computes `base64(SHA-1(key + GUID))` per RFC 6455 §4.2.2.
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the 101 Switching Protocols response.
fn build_response(accept_key: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(160);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    buf.put_slice(b"\r\n");
    buf
}

async fn write_http_error<S>(stream: &mut S, code: u16, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(code.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Perform the server-side upgrade handshake on a fresh TCP stream.
///
/// On success the stream is ready for RFC 6455 framing. A request
/// without `Sec-WebSocket-Key` is answered with 400, an I/O failure
/// while parsing with 500; both fail the handshake.
pub async fn accept<S>(stream: &mut S) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let mut key: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        match stream.read_line(&mut line).await {
            Ok(0) => return Err(Error::HandshakeFailed("client disconnected")),
            Ok(_) => {}
            Err(e) => {
                let _ = write_http_error(stream, 500, "Internal Server Error").await;
                return Err(e.into());
            }
        }

        let entry = line.trim_end_matches(['\r', '\n']);
        if entry.is_empty() {
            break;
        }
        // Request line and malformed headers have no separator; skip them.
        let Some((name, value)) = entry.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.trim().to_owned());
        }
    }

    let Some(key) = key else {
        write_http_error(stream, 400, "Bad Request").await?;
        return Err(Error::HandshakeFailed("missing Sec-WebSocket-Key header"));
    };

    let response = build_response(&generate_accept_key(&key));
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};

    use super::*;

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            generate_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn response_carries_accept_and_version() {
        let response = build_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    async fn run_accept(request: &'static [u8]) -> (Result<()>, Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut stream = BufStream::new(server);
            accept(&mut stream).await
        });

        client.write_all(request).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (task.await.unwrap(), response)
    }

    #[tokio::test]
    async fn upgrades_valid_request() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";

        let (result, response) = run_accept(request).await;
        result.unwrap();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("101 Switching Protocols"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[tokio::test]
    async fn skips_lines_without_separator() {
        let request = b"GET / HTTP/1.1\r\n\
            this line has no separator\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            \r\n";

        let (result, response) = run_accept(request).await;
        result.unwrap();
        assert!(std::str::from_utf8(&response)
            .unwrap()
            .contains("101 Switching Protocols"));
    }

    #[tokio::test]
    async fn missing_key_yields_400() {
        let request = b"GET / HTTP/1.1\r\n\
            Host: server.example.com\r\n\
            \r\n";

        let (result, response) = run_accept(request).await;
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
        assert!(std::str::from_utf8(&response)
            .unwrap()
            .starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn disconnect_before_blank_line_fails() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut stream = BufStream::new(server);
            accept(&mut stream).await
        });

        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::HandshakeFailed("client disconnected"))
        ));
    }
}
