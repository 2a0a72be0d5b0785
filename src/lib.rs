//! # wsframe: RFC 6455 WebSocket framing engine
//!
//! A server-side implementation of the WebSocket framing protocol that
//! accepts TCP connections, performs the HTTP upgrade handshake, and
//! services each connection as a bidirectional message stream. Received
//! application messages are echoed back; the substance of the crate is
//! the framing, fragmentation, masking, and close-handshake state
//! machine between raw TCP and message semantics.
//!
//! ## Design
//!
//! - **Frame codec**: reads and writes the 2-14 byte RFC 6455 header
//!   with full validation on the read path.
//! - **Payload arena**: a fixed-capacity buffer that records one slice
//!   per received fragment, so reassembly is zero-copy and outbound
//!   messages are re-fragmented on the writer's own budget.
//! - **Connection engine**: one task per connection, no shared state,
//!   no locks; control frames interleave with fragmented data messages.
//!
//! No extensions and no subprotocols are negotiated; the reserved
//! header bits must be zero.
//!
//! ## Example
//!
//! ```ignore
//! use tokio::net::TcpListener;
//! use wsframe::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> wsframe::Result<()> {
//!     let listener = TcpListener::bind("0.0.0.0:3000").await?;
//!     Server::new(Config::default()).serve(listener).await
//! }
//! ```

pub mod arena;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod server;

pub use arena::PayloadArena;
pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use frame::{CloseCode, FrameHeader, OpCode};
pub use server::Server;

/// WebSocket GUID appended to the client key during the handshake.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum frame header size (2 + 8 + 4 bytes).
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encodable in the 7-bit length field; also the
/// control-frame payload limit.
pub const SMALL_PAYLOAD_LIMIT: usize = 125;

/// Largest payload encodable with the 16-bit extended length.
pub const MEDIUM_PAYLOAD_LIMIT: usize = 65535;

/// Default payload arena capacity (2 MiB).
pub const DEFAULT_ARENA_CAPACITY: usize = 2 * 1024 * 1024;

/// Default writer buffer size; outbound frames are sized to fit it.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Read buffer size for the buffered stream over the socket.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Per-connection configuration.
///
/// # Example
///
/// ```
/// use wsframe::Config;
///
/// let config = Config::builder()
///     .arena_capacity(512 * 1024)
///     .writer_buffer_size(8 * 1024)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the payload arena; bounds the size of a reassembled
    /// message (default: 2 MiB).
    pub arena_capacity: usize,
    /// Writer buffer size; outbound messages are fragmented so that one
    /// frame fits the buffer (default: 4096).
    pub writer_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            writer_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Create a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload arena capacity in bytes.
    pub fn arena_capacity(mut self, bytes: usize) -> Self {
        self.config.arena_capacity = bytes;
        self
    }

    /// Set the writer buffer size in bytes.
    pub fn writer_buffer_size(mut self, bytes: usize) -> Self {
        self.config.writer_buffer_size = bytes;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}
