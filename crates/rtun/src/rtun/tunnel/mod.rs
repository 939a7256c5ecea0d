//! Reverse tunnel multiplexer.
//!
//! A client keeps one outbound connection to the server; the server exposes
//! ports on its behalf and carries every accepted connection over that single
//! connection as a virtual stream. Frames are `[0x89 0x89][u32 BE len][payload]`
//! where the payload is `key '#' control data`.

pub mod client;
pub mod frame;
pub mod hooks;
pub mod manager;
pub mod model;
pub mod mux;
pub mod packet;
pub mod relay;
pub mod server;
pub mod stream;
pub mod virtual_io;
pub mod wait;
pub mod writer;

use thiserror::Error;

pub use frame::{FrameCodec, FrameError};
pub use hooks::{
    Dialed, Dialer, Direction, FixedDialer, RegisterHandler, RemoteDialer, Transform,
    TunnelObserver,
};
pub use model::{Dial, DialResponse, Listen, RegisterRequest};
pub use mux::{Tunnel, TunnelOptions};
pub use packet::{Control, MessageType, Packet};
pub use virtual_io::VirtualIo;
pub use wait::{WaitError, WaitRegistry};

const EOF_TEXT: &str = "end of stream";
const CLOSED_TEXT: &str = "use of closed connection";
const NOT_REGISTERED_TEXT: &str = "not registered";
const REMOTE_CLOSED_TEXT: &str = "remote unexpectedly closed connection";

/// Error surfaced by tunnels and virtual streams.
///
/// Cloneable so the terminal error of a tunnel can be handed to every
/// virtual stream and observer it tears down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("{}", EOF_TEXT)]
    Eof,
    #[error("{}", CLOSED_TEXT)]
    Closed,
    #[error("{}", NOT_REGISTERED_TEXT)]
    NotRegistered,
    #[error("{}", REMOTE_CLOSED_TEXT)]
    RemoteClosed,
    #[error("timed out waiting for {0} response")]
    Timeout(&'static str),
    #[error("{0}")]
    Frame(String),
    #[error("io: {0}")]
    Io(String),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error("{0}")]
    Rejected(String),
    /// Error text reported by the peer.
    #[error("{0}")]
    Remote(String),
}

impl TunnelError {
    /// Maps error text received from the peer back to a variant.
    pub fn from_remote(text: &str) -> Self {
        match text {
            "" | EOF_TEXT => TunnelError::Eof,
            CLOSED_TEXT => TunnelError::Closed,
            NOT_REGISTERED_TEXT => TunnelError::NotRegistered,
            REMOTE_CLOSED_TEXT => TunnelError::RemoteClosed,
            other => TunnelError::Remote(other.to_string()),
        }
    }

    /// Text sent to the peer; end-of-stream travels as empty text.
    pub fn wire_text(&self) -> String {
        match self {
            TunnelError::Eof => String::new(),
            other => other.to_string(),
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, TunnelError::Eof)
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TunnelError::Eof,
            _ => TunnelError::Io(err.to_string()),
        }
    }
}

impl From<FrameError> for TunnelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => e.into(),
            other => TunnelError::Frame(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Payload(err.to_string())
    }
}

impl From<TunnelError> for std::io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Eof => std::io::ErrorKind::UnexpectedEof.into(),
            TunnelError::Closed | TunnelError::RemoteClosed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, err)
            }
            TunnelError::Timeout(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, err),
            other => std::io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_text_maps_back_to_variants() {
        for e in [
            TunnelError::Eof,
            TunnelError::Closed,
            TunnelError::NotRegistered,
            TunnelError::RemoteClosed,
        ] {
            assert_eq!(TunnelError::from_remote(&e.wire_text()), e);
        }
        assert_eq!(
            TunnelError::from_remote("incorrect credentials"),
            TunnelError::Remote("incorrect credentials".into())
        );
        assert_eq!(TunnelError::from_remote(EOF_TEXT), TunnelError::Eof);
    }

    #[test]
    fn io_eof_becomes_end_of_stream() {
        let e: TunnelError = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert!(e.is_eof());

        let e: TunnelError = FrameError::Malformed("missing separator").into();
        assert_eq!(e.to_string(), "malformed frame: missing separator");
    }
}
