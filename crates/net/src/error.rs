use std::io;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("write of {needed} bytes exceeds buffer capacity ({remaining} left)")]
    Overflow { needed: usize, remaining: usize },
    #[error("read of {needed} bytes past end of buffer ({remaining} left)")]
    Underflow { needed: usize, remaining: usize },
    #[error("unknown message kind byte {0}")]
    UnknownKind(u8),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("peer is not running")]
    NotRunning,
    #[error("client is not connected")]
    NotConnected,
}
