use thiserror::Error;

/// Identity of one opened socket. Never reused within a [`crate::Connection`].
pub type SocketId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No host configured, or the socket could not be opened.
    #[error("no connection: {0}")]
    NoConnection(String),

    /// A read or send failed on an established socket.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded. Never aborts the read loop.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("keepalive failed {failures} times on socket {socket}")]
    KeepaliveFailure { socket: SocketId, failures: u32 },
}
