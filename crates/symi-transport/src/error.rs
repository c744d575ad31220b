use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open serial port {path}: {source}")]
    Serial {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connection to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },
    /// The peer went away (EOF, reset or broken pipe)
    #[error("transport disconnected")]
    Disconnected,
    /// `close()` was called on this transport
    #[error("transport closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Map an I/O error, folding connection loss into `Disconnected`
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::Disconnected,
            _ => Self::Io(err),
        }
    }

    /// Whether the owning layer should try to reconnect
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}
