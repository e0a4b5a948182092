use thiserror::Error;

use crate::tunnel::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed hello: {0}")]
    MalformedHello(ProtocolError),
    #[error("authentication failed")]
    AuthFailure,
    #[error("no available target")]
    NoAvailableTarget,
    #[error("timed out waiting for a data connection")]
    RequestTimeout,
    #[error("cancelled")]
    Cancelled,
    #[error("data connection queue is full")]
    QueueFull,
    #[error("port {0} is owned by a backend with a different secret")]
    RegistryConflict(u16),
    #[error("no backend for port {0}")]
    UnknownBackend(u16),
    #[error("no target {id} on port {port}")]
    UnknownTarget { id: u64, port: u16 },
    #[error("target closed")]
    TargetClosed,
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => TunnelError::Transport(err),
            other => TunnelError::MalformedHello(other),
        }
    }
}

impl TunnelError {
    pub(crate) fn timed_out(what: impl std::fmt::Display) -> Self {
        TunnelError::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}
