use parley_core::EnvelopeError;

use crate::session::SessionState;

/// Failures starting or running the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a session could not be started.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session cannot start from state {0:?}")]
    InvalidState(SessionState),
    #[error("session already registered")]
    AlreadyRegistered,
    #[error("server is full ({max} clients)")]
    RegistryFull { max: usize },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Outcome of a dispatch operation that did not deliver.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed message: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),
    #[error("client {0} not found")]
    ClientNotFound(String),
    #[error("client {0} is no longer connected")]
    ClientDisconnected(String),
}

impl DispatchError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::ClientNotFound(_) => "client_not_found",
            Self::ClientDisconnected(_) => "client_disconnected",
        }
    }
}
