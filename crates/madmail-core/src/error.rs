use std::path::PathBuf;

/// Failure of a single admin API call.
///
/// Transport and application failures are kept apart: a transport failure means
/// no response reached us (the mutation may or may not have been applied), an
/// application failure means the server answered and refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    /// No response at all (connection refused, DNS, TLS, timeout).
    #[error("{message}")]
    Transport { message: String },
    /// The server answered with a non-null `error` field.
    #[error("{message}")]
    Application { status: u16, message: String },
    /// The envelope arrived but its body did not have the expected shape.
    #[error("unexpected response for {resource}: {message}")]
    Decode { resource: String, message: String },
    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },
}

impl AdminError {
    /// Status code in the envelope convention: 0 when nothing answered.
    pub fn status(&self) -> u16 {
        match self {
            AdminError::Application { status, .. } => *status,
            _ => 0,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, AdminError::Transport { .. })
    }
}

/// Why a coordinator operation did not run or did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// Another mutating operation is still in flight.
    #[error("another operation is in progress")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("endpoint and token are required")]
    MissingCredentials,
    #[error(transparent)]
    Admin(#[from] AdminError),
}

/// Failure fetching a console asset from the network.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },
}

/// Errors from the persistent key-value collections.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed store {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
