use thiserror::Error;

/// Errors returned by the Engine API.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("docker socket not found: {0}")]
    SocketNotFound(String),
}

pub type SwarmResult<T> = Result<T, SwarmError>;

impl SwarmError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// The object does not exist (or no longer exists).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// A create call raced with another creator of the same name.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Api { status: 409, .. } => true,
            Self::Api { message, .. } => message.contains("already exists"),
            _ => false,
        }
    }

    /// A service update was based on a stale spec version.
    pub fn is_out_of_sequence(&self) -> bool {
        matches!(
            self,
            Self::Api { status: 500, message } if message.contains("out of sequence")
        )
    }
}
