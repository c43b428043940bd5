//! Error types for the relay and master-poll subsystem.

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, IceError>;

#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("redirect loop exceeded {0} hops")]
    RedirectLoop(u32),

    #[error("input parse error: {0}")]
    InputParse(String),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("shutdown requested")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("{0}")]
    Other(String),
}

impl IceError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}
