//! Error kinds raised by the ingest and fan-out pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IceError {
    #[error("input parse error: {0}")]
    InputParse(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("frame sync error: {0}")]
    FrameSync(String),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("shutdown requested")]
    Shutdown,
}
