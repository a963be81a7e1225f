use thiserror::Error;

/// Errors surfaced while parsing a single telemetry log line. The tailer
/// logs these at debug and moves on; they never stall ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("line is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Errors surfaced from a client control message.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rate limit exceeded, try again in {retry_minutes} min")]
    RateLimited { retry_minutes: u64 },
    #[error("name rejected: {reason}")]
    NameRejected { reason: String },
    #[error("malformed control message: {0}")]
    MalformedMessage(String),
}

/// Errors from the name-moderation store's persistence layer.
#[derive(Debug, Error)]
pub enum NameStoreError {
    #[error("failed to read name map at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write name map at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize name map: {0}")]
    Serialize(#[from] serde_json::Error),
}
