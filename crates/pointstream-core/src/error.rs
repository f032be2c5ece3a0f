//! Error types for pointstream-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pointstream-core
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed chunk payload (skipped by the pipeline, never fatal)
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Persistence-layer failures
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The append would overflow the point arena; buffer state is unchanged
    #[error(
        "buffer capacity exceeded: {requested} points at write index {write_index} \
         (capacity {capacity})"
    )]
    CapacityExceeded {
        requested: usize,
        write_index: usize,
        capacity: usize,
    },

    /// The server did not answer the session query in time (transient)
    #[error("session query timed out after {waited_ms} ms")]
    SessionQueryTimeout { waited_ms: u64 },

    /// Stream-level conditions; drive the supervisor's backoff path
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Terminal failure: the supervisor gave up reconnecting
    #[error("retries exhausted after {attempts} consecutive failed attempts")]
    RetriesExhausted { attempts: u32 },

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while validating and decoding an inbound wire chunk
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The message carried no chunk identity
    #[error("chunk is missing its chunk_id")]
    MissingChunkId,

    /// The message carried no session identity
    #[error("chunk {chunk_id} is missing its session_id")]
    MissingSessionId { chunk_id: String },

    /// Coordinate and color arrays must describe the same points
    #[error("chunk {chunk_id}: {coords} coordinate values vs {colors} color values")]
    LengthMismatch {
        chunk_id: String,
        coords: usize,
        colors: usize,
    },

    /// A coordinate was NaN or infinite
    #[error("chunk {chunk_id}: non-finite coordinate at point {index}")]
    NonFiniteCoordinate { chunk_id: String, index: usize },
}

/// Errors from the durable chunk store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic database failure (possibly a transient lock conflict)
    #[error("database error: {0}")]
    Database(String),

    /// The backing storage is out of space
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Schema bootstrap or migration failed
    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    /// A persisted record failed integrity checks on read
    #[error("corrupt chunk record {chunk_id}: {details}")]
    Corruption { chunk_id: String, details: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref msg) = e {
            if code.code == rusqlite::ErrorCode::DiskFull {
                return StoreError::QuotaExceeded(
                    msg.clone().unwrap_or_else(|| "database or disk is full".to_string()),
                );
            }
        }
        StoreError::Database(e.to_string())
    }
}

/// Errors from the long-lived chunk stream
#[derive(Error, Debug)]
pub enum StreamError {
    /// Transport reported an error
    #[error("transport error: {0}")]
    Transport(String),

    /// The stream ended without an explicit error
    #[error("stream ended unexpectedly")]
    Closed,

    /// No message arrived within the liveness timeout
    #[error("stream stalled: no message for {idle_ms} ms")]
    Stalled { idle_ms: u64 },
}

impl Error {
    /// Whether the supervisor should retry after this error.
    ///
    /// Connection-level conditions (stream errors, stalls, session query
    /// timeouts) are retryable; everything else either never reaches the
    /// supervisor or is terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Stream(_) | Error::SessionQueryTimeout { .. } => true,
            // Lock conflicts on the store can clear on the next attempt.
            Error::Storage(StoreError::Database(_)) => true,
            Error::Storage(_)
            | Error::Decode(_)
            | Error::CapacityExceeded { .. }
            | Error::RetriesExhausted { .. }
            | Error::Config(_)
            | Error::Io(_) => false,
        }
    }
}
