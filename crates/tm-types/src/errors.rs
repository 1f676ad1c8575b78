use thiserror::Error;

/// Main error type for the Tidemark system
#[derive(Error, Debug)]
pub enum TidemarkError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("export error: {0}")]
    Export(#[from] ExportError),

    #[error("{0}")]
    Interval(#[from] InvalidInterval),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A malformed interval token. Surfaced at configuration time; fatal to the
/// call, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid interval '{token}': {reason}")]
pub struct InvalidInterval {
    pub token: String,
    pub reason: String,
}

impl InvalidInterval {
    pub fn new(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            reason: reason.into(),
        }
    }
}

/// Transient failures against the market data source. The ingestion loop
/// retries these after the configured delay; they never terminate a pair.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {message}")]
    Http { message: String },

    #[error("unexpected HTTP status: {status}")]
    Status { status: u16 },

    #[error("malformed payload: {message}")]
    MalformedPayload { message: String },
}

/// Failures against the relational store. Also retried by the loop; the
/// watermark and candle state are unchanged when one of these is returned.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database connection failed: {message}")]
    Connection { message: String },

    #[error("query execution failed: {message}")]
    Query { message: String },

    #[error("invalid stored value: {message}")]
    Corrupt { message: String },

    #[error("empty batch")]
    EmptyBatch,
}

/// Sequence export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("not enough data: {have} rows, need more than {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("parquet write failed: {message}")]
    WriteFailed { message: String },
}

/// Result type alias for Tidemark operations
pub type TmResult<T> = Result<T, TidemarkError>;
