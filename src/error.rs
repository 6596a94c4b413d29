use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExtractError>;

/// Extraction pipeline error types
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// GitLab API returned a non-success status
    #[error("gitlab api error ({status}): {message}")]
    GitLabApi { status: u16, message: String },

    /// Log service returned an error the extractor does not handle
    #[error("log service error ({code}): {message}")]
    LogService { code: String, message: String },

    /// A log query ended in a status other than Complete/Scheduled/Running
    #[error("log query {query_id} ended with unexpected status {status}")]
    QueryFailed { query_id: String, status: String },

    /// A remote response was missing an expected field
    #[error("unexpected api payload: {0}")]
    Payload(String),

    /// An author email could not be resolved via search or the alias table
    #[error("no identity found for {0}")]
    UnknownIdentity(String),

    /// A row of the issue-tracker export could not be parsed
    #[error("malformed issue export row: {0}")]
    IssueExport(String),

    /// The cancellation token was triggered mid-extraction
    #[error("extraction cancelled")]
    Cancelled,

    /// A spawned task failed outside of its own error handling
    #[error("internal error: {0}")]
    Internal(String),

    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// True for errors that end a producer without being a remote failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
