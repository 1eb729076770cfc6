use thiserror::Error;

/// Failures that terminate a batch. Transient I/O problems never surface
/// here: an exhausted search degrades to an empty candidate list and an
/// unreachable legal page to an empty identifier set.
#[derive(Error, Debug)]
pub enum EnrichError {
    /// No column in the input table names the company.
    #[error("no company column found")]
    NoCompanyColumn,

    #[error("configuration error: {0}")]
    Config(String),

    /// The chat endpoint could not produce a parseable reply before the
    /// batch started.
    #[error("language model preflight failed")]
    PreflightFailed,

    /// The chat endpoint failed in a non-retryable way mid-batch.
    #[error("language model failure: {0}")]
    LlmUnavailable(String),
}
