use thiserror::Error;

/// Result type alias shared across the CDN crates.
pub type Result<T> = std::result::Result<T, CdnError>;

/// Error kinds of the pipeline. The HTTP layer maps kinds to status codes;
/// everything below it reports kinds, never statuses.
#[derive(Error, Debug)]
pub enum CdnError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("install failed: {0}")]
    Install(String),

    #[error("analyzer failed: {0}")]
    Analyzer(String),

    #[error("bundler error: {0}")]
    Bundler(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CdnError {
    /// HTTP status for this kind. Bundler and resolve failures surface as a
    /// module-evaluation error body, still under a 500.
    pub fn status(&self) -> u16 {
        match self {
            CdnError::InvalidRequest(_) => 400,
            CdnError::Forbidden(_) => 403,
            CdnError::NotFound(_) => 404,
            CdnError::Timeout(_) => 408,
            CdnError::Upstream(_) => 502,
            CdnError::Resolve(_)
            | CdnError::Install(_)
            | CdnError::Analyzer(_)
            | CdnError::Bundler(_)
            | CdnError::Other(_) => 500,
        }
    }

    /// Whether the error should be delivered as a JS module that throws at
    /// evaluation time, so browser importers see a readable message.
    pub fn as_module_evaluation_error(&self) -> bool {
        matches!(self, CdnError::Resolve(_) | CdnError::Bundler(_))
    }
}
