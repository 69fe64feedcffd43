//! Error types crossing the site capability boundary

use thiserror::Error;

/// Result type alias for site capability operations
pub type SiteResult<T> = std::result::Result<T, SiteError>;

/// Errors a site driver can surface to its callers.
///
/// `Unsupported` is the explicit outcome for a verb a site does not
/// implement: permanent, non-retryable, and distinct from a transient
/// failure, so consumers branch on it instead of treating every error alike.
#[derive(Debug, Error)]
pub enum SiteError {
    /// Login failed (bad credential, unreachable endpoint). No job record is
    /// created.
    #[error("authentication failed for site {site}: {reason}")]
    Authentication {
        /// Site whose login was attempted
        site: String,
        /// Driver-reported reason
        reason: String,
    },

    /// Mid-session reset or channel failure. The session layer recovers by
    /// one forced re-login plus one retry before escalating this.
    #[error("connection failure: {0}")]
    TransientConnection(String),

    /// The native command reported failure. Never auto-retried.
    #[error("remote execution failed: {0}")]
    RemoteExecution(String),

    /// The verb is not implemented by this site.
    #[error("capability not supported: {0}")]
    Unsupported(String),

    /// Local filesystem failure (repo copies, staging).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiteError {
    /// Create an authentication error for a named site
    pub fn authentication(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Authentication {
            site: site.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported-capability error for a verb, e.g. `"repo.put"`
    pub fn unsupported(verb: impl Into<String>) -> Self {
        Self::Unsupported(verb.into())
    }

    /// Check if this error is the permanent unsupported-capability outcome
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Check if this error may clear on a re-established session
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConnection(_))
    }
}
