use crate::account::Kind;

/// A credential strategy that did not produce a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub reason: String,
}

impl std::fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

fn describe_attempts(attempts: &[StrategyFailure]) -> String {
    attempts
        .iter()
        .map(|failure| format!("\n  - {failure}"))
        .collect()
}

fn format_timeout(timeout: &std::time::Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn kind_scope(kind: &Option<Kind>) -> String {
    match kind {
        Some(kind) => format!(" for {kind}"),
        None => String::new(),
    }
}

/// Errors that stop a run, a kind, or a resource.
///
/// Per-action failures never surface as `Error`; they become `Outcome::Failed` entries in the
/// run report instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed after trying every credential strategy:{}", describe_attempts(.attempts))]
    Authentication { attempts: Vec<StrategyFailure> },
    #[error("configuration error{}: {reason}", kind_scope(.kind))]
    Configuration { kind: Option<Kind>, reason: String },
    #[error("failed to enumerate {resource}: {source}")]
    Enumeration {
        resource: String,
        #[source]
        source: TransferError,
    },
    #[error(transparent)]
    Transfer(TransferError),
    #[error("permission denied by role assignment: {0}")]
    PlatformPermission(String),
}

impl Error {
    pub fn configuration(kind: Kind, reason: impl Into<String>) -> Self {
        Error::Configuration {
            kind: Some(kind),
            reason: reason.into(),
        }
    }
}

impl From<TransferError> for Error {
    fn from(error: TransferError) -> Self {
        match error {
            TransferError::PermissionDenied(message) => Error::PlatformPermission(message),
            other => Error::Transfer(other),
        }
    }
}

/// Classification of a single failed data-plane call or bulk-copy invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("call timed out after {}", format_timeout(.0))]
    Timeout(std::time::Duration),
    #[error("throttled by the service (HTTP {status}): {message}")]
    Throttled { status: u16, message: String },
    #[error("access token expired")]
    TokenExpired,
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("malformed resource name: {0}")]
    InvalidName(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("destination exists")]
    AlreadyExists,
    #[error("bulk copy failed: {reason}")]
    BulkCopy { reason: String, transient: bool },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Timeout(_)
            | TransferError::Throttled { .. }
            | TransferError::TokenExpired
            | TransferError::TokenRefresh(_)
            | TransferError::Network(_)
            | TransferError::Busy(_) => true,
            TransferError::BulkCopy { transient, .. } => *transient,
            TransferError::InvalidName(_)
            | TransferError::PermissionDenied(_)
            | TransferError::NotFound(_)
            | TransferError::AlreadyExists
            | TransferError::Unsupported(_)
            | TransferError::Other(_) => false,
        }
    }
}
