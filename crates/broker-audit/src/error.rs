pub trait RetryableError {
    /// Whether the operation may succeed on a later attempt without operator action.
    fn should_retry(&self) -> bool;
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to parse auditor options: {0}")]
    Parse(Box<figment::Error>),
    #[error("Invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl From<figment::Error> for ConfigurationError {
    fn from(err: figment::Error) -> Self {
        ConfigurationError::Parse(Box::new(err))
    }
}

impl ConfigurationError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced through the public auditor contract.
///
/// Failures of asynchronous catalog work never show up here; they are logged by the
/// background worker.
#[derive(thiserror::Error, Debug)]
pub enum AuditorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Auditor must be configured before it is started")]
    NotConfigured,
    #[error("Auditor has not been started")]
    NotStarted,
    #[error("Auditor cannot be reconfigured while it is running")]
    AlreadyStarted,
    #[error("Auditor must be started from within a Tokio runtime")]
    NoRuntime,
    #[error("Auditor has been closed")]
    Closed,
    #[error("Failed to connect to the catalog: {0}")]
    CatalogConnect(#[source] CatalogError),
    #[error("Failed to connect to the resource lister: {0}")]
    ListerConnect(#[source] ListerError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Catalog service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Permission denied by catalog: {0}")]
    PermissionDenied(String),
    #[error("Catalog entity not found: {0}")]
    NotFound(String),
    #[error("Catalog rejected entity `{qualified_name}`: {reason}")]
    Rejected {
        qualified_name: String,
        reason: String,
    },
    #[error("Catalog batch response is missing the result for `{0}`")]
    MissingResult(String),
}

impl RetryableError for CatalogError {
    fn should_retry(&self) -> bool {
        match self {
            CatalogError::ServiceUnavailable(_) | CatalogError::MissingResult(_) => true,
            CatalogError::PermissionDenied(_)
            | CatalogError::NotFound(_)
            | CatalogError::Rejected { .. } => false,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ListerError {
    #[error("Resource lister unavailable: {0}")]
    Unavailable(String),
}

impl RetryableError for ListerError {
    fn should_retry(&self) -> bool {
        match self {
            ListerError::Unavailable(_) => true,
        }
    }
}

/// Failure of a single item inside an otherwise successful batch.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchItemError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Lister(#[from] ListerError),
    #[error("Resource `{0}` no longer exists on the broker")]
    Vanished(String),
}

/// Aborts a whole reconciliation pass. Per-item failures are reported in the
/// [`ReconcileReport`](crate::reconcile::ReconcileReport) instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Catalog call failed during reconciliation: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Resource lister failed during reconciliation: {0}")]
    Lister(#[from] ListerError),
}

impl RetryableError for ReconcileError {
    fn should_retry(&self) -> bool {
        match self {
            ReconcileError::Catalog(e) => e.should_retry(),
            ReconcileError::Lister(e) => e.should_retry(),
        }
    }
}
