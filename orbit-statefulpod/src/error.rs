use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflicting write to {kind} {name}")]
    Conflict { kind: String, name: String },

    #[error("Status index {index} out of range for {len} tracked ordinals")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Status arrays misaligned: {replicas} replica entries, {claims} claim entries")]
    StatusMisaligned { replicas: usize, claims: usize },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Teardown has not finished; the workload finalizer must stay.
    #[error("Teardown still in progress, rechecking in {retry_after:?}")]
    TeardownPending { retry_after: Duration },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Structural violations mean the two status arrays drifted apart; retrying
    /// will not fix them.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::IndexOutOfRange { .. } | Error::StatusMisaligned { .. }
        )
    }

    /// Anything that is neither structural nor a bad configuration is worth
    /// another attempt later.
    pub fn is_transient(&self) -> bool {
        !self.is_structural() && !matches!(self, Error::Configuration(_))
    }
}

/// Treats "already gone" as success for deletes.
pub trait IgnoreNotFound {
    fn ignore_not_found(self) -> Result<()>;
}

impl IgnoreNotFound for Result<()> {
    fn ignore_not_found(self) -> Result<()> {
        match self {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
