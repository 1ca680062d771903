use tracing::warn;

// Error type for the engine. Variants map onto the semantic error kinds the
// controller acts on: terminal spec problems stop requeuing until the spec
// changes, everything else requeues with backoff.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("optimistic concurrency conflict on {0}")]
    ConflictRetryable(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("incompatible versions: {0}")]
    IncompatibleVersions(String),

    #[error("promotion requirements not met: {0}")]
    RequirementsNotMet(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("git error: {0}")]
    GitError(#[from] gitsync::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("missing object key")]
    MissingObjectKey,

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Terminal errors are surfaced as conditions and not requeued until
    /// the spec changes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidSpec(_)
                | Self::IncompatibleVersions(_)
                | Self::Unauthorized(_)
                | Self::Fatal(_)
        )
    }

    /// Classify a cluster-API error at the call site.
    #[must_use]
    pub fn classify(err: kube::Error, target: &str) -> Self {
        match err {
            kube::Error::Api(ref response) => match response.code {
                404 => Self::NotFound(target.to_string()),
                409 => Self::ConflictRetryable(target.to_string()),
                429 | 500..=599 => Self::Transient(format!("{target}: {response}")),
                401 | 403 => Self::Unauthorized(target.to_string()),
                _ => Self::KubeError(err),
            },
            kube::Error::Service(_) | kube::Error::HyperError(_) => {
                Self::Transient(format!("{target}: {err}"))
            }
            other => Self::KubeError(other),
        }
    }

    /// The condition reason reported for this error.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::ConflictRetryable(_) => "Conflict",
            Self::Transient(_) | Self::KubeError(_) | Self::GitError(_) => "Transient",
            Self::InvalidSpec(_) => "InvalidSpec",
            Self::IncompatibleVersions(_) => "IncompatibleVersions",
            Self::RequirementsNotMet(_) => "RequirementsNotMet",
            Self::Unauthorized(_) => "Unauthorized",
            Self::SerializationError(_) | Self::MissingObjectKey | Self::ConfigError(_) => {
                "Internal"
            }
            Self::Fatal(_) => "Fatal",
        }
    }
}

/// Replace secret material in a message before it is logged or surfaced.
#[must_use]
pub fn redact(message: &str, secrets: &[&str]) -> String {
    let mut out = message.to_string();
    for secret in secrets {
        if secret.is_empty() {
            continue;
        }
        if out.contains(secret) {
            warn!("redacting credential material from message");
            out = out.replace(secret, "[REDACTED]");
        }
    }
    out
}
