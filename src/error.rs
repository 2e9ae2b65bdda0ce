//! Error types for the anck operator

use thiserror::Error;

/// Errors surfaced by the reconcile loops and their collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Optimistic-concurrency conflict on an update
    #[error("Conflict updating {0}")]
    Conflict(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid stream or operator configuration; retrying cannot succeed
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Resource spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Unparseable duration string
    #[error("Invalid duration: {0}")]
    DurationParse(String),

    /// Credential service returned an error response
    #[error("Credential service error: {0}")]
    CredentialService(String),

    /// Credential service RPC failed
    #[error("Credential service RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// Could not connect to the credential service
    #[error("Credential service transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Broker administrative call failed
    #[error("Broker error in domain {domain}: {message}")]
    Broker { domain: String, message: String },

    /// One or more streams could not be deleted
    #[error("Failed to delete streams in domain {domain}: {}", format_failures(.failures))]
    StreamDeletion {
        domain: String,
        failures: Vec<(String, String)>,
    },

    /// Some nodes of a network could not be brought into participation
    #[error("Participation failed for network {network} on nodes: {}", .nodes.join(", "))]
    NodeParticipation { network: String, nodes: Vec<String> },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Finalizer helper error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::ConfigError(_)
                | Error::ValidationError(_)
                | Error::DurationParse(_)
                | Error::SerializationError(_)
                | Error::YamlError(_)
        )
    }

    /// Optimistic-concurrency conflict, either mapped by the store or straight from the API
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(err)) => err.code == 409,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    /// Short label used for the reconcile error metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::DurationParse(_) => "duration",
            Error::CredentialService(_) => "credentials",
            Error::Rpc(_) => "rpc",
            Error::Transport(_) => "transport",
            Error::Broker { .. } => "broker",
            Error::StreamDeletion { .. } => "stream_deletion",
            Error::NodeParticipation { .. } => "participation",
            Error::SerializationError(_) => "serialization",
            Error::YamlError(_) => "yaml",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerErr;
        match err {
            FinalizerErr::ApplyFailed(e) | FinalizerErr::CleanupFailed(e) => e,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}
