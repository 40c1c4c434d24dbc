use crate::collective::{CollectiveKind, DType, DeviceGroupTopology};
use crate::mesh::MeshState;
use crate::DeviceId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resources unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("device {device} on host {host} is already owned by another mesh")]
    ResourceConflict { host: String, device: usize },

    #[error("cannot {operation} on a mesh in state {state}")]
    InvalidState { operation: &'static str, state: MeshState },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no profiling data for {kind} on {topology} with {dtype}")]
    NoProfileData { kind: CollectiveKind, topology: DeviceGroupTopology, dtype: DType },

    #[error("orchestration layer unavailable: {0}")]
    OrchestrationUnavailable(String),

    #[error("{kind} on {topology} with {size} bytes failed after {attempts} attempts: {reason}")]
    CollectiveFailed {
        kind: CollectiveKind,
        topology: DeviceGroupTopology,
        size: u64,
        attempts: usize,
        reason: String,
    },

    #[error("worker of device {device}: {message}")]
    Worker { device: DeviceId, message: String },

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("profiling result codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
