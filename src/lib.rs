use std::sync::atomic::{AtomicBool, Ordering};
use smallvec::SmallVec;

pub type SVec<T, const N: usize = 4> = SmallVec<[T; N]>;

static CTRLC_TRAPPED: AtomicBool = AtomicBool::new(false);
static CTRLC_RECEIVED: AtomicBool = AtomicBool::new(false);

macro_rules! new_usize_type {
    ($visibility: vis, $type_name: ident) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        $visibility struct $type_name(pub usize);

        impl<T: Into<$type_name>> std::ops::Add<T> for $type_name {
            type Output = $type_name;

            fn add(self, rhs: T) -> $type_name {
                $type_name(self.0 + rhs.into().0)
            }
        }

        impl From<usize> for $type_name {
            fn from(x: usize) -> $type_name {
                $type_name(x)
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    }
}

pub(crate) use new_usize_type;

// DeviceId is the logical index of a device inside one mesh, HostId the index of a host in the cluster
new_usize_type!(pub, DeviceId);
new_usize_type!(pub, HostId);

pub mod error;
pub mod config;
pub mod collective;
pub mod prof_result;
pub mod profiler;
mod worker;
pub mod mesh;
pub mod cluster;
pub mod parallelize;

#[cfg(feature = "python")]
mod python;

pub use error::{Error, Result};
pub use config::{Config, ClusterConfig, HostConfig, ProfilingConfig};
pub use collective::{CollectiveKind, DType, DeviceGroupTopology};
pub use prof_result::ProfilingResult;
pub use profiler::{CollectiveCostModel, BandwidthModel};
pub use mesh::{PhysicalMesh, MeshState};
pub use cluster::{DeviceCluster, Orchestrator, LocalOrchestrator, StaticOrchestrator, HostInfo};
pub use parallelize::{parallelize, Array, ParallelFunction};

/// Installs a Ctrl-C handler that makes running profiling loops bail out with [`Error::Interrupted`].
/// Calling it more than once is a no-op.
pub fn trap_ctrlc() -> Result<()> {
    if CTRLC_TRAPPED.swap(true, Ordering::SeqCst) {
        return Ok(())
    }

    ctrlc::set_handler(|| {
        CTRLC_RECEIVED.store(true, Ordering::Relaxed)
    }).map_err(|e| {
        CTRLC_TRAPPED.store(false, Ordering::SeqCst);
        Error::Io(std::io::Error::other(e.to_string()))
    })
}

pub fn interrupted() -> bool {
    CTRLC_RECEIVED.load(Ordering::Relaxed)
}

/// Forget a received Ctrl-C so that the next profiling call can run.
pub fn clear_interrupt() {
    CTRLC_RECEIVED.store(false, Ordering::Relaxed)
}
