use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{bounded, unbounded};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::cluster::Reservation;
use crate::collective::{CollectiveKind, DType, DeviceGroupTopology};
use crate::config::ProfilingConfig;
use crate::prof_result::ProfilingResult;
use crate::profiler::CollectiveProfiler;
use crate::worker::{Command, DeviceWorker, Kernel};
use crate::{DeviceId, Error, HostId, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshState {
    Created,
    Ready,
    ShuttingDown,
    Shutdown,
}

impl Display for MeshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshState::Created => write!(f, "created"),
            MeshState::Ready => write!(f, "ready"),
            MeshState::ShuttingDown => write!(f, "shutting down"),
            MeshState::Shutdown => write!(f, "shut down"),
        }
    }
}

/// The devices a mesh took from one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPlacement {
    pub host: HostId,
    pub address: String,
    pub physical_devices: Vec<usize>, // device indices on the host
    pub devices: Vec<DeviceId>, // logical ids in the mesh, same order
}

/// A live set of devices spread over one or more hosts.
///
/// Device ids are `0..num_devices()`, assigned host by host. Everything but [`PhysicalMesh::shutdown`]
/// fails with [`Error::InvalidState`] once the mesh is shut down. Dropping the mesh shuts it down.
pub struct PhysicalMesh {
    placement: Vec<HostPlacement>,
    workers: Vec<DeviceWorker>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: RwLock<MeshState>,
    prof_result: Arc<ProfilingResult>,
    config: ProfilingConfig,
    cancelled: AtomicBool,
    exclusive: Mutex<()>, // held while work is dispatched to the devices
    next_buffer: AtomicUsize,
    reservation: Mutex<Option<Reservation>>,
}

impl PhysicalMesh {
    pub(crate) fn launch(placement: Vec<HostPlacement>, reservation: Reservation, config: ProfilingConfig) -> Result<PhysicalMesh> {
        let num_devices = placement.iter().map(|h| h.devices.len()).sum();
        let (ready, confirmed) = unbounded();

        let mut mesh = PhysicalMesh {
            placement,
            workers: Vec::with_capacity(num_devices),
            handles: Mutex::new(Vec::with_capacity(num_devices)),
            state: RwLock::new(MeshState::Created),
            prof_result: Arc::new(ProfilingResult::new()),
            config,
            cancelled: AtomicBool::new(false),
            exclusive: Mutex::new(()),
            next_buffer: AtomicUsize::new(0),
            reservation: Mutex::new(Some(reservation)),
        };

        // a failure from here on drops `mesh`, which stops the workers launched so far
        for i in 0..num_devices {
            let (worker, handle) = DeviceWorker::launch(DeviceId(i), ready.clone())?;
            mesh.workers.push(worker);
            mesh.handles.get_mut().push(handle);
        }

        let deadline = Instant::now() + mesh.config.worker_timeout();
        for _ in 0..num_devices {
            confirmed.recv_deadline(deadline).map_err(|_| Error::ResourceUnavailable(format!("device workers did not start within {}ms", mesh.config.worker_timeout_ms)))?;
        }

        *mesh.state.get_mut() = MeshState::Ready;
        info!("mesh ready: {} devices on {} hosts", num_devices, mesh.placement.len());
        Ok(mesh)
    }

    pub fn state(&self) -> MeshState {
        *self.state.read()
    }

    fn ensure_ready(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            MeshState::Ready => Ok(()),
            state => Err(Error::InvalidState { operation, state })
        }
    }

    pub fn num_devices(&self) -> usize {
        self.workers.len()
    }

    pub fn num_hosts(&self) -> usize {
        self.placement.len()
    }

    /// Devices taken from each host, in host order.
    pub fn devices_per_host(&self) -> Vec<usize> {
        self.placement.iter().map(|h| h.devices.len()).collect()
    }

    pub fn placement(&self) -> &[HostPlacement] {
        &self.placement
    }

    pub fn host_of(&self, device: DeviceId) -> Option<&HostPlacement> {
        self.placement.iter().find(|h| h.devices.contains(&device))
    }

    pub fn prof_result(&self) -> &Arc<ProfilingResult> {
        &self.prof_result
    }

    pub fn default_topologies(&self) -> Vec<DeviceGroupTopology> {
        DeviceGroupTopology::defaults(self.num_devices())
    }

    /// Profiles `kind` over the default topologies. `size_range` holds exponents: each size is `1 << e` bytes.
    pub fn profile_collective(&self, kind: CollectiveKind, size_range: impl IntoIterator<Item = u32>, dtype: DType, verbose: bool) -> Result<()> {
        self.profile_collective_on(kind, size_range, dtype, &self.default_topologies(), verbose)
    }

    /// Times `kind` for every size in `size_range` and every topology, recording the median of each pair.
    /// Repeated calls append samples.
    pub fn profile_collective_on(
        &self,
        kind: CollectiveKind,
        size_range: impl IntoIterator<Item = u32>,
        dtype: DType,
        topologies: &[DeviceGroupTopology],
        verbose: bool,
    ) -> Result<()> {
        let _exclusive = self.exclusive.lock();
        self.ensure_ready("profile collectives")?;

        if self.config.timed_iterations == 0 {
            return Err(Error::invalid("timed_iterations must be at least one"))
        }

        let sizes = size_range.into_iter().map(|e| {
            if e >= 63 {
                return Err(Error::invalid(format!("{kind}: size exponent {e} is too large")))
            }
            let size = 1u64 << e;
            if size < dtype.width() as u64 {
                return Err(Error::invalid(format!("{kind}: {size} bytes hold no {dtype} element")))
            }
            Ok(size)
        }).collect::<Result<Vec<_>>>()?;

        for topology in topologies {
            if let Some(device) = topology.max_device().filter(|d| d.0 >= self.num_devices()) {
                return Err(Error::invalid(format!("{kind} on {topology}: device {device} is not in a mesh of {} devices", self.num_devices())))
            }
        }

        if topologies.is_empty() {
            warn!("{kind}: no topology to profile on a mesh of {} devices", self.num_devices());
        }

        let profiler = CollectiveProfiler {
            workers: &self.workers,
            config: &self.config,
            cancelled: &self.cancelled,
            next_buffer: &self.next_buffer,
        };

        for &size in &sizes {
            for topology in topologies {
                let seconds = profiler.profile(kind, topology, size, dtype)?;
                self.prof_result.record(kind, topology, size, dtype, seconds)?;
                if verbose {
                    info!("{kind} {topology} {size} bytes {dtype}: {:.3} ms", seconds * 1e3);
                } else {
                    debug!("{kind} {topology} {size} bytes {dtype}: {seconds:.6}s");
                }
            }
        }

        Ok(())
    }

    /// Profiles every supported collective over the default topologies.
    pub fn profile_all(&self, size_range: impl IntoIterator<Item = u32>, dtype: DType, verbose: bool) -> Result<()> {
        let sizes: Vec<u32> = size_range.into_iter().collect();
        for kind in CollectiveKind::ALL {
            self.profile_collective(kind, sizes.iter().copied(), dtype, verbose)?;
        }
        Ok(())
    }

    /// Merges a persisted profiling result into this mesh's result.
    pub fn load_prof_result(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_ready("load profiling results")?;
        self.prof_result.merge(&ProfilingResult::load(path)?);
        Ok(())
    }

    pub fn save_prof_result(&self, path: impl AsRef<Path>) -> Result<()> {
        self.prof_result.save(path)
    }

    /// Runs `kernel` over one shard per device and returns the outputs in device order.
    pub(crate) fn run_sharded(&self, kernel: &Kernel, shards: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let _exclusive = self.exclusive.lock();
        self.ensure_ready("run an executable")?;

        if shards.len() != self.num_devices() {
            return Err(Error::invalid(format!("{} shards for {} devices", shards.len(), self.num_devices())))
        }

        let mut answers = Vec::with_capacity(shards.len());
        for (worker, shard) in self.workers.iter().zip(shards) {
            let (reply, answer) = bounded(1);
            worker.send(Command::Execute { kernel: kernel.clone(), input: shard, reply })?;
            answers.push(answer);
        }

        self.workers.iter().zip(&answers).map(|(worker, answer)| worker.wait(answer, self.config.worker_timeout())).collect()
    }

    /// Stops every device worker and releases the devices. Calling it again is a no-op.
    ///
    /// In-flight profiling is cancelled between iterations, never inside one: shutdown first waits for the
    /// running iteration, so one very large iteration delays it by up to that iteration's duration
    /// (bounded per worker reply by `worker_timeout_ms`).
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            match *state {
                MeshState::ShuttingDown | MeshState::Shutdown => return,
                _ => *state = MeshState::ShuttingDown
            }
        }

        self.cancelled.store(true, Ordering::SeqCst);
        let _exclusive = self.exclusive.lock();

        for worker in &self.workers {
            let _ = worker.send(Command::Shutdown);
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("a device worker panicked");
            }
        }

        self.reservation.lock().take();
        *self.state.write() = MeshState::Shutdown;
        info!("mesh of {} devices shut down", self.num_devices());
    }
}

impl Drop for PhysicalMesh {
    fn drop(&mut self) {
        self.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn local_mesh(n: usize) -> PhysicalMesh {
        let placement = vec![HostPlacement {
            host: HostId(0),
            address: "localhost".into(),
            physical_devices: (0..n).collect(),
            devices: (0..n).map(DeviceId).collect(),
        }];
        let table = Arc::new(Mutex::new(BTreeSet::new()));
        let reservation = Reservation::acquire(&table, &placement).unwrap();
        let config = ProfilingConfig { warmup_iterations: 1, timed_iterations: 3, ..ProfilingConfig::default() };
        PhysicalMesh::launch(placement, reservation, config).unwrap()
    }

    #[test]
    fn profiles_every_default_topology() {
        let mesh = local_mesh(4);
        mesh.profile_collective(CollectiveKind::AllReduce, 10..12, DType::Float32, false).unwrap();

        let result = mesh.prof_result();
        assert_eq!(result.len(), 2 * mesh.default_topologies().len());
        for topology in mesh.default_topologies() {
            let sizes: Vec<_> = result.samples(CollectiveKind::AllReduce, &topology, DType::Float32).into_iter().map(|(s, _)| s).collect();
            assert_eq!(sizes, [1 << 10, 1 << 11]);
        }
    }

    #[test]
    fn every_kind_runs_on_an_odd_group() {
        let mesh = local_mesh(3);
        let odd = DeviceGroupTopology::single(3).unwrap();
        for kind in CollectiveKind::ALL {
            mesh.profile_collective_on(kind, [4, 9], DType::BFloat16, &[odd.clone()], true).unwrap();
            assert!(mesh.prof_result().estimate(kind, &odd, 1 << 9, DType::BFloat16).is_ok());
        }
    }

    #[test]
    fn rejects_bad_sizes_and_foreign_devices() {
        let mesh = local_mesh(2);
        let topology = DeviceGroupTopology::single(2).unwrap();
        let outside = DeviceGroupTopology::single(4).unwrap();

        assert!(matches!(mesh.profile_collective_on(CollectiveKind::AllReduce, [63], DType::Float32, &[topology.clone()], false), Err(Error::InvalidArgument(_))));
        assert!(matches!(mesh.profile_collective_on(CollectiveKind::AllReduce, [1], DType::Float64, &[topology], false), Err(Error::InvalidArgument(_))));
        assert!(matches!(mesh.profile_collective_on(CollectiveKind::AllReduce, [10], DType::Float32, &[outside], false), Err(Error::InvalidArgument(_))));
        assert!(mesh.prof_result().is_empty());
    }

    #[test]
    fn shutdown_is_final_and_idempotent() {
        let mesh = local_mesh(2);
        assert_eq!(mesh.state(), MeshState::Ready);
        mesh.shutdown();
        mesh.shutdown();
        assert_eq!(mesh.state(), MeshState::Shutdown);

        let err = mesh.profile_collective(CollectiveKind::AllGather, 10..11, DType::Float32, false).unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: MeshState::Shutdown, .. }));
        let kernel: Kernel = Arc::new(|x: f32| x);
        assert!(mesh.run_sharded(&kernel, vec![vec![], vec![]]).is_err());
    }

    #[test]
    fn shutdown_stops_profiling_in_flight() {
        let mesh = Arc::new(local_mesh(2));
        let topology = DeviceGroupTopology::single(2).unwrap();

        let profiling = {
            let mesh = mesh.clone();
            std::thread::spawn(move || mesh.profile_collective_on(CollectiveKind::AllReduce, std::iter::repeat(12).take(1_000_000), DType::Float32, &[topology], false))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        mesh.shutdown();

        match profiling.join().unwrap() {
            Err(Error::InvalidState { .. }) => {}
            other => panic!("profiling should have been cancelled, got {other:?}"),
        }
        assert_eq!(mesh.state(), MeshState::Shutdown);
    }

    #[test]
    fn unallocatable_sizes_fail_without_aborting() {
        let mesh = local_mesh(2);
        let topology = DeviceGroupTopology::single(2).unwrap();

        match mesh.profile_collective_on(CollectiveKind::AllReduce, [62], DType::Float32, &[topology.clone()], false) {
            Err(Error::CollectiveFailed { kind, topology: failed_on, size, .. }) => {
                assert_eq!(kind, CollectiveKind::AllReduce);
                assert_eq!(failed_on, topology);
                assert_eq!(size, 1 << 62);
            }
            other => panic!("expected a collective failure, got {other:?}"),
        }

        mesh.profile_collective_on(CollectiveKind::AllReduce, [10], DType::Float32, &[topology.clone()], false).unwrap();
        assert_eq!(mesh.prof_result().samples(CollectiveKind::AllReduce, &topology, DType::Float32).len(), 1);
    }

    #[test]
    fn a_dead_worker_fails_the_collective() {
        let mesh = local_mesh(2);
        mesh.workers[1].send(Command::Shutdown).unwrap();
        let handle = mesh.handles.lock().remove(1);
        handle.join().unwrap();

        let topology = DeviceGroupTopology::single(2).unwrap();
        match mesh.profile_collective_on(CollectiveKind::AllGather, [10], DType::Float32, &[topology.clone()], false) {
            Err(Error::CollectiveFailed { kind, topology: failed_on, size, reason, .. }) => {
                assert_eq!((kind, failed_on, size), (CollectiveKind::AllGather, topology, 1 << 10));
                assert!(reason.contains("worker exited"), "{reason}");
            }
            other => panic!("expected a collective failure, got {other:?}"),
        }
        assert!(mesh.prof_result().is_empty());
        mesh.shutdown();
    }

    #[test]
    fn saved_results_merge_into_another_mesh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prof.bin");
        let topology = DeviceGroupTopology::single(2).unwrap();

        let first = local_mesh(2);
        first.prof_result().record_all_gather(&topology, 1 << 12, DType::Float32, 0.01).unwrap();
        first.save_prof_result(&path).unwrap();
        first.shutdown();

        let second = local_mesh(2);
        second.load_prof_result(&path).unwrap();
        assert_eq!(second.prof_result().estimate(CollectiveKind::AllGather, &topology, 1 << 12, DType::Float32).unwrap(), 0.01);
    }
}
