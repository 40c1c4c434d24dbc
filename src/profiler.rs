use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::bounded;
use float_ord::FloatOrd;
use log::{debug, warn};

use crate::collective::{CollectiveKind, DType, DeviceGroupTopology, GroupCommunicator};
use crate::config::ProfilingConfig;
use crate::mesh::MeshState;
use crate::prof_result::ProfilingResult;
use crate::worker::{BufferId, Command, DeviceWorker};
use crate::{Error, Result, SVec};

pub trait CollectiveCostModel {
    /// Estimated seconds for `kind` over `topology` moving a payload of `size` bytes.
    fn estimate_collective(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType) -> Result<f64>;
}

impl CollectiveCostModel for ProfilingResult {
    fn estimate_collective(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType) -> Result<f64> {
        self.estimate(kind, topology, size, dtype)
    }
}

impl<T: CollectiveCostModel + ?Sized> CollectiveCostModel for Arc<T> {
    fn estimate_collective(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType) -> Result<f64> {
        (**self).estimate_collective(kind, topology, size, dtype)
    }
}

/// Measured costs first, the second model where nothing was measured.
impl<T, S> CollectiveCostModel for (T, S) where T: CollectiveCostModel, S: CollectiveCostModel {
    fn estimate_collective(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType) -> Result<f64> {
        match self.0.estimate_collective(kind, topology, size, dtype) {
            Err(Error::NoProfileData { .. }) => self.1.estimate_collective(kind, topology, size, dtype),
            result => result
        }
    }
}

/// Alpha-beta model of a ring collective: a fixed latency per step plus the wire traffic over the bandwidth.
pub struct BandwidthModel {
    pub latency: f64, // seconds per ring step
    pub bandwidth: f64 // bytes per second
}

impl CollectiveCostModel for BandwidthModel {
    fn estimate_collective(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, _dtype: DType) -> Result<f64> {
        let group_size = topology.max_group_size();
        if group_size <= 1 {
            return Ok(0.)
        }
        let steps = match kind {
            CollectiveKind::AllReduce => 2 * (group_size - 1),
            _ => group_size - 1
        };
        Ok(self.latency * steps as f64 + (size as f64) * kind.ring_traffic_factor(group_size) / self.bandwidth)
    }
}

/// Runs `op` until it succeeds, at most `max_retries + 1` times. On failure returns the attempt count and the last error.
pub(crate) fn retry<T>(max_retries: usize, mut op: impl FnMut() -> Result<T>) -> Result<T, (usize, Error)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op() {
            Ok(x) => return Ok(x),
            Err(e) if attempts > max_retries => return Err((attempts, e)),
            Err(e) => warn!("attempt {attempts} failed, retrying: {e}")
        }
    }
}

fn median(mut samples: Vec<f64>) -> f64 {
    samples.sort_by_key(|x| FloatOrd(*x));
    let n = samples.len();
    match n {
        0 => 0.,
        _ if n % 2 == 1 => samples[n / 2],
        _ => (samples[n / 2 - 1] + samples[n / 2]) / 2.
    }
}

fn collective_failed(kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, (attempts, e): (usize, Error)) -> Error {
    match e {
        e @ (Error::Interrupted | Error::InvalidState { .. }) => e,
        e => Error::CollectiveFailed { kind, topology: topology.clone(), size, attempts, reason: e.to_string() }
    }
}

/// Times collectives on the workers of one mesh. The caller holds the mesh exclusively while this runs.
pub(crate) struct CollectiveProfiler<'m> {
    pub workers: &'m [DeviceWorker],
    pub config: &'m ProfilingConfig,
    pub cancelled: &'m AtomicBool,
    pub next_buffer: &'m AtomicUsize,
}

struct Placement {
    device: usize,
    group: usize,
    rank: usize,
    input: BufferId,
    output: BufferId,
    output_bytes: usize,
}

impl CollectiveProfiler<'_> {
    /// Median seconds of `timed_iterations` runs of `kind` over `topology`, after `warmup_iterations` discarded runs.
    pub fn profile(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType) -> Result<f64> {
        let elements = (size / dtype.width() as u64) as usize;
        let mut placements = vec![];

        let timed = self.allocate(kind, topology, elements, dtype, &mut placements)
            .map_err(|e| (1, e))
            .and_then(|_| self.time(kind, topology, dtype, &placements));

        for p in &placements {
            let _ = self.workers[p.device].send(Command::Free { buffer: p.input });
            let _ = self.workers[p.device].send(Command::Free { buffer: p.output });
        }

        timed.map_err(|failure| collective_failed(kind, topology, size, failure))
    }

    // measured seconds, provided every output holds the expected amount of data
    fn time(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, dtype: DType, placements: &[Placement]) -> Result<f64, (usize, Error)> {
        let seconds = self.measure(kind, topology, dtype, placements)?;
        self.verify(placements)?;
        Ok(seconds)
    }

    fn timeout(&self) -> Duration {
        self.config.worker_timeout()
    }

    // placements are pushed before their buffers exist so that a failed allocation still frees what was created
    fn allocate(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, elements: usize, dtype: DType, placements: &mut Vec<Placement>) -> Result<()> {
        for (group_index, group) in topology.groups().iter().enumerate() {
            let (input_elements, output_elements) = kind.buffer_elements(elements, group.len());
            for (rank, device) in group.iter().enumerate() {
                let worker = &self.workers[device.0];
                let first = self.next_buffer.fetch_add(2, Ordering::Relaxed);
                let (input, output) = (BufferId(first), BufferId(first + 1));
                placements.push(Placement { device: device.0, group: group_index, rank, input, output, output_bytes: output_elements * dtype.width() });
                worker.request(self.timeout(), |reply| Command::Allocate { buffer: input, dtype, elements: input_elements, reply })?;
                worker.request(self.timeout(), |reply| Command::Allocate { buffer: output, dtype, elements: output_elements, reply })?;
            }
        }
        Ok(())
    }

    fn measure(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, dtype: DType, placements: &[Placement]) -> Result<f64, (usize, Error)> {
        let mut samples = Vec::with_capacity(self.config.timed_iterations);

        for iteration in 0..self.config.warmup_iterations + self.config.timed_iterations {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err((0, Error::InvalidState { operation: "profile collectives", state: MeshState::ShuttingDown }))
            }
            if crate::interrupted() {
                return Err((0, Error::Interrupted))
            }

            let seconds = retry(self.config.max_retries, || self.run_once(kind, topology, dtype, placements))?;
            if iteration >= self.config.warmup_iterations {
                debug!("{kind} {topology} iteration {iteration}: {seconds:.6}s");
                samples.push(seconds);
            }
        }

        Ok(median(samples))
    }

    /// One synchronized run over every group of the topology. Groups run concurrently; the cost is the slowest device.
    fn run_once(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, dtype: DType, placements: &[Placement]) -> Result<f64> {
        let comms: SVec<_, 2> = topology.groups().iter().map(|g| GroupCommunicator::new(g.len())).collect();

        let mut answers = Vec::with_capacity(placements.len());
        for p in placements {
            let (reply, answer) = bounded(1);
            self.workers[p.device].send(Command::Collective {
                kind, dtype,
                input: p.input,
                output: p.output,
                comm: comms[p.group].clone(),
                rank: p.rank,
                reply
            })?;
            answers.push((p.device, answer));
        }

        let mut slowest = Duration::ZERO;
        let mut failure = None;
        for (device, answer) in answers {
            match self.workers[device].wait(&answer, self.timeout()) {
                Ok(elapsed) => slowest = slowest.max(elapsed),
                Err(e) => failure = failure.or(Some(e))
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(slowest.as_secs_f64())
        }
    }

    // a collective that moved the wrong amount of data must not produce a timing
    fn verify(&self, placements: &[Placement]) -> Result<(), (usize, Error)> {
        for p in placements {
            let worker = &self.workers[p.device];
            let output = worker.request(self.timeout(), |reply| Command::Read { buffer: p.output, reply }).map_err(|e| (1, e))?;
            if output.len() != p.output_bytes {
                return Err((1, Error::Worker {
                    device: worker.device(),
                    message: format!("expected {} output bytes, found {}", p.output_bytes, output.len())
                }))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs() -> DeviceGroupTopology {
        DeviceGroupTopology::new([vec![0, 1], vec![2, 3]]).unwrap()
    }

    fn launch(n: usize) -> (Vec<DeviceWorker>, Vec<std::thread::JoinHandle<()>>) {
        let (ready, confirmed) = crossbeam::channel::unbounded();
        let launched: (Vec<_>, Vec<_>) = (0..n).map(|i| DeviceWorker::launch(crate::DeviceId(i), ready.clone()).unwrap()).unzip();
        for _ in 0..n {
            confirmed.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        launched
    }

    #[test]
    fn failing_iterations_are_retried_then_reported() {
        let (workers, handles) = launch(2);
        let config = ProfilingConfig { warmup_iterations: 1, timed_iterations: 2, max_retries: 2, worker_timeout_ms: 10_000 };
        let (cancelled, next_buffer) = (AtomicBool::new(false), AtomicUsize::new(0));
        let profiler = CollectiveProfiler { workers: &workers, config: &config, cancelled: &cancelled, next_buffer: &next_buffer };
        let topology = DeviceGroupTopology::single(2).unwrap();

        let mut placements = vec![];
        profiler.allocate(CollectiveKind::AllReduce, &topology, 16, DType::Float32, &mut placements).unwrap();
        assert!(profiler.time(CollectiveKind::AllReduce, &topology, DType::Float32, &placements).is_ok());

        // device 1 loses its input, so every run of the collective fails there
        workers[1].send(Command::Free { buffer: placements[1].input }).unwrap();
        let failure = profiler.time(CollectiveKind::AllReduce, &topology, DType::Float32, &placements).unwrap_err();
        match collective_failed(CollectiveKind::AllReduce, &topology, 64, failure) {
            Error::CollectiveFailed { kind, topology: failed_on, size, attempts, reason } => {
                assert_eq!(kind, CollectiveKind::AllReduce);
                assert_eq!(failed_on, topology);
                assert_eq!(size, 64);
                assert_eq!(attempts, 3);
                assert!(reason.contains("no buffer"), "{reason}");
            }
            other => panic!("expected a collective failure, got {other:?}"),
        }

        for worker in &workers {
            worker.send(Command::Shutdown).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn cancellation_is_not_a_collective_failure() {
        let topology = DeviceGroupTopology::single(2).unwrap();
        let cancelled = collective_failed(CollectiveKind::AllGather, &topology, 8, (0, Error::Interrupted));
        assert!(matches!(cancelled, Error::Interrupted));
        let failed = collective_failed(CollectiveKind::AllGather, &topology, 8, (1, Error::invalid("boom")));
        assert!(matches!(failed, Error::CollectiveFailed { size: 8, attempts: 1, .. }));
    }

    #[test]
    fn median_of_odd_and_even_counts() {
        assert_eq!(median(vec![3., 1., 2.]), 2.);
        assert_eq!(median(vec![4., 1., 2., 3.]), 2.5);
        assert_eq!(median(vec![]), 0.);
    }

    #[test]
    fn retry_gives_up_after_the_bound() {
        let mut calls = 0;
        let result: Result<(), _> = retry(2, || {
            calls += 1;
            Err(Error::invalid("flaky"))
        });
        assert!(matches!(result, Err((3, Error::InvalidArgument(_)))));
        assert_eq!(calls, 3);

        let mut calls = 0;
        let result = retry(3, || {
            calls += 1;
            if calls < 3 { Err(Error::invalid("flaky")) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn bandwidth_model_scales_with_group_and_size() {
        let model = BandwidthModel { latency: 1e-6, bandwidth: 1e9 };
        let four = DeviceGroupTopology::single(4).unwrap();

        let all_reduce = model.estimate_collective(CollectiveKind::AllReduce, &four, 1 << 20, DType::Float32).unwrap();
        let all_gather = model.estimate_collective(CollectiveKind::AllGather, &four, 1 << 20, DType::Float32).unwrap();
        assert!(all_reduce > all_gather);
        assert!((all_gather - (3e-6 + 0.75 * (1 << 20) as f64 / 1e9)).abs() < 1e-12);

        let alone = DeviceGroupTopology::single(1).unwrap();
        assert_eq!(model.estimate_collective(CollectiveKind::AllReduce, &alone, 1 << 20, DType::Float32).unwrap(), 0.);
    }

    #[test]
    fn measured_costs_take_precedence_over_the_fallback() {
        let measured = ProfilingResult::new();
        measured.record_all_reduce(&pairs(), 1024, DType::Float32, 0.5).unwrap();
        let model = (measured, BandwidthModel { latency: 0., bandwidth: 1024. });

        assert_eq!(model.estimate_collective(CollectiveKind::AllReduce, &pairs(), 1024, DType::Float32).unwrap(), 0.5);
        // nothing measured for all-gather: (2-1)/2 of 1024 bytes at 1024 B/s
        assert_eq!(model.estimate_collective(CollectiveKind::AllGather, &pairs(), 1024, DType::Float32).unwrap(), 0.5);
    }
}
