//! One thread per device. A worker owns the memory of its device and executes the commands sent by its mesh.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::debug;

use crate::collective::{CollectiveKind, DType, GroupCommunicator};
use crate::{DeviceId, Error, Result};

crate::new_usize_type!(pub, BufferId);

pub(crate) type Kernel = Arc<dyn Fn(f32) -> f32 + Send + Sync>;

pub(crate) enum Command {
    /// fills the new buffer with ones of `dtype`
    Allocate { buffer: BufferId, dtype: DType, elements: usize, reply: Sender<Result<()>> },
    Free { buffer: BufferId },
    Read { buffer: BufferId, reply: Sender<Result<Vec<u8>>> },
    Collective {
        kind: CollectiveKind,
        dtype: DType,
        input: BufferId,
        output: BufferId,
        comm: Arc<GroupCommunicator>,
        rank: usize,
        reply: Sender<Result<Duration>>,
    },
    Execute { kernel: Kernel, input: Vec<f32>, reply: Sender<Result<Vec<f32>>> },
    Shutdown,
}

pub(crate) struct DeviceWorker {
    device: DeviceId,
    sender: Sender<Command>,
}

impl DeviceWorker {
    /// Spawns the worker thread. The worker sends its id on `ready` once it accepts commands.
    pub fn launch(device: DeviceId, ready: Sender<DeviceId>) -> Result<(DeviceWorker, JoinHandle<()>)> {
        let (sender, receiver) = unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("meshprof-device-{device}"))
            .spawn(move || {
                let _ = ready.send(device);
                worker_loop(device, receiver)
            })?;
        Ok((DeviceWorker { device, sender }, handle))
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).map_err(|_| Error::Worker { device: self.device, message: "worker exited".into() })
    }

    /// Sends a command built around a fresh reply channel and waits for the answer.
    pub fn request<T>(&self, timeout: Duration, command: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, answer) = bounded(1);
        self.send(command(reply))?;
        self.wait(&answer, timeout)
    }

    pub fn wait<T>(&self, answer: &Receiver<Result<T>>, timeout: Duration) -> Result<T> {
        answer.recv_timeout(timeout).map_err(|e| Error::Worker { device: self.device, message: e.to_string() })?
    }
}

// a buffer of `elements` ones; an allocation that cannot be served is an error instead of an abort
fn filled(dtype: DType, elements: usize) -> std::result::Result<Vec<u8>, String> {
    let bytes = elements.checked_mul(dtype.width()).ok_or_else(|| format!("{elements} {dtype} elements overflow the address space"))?;
    let mut data = Vec::new();
    data.try_reserve_exact(bytes).map_err(|e| format!("cannot allocate {bytes} bytes: {e}"))?;
    data.extend(dtype.one().iter().copied().cycle().take(bytes));
    Ok(data)
}

fn worker_loop(device: DeviceId, receiver: Receiver<Command>) {
    let mut memory: BTreeMap<BufferId, Vec<u8>> = BTreeMap::new();
    let missing = |buffer: BufferId| Error::Worker { device, message: format!("no buffer {buffer}") };

    for command in receiver {
        match command {
            Command::Allocate { buffer, dtype, elements, reply } => {
                let result = filled(dtype, elements)
                    .map(|data| { memory.insert(buffer, data); })
                    .map_err(|message| Error::Worker { device, message });
                let _ = reply.send(result);
            }
            Command::Free { buffer } => {
                memory.remove(&buffer);
            }
            Command::Read { buffer, reply } => {
                let _ = reply.send(memory.get(&buffer).cloned().ok_or_else(|| missing(buffer)));
            }
            Command::Collective { kind, dtype, input, output, comm, rank, reply } => {
                let data = memory.get(&input);
                comm.sync();
                let start = Instant::now();
                let result = comm.run(kind, dtype, rank, data.map(Vec::as_slice).unwrap_or_default());
                let elapsed = start.elapsed();

                let _ = reply.send(match (data.is_some(), memory.get_mut(&output)) {
                    (true, Some(out)) => {
                        *out = result;
                        Ok(elapsed)
                    }
                    (false, _) => Err(missing(input)),
                    (_, None) => Err(missing(output)),
                });
            }
            Command::Execute { kernel, input, reply } => {
                let result = catch_unwind(AssertUnwindSafe(|| input.into_iter().map(|x| kernel(x)).collect::<Vec<f32>>()))
                    .map_err(|_| Error::Worker { device, message: "kernel panicked".into() });
                let _ = reply.send(result);
            }
            Command::Shutdown => break
        }
    }

    debug!("device {device} stopped with {} live buffers", memory.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn launch(n: usize) -> (Vec<DeviceWorker>, Vec<JoinHandle<()>>) {
        let (ready, confirmed) = unbounded();
        let (workers, handles): (Vec<_>, Vec<_>) = (0..n).map(|i| DeviceWorker::launch(DeviceId(i), ready.clone()).unwrap()).unzip();
        for _ in 0..n {
            confirmed.recv_timeout(TIMEOUT).unwrap();
        }
        (workers, handles)
    }

    fn stop(workers: Vec<DeviceWorker>, handles: Vec<JoinHandle<()>>) {
        for worker in &workers {
            worker.send(Command::Shutdown).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn reduce_scatter_across_workers() {
        let (workers, handles) = launch(2);
        let (input, output) = (BufferId(0), BufferId(1));
        for worker in &workers {
            worker.request(TIMEOUT, |reply| Command::Allocate { buffer: input, dtype: DType::Int32, elements: 4, reply }).unwrap();
            worker.request(TIMEOUT, |reply| Command::Allocate { buffer: output, dtype: DType::Int32, elements: 2, reply }).unwrap();
        }

        let comm = GroupCommunicator::new(2);
        let answers: Vec<_> = workers.iter().enumerate().map(|(rank, worker)| {
            let (reply, answer) = bounded(1);
            worker.send(Command::Collective {
                kind: CollectiveKind::ReduceScatter, dtype: DType::Int32, input, output, comm: comm.clone(), rank, reply,
            }).unwrap();
            answer
        }).collect();
        for (worker, answer) in workers.iter().zip(&answers) {
            worker.wait(answer, TIMEOUT).unwrap();
        }

        let expected: Vec<u8> = [2i32, 2].iter().flat_map(|x| x.to_le_bytes()).collect();
        for worker in &workers {
            assert_eq!(worker.request(TIMEOUT, |reply| Command::Read { buffer: output, reply }).unwrap(), expected);
        }

        stop(workers, handles);
    }

    #[test]
    fn missing_buffer_is_reported_without_blocking_peers() {
        let (workers, handles) = launch(2);
        let (input, output) = (BufferId(0), BufferId(1));
        workers[0].request(TIMEOUT, |reply| Command::Allocate { buffer: input, dtype: DType::Float32, elements: 2, reply }).unwrap();
        workers[0].request(TIMEOUT, |reply| Command::Allocate { buffer: output, dtype: DType::Float32, elements: 2, reply }).unwrap();

        let comm = GroupCommunicator::new(2);
        let answers: Vec<_> = workers.iter().enumerate().map(|(rank, worker)| {
            let (reply, answer) = bounded(1);
            worker.send(Command::Collective {
                kind: CollectiveKind::AllReduce, dtype: DType::Float32, input, output, comm: comm.clone(), rank, reply,
            }).unwrap();
            answer
        }).collect();

        assert!(workers[0].wait(&answers[0], TIMEOUT).is_ok());
        assert!(matches!(workers[1].wait(&answers[1], TIMEOUT), Err(Error::Worker { .. })));

        stop(workers, handles);
    }

    #[test]
    fn oversized_allocation_is_an_error() {
        let (workers, handles) = launch(1);
        let huge = workers[0].request(TIMEOUT, |reply| Command::Allocate { buffer: BufferId(0), dtype: DType::Float32, elements: 1 << 60, reply });
        assert!(matches!(huge, Err(Error::Worker { .. })));
        let overflow = workers[0].request(TIMEOUT, |reply| Command::Allocate { buffer: BufferId(1), dtype: DType::Int64, elements: usize::MAX, reply });
        assert!(matches!(overflow, Err(Error::Worker { .. })));

        workers[0].request(TIMEOUT, |reply| Command::Allocate { buffer: BufferId(2), dtype: DType::Float32, elements: 2, reply }).unwrap();
        assert_eq!(workers[0].request(TIMEOUT, |reply| Command::Read { buffer: BufferId(2), reply }).unwrap().len(), 8);

        stop(workers, handles);
    }

    #[test]
    fn panicking_kernel_keeps_worker_alive() {
        let (workers, handles) = launch(1);
        let kernel: Kernel = Arc::new(|x: f32| if x < 0. { panic!("negative") } else { x * 2. });

        let failed = workers[0].request(TIMEOUT, |reply| Command::Execute { kernel: kernel.clone(), input: vec![-1.], reply });
        assert!(failed.is_err());
        let doubled = workers[0].request(TIMEOUT, |reply| Command::Execute { kernel: kernel.clone(), input: vec![1., 2.], reply });
        assert_eq!(doubled.unwrap(), vec![2., 4.]);

        stop(workers, handles);
    }
}
