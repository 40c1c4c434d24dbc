use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;

use crate::config::{ClusterConfig, Config, ProfilingConfig};
use crate::mesh::{HostPlacement, PhysicalMesh};
use crate::{DeviceId, Error, HostId, Result};

const NUM_DEVICES_ENV: &str = "MESHPROF_NUM_DEVICES";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostInfo {
    pub address: String,
    pub num_devices: usize,
}

/// The cluster layer that knows which hosts and devices exist.
pub trait Orchestrator: Send + Sync {
    fn discover(&self) -> Result<Vec<HostInfo>>;
}

/// Devices of the current process's host.
pub struct LocalOrchestrator {
    num_devices: Option<usize>,
}

impl LocalOrchestrator {
    /// Uses `MESHPROF_NUM_DEVICES` when set, otherwise one device per CPU.
    pub fn new() -> Self {
        LocalOrchestrator { num_devices: None }
    }

    pub fn with_devices(num_devices: usize) -> Self {
        LocalOrchestrator { num_devices: Some(num_devices) }
    }
}

impl Default for LocalOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator for LocalOrchestrator {
    fn discover(&self) -> Result<Vec<HostInfo>> {
        let num_devices = match (self.num_devices, std::env::var(NUM_DEVICES_ENV)) {
            (Some(n), _) => n,
            (None, Ok(value)) => value.trim().parse().map_err(|_| Error::OrchestrationUnavailable(format!("{NUM_DEVICES_ENV}={value:?} is not a device count")))?,
            (None, Err(_)) => num_cpus::get(),
        };

        if num_devices == 0 {
            return Err(Error::OrchestrationUnavailable("the local host exposes no devices".into()))
        }
        Ok(vec![HostInfo { address: "localhost".into(), num_devices }])
    }
}

/// A fixed host list, optionally guarded by a reachable head address.
pub struct StaticOrchestrator {
    head_address: Option<String>,
    hosts: Vec<HostInfo>,
    probe_timeout: Duration,
}

impl StaticOrchestrator {
    pub fn new(hosts: Vec<HostInfo>) -> Self {
        StaticOrchestrator { head_address: None, hosts, probe_timeout: Duration::from_secs(2) }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        StaticOrchestrator {
            head_address: config.head_address.clone(),
            hosts: config.hosts.iter().map(|h| HostInfo { address: h.address.clone(), num_devices: h.num_devices }).collect(),
            probe_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_head_address(mut self, address: impl Into<String>) -> Self {
        self.head_address = Some(address.into());
        self
    }

    fn probe(&self, address: &str) -> Result<()> {
        let unreachable = |reason: String| Error::OrchestrationUnavailable(format!("head {address}: {reason}"));
        let addrs: Vec<_> = address.to_socket_addrs().map_err(|e| unreachable(e.to_string()))?.collect();
        let mut last_error = "no address".to_string();
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.probe_timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(unreachable(last_error))
    }
}

impl Orchestrator for StaticOrchestrator {
    fn discover(&self) -> Result<Vec<HostInfo>> {
        if let Some(address) = &self.head_address {
            self.probe(address)?;
        }
        if self.hosts.iter().all(|h| h.num_devices == 0) {
            return Err(Error::OrchestrationUnavailable("no host with devices is registered".into()))
        }
        Ok(self.hosts.clone())
    }
}

type DeviceTable = Arc<Mutex<BTreeSet<(HostId, usize)>>>;

/// Exclusive claim on a set of (host, device) pairs, released on drop.
pub(crate) struct Reservation {
    table: DeviceTable,
    devices: Vec<(HostId, usize)>,
}

impl Reservation {
    pub fn acquire(table: &DeviceTable, placement: &[HostPlacement]) -> Result<Reservation> {
        let mut taken = table.lock();
        let devices: Vec<_> = placement.iter()
            .flat_map(|h| h.physical_devices.iter().map(move |&d| (h.host, d)))
            .collect();

        if let Some(&(host, device)) = devices.iter().find(|d| taken.contains(*d)) {
            let address = placement.iter().find(|h| h.host == host).map(|h| h.address.clone()).unwrap_or_default();
            return Err(Error::ResourceConflict { host: address, device })
        }

        taken.extend(devices.iter().copied());
        Ok(Reservation { table: table.clone(), devices })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut taken = self.table.lock();
        for device in &self.devices {
            taken.remove(device);
        }
    }
}

/// Entry point: a handle on the orchestration layer that hands out physical meshes.
///
/// Meshes created by one cluster never share a device. A mesh gives its devices back when it shuts down.
pub struct DeviceCluster {
    orchestrator: Arc<dyn Orchestrator>,
    hosts: Vec<HostInfo>,
    taken: DeviceTable,
    profiling: ProfilingConfig,
}

impl DeviceCluster {
    /// Connects to the local orchestrator.
    pub fn new() -> Result<DeviceCluster> {
        Self::connect(Arc::new(LocalOrchestrator::new()))
    }

    pub fn connect(orchestrator: Arc<dyn Orchestrator>) -> Result<DeviceCluster> {
        let hosts = orchestrator.discover()?;
        info!("cluster: {} hosts, {} devices", hosts.len(), hosts.iter().map(|h| h.num_devices).sum::<usize>());
        Ok(DeviceCluster { orchestrator, hosts, taken: Arc::default(), profiling: ProfilingConfig::default() })
    }

    /// Uses the configured host list, or the local host when none is listed.
    pub fn from_config(config: &Config) -> Result<DeviceCluster> {
        let orchestrator: Arc<dyn Orchestrator> = if config.cluster.hosts.is_empty() && config.cluster.head_address.is_none() {
            Arc::new(LocalOrchestrator::new())
        } else {
            Arc::new(StaticOrchestrator::from_config(&config.cluster))
        };
        Ok(Self::connect(orchestrator)?.with_profiling_config(config.profiling.clone()))
    }

    /// Profiling parameters given to the meshes created from now on.
    pub fn with_profiling_config(mut self, profiling: ProfilingConfig) -> Self {
        self.profiling = profiling;
        self
    }

    /// Asks the orchestrator again for the registered hosts.
    pub fn refresh(&mut self) -> Result<()> {
        self.hosts = self.orchestrator.discover()?;
        Ok(())
    }

    pub fn hosts(&self) -> &[HostInfo] {
        &self.hosts
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn num_devices(&self) -> usize {
        self.hosts.iter().map(|h| h.num_devices).sum()
    }

    /// Devices not held by a live mesh.
    pub fn num_free_devices(&self) -> usize {
        self.num_devices().saturating_sub(self.taken.lock().len())
    }

    /// Builds a mesh of `num_hosts` hosts with `devices_per_host` devices each; by default every host and
    /// every device of it. Hosts too small for the request are skipped.
    pub fn get_physical_mesh(&self, num_hosts: Option<usize>, devices_per_host: Option<usize>) -> Result<PhysicalMesh> {
        let num_hosts = num_hosts.unwrap_or(self.hosts.len());
        if num_hosts == 0 || devices_per_host == Some(0) {
            return Err(Error::invalid("a mesh needs at least one host and one device per host"))
        }

        let capable: Vec<_> = self.hosts.iter().enumerate()
            .filter(|(_, h)| h.num_devices > 0 && h.num_devices >= devices_per_host.unwrap_or(1))
            .collect();
        if capable.len() < num_hosts {
            return Err(Error::ResourceUnavailable(format!(
                "requested {num_hosts} hosts with {} devices each, {} hosts of {} qualify",
                devices_per_host.map(|d| d.to_string()).unwrap_or_else(|| "all".into()),
                capable.len(),
                self.hosts.len()
            )))
        }

        let taken = self.taken.lock().clone();
        let mut selection = vec![];
        let mut first_conflict = None;
        for (index, host) in capable {
            let wanted = devices_per_host.unwrap_or(host.num_devices);
            let free: Vec<usize> = (0..host.num_devices).filter(|&d| !taken.contains(&(HostId(index), d))).collect();
            if free.len() >= wanted {
                selection.push((HostId(index), free[..wanted].to_vec()));
                if selection.len() == num_hosts {
                    break
                }
            } else if first_conflict.is_none() {
                let busy = (0..host.num_devices).find(|&d| taken.contains(&(HostId(index), d))).unwrap_or_default();
                first_conflict = Some(Error::ResourceConflict { host: host.address.clone(), device: busy });
            }
        }

        if selection.len() < num_hosts {
            return Err(first_conflict.unwrap_or_else(|| Error::ResourceUnavailable(format!("only {} hosts have enough free devices", selection.len()))))
        }

        self.launch(selection)
    }

    /// Builds a mesh on exactly the given (host, device index) pairs. Logical ids follow host order, then the given order.
    pub fn get_physical_mesh_on(&self, devices: &[(HostId, usize)]) -> Result<PhysicalMesh> {
        if devices.is_empty() {
            return Err(Error::invalid("a mesh needs at least one device"))
        }

        let mut seen = BTreeSet::new();
        for &(host, device) in devices {
            let info = self.hosts.get(host.0).ok_or_else(|| Error::ResourceUnavailable(format!("no host {host}")))?;
            if device >= info.num_devices {
                return Err(Error::ResourceUnavailable(format!("host {} has {} devices, no device {device}", info.address, info.num_devices)))
            }
            if !seen.insert((host, device)) {
                return Err(Error::invalid(format!("device {device} of host {} is listed twice", info.address)))
            }
        }

        let mut selection: Vec<(HostId, Vec<usize>)> = vec![];
        for &(host, device) in devices {
            match selection.iter_mut().find(|(h, _)| *h == host) {
                Some((_, list)) => list.push(device),
                None => selection.push((host, vec![device]))
            }
        }
        selection.sort_by_key(|(h, _)| *h);

        self.launch(selection)
    }

    fn launch(&self, selection: Vec<(HostId, Vec<usize>)>) -> Result<PhysicalMesh> {
        let mut next = 0;
        let placement: Vec<HostPlacement> = selection.into_iter().map(|(host, physical_devices)| {
            let devices = (next..next + physical_devices.len()).map(DeviceId).collect();
            next += physical_devices.len();
            HostPlacement { host, address: self.hosts[host.0].address.clone(), physical_devices, devices }
        }).collect();

        let reservation = Reservation::acquire(&self.taken, &placement)?;
        debug!("reserved {next} devices: {placement:?}");
        PhysicalMesh::launch(placement, reservation, self.profiling.clone())
    }
}
