//! Cache of measured collective latencies.
//!
//! Samples are keyed by (collective, topology, dtype) and then by payload size. Recording the same key twice
//! appends a sample; lookups aggregate the samples of a size by their mean.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::ops::Bound;
use std::path::Path;

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::collective::{CollectiveKind, DType, DeviceGroupTopology};
use crate::{Error, Result};

const MAGIC: [u8; 8] = *b"MESHPROF";
const FORMAT_VERSION: u32 = 1;

type Key = (CollectiveKind, DeviceGroupTopology, DType);

#[derive(Default)]
pub struct ProfilingResult {
    records: RwLock<BTreeMap<Key, BTreeMap<u64, Vec<f64>>>>,
}

/// All samples of one (collective, topology, dtype, size) key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub kind: CollectiveKind,
    pub topology: DeviceGroupTopology,
    pub dtype: DType,
    pub size: u64,
    pub samples: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    magic: [u8; 8],
    version: u32,
    entries: Vec<ProfileEntry>,
}

fn check_sample(kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, duration: f64) -> Result<()> {
    if size == 0 {
        return Err(Error::invalid(format!("{kind} on {topology}: payload size must be positive")))
    }
    if !duration.is_finite() || duration < 0. {
        return Err(Error::invalid(format!("{kind} on {topology} with {size} bytes: duration {duration} is not a non-negative number")))
    }
    Ok(())
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

// the line through p0 and p1 evaluated at x
fn line((x0, y0): (u64, f64), (x1, y1): (u64, f64), x: u64) -> f64 {
    y0 + (y1 - y0) * (x as f64 - x0 as f64) / (x1 as f64 - x0 as f64)
}

impl ProfilingResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType, duration: f64) -> Result<()> {
        check_sample(kind, topology, size, duration)?;
        debug!("record {kind} {topology} {size}B {dtype}: {duration:.6}s");
        self.records.write()
            .entry((kind, topology.clone(), dtype))
            .or_default()
            .entry(size)
            .or_default()
            .push(duration);
        Ok(())
    }

    pub fn record_all_reduce(&self, topology: &DeviceGroupTopology, size: u64, dtype: DType, duration: f64) -> Result<()> {
        self.record(CollectiveKind::AllReduce, topology, size, dtype, duration)
    }

    pub fn record_all_gather(&self, topology: &DeviceGroupTopology, size: u64, dtype: DType, duration: f64) -> Result<()> {
        self.record(CollectiveKind::AllGather, topology, size, dtype, duration)
    }

    pub fn record_reduce_scatter(&self, topology: &DeviceGroupTopology, size: u64, dtype: DType, duration: f64) -> Result<()> {
        self.record(CollectiveKind::ReduceScatter, topology, size, dtype, duration)
    }

    pub fn record_all_to_all(&self, topology: &DeviceGroupTopology, size: u64, dtype: DType, duration: f64) -> Result<()> {
        self.record(CollectiveKind::AllToAll, topology, size, dtype, duration)
    }

    /// Estimated duration in seconds of `kind` over `topology` for `size` bytes.
    ///
    /// Uses the recorded size if present, otherwise interpolates linearly between the nearest recorded sizes
    /// on both sides. Beyond the recorded range it extrapolates along the two closest points, never going
    /// below zero; with a single recorded size that size's value is returned.
    pub fn estimate(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, size: u64, dtype: DType) -> Result<f64> {
        let records = self.records.read();
        let no_data = || Error::NoProfileData { kind, topology: topology.clone(), dtype };
        let by_size = records.get(&(kind, topology.clone(), dtype)).filter(|x| !x.is_empty()).ok_or_else(no_data)?;

        if let Some(samples) = by_size.get(&size) {
            return Ok(mean(samples))
        }

        let below: Vec<(u64, f64)> = by_size.range(..size).rev().take(2).map(|(&s, v)| (s, mean(v))).collect();
        let above: Vec<(u64, f64)> = by_size.range((Bound::Excluded(size), Bound::Unbounded)).take(2).map(|(&s, v)| (s, mean(v))).collect();

        let estimated = match (&below[..], &above[..]) {
            ([lo, ..], [hi, ..]) => line(*lo, *hi, size),
            ([nearest, next, ..], []) | ([], [nearest, next, ..]) => line(*next, *nearest, size),
            ([only], []) | ([], [only]) => only.1,
            ([], []) => return Err(no_data()),
        };

        Ok(estimated.max(0.))
    }

    /// The recorded sizes and their samples for one key, in increasing size order.
    pub fn samples(&self, kind: CollectiveKind, topology: &DeviceGroupTopology, dtype: DType) -> Vec<(u64, Vec<f64>)> {
        self.records.read()
            .get(&(kind, topology.clone(), dtype))
            .map(|by_size| by_size.iter().map(|(&s, v)| (s, v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<ProfileEntry> {
        self.records.read().iter().flat_map(|((kind, topology, dtype), by_size)| {
            by_size.iter().map(|(&size, samples)| ProfileEntry {
                kind: *kind,
                topology: topology.clone(),
                dtype: *dtype,
                size,
                samples: samples.clone(),
            })
        }).collect()
    }

    /// number of distinct (collective, topology, dtype, size) keys
    pub fn len(&self) -> usize {
        self.records.read().values().map(|by_size| by_size.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_samples(&self) -> usize {
        self.records.read().values().flat_map(|by_size| by_size.values()).map(|v| v.len()).sum()
    }

    /// Appends every sample of `other` to this result.
    pub fn merge(&self, other: &ProfilingResult) {
        self.extend(other.entries())
    }

    fn extend(&self, entries: Vec<ProfileEntry>) {
        let mut records = self.records.write();
        for entry in entries.into_iter().filter(|e| !e.samples.is_empty()) {
            records.entry((entry.kind, entry.topology, entry.dtype))
                .or_default()
                .entry(entry.size)
                .or_default()
                .extend(entry.samples);
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let persisted = Persisted { magic: MAGIC, version: FORMAT_VERSION, entries: self.entries() };
        Ok(bincode::serialize(&persisted)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<ProfilingResult> {
        let persisted: Persisted = bincode::deserialize(bytes)?;
        if persisted.magic != MAGIC {
            return Err(Error::invalid("not a profiling result"))
        }
        if persisted.version != FORMAT_VERSION {
            return Err(Error::invalid(format!("unsupported profiling result version {}", persisted.version)))
        }

        for entry in &persisted.entries {
            for &duration in &entry.samples {
                check_sample(entry.kind, &entry.topology, entry.size, duration)?;
            }
        }

        let result = ProfilingResult::new();
        result.extend(persisted.entries);
        Ok(result)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<ProfilingResult> {
        Self::deserialize(&std::fs::read(path)?)
    }
}

impl Clone for ProfilingResult {
    fn clone(&self) -> Self {
        let result = ProfilingResult::new();
        result.extend(self.entries());
        result
    }
}

impl PartialEq for ProfilingResult {
    fn eq(&self, other: &Self) -> bool {
        self.entries() == other.entries()
    }
}

impl Debug for ProfilingResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}
