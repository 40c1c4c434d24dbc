use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::smallvec;

use crate::{DeviceId, Error, Result, SVec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CollectiveKind {
    AllReduce,
    AllGather,
    ReduceScatter,
    AllToAll,
}

impl CollectiveKind {
    pub const ALL: [CollectiveKind; 4] = [
        CollectiveKind::AllReduce,
        CollectiveKind::AllGather,
        CollectiveKind::ReduceScatter,
        CollectiveKind::AllToAll,
    ];

    /// Number of elements each rank sends and receives for a payload of `elements` in a group of `group_size`.
    /// The payload is the full (unsharded) tensor: the gathered output, the reduce-scatter input, etc.
    pub fn buffer_elements(self, elements: usize, group_size: usize) -> (usize, usize) {
        let chunk = (elements / group_size.max(1)).max(1);
        match self {
            CollectiveKind::AllReduce => (elements, elements),
            CollectiveKind::AllGather => (chunk, chunk * group_size),
            CollectiveKind::ReduceScatter => (chunk * group_size, chunk),
            CollectiveKind::AllToAll => (chunk * group_size, chunk * group_size),
        }
    }

    /// Bytes crossing the wire per rank relative to the payload, for a ring implementation.
    pub fn ring_traffic_factor(self, group_size: usize) -> f64 {
        let g = group_size.max(1) as f64;
        match self {
            CollectiveKind::AllReduce => 2. * (g - 1.) / g,
            CollectiveKind::AllGather | CollectiveKind::ReduceScatter | CollectiveKind::AllToAll => (g - 1.) / g,
        }
    }
}

impl Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectiveKind::AllReduce => write!(f, "all-reduce"),
            CollectiveKind::AllGather => write!(f, "all-gather"),
            CollectiveKind::ReduceScatter => write!(f, "reduce-scatter"),
            CollectiveKind::AllToAll => write!(f, "all-to-all"),
        }
    }
}

impl FromStr for CollectiveKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match &s.replace('_', "-")[..] {
            "all-reduce" => Ok(CollectiveKind::AllReduce),
            "all-gather" => Ok(CollectiveKind::AllGather),
            "reduce-scatter" => Ok(CollectiveKind::ReduceScatter),
            "all-to-all" => Ok(CollectiveKind::AllToAll),
            _ => Err(Error::invalid(format!("unknown collective {s:?}")))
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    #[default]
    Float32,
    Float64,
    BFloat16,
    Int32,
    Int64,
    UInt8,
}

macro_rules! add_le {
    ($a: expr, $b: expr, $t: ty, $add: expr) => {{
        let mut x = [0u8; std::mem::size_of::<$t>()];
        let mut y = [0u8; std::mem::size_of::<$t>()];
        x.copy_from_slice($a);
        y.copy_from_slice($b);
        let add: fn($t, $t) -> $t = $add;
        $a.copy_from_slice(&add(<$t>::from_le_bytes(x), <$t>::from_le_bytes(y)).to_le_bytes());
    }}
}

impl DType {
    /// element width in bytes
    pub fn width(self) -> usize {
        match self {
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
            DType::BFloat16 => 2,
            DType::UInt8 => 1,
        }
    }

    /// little-endian encoding of the value one
    pub fn one(self) -> SVec<u8, 8> {
        match self {
            DType::Float32 => SVec::from_slice(&1f32.to_le_bytes()),
            DType::Float64 => SVec::from_slice(&1f64.to_le_bytes()),
            DType::BFloat16 => SVec::from_slice(&(((1f32.to_bits()) >> 16) as u16).to_le_bytes()),
            DType::Int32 => SVec::from_slice(&1i32.to_le_bytes()),
            DType::Int64 => SVec::from_slice(&1i64.to_le_bytes()),
            DType::UInt8 => smallvec![1],
        }
    }

    /// Elementwise `acc += other`. Integers wrap, bfloat16 is summed in f32 and truncated.
    pub fn accumulate(self, acc: &mut [u8], other: &[u8]) {
        let w = self.width();
        for (a, b) in acc.chunks_exact_mut(w).zip(other.chunks_exact(w)) {
            match self {
                DType::Float32 => add_le!(a, b, f32, |x, y| x + y),
                DType::Float64 => add_le!(a, b, f64, |x, y| x + y),
                DType::Int32 => add_le!(a, b, i32, i32::wrapping_add),
                DType::Int64 => add_le!(a, b, i64, i64::wrapping_add),
                DType::UInt8 => add_le!(a, b, u8, u8::wrapping_add),
                DType::BFloat16 => add_le!(a, b, u16, |x, y| {
                    let sum = f32::from_bits((x as u32) << 16) + f32::from_bits((y as u32) << 16);
                    (sum.to_bits() >> 16) as u16
                }),
            }
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::Float32 => write!(f, "float32"),
            DType::Float64 => write!(f, "float64"),
            DType::BFloat16 => write!(f, "bfloat16"),
            DType::Int32 => write!(f, "int32"),
            DType::Int64 => write!(f, "int64"),
            DType::UInt8 => write!(f, "uint8"),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float32" | "f32" => Ok(DType::Float32),
            "float64" | "f64" => Ok(DType::Float64),
            "bfloat16" | "bf16" => Ok(DType::BFloat16),
            "int32" | "i32" => Ok(DType::Int32),
            "int64" | "i64" => Ok(DType::Int64),
            "uint8" | "u8" => Ok(DType::UInt8),
            _ => Err(Error::invalid(format!("unknown dtype {s:?}")))
        }
    }
}

/// Disjoint groups of devices, each running its own instance of a collective.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceGroupTopology {
    groups: SVec<SVec<DeviceId>, 2>,
}

impl DeviceGroupTopology {
    pub fn new<G, I>(groups: G) -> Result<Self> where G: IntoIterator<Item = I>, I: IntoIterator<Item = usize> {
        let groups: SVec<SVec<DeviceId>, 2> = groups.into_iter()
            .map(|group| group.into_iter().map(DeviceId).collect())
            .collect();

        if groups.is_empty() {
            return Err(Error::invalid("a topology needs at least one group"))
        }

        let mut seen = std::collections::BTreeSet::new();
        for group in &groups {
            if group.is_empty() {
                return Err(Error::invalid("a device group cannot be empty"))
            }
            for &device in group {
                if !seen.insert(device) {
                    return Err(Error::invalid(format!("device {device} appears in more than one group")))
                }
            }
        }

        Ok(DeviceGroupTopology { groups })
    }

    /// One group holding devices `0..n`.
    pub fn single(n: usize) -> Result<Self> {
        Self::new([0..n])
    }

    /// Devices `0..n` split into contiguous groups of `group_size`.
    pub fn contiguous(n: usize, group_size: usize) -> Result<Self> {
        if group_size == 0 || n % group_size != 0 {
            return Err(Error::invalid(format!("cannot split {n} devices into groups of {group_size}")))
        }
        Self::new((0..n / group_size).map(|i| i * group_size..(i + 1) * group_size))
    }

    /// Devices `0..n` split into groups of `group_size` that take every `n / group_size`-th device,
    /// the other axis of a 2-d mesh: `strided(4, 2)` is `((0,2),(1,3))`.
    pub fn strided(n: usize, group_size: usize) -> Result<Self> {
        if group_size == 0 || n % group_size != 0 {
            return Err(Error::invalid(format!("cannot split {n} devices into groups of {group_size}")))
        }
        let stride = n / group_size;
        Self::new((0..stride).map(|i| (0..group_size).map(move |j| i + j * stride)))
    }

    /// Topologies profiled when the caller does not name any. For every divisor `k >= 2` of `n`: the first `k`
    /// devices as one group, and when `k < n` all devices split into contiguous and into strided groups of `k`.
    /// The last one is always the whole mesh.
    pub fn defaults(n: usize) -> Vec<Self> {
        let mut result = vec![];
        for k in (2..=n).filter(|k| n % k == 0) {
            result.extend(Self::single(k));
            if k < n {
                result.extend(Self::contiguous(n, k));
                result.extend(Self::strided(n, k));
            }
        }
        result
    }

    pub fn groups(&self) -> &[SVec<DeviceId>] {
        &self.groups
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.groups.iter().flatten().copied()
    }

    pub fn num_devices(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn max_group_size(&self) -> usize {
        self.groups.iter().map(|g| g.len()).max().unwrap_or(0)
    }

    pub fn max_device(&self) -> Option<DeviceId> {
        self.devices().max()
    }
}

impl Display for DeviceGroupTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "(")?;
            for (j, device) in group.iter().enumerate() {
                if j > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{device}")?;
            }
            write!(f, ")")?;
        }
        if self.groups.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl FromStr for DeviceGroupTopology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::invalid(format!("malformed topology {s:?}"));
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut rest = compact.strip_prefix('(').and_then(|x| x.strip_suffix(')')).ok_or_else(bad)?;

        let mut groups = vec![];
        while !rest.is_empty() {
            let body = rest.strip_prefix('(').ok_or_else(bad)?;
            let end = body.find(')').ok_or_else(bad)?;
            let group = body[..end].split(',')
                .filter(|x| !x.is_empty())
                .map(|x| x.parse::<usize>().map_err(|_| bad()))
                .collect::<Result<Vec<_>>>()?;
            groups.push(group);
            rest = &body[end + 1..];
            rest = rest.strip_prefix(',').unwrap_or(rest);
        }

        Self::new(groups)
    }
}

impl TryFrom<Vec<Vec<usize>>> for DeviceGroupTopology {
    type Error = Error;

    fn try_from(groups: Vec<Vec<usize>>) -> Result<Self> {
        Self::new(groups)
    }
}

/// Rendezvous point for the members of one device group. Every member calls [`GroupCommunicator::run`]
/// with its own rank; the call returns once all members have exchanged their data.
pub(crate) struct GroupCommunicator {
    slots: Vec<Mutex<Vec<u8>>>,
    barrier: Barrier,
}

impl GroupCommunicator {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(GroupCommunicator {
            slots: (0..size).map(|_| Mutex::new(vec![])).collect(),
            barrier: Barrier::new(size),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn sync(&self) {
        self.barrier.wait();
    }

    // Every member passes both barriers even with malformed input, otherwise its peers would block forever.
    pub fn run(&self, kind: CollectiveKind, dtype: DType, rank: usize, input: &[u8]) -> Vec<u8> {
        *self.slots[rank].lock() = input.to_vec();
        self.barrier.wait();

        let g = self.size();
        let chunk_bytes = input.len() / g.max(1);
        let chunk = |r: usize, i: usize| -> Vec<u8> {
            self.slots[r].lock().get(i * chunk_bytes..(i + 1) * chunk_bytes).map(<[u8]>::to_vec).unwrap_or_default()
        };

        let output = match kind {
            CollectiveKind::AllReduce => {
                let mut acc = self.slots[0].lock().clone();
                for slot in &self.slots[1..] {
                    dtype.accumulate(&mut acc, &slot.lock());
                }
                acc
            }
            CollectiveKind::AllGather => {
                self.slots.iter().flat_map(|slot| slot.lock().clone()).collect()
            }
            CollectiveKind::ReduceScatter => {
                let mut acc = chunk(0, rank);
                for r in 1..g {
                    dtype.accumulate(&mut acc, &chunk(r, rank));
                }
                acc
            }
            CollectiveKind::AllToAll => {
                (0..g).flat_map(|r| chunk(r, rank)).collect()
            }
        };

        self.barrier.wait();
        output
    }
}
