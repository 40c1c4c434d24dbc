use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub profiling: ProfilingConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address of the orchestration head. When set it must accept a TCP connection before any mesh is built.
    pub head_address: Option<String>,
    pub hosts: Vec<HostConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    pub num_devices: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    pub warmup_iterations: usize,
    pub timed_iterations: usize,
    pub max_retries: usize,
    pub worker_timeout_ms: u64,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        ProfilingConfig {
            warmup_iterations: 2,
            timed_iterations: 5,
            max_retries: 3,
            worker_timeout_ms: 30_000,
        }
    }
}

impl ProfilingConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_toml_str(&text)
    }
}
