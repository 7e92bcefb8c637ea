//! Simulation configuration
//!
//! Loaded from a YAML file with one mapping per section. Every key has a
//! default, so a minimal config only names the trace and catalog files;
//! `validate()` rejects values the simulation cannot run with.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::link::LinkParams;
use crate::proxy::ProxyKind;

/// Which replay engine drives the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMethod {
    /// Priority-queue scheduler with optional busy-loop idle skipping.
    Scheduler,
    /// FIFO replay that parks on the quiescence event between requests.
    EventLock,
}

impl std::fmt::Display for ReplayMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayMethod::Scheduler => f.write_str("scheduler"),
            ReplayMethod::EventLock => f.write_str("event_lock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Virtual-time acceleration during transfers. Precision degrades past
    /// roughly 8x.
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Additional acceleration for orchestration waits.
    #[serde(default = "default_wait_acc")]
    pub wait_acc: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSection {
    #[serde(default = "default_method")]
    pub method: ReplayMethod,
    #[serde(default = "default_true")]
    pub skip_inactivity: bool,
    #[serde(default = "default_trace_file")]
    pub trace_file: String,
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_type")]
    pub proxy_type: ProxyKind,
    /// Cache capacity in kb; ignored by Forward and Unlimited proxies.
    #[serde(default = "default_cache_size")]
    pub cache_size: f64,
}

/// Link parameters for the client side of the star topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsSection {
    #[serde(default = "default_lag")]
    pub lag_down: f64,
    #[serde(default = "default_lag")]
    pub lag_up: f64,
    #[serde(default = "default_client_down")]
    pub down: f64,
    #[serde(default = "default_client_up")]
    pub up: f64,
    #[serde(default = "default_max_chunk")]
    pub max_chunk: f64,
    /// Start a player task per client so buffers actually drain.
    #[serde(default = "default_true")]
    pub consume_videos: bool,
}

/// Link parameters for the server side of the star topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersSection {
    #[serde(default = "default_lag")]
    pub lag_down: f64,
    #[serde(default = "default_lag")]
    pub lag_up: f64,
    #[serde(default = "default_server_bw")]
    pub down: f64,
    #[serde(default = "default_server_bw")]
    pub up: f64,
    #[serde(default = "default_max_chunk")]
    pub max_chunk: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    #[serde(default = "default_data_out")]
    pub data_out: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub orchestration: OrchestrationSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub clients: ClientsSection,
    #[serde(default)]
    pub servers: ServersSection,
    #[serde(default)]
    pub data: DataSection,
}

impl ClientsSection {
    /// Peer-to-proxy direction.
    pub fn uplink(&self) -> LinkParams {
        LinkParams {
            latency_s: self.lag_up,
            bandwidth_kb_s: self.up,
            max_chunk_kb: self.max_chunk,
        }
    }

    /// Proxy-to-peer direction.
    pub fn downlink(&self) -> LinkParams {
        LinkParams {
            latency_s: self.lag_down,
            bandwidth_kb_s: self.down,
            max_chunk_kb: self.max_chunk,
        }
    }
}

impl ServersSection {
    pub fn uplink(&self) -> LinkParams {
        LinkParams {
            latency_s: self.lag_up,
            bandwidth_kb_s: self.up,
            max_chunk_kb: self.max_chunk,
        }
    }

    pub fn downlink(&self) -> LinkParams {
        LinkParams {
            latency_s: self.lag_down,
            bandwidth_kb_s: self.down,
            max_chunk_kb: self.max_chunk,
        }
    }
}

// Default value functions for serde
fn default_speed() -> f64 {
    6.0
}

fn default_wait_acc() -> f64 {
    1.0
}

fn default_method() -> ReplayMethod {
    ReplayMethod::Scheduler
}

fn default_true() -> bool {
    true
}

fn default_trace_file() -> String {
    "trace.dat".to_string()
}

fn default_db_file() -> String {
    "video_db.dat".to_string()
}

fn default_proxy_type() -> ProxyKind {
    ProxyKind::Fifo
}

fn default_cache_size() -> f64 {
    16000.0
}

fn default_lag() -> f64 {
    0.1
}

fn default_client_down() -> f64 {
    4000.0
}

fn default_client_up() -> f64 {
    600.0
}

fn default_server_bw() -> f64 {
    100_000.0
}

fn default_max_chunk() -> f64 {
    16.0
}

fn default_data_out() -> String {
    "stats".to_string()
}

impl Default for SimulationSection {
    fn default() -> Self {
        SimulationSection {
            speed: default_speed(),
            wait_acc: default_wait_acc(),
        }
    }
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        OrchestrationSection {
            method: default_method(),
            skip_inactivity: default_true(),
            trace_file: default_trace_file(),
            db_file: default_db_file(),
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        ProxySection {
            proxy_type: default_proxy_type(),
            cache_size: default_cache_size(),
        }
    }
}

impl Default for ClientsSection {
    fn default() -> Self {
        ClientsSection {
            lag_down: default_lag(),
            lag_up: default_lag(),
            down: default_client_down(),
            up: default_client_up(),
            max_chunk: default_max_chunk(),
            consume_videos: default_true(),
        }
    }
}

impl Default for ServersSection {
    fn default() -> Self {
        ServersSection {
            lag_down: default_lag(),
            lag_up: default_lag(),
            down: default_server_bw(),
            up: default_server_bw(),
            max_chunk: default_max_chunk(),
        }
    }
}

impl Default for DataSection {
    fn default() -> Self {
        DataSection {
            data_out: default_data_out(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            simulation: SimulationSection::default(),
            orchestration: OrchestrationSection::default(),
            proxy: ProxySection::default(),
            clients: ClientsSection::default(),
            servers: ServersSection::default(),
            data: DataSection::default(),
        }
    }
}

impl SimConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SimError::ConfigNotFound(path.display().to_string())
            } else {
                SimError::Io(e)
            }
        })?;

        let config: SimConfig = serde_yaml::from_str(&content)
            .map_err(|e| SimError::ConfigParse(format!("{}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the simulation cannot run with: non-positive speeds,
    /// bandwidths or chunk sizes, and a zero-sized bounded cache.
    pub fn validate(&self) -> Result<()> {
        if self.simulation.speed <= 0.0 {
            return Err(SimError::ConfigParse(format!(
                "simulation.speed must be positive, got {}",
                self.simulation.speed
            )));
        }
        if self.simulation.wait_acc <= 0.0 {
            return Err(SimError::ConfigParse(format!(
                "simulation.wait_acc must be positive, got {}",
                self.simulation.wait_acc
            )));
        }

        for (section, down, up, max_chunk) in [
            ("clients", self.clients.down, self.clients.up, self.clients.max_chunk),
            ("servers", self.servers.down, self.servers.up, self.servers.max_chunk),
        ] {
            if down <= 0.0 || up <= 0.0 {
                return Err(SimError::ConfigParse(format!(
                    "{section}: bandwidths must be positive (down={down}, up={up})"
                )));
            }
            if max_chunk <= 0.0 {
                return Err(SimError::ConfigParse(format!(
                    "{section}: max_chunk must be positive, got {max_chunk}"
                )));
            }
        }

        if matches!(self.proxy.proxy_type, ProxyKind::Fifo | ProxyKind::Lru)
            && self.proxy.cache_size <= 0.0
        {
            return Err(SimError::ConfigParse(format!(
                "proxy.cache_size must be positive for {}, got {}",
                self.proxy.proxy_type, self.proxy.cache_size
            )));
        }

        Ok(())
    }
}
