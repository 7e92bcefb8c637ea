//! Trace-driven discrete-event simulator for video-caching proxies
//!
//! Replays a timestamped request trace through a central caching proxy and
//! measures what clients experience: playout latencies, re-buffering
//! stalls, and the proxy's hit statistics. Two caching policies can be
//! compared side by side on the same trace.
//!
//! # Overview
//!
//! The simulated network is a star: every client and every origin server is
//! wired to the proxy with two unidirectional [`link::Link`]s. A link
//! fragments payloads into chunks and charges a bandwidth delay per chunk
//! plus one latency per payload; all delays run against an accelerated
//! virtual clock ([`clock::SimClock`]), so long traces replay in seconds.
//! When nothing is in flight, the orchestrator fast-forwards the clock over
//! the idle gap.
//!
//! Units: data in kilobits (kb), bandwidth in kb/s, time in seconds.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use vcache_sim::{Orchestrator, SimConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = SimConfig::from_file("config.yaml")?;
//! let out = std::path::PathBuf::from(&config.data.data_out);
//!
//! let mut orchestrator = Orchestrator::new(config);
//! orchestrator.set_up()?;
//! orchestrator.run().await?;
//! orchestrator.wait_end().await;
//! orchestrator.gather_statistics(&out)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`clock`]: virtual time, accelerated sleeps, quiescence tracking
//! - [`link`]: the chunking transport pipe between peers
//! - [`peer`], [`server`], [`client`]: the simulated actors
//! - [`proxy`] and [`cache`]: forwarding, the active-request table, and the
//!   pluggable replacement policies (FIFO, LRU, Unlimited)
//! - [`orchestrator`]: topology wiring and trace replay
//! - [`metrics`]: hit statistics and playout latency recording

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod peer;
pub mod proxy;
pub mod server;
pub mod trace;

// Re-export commonly used types
pub use cache::{CachePolicy, CacheStore, FifoPolicy, LruPolicy, UnlimitedPolicy};
pub use client::{Client, ClientHooks, ClientSettings, PlaybackState};
pub use clock::{DownloadGauge, SimClock, SimContext};
pub use config::{ReplayMethod, SimConfig};
pub use error::{Result, SimError};
pub use link::{Link, LinkParams, SendMode};
pub use metrics::{HitCounter, HitStats, PlayoutRecorder};
pub use models::{Packet, Payload, PayloadKind, PeerId, Video, VideoId, VideoRequest};
pub use orchestrator::Orchestrator;
pub use peer::{Peer, PeerCore};
pub use proxy::{Proxy, ProxyKind};
pub use server::VideoServer;
