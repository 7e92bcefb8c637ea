//! Run metrics: proxy hit statistics and client playout latencies
//!
//! Both collectors are passive observers. The proxy feeds the
//! [`HitCounter`] from its request/response paths; clients feed the
//! [`PlayoutRecorder`] through the observation hooks the orchestrator wires
//! up. All byte-ish quantities are kilobits, like everywhere else in the
//! crate.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use crate::clock::SimContext;
use crate::error::{Result, SimError};
use crate::models::{PeerId, VideoId};

/// Counts how much the proxy served, and from where.
#[derive(Debug, Default)]
pub struct HitCounter {
    inner: Mutex<HitTally>,
}

#[derive(Debug, Default, Clone)]
struct HitTally {
    cache_hits: u64,
    nb_served: u64,
    kb_from_cache: f64,
    kb_served: f64,
}

/// Snapshot of the proxy hit statistics; one CSV row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HitStats {
    pub cache_hits: u64,
    pub nb_served: u64,
    pub hit_ratio: f64,
    pub kb_from_cache: f64,
    pub kb_served: f64,
    pub kb_hit_ratio: f64,
}

impl HitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a response served out of the cache.
    pub fn from_cache(&self, size_kb: f64) {
        let mut tally = self.inner.lock().unwrap();
        tally.cache_hits += 1;
        tally.nb_served += 1;
        tally.kb_from_cache += size_kb;
        tally.kb_served += size_kb;
    }

    /// Record a response fetched from an origin server.
    pub fn from_server(&self, size_kb: f64) {
        let mut tally = self.inner.lock().unwrap();
        tally.nb_served += 1;
        tally.kb_served += size_kb;
    }

    pub fn snapshot(&self) -> HitStats {
        let tally = self.inner.lock().unwrap().clone();
        let hit_ratio = if tally.nb_served == 0 {
            0.0
        } else {
            tally.cache_hits as f64 / tally.nb_served as f64
        };
        let kb_hit_ratio = if tally.kb_served == 0.0 {
            0.0
        } else {
            tally.kb_from_cache / tally.kb_served
        };
        HitStats {
            cache_hits: tally.cache_hits,
            nb_served: tally.nb_served,
            hit_ratio,
            kb_from_cache: tally.kb_from_cache,
            kb_served: tally.kb_served,
            kb_hit_ratio,
        }
    }
}

/// One measured playout latency.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySample {
    pub id_client: PeerId,
    pub playout_latency: f64,
}

/// Times the interval from `request_media` to `start_playback` per
/// (client, video), and counts playback stalls.
pub struct PlayoutRecorder {
    ctx: Arc<SimContext>,
    inner: Mutex<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    pending: HashMap<(PeerId, VideoId), f64>,
    latencies: Vec<LatencySample>,
    stalls: u64,
}

impl PlayoutRecorder {
    pub fn new(ctx: Arc<SimContext>) -> Self {
        PlayoutRecorder {
            ctx,
            inner: Mutex::new(RecorderState::default()),
        }
    }

    /// Start the timer for one request.
    pub fn request_started(&self, client: PeerId, video: &str) {
        let now = self.ctx.clock.now();
        self.inner
            .lock()
            .unwrap()
            .pending
            .insert((client, video.to_string()), now);
    }

    /// Stop the matching timer and record the sample.
    pub fn playback_started(&self, client: PeerId, video: &str) {
        let now = self.ctx.clock.now();
        let mut state = self.inner.lock().unwrap();
        let Some(start) = state.pending.remove(&(client, video.to_string())) else {
            debug!(client, video, "playback without a pending request timer");
            return;
        };
        let latency = now - start;
        state.latencies.push(LatencySample {
            id_client: client,
            playout_latency: latency,
        });
        let mean =
            state.latencies.iter().map(|s| s.playout_latency).sum::<f64>() / state.latencies.len() as f64;
        info!(
            client,
            video,
            latency_s = format_args!("{latency:.3}"),
            mean_s = format_args!("{mean:.3}"),
            "playout started"
        );
    }

    /// Record one playback stall (empty buffer during play).
    pub fn stalled(&self, client: PeerId, video: &str) {
        debug!(client, video, "playback stalled");
        self.inner.lock().unwrap().stalls += 1;
    }

    pub fn latencies(&self) -> Vec<LatencySample> {
        self.inner.lock().unwrap().latencies.clone()
    }

    pub fn latencies_for(&self, client: PeerId) -> Vec<f64> {
        self.inner
            .lock()
            .unwrap()
            .latencies
            .iter()
            .filter(|s| s.id_client == client)
            .map(|s| s.playout_latency)
            .collect()
    }

    pub fn stall_count(&self) -> u64 {
        self.inner.lock().unwrap().stalls
    }

    pub fn mean_latency(&self) -> Option<f64> {
        let state = self.inner.lock().unwrap();
        if state.latencies.is_empty() {
            return None;
        }
        Some(state.latencies.iter().map(|s| s.playout_latency).sum::<f64>() / state.latencies.len() as f64)
    }
}

/// Write the run artifacts under `dir`: a `clients` CSV with one row per
/// measured playout latency, and a `proxy` CSV with the single hit-stats
/// row. The plotting pipeline picks these up from there.
pub fn write_stats(
    dir: &Path,
    recorder: &PlayoutRecorder,
    proxy_stats: Option<&HitStats>,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    info!(dir = %dir.display(), "writing statistics");

    let mut clients = csv::Writer::from_path(dir.join("clients"))
        .map_err(|e| SimError::StatsOutput(e.to_string()))?;
    for sample in recorder.latencies() {
        clients
            .serialize(&sample)
            .map_err(|e| SimError::StatsOutput(e.to_string()))?;
    }
    clients
        .flush()
        .map_err(|e| SimError::StatsOutput(e.to_string()))?;

    if let Some(stats) = proxy_stats {
        let mut proxy = csv::Writer::from_path(dir.join("proxy"))
            .map_err(|e| SimError::StatsOutput(e.to_string()))?;
        proxy
            .serialize(stats)
            .map_err(|e| SimError::StatsOutput(e.to_string()))?;
        proxy
            .flush()
            .map_err(|e| SimError::StatsOutput(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_counter_ratios() {
        let counter = HitCounter::new();
        counter.from_server(2048.0);
        counter.from_cache(2048.0);
        counter.from_cache(1024.0);

        let stats = counter.snapshot();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.nb_served, 3);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.kb_served, 5120.0);
        assert_eq!(stats.kb_from_cache, 3072.0);
        assert!((stats.kb_hit_ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_empty_counter_has_zero_ratios() {
        let stats = HitCounter::new().snapshot();
        assert_eq!(stats.hit_ratio, 0.0);
        assert_eq!(stats.kb_hit_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_recorder_pairs_request_and_playback() {
        let ctx = Arc::new(SimContext::new(1000.0, 1.0));
        let recorder = PlayoutRecorder::new(ctx);
        recorder.request_started(1001, "v1");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        recorder.playback_started(1001, "v1");

        let latencies = recorder.latencies_for(1001);
        assert_eq!(latencies.len(), 1);
        assert!(latencies[0] > 0.0);
        assert!(recorder.mean_latency().is_some());
    }

    #[tokio::test]
    async fn test_recorder_ignores_unmatched_playback() {
        let ctx = Arc::new(SimContext::new(1.0, 1.0));
        let recorder = PlayoutRecorder::new(ctx);
        recorder.playback_started(1001, "v1");
        assert!(recorder.latencies().is_empty());
    }

    #[tokio::test]
    async fn test_write_stats_layout() {
        let ctx = Arc::new(SimContext::new(1.0, 1.0));
        let recorder = PlayoutRecorder::new(ctx);
        recorder.request_started(1001, "v1");
        recorder.playback_started(1001, "v1");

        let counter = HitCounter::new();
        counter.from_cache(512.0);

        let dir = tempfile::tempdir().unwrap();
        write_stats(dir.path(), &recorder, Some(&counter.snapshot())).unwrap();

        let clients = fs::read_to_string(dir.path().join("clients")).unwrap();
        assert!(clients.starts_with("id_client,playout_latency"));
        assert!(clients.lines().count() >= 2);

        let proxy = fs::read_to_string(dir.path().join("proxy")).unwrap();
        assert!(proxy.starts_with("cache_hits,nb_served,hit_ratio,kb_from_cache,kb_served,kb_hit_ratio"));
    }
}
