//! Replay orchestration
//!
//! Builds the star topology (every client and server wired to the proxy
//! with two unidirectional links), loads the trace and catalog, and replays
//! the requests at their simulated timestamps. Two replay engines exist: a
//! priority-queue scheduler that can fast-forward over idle gaps, and an
//! event-lock replay that parks on the quiescence event and dispatches the
//! next request as soon as the system drains.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{Client, ClientHooks, ClientSettings};
use crate::clock::SimContext;
use crate::config::{ReplayMethod, SimConfig};
use crate::error::Result;
use crate::link::Link;
use crate::metrics::{self, HitStats, PlayoutRecorder};
use crate::models::{PeerId, PROXY_ID};
use crate::peer::Peer;
use crate::proxy::{Proxy, ProxyKind};
use crate::server::VideoServer;
use crate::trace::{self, TraceEvent};

/// Heap entry: a trace event and when it is due, ordered soonest-first.
#[derive(Clone, Copy)]
struct Scheduled {
    due_s: f64,
    seq: usize,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_s
            .total_cmp(&other.due_s)
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct Orchestrator {
    config: SimConfig,
    ctx: Arc<SimContext>,
    proxy: Arc<Proxy>,
    clients: HashMap<PeerId, Arc<Client>>,
    servers: HashMap<PeerId, Arc<VideoServer>>,
    events: Vec<TraceEvent>,
    recorder: Arc<PlayoutRecorder>,
}

impl Orchestrator {
    /// Build a replay for the proxy named in the configuration.
    pub fn new(config: SimConfig) -> Self {
        let kind = config.proxy.proxy_type;
        Self::with_proxy(config, kind)
    }

    /// Build a replay with an explicit proxy variant (side-by-side runs).
    pub fn with_proxy(config: SimConfig, kind: ProxyKind) -> Self {
        let ctx = Arc::new(SimContext::new(
            config.simulation.speed,
            config.simulation.wait_acc,
        ));
        let proxy = Arc::new(Proxy::new(PROXY_ID, "Proxy", kind, config.proxy.cache_size));
        let recorder = Arc::new(PlayoutRecorder::new(ctx.clone()));
        Orchestrator {
            config,
            ctx,
            proxy,
            clients: HashMap::new(),
            servers: HashMap::new(),
            events: Vec::new(),
            recorder,
        }
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn recorder(&self) -> &Arc<PlayoutRecorder> {
        &self.recorder
    }

    pub fn client(&self, id: PeerId) -> Option<&Arc<Client>> {
        self.clients.get(&id)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Load the trace and catalog, create every peer they mention, and wire
    /// the topology.
    pub fn set_up(&mut self) -> Result<()> {
        let trace_path = self.config.orchestration.trace_file.clone();
        let db_path = self.config.orchestration.db_file.clone();
        self.events = trace::load_trace(Path::new(&trace_path))?;

        let client_events: Vec<PeerId> = self.events.iter().map(|e| e.client_id).collect();
        for client_id in client_events {
            self.ensure_client(client_id);
        }

        for (server_id, video) in trace::load_catalog(Path::new(&db_path))? {
            let server = self.ensure_server(server_id);
            server.add_video(video);
        }

        info!(
            clients = self.clients.len(),
            servers = self.servers.len(),
            events = self.events.len(),
            proxy = %self.proxy.name(),
            method = %self.config.orchestration.method,
            "simulation set up"
        );
        Ok(())
    }

    fn ensure_client(&mut self, client_id: PeerId) {
        if self.clients.contains_key(&client_id) {
            return;
        }

        let settings = ClientSettings::default();
        let hooks = self.client_hooks(client_id);
        let client = Arc::new(Client::new(
            client_id,
            format!("Client {}", client_id - crate::models::CLIENT_ID_BASE),
            settings,
            hooks,
            self.ctx.clone(),
        ));

        client.connect_to(Link::to(
            self.proxy.clone(),
            self.config.clients.uplink(),
            self.ctx.clone(),
        ));
        self.proxy.connect_to(
            client_id,
            Link::to(
                client.clone(),
                self.config.clients.downlink(),
                self.ctx.clone(),
            ),
        );

        if self.config.clients.consume_videos {
            client.start_player();
        }
        self.clients.insert(client_id, client);
    }

    fn ensure_server(&mut self, server_id: PeerId) -> Arc<VideoServer> {
        if let Some(server) = self.servers.get(&server_id) {
            return server.clone();
        }

        let server = Arc::new(VideoServer::new(server_id, format!("Server {server_id}")));
        server.connect_to(Link::to(
            self.proxy.clone(),
            self.config.servers.uplink(),
            self.ctx.clone(),
        ));
        self.proxy.connect_to(
            server_id,
            Link::to(
                server.clone(),
                self.config.servers.downlink(),
                self.ctx.clone(),
            ),
        );
        self.servers.insert(server_id, server.clone());
        server
    }

    /// Observation wiring for one client: the download gauge tracks
    /// quiescence, the recorder times playout latencies and counts stalls.
    fn client_hooks(&self, client_id: PeerId) -> ClientHooks {
        let gauge_inc = self.ctx.clone();
        let gauge_dec = self.ctx.clone();
        let rec_start = self.recorder.clone();
        let rec_play = self.recorder.clone();
        let rec_stall = self.recorder.clone();
        ClientHooks::new()
            .on_new_download(move |video| {
                rec_start.request_started(client_id, video);
                gauge_inc.downloads.inc();
            })
            .on_end_download(move |_| gauge_dec.downloads.dec())
            .on_start_playback(move |video| rec_play.playback_started(client_id, video))
            .on_video_stopped(move |video| rec_stall.stalled(client_id, video))
    }

    /// Replay the whole trace with the configured engine. Returns once the
    /// last request has been dispatched; use [`Orchestrator::wait_end`] to
    /// drain in-flight downloads.
    pub async fn run(&self) -> Result<()> {
        match self.config.orchestration.method {
            ReplayMethod::Scheduler => self.run_scheduler().await,
            ReplayMethod::EventLock => self.run_event_lock().await,
        }
        Ok(())
    }

    async fn run_scheduler(&self) {
        let skip = self.config.orchestration.skip_inactivity;
        let speed = self.ctx.clock.speed();
        let start = self.ctx.clock.now_sched();

        let mut queue: BinaryHeap<Reverse<Scheduled>> = self
            .events
            .iter()
            .enumerate()
            .map(|(seq, event)| {
                Reverse(Scheduled {
                    due_s: start + event.delay_s,
                    seq,
                })
            })
            .collect();

        while let Some(Reverse(next)) = queue.peek().copied() {
            let now = self.ctx.clock.now_sched();
            let delay = next.due_s - now;

            if delay <= 0.0 {
                queue.pop();
                self.dispatch(next.seq);
                continue;
            }

            if !skip {
                self.ctx.clock.sleep_sched(delay).await;
                continue;
            }

            // Fast-forward only past gaps worth at least a wall second, and
            // only while nothing is downloading.
            if delay / speed >= 1.0 && self.ctx.downloads.is_idle() {
                info!(gap_s = delay, "skipping inactivity");
                self.ctx.clock.fast_forward(delay - 1.0);
            } else {
                self.ctx.clock.sleep_sched(delay / 2.0).await;
            }
        }
    }

    async fn run_event_lock(&self) {
        let skip = self.config.orchestration.skip_inactivity;
        let mut last_delay = 0.0;

        for (seq, event) in self.events.iter().enumerate() {
            let relative = (event.delay_s - last_delay).max(0.0);
            last_delay = event.delay_s;

            let notified = self.ctx.downloads.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.ctx.downloads.is_idle() {
                if skip {
                    // Wake on whichever comes first: the quiescence event or
                    // the request's own due time.
                    tokio::select! {
                        _ = notified => debug!("quiescent, dispatching next request early"),
                        _ = self.ctx.clock.sleep_sched(relative) => {}
                    }
                } else {
                    self.ctx.clock.sleep_sched(relative).await;
                }
            }

            self.dispatch(seq);
        }
    }

    fn dispatch(&self, seq: usize) {
        let event = self.events[seq].clone();
        match self.clients.get(&event.client_id) {
            Some(client) => client.request_media(&event.video_id, event.server_id),
            None => warn!(client = event.client_id, "trace names an unknown client"),
        }
    }

    /// Block until every dispatched download has completed.
    pub async fn wait_end(&self) {
        self.ctx.downloads.wait_idle().await;
        info!("all downloads drained");
    }

    /// Current proxy hit statistics; `None` for the plain forward proxy,
    /// which has nothing to count.
    pub fn proxy_stats(&self) -> Option<HitStats> {
        if self.proxy.has_cache() {
            Some(self.proxy.stats())
        } else {
            None
        }
    }

    /// Write the `clients` and `proxy` CSVs under `dir`.
    pub fn gather_statistics(&self, dir: &Path) -> Result<()> {
        metrics::write_stats(dir, &self.recorder, self.proxy_stats().as_ref())
    }
}
