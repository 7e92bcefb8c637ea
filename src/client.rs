//! Simulated client: request issuance, reassembly, playback
//!
//! A client asks the proxy for videos, reassembles the chunked responses
//! into per-video progress entries, and drives a play-buffer state machine.
//! Its player task drains one bitrate-worth of buffer per simulated second
//! and reports stalls when the buffer runs dry.
//!
//! Everything observable about a client goes through [`ClientHooks`]:
//! download start/end (the quiescence gauge subscribes), playback start and
//! stall events (the metrics recorder subscribes).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::clock::SimContext;
use crate::error::SimError;
use crate::link::{Link, SendMode};
use crate::models::{Packet, Payload, PeerId, Video, VideoId, VideoRequest};
use crate::peer::{Peer, PeerCore};

/// Playback state of one requested video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing played yet; waiting for the initial buffer fill.
    Stopped,
    /// Underrun; waiting for the buffer to refill past the threshold.
    Buffering,
    Playing,
}

#[derive(Debug)]
struct MediaProgress {
    received_kb: f64,
    total_kb: Option<f64>,
    bitrate_kb_s: f64,
    buffer_kb: f64,
    state: PlaybackState,
}

impl MediaProgress {
    fn new() -> Self {
        MediaProgress {
            received_kb: 0.0,
            total_kb: None,
            bitrate_kb_s: 0.0,
            buffer_kb: 0.0,
            state: PlaybackState::Stopped,
        }
    }
}

/// Read-only view of a client's progress on one video.
#[derive(Debug, Clone, Copy)]
pub struct MediaSnapshot {
    pub received_kb: f64,
    pub total_kb: Option<f64>,
    pub buffer_kb: f64,
    pub state: PlaybackState,
}

type Hook = Box<dyn Fn(&str) + Send + Sync>;

/// Observation call-points. Each hook receives the video id; subscribers
/// that only count (like the download gauge) ignore it.
#[derive(Default)]
pub struct ClientHooks {
    new_download: Vec<Hook>,
    end_download: Vec<Hook>,
    start_playback: Vec<Hook>,
    video_stopped: Vec<Hook>,
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_download(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.new_download.push(Box::new(f));
        self
    }

    pub fn on_end_download(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.end_download.push(Box::new(f));
        self
    }

    pub fn on_start_playback(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.start_playback.push(Box::new(f));
        self
    }

    pub fn on_video_stopped(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.video_stopped.push(Box::new(f));
        self
    }

    fn fire(hooks: &[Hook], video_id: &str) {
        for hook in hooks {
            hook(video_id);
        }
    }
}

/// Client tunables; defaults follow the usual simulation setup.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Initial play threshold and refill threshold, in kb.
    pub buffer_size_kb: f64,
    /// Re-enter `Buffering` on underrun instead of replaying into an empty
    /// buffer.
    pub wait_on_refill: bool,
    /// Silently drop a request for the same video twice in a row.
    pub two_in_a_row_protection: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            buffer_size_kb: 1024.0,
            wait_on_refill: true,
            two_in_a_row_protection: true,
        }
    }
}

pub struct Client {
    core: PeerCore,
    ctx: Arc<SimContext>,
    settings: ClientSettings,
    hooks: ClientHooks,
    media: Mutex<HashMap<VideoId, MediaProgress>>,
    last_media: Mutex<Option<VideoId>>,
}

impl Client {
    pub fn new(
        id: PeerId,
        name: impl Into<String>,
        settings: ClientSettings,
        hooks: ClientHooks,
        ctx: Arc<SimContext>,
    ) -> Self {
        Client {
            core: PeerCore::new(id, name),
            ctx,
            settings,
            hooks,
            media: Mutex::new(HashMap::new()),
            last_media: Mutex::new(None),
        }
    }

    pub fn connect_to(&self, link: Link) {
        self.core.connect_to(link);
    }

    /// Low level text request (echo/health path).
    pub fn request(&self, text: impl Into<String>) {
        self.core.request(text);
    }

    pub fn last_received(&self) -> Option<Packet> {
        self.core.last_received()
    }

    pub fn snapshot(&self, video_id: &str) -> Option<MediaSnapshot> {
        self.media.lock().unwrap().get(video_id).map(|entry| MediaSnapshot {
            received_kb: entry.received_kb,
            total_kb: entry.total_kb,
            buffer_kb: entry.buffer_kb,
            state: entry.state,
        })
    }

    /// Ask `server_id` (through the proxy) for a video.
    ///
    /// A request for the same video as the immediately preceding one is
    /// dropped when two-in-a-row protection is on; the drop does not touch
    /// the download hooks, so quiescence accounting stays balanced.
    pub fn request_media(&self, video_id: &str, server_id: PeerId) {
        {
            let mut last = self.last_media.lock().unwrap();
            if self.settings.two_in_a_row_protection && last.as_deref() == Some(video_id) {
                debug!(client = self.core.id(), video = video_id, "duplicate request dropped");
                return;
            }
            *last = Some(video_id.to_string());
        }

        info!(client = self.core.id(), video = video_id, server = server_id, "requesting video");
        self.media
            .lock()
            .unwrap()
            .insert(video_id.to_string(), MediaProgress::new());
        ClientHooks::fire(&self.hooks.new_download, video_id);

        let payload = Payload::VideoRequest(VideoRequest {
            server_id,
            video_id: video_id.to_string(),
        });
        let packet = self.core.pack(payload, None, None);
        self.core.send(packet, SendMode::Normal);
    }

    /// Start this client's player task: one buffer-drain pass per simulated
    /// second.
    pub fn start_player(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                client.player_tick();
                client.ctx.clock.sleep(1.0).await;
            }
        });
    }

    /// One pass of the player loop over all tracked videos.
    pub fn player_tick(&self) {
        let mut stalled: Vec<VideoId> = Vec::new();
        {
            let mut media = self.media.lock().unwrap();
            for (id, entry) in media.iter_mut() {
                if self.settings.wait_on_refill
                    && entry.state == PlaybackState::Buffering
                    && entry.buffer_kb > self.settings.buffer_size_kb
                {
                    entry.state = PlaybackState::Playing;
                }
                if entry.state == PlaybackState::Playing {
                    entry.buffer_kb = (entry.buffer_kb - entry.bitrate_kb_s).max(0.0);
                    if entry.buffer_kb == 0.0 {
                        if self.settings.wait_on_refill {
                            entry.state = PlaybackState::Buffering;
                        }
                        stalled.push(id.clone());
                    }
                }
            }
        }
        for id in stalled {
            self.video_stopped(&id);
        }
    }

    fn receive_video_chunk(&self, packet: &Packet, video: &Video) {
        let Some((completed, starts_playing)) = self.apply_chunk(packet, video) else {
            return;
        };
        if completed {
            self.download_complete(&video.id);
        }
        if starts_playing {
            self.start_playback(&video.id);
        }
    }

    /// Account one chunk against the matching progress entry; returns the
    /// (download finished, playback starts) transitions it caused, or
    /// `None` for an unsolicited chunk.
    fn apply_chunk(&self, packet: &Packet, video: &Video) -> Option<(bool, bool)> {
        let mut media = self.media.lock().unwrap();
        let Some(entry) = media.get_mut(&video.id) else {
            let error = SimError::UnsolicitedVideoChunk(video.id.clone());
            warn!(client = self.core.id(), %error, "dropping chunk");
            return None;
        };

        if entry.total_kb.is_none() {
            entry.total_kb = Some(packet.payload_size_kb);
            entry.bitrate_kb_s = video.bitrate_kb_s;
        }

        let chunk_kb = packet.chunk_kb();
        let old_received = entry.received_kb;
        entry.received_kb += chunk_kb;
        entry.buffer_kb += chunk_kb;

        let total = entry.total_kb.unwrap_or(f64::INFINITY);
        let completed = entry.received_kb >= total;
        let starts_playing = entry.received_kb >= self.settings.buffer_size_kb
            && old_received < entry.received_kb
            && entry.state == PlaybackState::Stopped;
        if starts_playing {
            entry.state = PlaybackState::Playing;
        }
        Some((completed, starts_playing))
    }

    fn download_complete(&self, video_id: &str) {
        info!(client = self.core.id(), video = video_id, "download complete");
        ClientHooks::fire(&self.hooks.end_download, video_id);
    }

    fn start_playback(&self, video_id: &str) {
        info!(client = self.core.id(), video = video_id, "playback started");
        ClientHooks::fire(&self.hooks.start_playback, video_id);
    }

    fn video_stopped(&self, video_id: &str) {
        debug!(client = self.core.id(), video = video_id, "playback stalled on empty buffer");
        ClientHooks::fire(&self.hooks.video_stopped, video_id);
    }
}

impl Peer for Client {
    fn id(&self) -> PeerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn received(&self, packet: Packet) {
        match &packet.payload {
            Payload::Video(video) => {
                let video = video.clone();
                self.receive_video_chunk(&packet, &video);
            }
            _ => self.core.note_received(packet),
        }
    }
}
