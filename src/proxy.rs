//! Central proxy: request classification, forwarding, cache interception
//!
//! The proxy classifies every delivered chunk: packets carrying
//! `response_to` take the response path, `videoRequest` payloads take the
//! request path, anything else is answered on the echo path. A forwarded
//! request leaves an entry in the active-request table that lives exactly
//! until the last chunk of its response has been relayed.
//!
//! With a cache attached, the request path first tries to serve from the
//! store and the response path decides admission; both otherwise fall back
//! to plain forwarding.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::error::SimError;
use crate::link::{Link, SendMode};
use crate::metrics::{HitCounter, HitStats};
use crate::models::{Packet, Payload, PeerId, VideoId};
use crate::peer::{Peer, PeerCore};

/// Which proxy variant to run. The names match the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyKind {
    #[serde(rename = "ForwardProxy", alias = "forward")]
    Forward,
    #[serde(rename = "FIFOProxy", alias = "fifo")]
    Fifo,
    #[serde(rename = "LRUProxy", alias = "lru")]
    Lru,
    #[serde(rename = "UnlimitedProxy", alias = "unlimited")]
    Unlimited,
}

impl ProxyKind {
    fn build_cache(self, cache_size_kb: f64) -> Option<CacheStore> {
        match self {
            ProxyKind::Forward => None,
            ProxyKind::Fifo => Some(CacheStore::fifo(cache_size_kb)),
            ProxyKind::Lru => Some(CacheStore::lru(cache_size_kb)),
            ProxyKind::Unlimited => Some(CacheStore::unlimited()),
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyKind::Forward => "ForwardProxy",
            ProxyKind::Fifo => "FIFOProxy",
            ProxyKind::Lru => "LRUProxy",
            ProxyKind::Unlimited => "UnlimitedProxy",
        };
        f.write_str(name)
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forwardproxy" | "forward" => Ok(ProxyKind::Forward),
            "fifoproxy" | "fifo" => Ok(ProxyKind::Fifo),
            "lruproxy" | "lru" => Ok(ProxyKind::Lru),
            "unlimitedproxy" | "unlimited" => Ok(ProxyKind::Unlimited),
            other => Err(format!(
                "unknown proxy type '{other}' (expected ForwardProxy, FIFOProxy, LRUProxy or UnlimitedProxy)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    orig_sender: PeerId,
    orig_packet_id: u64,
}

/// Mutable proxy state, serialized under one mutex: the active-request
/// table and the cache plus its policy structure. Receive callbacks arrive
/// from every incoming link's transport task.
struct ProxyState {
    active: HashMap<u64, PendingRequest>,
    cache: Option<CacheStore>,
}

pub struct Proxy {
    core: PeerCore,
    links: Mutex<HashMap<PeerId, Link>>,
    state: Mutex<ProxyState>,
    stats: HitCounter,
}

impl Proxy {
    /// Build the proxy variant named by `kind`; `cache_size_kb` only
    /// matters for the bounded caches.
    pub fn new(id: PeerId, name: impl Into<String>, kind: ProxyKind, cache_size_kb: f64) -> Self {
        Proxy {
            core: PeerCore::new(id, name),
            links: Mutex::new(HashMap::new()),
            state: Mutex::new(ProxyState {
                active: HashMap::new(),
                cache: kind.build_cache(cache_size_kb),
            }),
            stats: HitCounter::new(),
        }
    }

    /// Pure forwarder, caching nothing.
    pub fn forward(id: PeerId, name: impl Into<String>) -> Self {
        Self::new(id, name, ProxyKind::Forward, 0.0)
    }

    /// Attach the outgoing link towards `peer_id`.
    pub fn connect_to(&self, peer_id: PeerId, link: Link) {
        self.links.lock().unwrap().insert(peer_id, link);
    }

    pub fn stats(&self) -> HitStats {
        self.stats.snapshot()
    }

    /// Number of forwarded requests still waiting for their last response
    /// chunk. Zero after a drained run.
    pub fn pending_requests(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn has_cache(&self) -> bool {
        self.state.lock().unwrap().cache.is_some()
    }

    pub fn cache_len(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .cache
            .as_ref()
            .map_or(0, |c| c.len())
    }

    pub fn cache_contains(&self, id: &VideoId) -> bool {
        self.state
            .lock()
            .unwrap()
            .cache
            .as_ref()
            .is_some_and(|c| c.contains(id))
    }

    pub fn cache_kb(&self) -> f64 {
        self.state
            .lock()
            .unwrap()
            .cache
            .as_ref()
            .map_or(0.0, |c| c.current_kb())
    }

    fn send_to(&self, peer_id: PeerId, packet: Packet, mode: SendMode) {
        match self.links.lock().unwrap().get(&peer_id) {
            Some(link) => link.send(packet, mode),
            None => warn!(peer_id, "dropping send: no link to peer"),
        }
    }

    /// Frame a relay packet, carrying over the incoming chunk boundaries.
    fn pack_relay(&self, incoming: &Packet, response_to: Option<u64>) -> Packet {
        let mut packet = self.core.pack(
            incoming.payload.clone(),
            Some(incoming.payload_size_kb),
            response_to,
        );
        packet.chunk_id = incoming.chunk_id;
        packet.chunk_size_kb = incoming.chunk_size_kb;
        packet.last_chunk = incoming.last_chunk;
        packet
    }

    fn handle_request(&self, packet: Packet) {
        let Payload::VideoRequest(request) = &packet.payload else {
            return;
        };

        let mut state = self.state.lock().unwrap();
        if let Some(cache) = state.cache.as_mut() {
            if let Some(video) = cache.serve(&request.video_id) {
                drop(state);
                info!(video = %video.id, client = packet.sender, "cache hit");
                self.stats.from_cache(video.size_kb);
                let size_kb = video.size_kb;
                let response =
                    self.core
                        .pack(Payload::Video(video), Some(size_kb), Some(packet.packet_id));
                self.send_to(packet.sender, response, SendMode::Normal);
                return;
            }
        }

        debug!(video = %request.video_id, server = request.server_id, "forwarding request");
        let forward = self.pack_relay(&packet, None);
        state.active.insert(
            forward.packet_id,
            PendingRequest {
                orig_sender: packet.sender,
                orig_packet_id: packet.packet_id,
            },
        );
        drop(state);
        self.send_to(request.server_id, forward, SendMode::ForwardChunk);
    }

    fn handle_response(&self, packet: Packet) {
        let Some(response_to) = packet.response_to else {
            return;
        };

        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.active.get(&response_to).cloned() else {
            let error = SimError::UnexpectedResponse(response_to);
            warn!(%error, "dropping response");
            return;
        };

        if let Payload::Video(video) = &packet.payload {
            if let Some(cache) = state.cache.as_mut() {
                if cache.should_admit(video) {
                    self.stats.from_server(video.size_kb);
                    cache.make_space(video.size_kb);
                    cache.insert(video.clone());
                    debug!(video = %video.id, "admitted to cache");
                }
            }
        }

        if packet.last_chunk {
            state.active.remove(&response_to);
        }
        drop(state);

        let relay = self.pack_relay(&packet, Some(pending.orig_packet_id));
        self.send_to(pending.orig_sender, relay, SendMode::ForwardChunk);
    }

    fn handle_other(&self, packet: Packet) {
        match &packet.payload {
            Payload::Text(text) => {
                let reply = self.core.pack(
                    Payload::Text(format!("There you go: {text}")),
                    None,
                    Some(packet.packet_id),
                );
                self.send_to(packet.sender, reply, SendMode::Normal);
            }
            _ => self.core.note_received(packet),
        }
    }
}

impl Peer for Proxy {
    fn id(&self) -> PeerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn received(&self, packet: Packet) {
        if packet.is_response() {
            self.handle_response(packet);
        } else {
            match packet.payload.kind() {
                crate::models::PayloadKind::VideoRequest => self.handle_request(packet),
                _ => self.handle_other(packet),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Video, VideoRequest};

    fn video(id: &str, size_kb: f64) -> Video {
        Video {
            id: id.to_string(),
            duration_s: 60,
            size_kb,
            bitrate_kb_s: size_kb / 60.0,
            title: String::new(),
            description: String::new(),
        }
    }

    fn request_packet(sender: PeerId, packet_id: u64, video_id: &str, server_id: PeerId) -> Packet {
        Packet {
            sender,
            payload: Payload::VideoRequest(VideoRequest {
                server_id,
                video_id: video_id.into(),
            }),
            payload_size_kb: 0.016,
            packet_id,
            response_to: None,
            chunk_id: 0,
            chunk_size_kb: Some(0.016),
            last_chunk: true,
        }
    }

    fn response_chunk(
        sender: PeerId,
        response_to: u64,
        vid: &Video,
        chunk_id: u64,
        chunk_kb: f64,
        last: bool,
    ) -> Packet {
        Packet {
            sender,
            payload: Payload::Video(vid.clone()),
            payload_size_kb: vid.size_kb,
            packet_id: 0,
            response_to: Some(response_to),
            chunk_id,
            chunk_size_kb: Some(chunk_kb),
            last_chunk: last,
        }
    }

    #[tokio::test]
    async fn test_forwarded_request_tracked_until_last_chunk() {
        let proxy = Proxy::forward(0, "Proxy");
        // no links wired: sends are dropped, the table bookkeeping is what
        // this test watches
        proxy.received(request_packet(1001, 7, "v1", 1));
        assert_eq!(proxy.pending_requests(), 1);

        let vid = video("v1", 64.0);
        proxy.received(response_chunk(1, 0, &vid, 0, 32.0, false));
        assert_eq!(proxy.pending_requests(), 1);
        proxy.received(response_chunk(1, 0, &vid, 1, 32.0, true));
        assert_eq!(proxy.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_response_dropped() {
        let proxy = Proxy::forward(0, "Proxy");
        let vid = video("v1", 64.0);
        proxy.received(response_chunk(1, 99, &vid, 0, 64.0, true));
        assert_eq!(proxy.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_cache_admission_on_response_path() {
        let proxy = Proxy::new(0, "Proxy", ProxyKind::Fifo, 4096.0);
        proxy.received(request_packet(1001, 0, "v1", 1));

        let vid = video("v1", 1024.0);
        proxy.received(response_chunk(1, 0, &vid, 0, 512.0, false));
        // admitted on the first chunk already
        assert!(proxy.cache_contains(&"v1".to_string()));
        proxy.received(response_chunk(1, 0, &vid, 1, 512.0, true));
        assert_eq!(proxy.cache_len(), 1);
        assert_eq!(proxy.cache_kb(), 1024.0);

        let stats = proxy.stats();
        assert_eq!(stats.nb_served, 1);
        assert_eq!(stats.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_cache_hit_counts_and_serves() {
        let proxy = Proxy::new(0, "Proxy", ProxyKind::Fifo, 4096.0);
        proxy.received(request_packet(1001, 0, "v1", 1));
        let vid = video("v1", 1024.0);
        proxy.received(response_chunk(1, 0, &vid, 0, 1024.0, true));

        // second request for the same video hits the cache: no new entry in
        // the active table
        proxy.received(request_packet(1002, 0, "v1", 1));
        assert_eq!(proxy.pending_requests(), 0);

        let stats = proxy.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.nb_served, 2);
        assert_eq!(stats.kb_from_cache, 1024.0);
    }

    #[tokio::test]
    async fn test_oversized_video_not_cached() {
        let proxy = Proxy::new(0, "Proxy", ProxyKind::Lru, 1000.0);
        proxy.received(request_packet(1001, 0, "huge", 1));
        let vid = video("huge", 1000.0);
        proxy.received(response_chunk(1, 0, &vid, 0, 1000.0, true));
        assert_eq!(proxy.cache_len(), 0);
    }

    #[test]
    fn test_proxy_kind_parsing() {
        assert_eq!("FIFOProxy".parse::<ProxyKind>().unwrap(), ProxyKind::Fifo);
        assert_eq!("lru".parse::<ProxyKind>().unwrap(), ProxyKind::Lru);
        assert_eq!(
            "UnlimitedProxy".parse::<ProxyKind>().unwrap(),
            ProxyKind::Unlimited
        );
        assert!("GhostProxy".parse::<ProxyKind>().is_err());
        assert_eq!(ProxyKind::Fifo.to_string(), "FIFOProxy");
    }
}
