//! Core data models: packets, payloads, videos
//!
//! Units follow the rest of the crate: data in kilobits (kb), bandwidth in
//! kb/s, time in seconds.

use serde::{Deserialize, Serialize};

/// Identifies a peer on the simulated network.
///
/// Conventions: 0 is the proxy, 1..=1000 are video servers, 1001.. are
/// clients.
pub type PeerId = u64;

/// Catalog-unique video identifier.
pub type VideoId = String;

/// The proxy's well-known peer id.
pub const PROXY_ID: PeerId = 0;

/// Offset added to trace client ids so they land in the client id range.
pub const CLIENT_ID_BASE: PeerId = 1000;

/// A video as stored in a server catalog (and in proxy caches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: VideoId,
    pub duration_s: u64,
    pub size_kb: f64,
    pub bitrate_kb_s: f64,
    pub title: String,
    pub description: String,
}

/// Payload of a `videoRequest` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub server_id: PeerId,
    pub video_id: VideoId,
}

/// What a packet carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    VideoRequest(VideoRequest),
    Video(Video),
    Text(String),
}

impl Payload {
    /// Payload classification used by the proxy dispatch.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::VideoRequest(_) => PayloadKind::VideoRequest,
            Payload::Video(_) => PayloadKind::Video,
            Payload::Text(_) => PayloadKind::Other,
        }
    }

    /// Fallback payload size when the sender does not supply one.
    ///
    /// Text is sized as 8 bits per byte; a video request is a small fixed
    /// frame; a video payload weighs its full media size.
    pub fn estimate_kb(&self) -> f64 {
        match self {
            Payload::Text(text) => text.len() as f64 * 8.0 / 1024.0,
            Payload::VideoRequest(_) => 0.016,
            Payload::Video(video) => video.size_kb,
        }
    }
}

/// A framed unit of communication between two peers.
///
/// A large payload is transported as several chunks; each delivered chunk is
/// a clone of the original packet with `chunk_id`, `chunk_size_kb` and
/// `last_chunk` filled in by the link. For a transfer of N chunks the
/// receiver observes `chunk_id` 0..N-1 in order, exactly the last one
/// carries `last_chunk`, and the chunk sizes sum to `payload_size_kb`.
#[derive(Debug, Clone)]
pub struct Packet {
    pub sender: PeerId,
    pub payload: Payload,
    pub payload_size_kb: f64,
    /// Per-sender monotonic packet counter.
    pub packet_id: u64,
    /// Set on responses; matches the `packet_id` of the request.
    pub response_to: Option<u64>,
    /// 0-based position of this chunk within the transfer.
    pub chunk_id: u64,
    /// Size of this chunk; `None` until a link has framed it.
    pub chunk_size_kb: Option<f64>,
    pub last_chunk: bool,
}

impl Packet {
    /// Size of this chunk, falling back to the whole payload size when the
    /// packet has not passed through a link yet.
    pub fn chunk_kb(&self) -> f64 {
        self.chunk_size_kb.unwrap_or(self.payload_size_kb)
    }

    /// True when this packet answers a previous request.
    pub fn is_response(&self) -> bool {
        self.response_to.is_some()
    }
}

/// Payload classification for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    VideoRequest,
    Video,
    Other,
}
