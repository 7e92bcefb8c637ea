//! Simulated origin server
//!
//! Stores a catalog of videos and answers `videoRequest` packets over its
//! single outgoing link (to the proxy, or directly to a client in tests).

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, error};

use crate::error::{Result, SimError};
use crate::link::{Link, SendMode};
use crate::models::{Packet, Payload, PeerId, Video, VideoId};
use crate::peer::{Peer, PeerCore};

pub struct VideoServer {
    core: PeerCore,
    catalog: Mutex<HashMap<VideoId, Video>>,
}

impl VideoServer {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        VideoServer {
            core: PeerCore::new(id, name),
            catalog: Mutex::new(HashMap::new()),
        }
    }

    pub fn connect_to(&self, link: Link) {
        self.core.connect_to(link);
    }

    /// Add a video to the catalog. Videos are immutable once added; an id
    /// collision replaces the entry.
    pub fn add_video(&self, video: Video) {
        debug!(server = self.core.id(), video = %video.id, "catalog insert");
        self.catalog.lock().unwrap().insert(video.id.clone(), video);
    }

    pub fn catalog_len(&self) -> usize {
        self.catalog.lock().unwrap().len()
    }

    fn serve(&self, request: &Packet, video_id: &VideoId) -> Result<()> {
        let video = self
            .catalog
            .lock()
            .unwrap()
            .get(video_id)
            .cloned()
            .ok_or_else(|| SimError::UnknownVideo(video_id.clone()))?;

        let size_kb = video.size_kb;
        let response = self
            .core
            .pack(Payload::Video(video), Some(size_kb), Some(request.packet_id));
        self.core.send(response, SendMode::Normal);
        Ok(())
    }
}

impl Peer for VideoServer {
    fn id(&self) -> PeerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn received(&self, packet: Packet) {
        match &packet.payload {
            Payload::VideoRequest(request) => {
                let video_id = request.video_id.clone();
                if let Err(error) = self.serve(&packet, &video_id) {
                    // A request for an uncatalogued video is a wiring error
                    // in the trace or topology; its request path dies here.
                    error!(server = self.core.id(), %error, "dropping request");
                }
            }
            _ => self.core.note_received(packet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VideoRequest;

    fn video(id: &str) -> Video {
        Video {
            id: id.to_string(),
            duration_s: 60,
            size_kb: 2048.0,
            bitrate_kb_s: 2048.0 / 60.0,
            title: "Video".into(),
            description: "A video".into(),
        }
    }

    #[tokio::test]
    async fn test_catalog_insert_and_len() {
        let server = VideoServer::new(1, "s1");
        server.add_video(video("v1"));
        server.add_video(video("v2"));
        server.add_video(video("v1"));
        assert_eq!(server.catalog_len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_video_is_dropped() {
        let server = VideoServer::new(1, "s1");
        let request = Packet {
            sender: 1001,
            payload: Payload::VideoRequest(VideoRequest {
                server_id: 1,
                video_id: "missing".into(),
            }),
            payload_size_kb: 0.016,
            packet_id: 0,
            response_to: None,
            chunk_id: 0,
            chunk_size_kb: Some(0.016),
            last_chunk: true,
        };
        // no outgoing link and no catalog entry: both paths must be non-fatal
        server.received(request);
    }
}
