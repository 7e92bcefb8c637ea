//! Peer identity and packet framing
//!
//! Every simulated actor (client, server, proxy) is a [`Peer`]: it has a
//! network id and accepts delivered chunks through a synchronous receive
//! callback invoked on the delivering link's transport task. Callback
//! bodies never await; anything they "send" is just an enqueue on an
//! outgoing link.
//!
//! [`PeerCore`] carries the shared plumbing: the id/name, the per-sender
//! packet counter, a single outgoing link, and the last received packet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::link::{Link, SendMode};
use crate::models::{Packet, Payload, PeerId};

/// A participant on the simulated network.
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    fn name(&self) -> &str;

    /// Deliver one chunk to this peer. Runs synchronously on the sending
    /// link's transport task.
    fn received(&self, packet: Packet);
}

/// Identity, framing and send plumbing shared by all peer kinds.
pub struct PeerCore {
    id: PeerId,
    name: String,
    next_packet: AtomicU64,
    link: Mutex<Option<Link>>,
    last_received: Mutex<Option<Packet>>,
}

impl PeerCore {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        PeerCore {
            id,
            name: name.into(),
            next_packet: AtomicU64::new(0),
            link: Mutex::new(None),
            last_received: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the single outgoing link of this peer.
    pub fn connect_to(&self, link: Link) {
        let mut slot = self.link.lock().unwrap();
        if slot.is_some() {
            warn!(peer = self.id, "replacing existing outgoing link");
        }
        *slot = Some(link);
    }

    /// Frame a payload into a packet, consuming the next packet id.
    pub fn pack(
        &self,
        payload: Payload,
        size_kb: Option<f64>,
        response_to: Option<u64>,
    ) -> Packet {
        let payload_size_kb = size_kb.unwrap_or_else(|| payload.estimate_kb());
        Packet {
            sender: self.id,
            payload_size_kb,
            payload,
            packet_id: self.next_packet.fetch_add(1, Ordering::SeqCst),
            response_to,
            chunk_id: 0,
            chunk_size_kb: None,
            last_chunk: false,
        }
    }

    /// Send on the outgoing link; logged and dropped when unconnected.
    pub fn send(&self, packet: Packet, mode: SendMode) {
        match &*self.link.lock().unwrap() {
            Some(link) => link.send(packet, mode),
            None => warn!(peer = self.id, "dropping send: peer has no outgoing link"),
        }
    }

    /// Low level helper to request something from the connected peer with a
    /// plain text payload.
    pub fn request(&self, text: impl Into<String>) {
        let packet = self.pack(Payload::Text(text.into()), None, None);
        self.send(packet, SendMode::Normal);
    }

    /// Default receive behaviour: remember the packet and log it.
    pub fn note_received(&self, packet: Packet) {
        info!(
            peer = %self.name,
            sender = packet.sender,
            payload = ?packet.payload,
            "received data"
        );
        *self.last_received.lock().unwrap() = Some(packet);
    }

    /// Most recently delivered packet, if any.
    pub fn last_received(&self) -> Option<Packet> {
        self.last_received.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_ids_are_monotonic() {
        let core = PeerCore::new(1001, "c1");
        let a = core.pack(Payload::Text("a".into()), None, None);
        let b = core.pack(Payload::Text("b".into()), None, None);
        let c = core.pack(Payload::Text("c".into()), Some(42.0), Some(a.packet_id));
        assert_eq!((a.packet_id, b.packet_id, c.packet_id), (0, 1, 2));
        assert_eq!(c.response_to, Some(0));
        assert_eq!(c.payload_size_kb, 42.0);
    }

    #[test]
    fn test_pack_estimates_size_when_absent() {
        let core = PeerCore::new(1001, "c1");
        let packet = core.pack(Payload::Text("x".repeat(128)), None, None);
        assert!((packet.payload_size_kb - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_send_without_link_does_not_panic() {
        let core = PeerCore::new(1001, "c1");
        core.request("hello");
    }

    #[test]
    fn test_note_received_remembers_last() {
        let core = PeerCore::new(1001, "c1");
        assert!(core.last_received().is_none());
        let packet = core.pack(Payload::Text("hi".into()), None, None);
        core.note_received(packet);
        let last = core.last_received().unwrap();
        assert_eq!(last.payload, Payload::Text("hi".into()));
    }
}
