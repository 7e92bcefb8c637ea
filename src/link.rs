//! One-way link between two peers
//!
//! A link fragments payloads into chunks and delivers them to its peer with
//! a deterministic delay model: every chunk pays `chunk_size / bandwidth`,
//! and the link latency is added once per payload, on chunk 0. Each link
//! owns one background transport task; `send` only enqueues, the task
//! sleeps virtual time and invokes the peer's receive callback, so delivery
//! order is FIFO across all producers of the link.
//!
//! Chunking is non-preemptive round-robin: when a payload is larger than
//! `max_chunk_kb`, the head chunk is emitted and the remainder goes back to
//! the tail of the queue, so a later payload's first chunk can interleave
//! with an earlier payload's tail.

use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::clock::SimContext;
use crate::error::SimError;
use crate::models::Packet;
use crate::peer::Peer;

/// How a packet should be framed by the transport task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Fragment into `max_chunk_kb` chunks.
    Normal,
    /// The packet is already a chunk (proxy relay); keep its framing.
    ForwardChunk,
    /// Deliver as one chunk regardless of size.
    DoNotChunk,
}

/// Static link attributes.
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    pub latency_s: f64,
    pub bandwidth_kb_s: f64,
    pub max_chunk_kb: f64,
}

struct SendItem {
    packet: Packet,
    remaining_kb: f64,
    next_chunk_id: u64,
    mode: SendMode,
}

struct LinkShared {
    params: LinkParams,
    peer: OnceLock<Arc<dyn Peer>>,
    tx: mpsc::UnboundedSender<SendItem>,
    ctx: Arc<SimContext>,
}

/// A directed, ordered, chunking byte pipe to exactly one peer.
pub struct Link {
    shared: Arc<LinkShared>,
}

impl Link {
    /// Create an unconnected link and start its transport task.
    pub fn new(params: LinkParams, ctx: Arc<SimContext>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LinkShared {
            params,
            peer: OnceLock::new(),
            tx,
            ctx,
        });
        tokio::spawn(transport(shared.clone(), rx));
        Link { shared }
    }

    /// Create a link already connected to `peer`.
    pub fn to(peer: Arc<dyn Peer>, params: LinkParams, ctx: Arc<SimContext>) -> Self {
        let link = Link::new(params, ctx);
        link.connect(peer);
        link
    }

    /// Attach the receiving peer. A link talks to exactly one peer; later
    /// calls are ignored.
    pub fn connect(&self, peer: Arc<dyn Peer>) {
        if self.shared.peer.set(peer).is_err() {
            warn!("link already has a peer connected");
        }
    }

    pub fn params(&self) -> LinkParams {
        self.shared.params
    }

    /// Enqueue a packet for delivery. A send on a link without a peer is
    /// logged and dropped.
    pub fn send(&self, packet: Packet, mode: SendMode) {
        if self.shared.peer.get().is_none() {
            let error = SimError::NoPeerConnected;
            warn!(
                sender = packet.sender,
                packet_id = packet.packet_id,
                %error,
                "dropping send"
            );
            return;
        }
        let item = SendItem {
            remaining_kb: packet.payload_size_kb,
            next_chunk_id: 0,
            packet,
            mode,
        };
        // The transport task holds the receiver for the process lifetime.
        let _ = self.shared.tx.send(item);
    }
}

/// Sole consumer of a link's queue: frames one chunk per dequeue, sleeps its
/// transmission delay on the virtual clock, and hands it to the peer.
async fn transport(shared: Arc<LinkShared>, mut rx: mpsc::UnboundedReceiver<SendItem>) {
    let LinkParams {
        latency_s,
        bandwidth_kb_s,
        max_chunk_kb,
    } = shared.params;

    while let Some(mut item) = rx.recv().await {
        let mut chunk = item.packet.clone();

        match item.mode {
            SendMode::Normal => {
                chunk.chunk_id = item.next_chunk_id;
                if item.remaining_kb > max_chunk_kb {
                    chunk.chunk_size_kb = Some(max_chunk_kb);
                    item.next_chunk_id += 1;
                    item.remaining_kb -= max_chunk_kb;
                    // Remainder rejoins at the tail: round-robin with any
                    // payload queued behind this one.
                    let _ = shared.tx.send(item);
                } else {
                    chunk.chunk_size_kb = Some(item.remaining_kb);
                    chunk.last_chunk = true;
                }
            }
            SendMode::ForwardChunk => {
                if chunk.chunk_size_kb.is_none() {
                    let error = SimError::ChunkMissingSize(chunk.sender);
                    warn!(packet_id = chunk.packet_id, %error, "falling back to payload size");
                    chunk.chunk_size_kb = Some(item.remaining_kb);
                }
            }
            SendMode::DoNotChunk => {
                chunk.chunk_id = 0;
                chunk.chunk_size_kb = Some(item.remaining_kb);
                chunk.last_chunk = true;
            }
        }

        let mut delay = chunk.chunk_kb() / bandwidth_kb_s;
        if chunk.chunk_id == 0 {
            // Latency is only noticeable once per payload; the following
            // chunks travel back-to-back.
            delay += latency_s;
        }

        trace!(
            chunk_id = chunk.chunk_id,
            chunk_kb = chunk.chunk_kb(),
            delay_s = delay,
            "link transporting chunk"
        );
        shared.ctx.clock.sleep(delay).await;

        match shared.peer.get() {
            Some(peer) => peer.received(chunk),
            None => debug!("chunk dropped: link peer disappeared"),
        }
    }
}
