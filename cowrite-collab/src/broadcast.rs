//! Fan-out of encoded frames to every member of a session.
//!
//! One tokio broadcast channel per script. Frames are encoded once and
//! shared behind an `Arc`; each connection task decides from the frame header
//! whether the frame is meant for its member, so nothing is decoded twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Envelope, PeerInfo, ProtocolError};

/// An encoded envelope plus routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Member the frame originates from (`Uuid::nil()` for the server).
    pub sender: Uuid,
    /// Deliver to the sender too. Edits are echoed back as acknowledgments;
    /// presence is not.
    pub echo_to_sender: bool,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn delivers_to(&self, member: Uuid) -> bool {
        self.echo_to_sender || self.sender != member
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Members of one script's session and their shared channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    members: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    /// Frames buffered per receiver before a slow member lags
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a member. The receiver sees every frame sent from now on.
    pub async fn add_member(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Frame>> {
        let mut members = self.members.write().await;
        members.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, member: &Uuid) -> Option<PeerInfo> {
        self.members.write().await.remove(member)
    }

    /// Encode and send an envelope. Returns the number of receivers.
    pub fn broadcast(&self, envelope: &Envelope, echo_to_sender: bool) -> Result<usize, ProtocolError> {
        let frame = Frame {
            sender: envelope.sender,
            echo_to_sender,
            bytes: envelope.encode()?,
        };
        Ok(self.broadcast_frame(Arc::new(frame)))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_frame(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<PeerInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, member: &Uuid) -> bool {
        self.members.read().await.contains_key(member)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
