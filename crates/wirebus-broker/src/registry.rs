//! Broker-side routing state: the subject→subscriber registry and the
//! subject→pending-query table.
//!
//! Both maps are owned by the broker instance and guarded by `RwLock`;
//! fan-out takes a snapshot under the read lock and sends outside it, so
//! iteration never races a concurrent subscribe/unsubscribe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;
use wirebus_core::transport::{write_frame, TransportError};

/// A connected peer: its identity plus the write half of its socket.
///
/// The write half sits behind a mutex so that concurrent logical operations
/// (fan-out, acks, heartbeat echoes) targeting the same connection emit one
/// frame at a time and never interleave bytes.
#[derive(Clone)]
pub(crate) struct Peer {
    pub id: Uuid,
    pub addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl Peer {
    pub fn new(addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes one pre-encoded frame to this peer, serialized against all
    /// other writers on the same connection.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }
}

// ── Subscriber registry ───────────────────────────────────────────────────────

/// `subject → subscriber set`, keyed by peer id for idempotent membership.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    inner: RwLock<HashMap<String, Vec<Peer>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `peer` to `subject`'s set. Returns `false` when the peer was
    /// already subscribed, so a duplicate subscribe never causes duplicate
    /// deliveries.
    pub async fn add(&self, subject: &str, peer: &Peer) -> bool {
        let mut map = self.inner.write().await;
        let peers = map.entry(subject.to_string()).or_default();
        if peers.iter().any(|p| p.id == peer.id) {
            return false;
        }
        peers.push(peer.clone());
        true
    }

    /// Removes `peer_id` from `subject`'s set if present.
    pub async fn remove(&self, subject: &str, peer_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        let Some(peers) = map.get_mut(subject) else {
            return false;
        };
        let before = peers.len();
        peers.retain(|p| p.id != peer_id);
        let removed = peers.len() != before;
        if peers.is_empty() {
            map.remove(subject);
        }
        removed
    }

    /// Removes `peer_id` from every subject's set (connection loss).
    pub async fn purge_peer(&self, peer_id: Uuid) {
        let mut map = self.inner.write().await;
        map.retain(|_, peers| {
            peers.retain(|p| p.id != peer_id);
            !peers.is_empty()
        });
    }

    /// Snapshot of `subject`'s current subscribers, safe to iterate while
    /// other tasks mutate the registry.
    pub async fn snapshot(&self, subject: &str) -> Vec<Peer> {
        self.inner
            .read()
            .await
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, subject: &str) -> usize {
        self.inner
            .read()
            .await
            .get(subject)
            .map_or(0, |peers| peers.len())
    }
}

// ── Pending-query table ───────────────────────────────────────────────────────

/// One unanswered query: the peer waiting for the answer and the task id the
/// answer must carry.
pub(crate) struct PendingQuery {
    pub peer: Peer,
    pub task_id: u32,
}

/// `subject → pending query`. At most one outstanding query per subject: a
/// second query on the same subject before the first is answered overwrites
/// the entry, and the earlier caller times out. Known limitation, kept from
/// the protocol's single-flight design.
#[derive(Default)]
pub(crate) struct PendingQueryTable {
    inner: RwLock<HashMap<String, PendingQuery>>,
}

impl PendingQueryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending query, returning any entry it displaced.
    pub async fn record(&self, subject: String, pending: PendingQuery) -> Option<PendingQuery> {
        self.inner.write().await.insert(subject, pending)
    }

    /// Removes and returns the pending query for `subject`, if any.
    pub async fn take(&self, subject: &str) -> Option<PendingQuery> {
        self.inner.write().await.remove(subject)
    }

    /// Drops every pending entry whose waiting peer is `peer_id`.
    pub async fn purge_peer(&self, peer_id: Uuid) {
        self.inner
            .write()
            .await
            .retain(|_, pending| pending.peer.id != peer_id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
