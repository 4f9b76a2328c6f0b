//! The event broker: accepts connections, routes frames, fans out publishes,
//! and correlates query answers.
//!
//! One task per accepted connection reads frames and dispatches them against
//! the broker's registries. Routing rules:
//!
//! - `HandshakeProbe` / `Subscribe` / `Unsubscribe` are acknowledged with an
//!   `Ack` echoing the request's task id.
//! - `Publish` on a subject with an unanswered query is the *answer* to that
//!   query: it is routed to the waiting peer only, under the original query's
//!   task id. Any other publish fans out to the subject's subscribers and is
//!   acknowledged to the publisher.
//! - `Query` records the caller as waiting on the subject, then fans out to
//!   subscribers exactly like a publish; a subscriber answers by publishing
//!   back on the same subject.
//! - `Heartbeat` is echoed unchanged.
//!
//! A connection that drops is purged from every subject's subscriber set and
//! from the pending-query table.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wirebus_core::protocol::codec::{decode_body, encode_frame};
use wirebus_core::protocol::messages::{
    AckMessage, AckStatus, BusMessage, DeliveryMessage, Heartbeat,
};
use wirebus_core::transport::read_frame;

use crate::registry::{Peer, PendingQuery, PendingQueryTable, SubscriberRegistry};

/// Errors surfaced by the broker's public API.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Binding the listener socket failed.
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called while the broker was already running.
    #[error("broker is already running")]
    AlreadyRunning,
}

/// A subject-based publish/subscribe and query broker over TCP.
///
/// `start` binds and spawns the accept loop; `stop` signals every connection
/// task to exit and abandons in-flight sends. Both are idempotent in the
/// directions that matter: `stop` on a stopped broker is a no-op, `start` on
/// a running one is an error.
pub struct EventBroker {
    shared: Arc<BrokerShared>,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

struct BrokerShared {
    subscribers: SubscriberRegistry,
    pending_queries: PendingQueryTable,
    connections: AtomicUsize,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                subscribers: SubscriberRegistry::new(),
                pending_queries: PendingQueryTable::new(),
                connections: AtomicUsize::new(0),
            }),
            shutdown: StdMutex::new(None),
            local_addr: StdMutex::new(None),
        }
    }

    /// Binds `host:port` and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BindFailed`] when the listener cannot bind and
    /// [`BrokerError::AlreadyRunning`] when the broker is already started.
    pub async fn start(&self, host: &str, port: u16) -> Result<(), BrokerError> {
        if self.shutdown.lock().unwrap().is_some() {
            return Err(BrokerError::AlreadyRunning);
        }

        let listener =
            TcpListener::bind((host, port))
                .await
                .map_err(|source| BrokerError::BindFailed {
                    addr: format!("{host}:{port}"),
                    source,
                })?;
        let addr = listener.local_addr().map_err(|source| BrokerError::BindFailed {
            addr: format!("{host}:{port}"),
            source,
        })?;

        let (tx, rx) = watch::channel(false);
        {
            // Re-check under the lock; a concurrent start may have won the
            // bind race while ours was in flight.
            let mut shutdown = self.shutdown.lock().unwrap();
            if shutdown.is_some() {
                return Err(BrokerError::AlreadyRunning);
            }
            *shutdown = Some(tx);
        }
        *self.local_addr.lock().unwrap() = Some(addr);

        info!(%addr, "event broker listening");
        tokio::spawn(Self::accept_loop(Arc::clone(&self.shared), listener, rx));
        Ok(())
    }

    /// Signals every broker task to exit and closes the listener.
    /// In-flight sends are abandoned best-effort. Idempotent.
    pub fn stop(&self) {
        let sender = self.shutdown.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
            info!("event broker stopping");
        }
        *self.local_addr.lock().unwrap() = None;
    }

    /// The address the listener is bound to, while running. With port 0 this
    /// is where the kernel actually put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Current subscriber count for `subject`.
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        self.shared.subscribers.count(subject).await
    }

    /// Number of currently connected peers.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    async fn accept_loop(
        shared: Arc<BrokerShared>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(Self::handle_connection(
                            Arc::clone(&shared),
                            stream,
                            addr,
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }

    async fn handle_connection(
        shared: Arc<BrokerShared>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let _ = stream.set_nodelay(true);
        let (mut read_half, write_half) = stream.into_split();
        let peer = Peer::new(addr, write_half);
        shared.connections.fetch_add(1, Ordering::Relaxed);
        info!(peer = %peer.id, addr = %peer.addr, "peer connected");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                frame = read_frame(&mut read_half) => match frame {
                    Ok(Some((header, body))) => match decode_body(&header, &body) {
                        Ok(message) => shared.dispatch(&peer, message).await,
                        // A frame that does not decode is dropped; the
                        // connection and its framing are still intact.
                        Err(e) => warn!(peer = %peer.id, "dropping undecodable frame: {e}"),
                    },
                    Ok(None) => {
                        debug!(peer = %peer.id, "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %peer.id, "transport error, dropping connection: {e}");
                        break;
                    }
                },
            }
        }

        shared.drop_peer(peer.id).await;
        shared.connections.fetch_sub(1, Ordering::Relaxed);
        info!(peer = %peer.id, "peer disconnected");
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerShared {
    async fn dispatch(&self, peer: &Peer, message: BusMessage) {
        match message {
            BusMessage::HandshakeProbe(probe) => {
                debug!(peer = %peer.id, "handshake probe");
                self.send_ack(peer, probe.task_id).await;
            }
            BusMessage::Subscribe(subscribe) => {
                let added = self.subscribers.add(&subscribe.subject, peer).await;
                if added {
                    debug!(peer = %peer.id, subject = %subscribe.subject, "subscribed");
                } else {
                    debug!(peer = %peer.id, subject = %subscribe.subject, "duplicate subscribe ignored");
                }
                self.send_ack(peer, subscribe.task_id).await;
            }
            BusMessage::Unsubscribe(unsubscribe) => {
                self.subscribers.remove(&unsubscribe.subject, peer.id).await;
                debug!(peer = %peer.id, subject = %unsubscribe.subject, "unsubscribed");
                self.send_ack(peer, unsubscribe.task_id).await;
            }
            BusMessage::Publish(publish) => {
                if let Some(pending) = self.pending_queries.take(&publish.subject).await {
                    // This publish answers the in-flight query on the
                    // subject: route it to the waiting peer only, under the
                    // original query's task id.
                    let answer = DeliveryMessage {
                        task_id: pending.task_id,
                        subject: publish.subject,
                        payload: publish.payload,
                    };
                    debug!(
                        peer = %pending.peer.id,
                        subject = %answer.subject,
                        task_id = answer.task_id,
                        "routing query answer"
                    );
                    if let Err(e) = pending.peer.send_frame(&encode_frame(&answer)).await {
                        warn!(peer = %pending.peer.id, "failed to deliver query answer: {e}");
                        self.drop_peer(pending.peer.id).await;
                    }
                } else {
                    let delivery = DeliveryMessage {
                        task_id: publish.task_id,
                        subject: publish.subject.clone(),
                        payload: publish.payload,
                    };
                    self.fan_out(&publish.subject, &delivery).await;
                    self.send_ack(peer, publish.task_id).await;
                }
            }
            BusMessage::Query(query) => {
                let displaced = self
                    .pending_queries
                    .record(
                        query.subject.clone(),
                        PendingQuery {
                            peer: peer.clone(),
                            task_id: query.task_id,
                        },
                    )
                    .await;
                if let Some(displaced) = displaced {
                    // Single-flight per subject: the earlier caller will
                    // observe a timeout rather than an answer.
                    warn!(
                        subject = %query.subject,
                        superseded_task_id = displaced.task_id,
                        "new query displaced an unanswered query on the same subject"
                    );
                }
                let delivery = DeliveryMessage {
                    task_id: query.task_id,
                    subject: query.subject.clone(),
                    payload: query.payload,
                };
                self.fan_out(&query.subject, &delivery).await;
            }
            BusMessage::Heartbeat(_) => {
                if let Err(e) = peer.send_frame(&encode_frame(&Heartbeat::default())).await {
                    warn!(peer = %peer.id, "failed to echo heartbeat: {e}");
                }
            }
            other => {
                debug!(peer = %peer.id, kind = ?other.kind(), "ignoring unexpected frame");
            }
        }
    }

    /// Sends `delivery` to every current subscriber of `subject`.
    ///
    /// Works from a snapshot of the subscriber set; a peer that fails to
    /// accept the frame is purged and never blocks delivery to the rest.
    async fn fan_out(&self, subject: &str, delivery: &DeliveryMessage) {
        let peers = self.subscribers.snapshot(subject).await;
        if peers.is_empty() {
            debug!(subject, "no subscribers for fan-out");
            return;
        }

        let frame = encode_frame(delivery);
        for peer in peers {
            if let Err(e) = peer.send_frame(&frame).await {
                warn!(peer = %peer.id, subject, "removing unreachable subscriber: {e}");
                self.drop_peer(peer.id).await;
            }
        }
    }

    async fn send_ack(&self, peer: &Peer, task_id: u32) {
        let ack = AckMessage {
            task_id,
            status: AckStatus::Success,
            message: String::new(),
        };
        if let Err(e) = peer.send_frame(&encode_frame(&ack)).await {
            warn!(peer = %peer.id, "failed to send ack: {e}");
        }
    }

    /// Forgets a peer entirely: subscriber sets and pending queries.
    async fn drop_peer(&self, peer_id: Uuid) {
        self.subscribers.purge_peer(peer_id).await;
        self.pending_queries.purge_peer(peer_id).await;
    }
}
