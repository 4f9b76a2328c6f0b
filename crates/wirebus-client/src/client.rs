//! The event client: connection state machine, typed subscriptions,
//! publishing, and correlated queries against a WireBus broker.
//!
//! Connection lifecycle:
//!
//! - [`EventClient::connect`] opens the socket (retrying on a fixed backoff
//!   until cancelled — the only place the initial connect auto-retries),
//!   starts the frame-reader task, and sends a handshake probe. Only after
//!   the broker acks the probe is the connection marked
//!   [`ConnectState::Connected`]; a silent peer yields
//!   [`ClientError::BrokerNotVerified`].
//! - A heartbeat task then pings the broker on a fixed interval. Send
//!   failures accumulate; hitting the threshold tears the connection down
//!   and reconnects. A reader-side connection loss takes the same path.
//! - After any reconnect, every subject with registered handlers is
//!   re-announced to the broker.
//!
//! All socket writes go through one mutex-guarded write half, so frames from
//! concurrent publishers, the heartbeat task, and query traffic never
//! interleave on the wire.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use wirebus_core::protocol::codec::{decode_body, decode_payload, encode_frame, encode_payload};
use wirebus_core::protocol::messages::{
    BusMessage, HandshakeProbe, Heartbeat, PublishMessage, QueryMessage, SubscribeMessage,
    UnsubscribeMessage,
};
use wirebus_core::protocol::wire::{DecodeError, WireShape, WireValue};
use wirebus_core::protocol::TaskIdCounter;
use wirebus_core::transport::{read_frame, write_frame, TransportError};

use crate::config::ClientConfig;
use crate::subscription::{DynHandler, HandlerFuture, HandlerRegistry, Removal, SubscriptionId};

/// Errors surfaced by the client's public API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation requires a verified broker connection.
    #[error("not connected to a broker")]
    NotConnected,

    /// The TCP connect succeeded but the peer never answered the handshake
    /// probe, so it cannot be trusted to be a WireBus broker.
    #[error("broker not verified: no handshake ack within {timeout:?}")]
    BrokerNotVerified { timeout: Duration },

    /// No answer arrived for a query within the caller's deadline.
    #[error("query on '{subject}' timed out after {timeout:?}")]
    QueryTimeout { subject: String, timeout: Duration },

    /// The client was disconnected while the operation was in flight.
    #[error("cancelled: client is disconnecting")]
    Cancelled,

    /// The connection failed underneath the operation.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A query answer arrived but did not decode as the expected type.
    #[error("query answer did not decode: {0}")]
    AnswerDecode(#[from] DecodeError),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    /// The socket opened but the peer failed the handshake; the connection
    /// was cancelled and must not be used.
    ConnectedButUnverified,
}

impl ConnectState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectState::Connecting,
            2 => ConnectState::Connected,
            3 => ConnectState::ConnectedButUnverified,
            _ => ConnectState::Disconnected,
        }
    }
}

/// A typed publish/subscribe/query client for one broker connection.
pub struct EventClient {
    inner: Arc<ClientShared>,
}

struct ClientShared {
    config: ClientConfig,
    state: AtomicU8,
    /// Bumped on every successful (re)connect and on disconnect; background
    /// loops from an older connection observe the mismatch and exit.
    generation: AtomicU64,
    reconnecting: AtomicBool,
    task_ids: TaskIdCounter,
    handlers: HandlerRegistry,
    /// In-flight queries: task id → waiter for the answer payload.
    pending_queries: Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
    /// Outstanding handshake: probe task id → waiter completed by the ack.
    handshake_wait: StdMutex<Option<(u32, oneshot::Sender<()>)>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    heartbeat_failures: AtomicU32,
    endpoint: StdMutex<Option<(String, u16)>>,
    cancel: StdMutex<Option<watch::Sender<bool>>>,
}

impl EventClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientShared {
                config,
                state: AtomicU8::new(ConnectState::Disconnected as u8),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                task_ids: TaskIdCounter::new(),
                handlers: HandlerRegistry::new(),
                pending_queries: Mutex::new(HashMap::new()),
                handshake_wait: StdMutex::new(None),
                writer: Mutex::new(None),
                heartbeat_failures: AtomicU32::new(0),
                endpoint: StdMutex::new(None),
                cancel: StdMutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectState {
        ConnectState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Connects to the broker at `host:port` and completes the handshake.
    ///
    /// Socket-level failures are retried on
    /// [`reconnect_interval`](ClientConfig::reconnect_interval) until
    /// [`disconnect`](Self::disconnect) cancels the attempt, so this call
    /// only returns once the handshake settles (or the session is
    /// cancelled).
    ///
    /// # Errors
    ///
    /// [`ClientError::BrokerNotVerified`] when the peer accepts the socket
    /// but never acks the probe, [`ClientError::Cancelled`] when
    /// `disconnect` interrupts the attempt.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        // Restart from a clean slate if a session already exists.
        self.disconnect().await;

        *self.inner.endpoint.lock().unwrap() = Some((host.to_string(), port));
        let (tx, rx) = watch::channel(false);
        *self.inner.cancel.lock().unwrap() = Some(tx);

        Arc::clone(&self.inner).connect_session(rx).await
    }

    /// Cancels all background loops, closes the socket, and returns the
    /// client to [`ConnectState::Disconnected`]. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.cancel_session();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.teardown_io().await;
        self.inner.set_state(ConnectState::Disconnected);
    }

    /// Registers a synchronous handler for `subject`.
    ///
    /// The first handler for a subject announces it to the broker with one
    /// `Subscribe` frame; further handlers only extend the local list.
    /// Handlers run in registration order on delivery.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if announcing the subject fails;
    /// the handler stays registered and is re-announced on reconnect.
    pub async fn subscribe<T, F>(
        &self,
        subject: &str,
        handler: F,
    ) -> Result<SubscriptionId, ClientError>
    where
        T: WireValue + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let decode_and_invoke: DynHandler = Arc::new(move |payload: Vec<u8>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                match decode_payload::<T>(&payload) {
                    Ok(message) => handler(message),
                    Err(e) => warn!("discarding delivery that does not decode as subscribed type: {e}"),
                }
            }) as HandlerFuture
        });
        self.subscribe_with(subject, decode_and_invoke).await
    }

    /// Registers an asynchronous handler for `subject`.
    ///
    /// The returned future is awaited to completion before the next handler
    /// for the same delivery runs — delivery is in-order, not
    /// fire-and-forget.
    pub async fn subscribe_async<T, F, Fut>(
        &self,
        subject: &str,
        handler: F,
    ) -> Result<SubscriptionId, ClientError>
    where
        T: WireValue + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let decode_and_invoke: DynHandler = Arc::new(move |payload: Vec<u8>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                match decode_payload::<T>(&payload) {
                    Ok(message) => handler(message).await,
                    Err(e) => warn!("discarding delivery that does not decode as subscribed type: {e}"),
                }
            }) as HandlerFuture
        });
        self.subscribe_with(subject, decode_and_invoke).await
    }

    async fn subscribe_with(
        &self,
        subject: &str,
        handler: DynHandler,
    ) -> Result<SubscriptionId, ClientError> {
        let (id, first) = self.inner.handlers.add(subject, handler).await;
        if first && self.state() == ConnectState::Connected {
            self.inner
                .send_shape(&SubscribeMessage {
                    task_id: self.inner.task_ids.next(),
                    subject: subject.to_string(),
                })
                .await?;
        }
        Ok(id)
    }

    /// Removes the handler registered under `id` for `subject`.
    ///
    /// Removing the last handler for a subject sends one `Unsubscribe`
    /// frame. Returns `false` when no such registration exists.
    pub async fn unsubscribe(
        &self,
        subject: &str,
        id: SubscriptionId,
    ) -> Result<bool, ClientError> {
        match self.inner.handlers.remove(subject, id).await {
            Removal::NotFound => Ok(false),
            Removal::Removed { last: false } => Ok(true),
            Removal::Removed { last: true } => {
                if self.state() == ConnectState::Connected {
                    self.inner
                        .send_shape(&UnsubscribeMessage {
                            task_id: self.inner.task_ids.next(),
                            subject: subject.to_string(),
                        })
                        .await?;
                }
                Ok(true)
            }
        }
    }

    /// Publishes `message` on `subject`.
    ///
    /// Success means the frame left this client; delivery to remote
    /// subscribers is not acknowledged back to the publisher.
    pub async fn publish<T: WireValue>(
        &self,
        subject: &str,
        message: &T,
    ) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.inner
            .send_shape(&PublishMessage {
                task_id: self.inner.task_ids.next(),
                subject: subject.to_string(),
                payload: encode_payload(message),
            })
            .await
    }

    /// Sends `message` as a query on `subject` and waits up to `wait` for a
    /// subscriber's answer, decoded as `R`.
    ///
    /// # Errors
    ///
    /// [`ClientError::QueryTimeout`] when no answer arrives in time (the
    /// pending entry is released, so a later query on the subject starts
    /// fresh), [`ClientError::Cancelled`] when the client disconnects while
    /// waiting, and [`ClientError::AnswerDecode`] when the answer payload
    /// does not decode as `R`.
    pub async fn query<Q, R>(
        &self,
        subject: &str,
        message: &Q,
        wait: Duration,
    ) -> Result<R, ClientError>
    where
        Q: WireValue,
        R: WireValue,
    {
        self.ensure_connected()?;

        let task_id = self.inner.task_ids.next();
        let (tx, rx) = oneshot::channel();
        self.inner.pending_queries.lock().await.insert(task_id, tx);

        let send_result = self
            .inner
            .send_shape(&QueryMessage {
                task_id,
                subject: subject.to_string(),
                payload: encode_payload(message),
            })
            .await;
        if let Err(e) = send_result {
            self.inner.pending_queries.lock().await.remove(&task_id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Err(_) => {
                self.inner.pending_queries.lock().await.remove(&task_id);
                Err(ClientError::QueryTimeout {
                    subject: subject.to_string(),
                    timeout: wait,
                })
            }
            // The waiter was dropped by teardown: the client is going away.
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Ok(Ok(payload)) => Ok(decode_payload::<R>(&payload)?),
        }
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.state() == ConnectState::Connected {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}

impl Drop for EventClient {
    fn drop(&mut self) {
        // Background loops hold clones of `inner`; signalling here lets them
        // exit even when the caller never disconnected explicitly.
        self.inner.cancel_session();
    }
}

impl ClientShared {
    fn set_state(&self, state: ConnectState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn cancel_session(&self) {
        let sender = self.cancel.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
    }

    /// Drops the socket writer and fails every in-flight wait.
    async fn teardown_io(&self) {
        *self.writer.lock().await = None;
        // Dropping the senders wakes `query` waiters with a cancellation.
        self.pending_queries.lock().await.clear();
        self.handshake_wait.lock().unwrap().take();
    }

    /// Dials the broker, verifies it with a handshake probe, and starts the
    /// background loops. Retries the TCP connect until cancelled.
    async fn connect_session(
        self: Arc<Self>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        let (host, port) = match self.endpoint.lock().unwrap().clone() {
            Some(endpoint) => endpoint,
            None => return Err(ClientError::NotConnected),
        };
        self.set_state(ConnectState::Connecting);

        let stream = loop {
            tokio::select! {
                _ = cancel_rx.changed() => return Err(ClientError::Cancelled),
                result = TcpStream::connect((host.as_str(), port)) => match result {
                    Ok(stream) => break stream,
                    Err(e) => {
                        warn!(
                            "could not connect to broker at {host}:{port}: {e}; retrying in {:?}",
                            self.config.reconnect_interval
                        );
                        tokio::select! {
                            _ = cancel_rx.changed() => return Err(ClientError::Cancelled),
                            _ = sleep(self.config.reconnect_interval) => {}
                        }
                    }
                },
            }
        };
        let _ = stream.set_nodelay(true);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.heartbeat_failures.store(0, Ordering::SeqCst);

        tokio::spawn(Self::read_loop(
            Arc::clone(&self),
            read_half,
            cancel_rx.clone(),
            generation,
        ));

        // Handshake: the TCP accept alone proves nothing about the peer.
        let task_id = self.task_ids.next();
        let (ack_tx, ack_rx) = oneshot::channel();
        *self.handshake_wait.lock().unwrap() = Some((task_id, ack_tx));
        if let Err(e) = self.send_shape(&HandshakeProbe { task_id }).await {
            self.handshake_wait.lock().unwrap().take();
            return Err(e);
        }

        match timeout(self.config.handshake_timeout, ack_rx).await {
            Err(_) => {
                self.handshake_wait.lock().unwrap().take();
                self.set_state(ConnectState::ConnectedButUnverified);
                // Cancel the session: the socket is open but the peer never
                // verified itself as a broker.
                self.cancel_session();
                self.teardown_io().await;
                Err(ClientError::BrokerNotVerified {
                    timeout: self.config.handshake_timeout,
                })
            }
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Ok(Ok(())) => {
                self.set_state(ConnectState::Connected);
                tokio::spawn(Self::heartbeat_loop(
                    Arc::clone(&self),
                    cancel_rx.clone(),
                    generation,
                ));
                self.reannounce_subscriptions().await;
                info!("connected to broker at {host}:{port}");
                Ok(())
            }
        }
    }

    /// Reads frames until cancelled or the connection drops; a drop outside
    /// shutdown takes the reconnect path.
    async fn read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        mut cancel_rx: watch::Receiver<bool>,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => return,
                frame = read_frame(&mut read_half) => match frame {
                    Ok(Some((header, body))) => match decode_body(&header, &body) {
                        Ok(message) => self.dispatch(message).await,
                        Err(e) => warn!("dropping undecodable frame from broker: {e}"),
                    },
                    Ok(None) => {
                        self.connection_lost("broker closed the connection", cancel_rx, generation);
                        return;
                    }
                    Err(e) => {
                        self.connection_lost(&format!("read failed: {e}"), cancel_rx, generation);
                        return;
                    }
                },
            }
        }
    }

    fn connection_lost(
        self: &Arc<Self>,
        reason: &str,
        cancel_rx: watch::Receiver<bool>,
        generation: u64,
    ) {
        if *cancel_rx.borrow() || self.generation.load(Ordering::SeqCst) != generation {
            // An intentional disconnect or a newer connection already exists.
            return;
        }
        warn!("connection to broker lost ({reason}); reconnecting");
        self.begin_reconnect(cancel_rx);
    }

    /// Tears the session down and dials again, once, no matter how many
    /// loops observed the same failure.
    fn begin_reconnect(self: &Arc<Self>, cancel_rx: watch::Receiver<bool>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.set_state(ConnectState::Disconnected);
            shared.teardown_io().await;
            let result = Arc::clone(&shared).connect_session(cancel_rx).await;
            shared.reconnecting.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => info!("reconnected to broker"),
                Err(ClientError::Cancelled) => {}
                Err(e) => warn!("reconnect failed: {e}"),
            }
        });
    }

    /// Sends a heartbeat on a fixed interval; consecutive send failures up
    /// to the threshold trigger a reconnect.
    async fn heartbeat_loop(
        self: Arc<Self>,
        mut cancel_rx: watch::Receiver<bool>,
        generation: u64,
    ) {
        loop {
            tokio::select! {
                _ = cancel_rx.changed() => return,
                _ = sleep(self.config.heartbeat_interval) => {}
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }

            match self.send_shape(&Heartbeat::default()).await {
                Ok(()) => {}
                Err(e) => {
                    let failures = self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    let max = self.config.max_heartbeat_failures;
                    warn!("heartbeat send failed ({failures}/{max}): {e}");
                    if failures >= max {
                        self.heartbeat_failures.store(0, Ordering::SeqCst);
                        warn!("heartbeat failures exhausted; reconnecting");
                        self.begin_reconnect(cancel_rx.clone());
                        return;
                    }
                }
            }
        }
    }

    /// Routes one inbound frame: handshake acks, query answers, fan-out
    /// deliveries, heartbeat echoes.
    async fn dispatch(&self, message: BusMessage) {
        match message {
            BusMessage::Ack(ack) => {
                let waiter = {
                    let mut guard = self.handshake_wait.lock().unwrap();
                    match guard.take() {
                        Some((task_id, tx)) if task_id == ack.task_id => Some(tx),
                        other => {
                            *guard = other;
                            None
                        }
                    }
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    // No publisher-side ack tracking: any other ack is noise.
                    None => debug!(task_id = ack.task_id, "ignoring ack"),
                }
            }
            BusMessage::Delivery(delivery) => {
                let pending = self
                    .pending_queries
                    .lock()
                    .await
                    .remove(&delivery.task_id);
                if let Some(tx) = pending {
                    let _ = tx.send(delivery.payload);
                    return;
                }
                self.deliver_to_handlers(&delivery.subject, delivery.payload)
                    .await;
            }
            BusMessage::Heartbeat(_) => {
                self.heartbeat_failures.store(0, Ordering::SeqCst);
            }
            other => {
                debug!(kind = ?other.kind(), "ignoring unexpected frame from broker");
            }
        }
    }

    async fn deliver_to_handlers(&self, subject: &str, payload: Vec<u8>) {
        let handlers = self.handlers.snapshot(subject).await;
        if handlers.is_empty() {
            debug!(subject, "delivery for subject with no handlers");
            return;
        }

        for handler in handlers {
            // Each handler runs in its own task and is awaited before the
            // next: registration order is preserved and a panicking handler
            // cannot take down the dispatch loop or starve its successors.
            let invocation = handler(payload.clone());
            if let Err(e) = tokio::spawn(invocation).await {
                warn!(subject, "subscriber handler panicked: {e}");
            }
        }
    }

    /// Re-announces every subject that has live handlers. Called after each
    /// successful (re)connect; on the first connect the registry is empty.
    async fn reannounce_subscriptions(&self) {
        for subject in self.handlers.subjects().await {
            let message = SubscribeMessage {
                task_id: self.task_ids.next(),
                subject: subject.clone(),
            };
            match self.send_shape(&message).await {
                Ok(()) => debug!(subject = %subject, "re-announced subscription"),
                Err(e) => warn!(subject = %subject, "failed to re-announce subscription: {e}"),
            }
        }
    }

    async fn send_shape<S: WireShape>(&self, shape: &S) -> Result<(), ClientError> {
        let frame = encode_frame(shape);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        write_frame(writer, &frame).await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
