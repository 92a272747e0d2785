//! Self-healing connection to the upstream topic service.
//!
//! [`TopicServiceClient`] keeps one framed TCP connection open. Each
//! connection gets a send loop, which drains the outbound queue into the
//! socket, and a receive loop, which decodes frames into the inbound queue and
//! swallows heartbeats. A loop that hits an I/O error closes the connection;
//! unless [`TopicServiceClient::shutdown`] was called, closing immediately
//! starts reconnecting with capped exponential backoff.
//!
//! The outbound and inbound queues outlive individual connections, so callers
//! keep their handles across reconnects. Messages in flight on a broken
//! connection are lost.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected ...
//!                                    \             \
//!                                     `-------------`--> ShutDown
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::TopicServiceConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::network::codec::{self, FireCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::network::message::kinds;
use crate::network::Message;

use super::backoff::{retry, BackoffPolicy};

/// Observable link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal. Reached only through [`TopicServiceClient::shutdown`].
    ShutDown,
}

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address: String,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
    pub backoff: BackoffPolicy,
}

impl TransportConfig {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(3),
            queue_capacity: 1024,
            read_buffer_size: 16 * 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl From<&TopicServiceConfig> for TransportConfig {
    fn from(config: &TopicServiceConfig) -> Self {
        Self {
            address: config.address(),
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            queue_capacity: config.queue_capacity,
            read_buffer_size: config.read_buffer_size,
            max_frame_size: config.max_frame_size,
            backoff: config.backoff_policy(),
        }
    }
}

/// Narrow publish capability used by the gateway manager.
#[async_trait]
pub trait UpstreamPublisher: Send + Sync {
    async fn publish(&self, id: &str, source: &str, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Everything guarded by the link lock.
struct Link {
    live: bool,
    manual_close: bool,
    /// Cancels the loops of the current connection.
    close_token: Option<CancellationToken>,
    /// Bumped on every successful connect so stale loops cannot close a
    /// newer connection.
    generation: u64,
}

/// Reconnecting client for the topic service.
pub struct TopicServiceClient {
    config: TransportConfig,
    link: Mutex<Link>,
    state_tx: watch::Sender<LinkState>,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    shutdown: CancellationToken,
    metrics: Arc<GatewayMetrics>,
}

impl TopicServiceClient {
    /// Create a new client (not yet connected).
    #[must_use]
    pub fn new(config: TransportConfig, metrics: Arc<GatewayMetrics>) -> Arc<Self> {
        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (state_tx, _) = watch::channel(LinkState::Disconnected);

        Arc::new(Self {
            config,
            link: Mutex::new(Link {
                live: false,
                manual_close: false,
                close_token: None,
                generation: 0,
            }),
            state_tx,
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            shutdown: CancellationToken::new(),
            metrics,
        })
    }

    /// Get the topic service address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Whether a connection is currently up.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.lock_link().live
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Wait until the link is connected.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Shutdown`] once the client is shut down.
    pub async fn wait_until_live(&self) -> Result<()> {
        let mut state = self.state_tx.subscribe();
        let result = state
            .wait_for(|s| matches!(s, LinkState::Connected | LinkState::ShutDown))
            .await
            .map(|s| *s);
        match result {
            Ok(LinkState::Connected) => Ok(()),
            _ => Err(GatewayError::Shutdown),
        }
    }

    /// Open one connection and start its send and receive loops.
    ///
    /// Does nothing if a connection is already up.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Connect`] if the dial fails or times out, and
    /// [`GatewayError::Shutdown`] after [`shutdown`](Self::shutdown).
    #[instrument(skip(self), fields(address = %self.config.address))]
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let link = self.lock_link();
            if link.manual_close {
                return Err(GatewayError::Shutdown);
            }
            if link.live {
                return Ok(());
            }
            if *self.state_tx.borrow() == LinkState::Disconnected {
                self.state_tx.send_replace(LinkState::Connecting);
            }
        }

        let stream = match timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to topic service");
                return Err(GatewayError::Connect {
                    address: self.config.address.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!("connection timeout");
                return Err(GatewayError::Connect {
                    address: self.config.address.clone(),
                    message: "connection timeout".to_string(),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let token = self.shutdown.child_token();
        let generation = {
            let mut link = self.lock_link();
            if link.manual_close {
                return Err(GatewayError::Shutdown);
            }
            if link.live {
                // Lost a race with a concurrent connect; keep theirs.
                return Ok(());
            }
            link.live = true;
            link.close_token = Some(token.clone());
            link.generation += 1;
            self.state_tx.send_replace(LinkState::Connected);
            link.generation
        };
        self.metrics.set_upstream_connected(true);

        let (reader, writer) = stream.into_split();
        self.spawn_worker(
            "send",
            generation,
            Arc::clone(self).send_loop(writer, token.clone(), generation),
        );
        self.spawn_worker(
            "receive",
            generation,
            Arc::clone(self).receive_loop(reader, token, generation),
        );

        info!(generation, "connected to topic service");
        Ok(())
    }

    /// Close the current connection and, unless shut down, reconnect.
    ///
    /// Idempotent: closing a link that is not live returns immediately. The
    /// returned future completes once the reconnect succeeded or the client
    /// was shut down.
    pub fn close(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        self.close_generation(None)
    }

    fn close_generation(self: &Arc<Self>, generation: Option<u64>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let token = {
                let mut link = this.lock_link();
                if generation.is_some_and(|g| g != link.generation) || !link.live {
                    return;
                }
                link.live = false;
                if !link.manual_close {
                    this.state_tx.send_replace(LinkState::Reconnecting);
                }
                link.close_token.take()
            };
            if let Some(token) = token {
                token.cancel();
            }
            this.metrics.set_upstream_connected(false);
            info!(address = %this.config.address, "topic service connection closed");

            this.reconnect().await;
        }
        .boxed()
    }

    async fn reconnect(self: &Arc<Self>) {
        if self.lock_link().manual_close {
            return;
        }
        let result = retry(
            self.config.backoff,
            &self.shutdown,
            "topic service reconnect",
            || self.connect(),
        )
        .await;

        match result {
            Ok(()) => {
                self.metrics.record_reconnect();
                info!(address = %self.config.address, "reconnected to topic service");
            }
            Err(e) => debug!(error = %e, "reconnect abandoned"),
        }
    }

    /// Close permanently. No reconnect is attempted afterwards.
    pub fn shutdown(&self) {
        let token = {
            let mut link = self.lock_link();
            link.manual_close = true;
            link.live = false;
            self.state_tx.send_replace(LinkState::ShutDown);
            link.close_token.take()
        };
        self.shutdown.cancel();
        if let Some(token) = token {
            token.cancel();
        }
        self.metrics.set_upstream_connected(false);
        info!(address = %self.config.address, "topic service client shut down");
    }

    /// Queue an encoded frame for sending.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionClosed`] if the link is not live and
    /// [`GatewayError::SendTimeout`] if the queue stays full for the send
    /// timeout.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if !self.is_live() {
            return Err(GatewayError::ConnectionClosed);
        }
        match timeout(self.config.send_timeout, self.outbound_tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                self.metrics.record_send_timeout();
                warn!(address = %self.config.address, "topic service send timeout");
                Err(GatewayError::SendTimeout {
                    timeout: self.config.send_timeout,
                })
            }
        }
    }

    /// Encode and send a `publish` frame.
    ///
    /// # Errors
    ///
    /// Framing errors plus everything [`send`](Self::send) returns.
    pub async fn publish(&self, id: &str, source: &str, topic: &str, payload: &[u8]) -> Result<()> {
        let frame = codec::encode_with_limit(
            kinds::PUBLISH,
            id,
            source,
            topic,
            Some(payload),
            self.config.max_frame_size,
        )?;
        self.send(frame).await
    }

    /// Next application message from the topic service.
    ///
    /// Heartbeats are skipped. Messages already queued are returned even
    /// after the link went down.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ConnectionClosed`] once the link is down and
    /// the queue is drained.
    pub async fn receive(&self) -> Result<Message> {
        let mut inbound = self.inbound_rx.lock().await;
        let mut state = self.state_tx.subscribe();

        loop {
            match inbound.try_recv() {
                Ok(message) if message.is_heartbeat() => continue,
                Ok(message) => return Ok(message),
                Err(TryRecvError::Disconnected) => return Err(GatewayError::ConnectionClosed),
                Err(TryRecvError::Empty) => {}
            }
            if !self.is_live() {
                return Err(GatewayError::ConnectionClosed);
            }

            tokio::select! {
                next = inbound.recv() => match next {
                    Some(message) if message.is_heartbeat() => continue,
                    Some(message) => return Ok(message),
                    None => return Err(GatewayError::ConnectionClosed),
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(GatewayError::ConnectionClosed);
                    }
                }
            }
        }
    }

    fn spawn_worker<F>(self: &Arc<Self>, name: &'static str, generation: u64, worker: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(worker).catch_unwind().await {
                error!(
                    worker = name,
                    generation,
                    panic = panic_message(panic.as_ref()),
                    "transport worker panicked"
                );
                this.close_generation(Some(generation)).await;
            }
        });
    }

    async fn send_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        token: CancellationToken,
        generation: u64,
    ) {
        let result: std::io::Result<()> = async {
            // A previous connection's loop may still hold the queue briefly.
            let mut outbound = tokio::select! {
                guard = self.outbound_rx.lock() => guard,
                () = token.cancelled() => return Ok(()),
            };
            loop {
                let payload = tokio::select! {
                    () = token.cancelled() => return Ok(()),
                    next = outbound.recv() => match next {
                        Some(payload) => payload,
                        None => return Ok(()),
                    },
                };
                tokio::select! {
                    written = writer.write_all(&payload) => written?,
                    () = token.cancelled() => return Ok(()),
                }
                trace!(bytes = payload.len(), "frame written");
            }
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, generation, "topic service write failed");
            self.close_generation(Some(generation)).await;
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        reader: OwnedReadHalf,
        token: CancellationToken,
        generation: u64,
    ) {
        let codec = FireCodec::with_max_frame_size(self.config.max_frame_size);
        let mut frames = FramedRead::with_capacity(reader, codec, self.config.read_buffer_size);

        let failed = loop {
            let next = tokio::select! {
                () = token.cancelled() => break false,
                next = frames.next() => next,
            };
            let decoder = frames.decoder_mut();
            self.metrics
                .record_frames_corrupt(decoder.take_corrupt_frames());
            self.metrics
                .record_garbage_bytes(decoder.take_skipped_bytes());

            match next {
                Some(Ok(message)) => {
                    self.metrics.record_frame_decoded();
                    if message.is_heartbeat() {
                        trace!("heartbeat received");
                        continue;
                    }
                    tokio::select! {
                        sent = self.inbound_tx.send(message) => {
                            if sent.is_err() {
                                break false;
                            }
                        }
                        () = token.cancelled() => break false,
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, generation, "topic service read failed");
                    break true;
                }
                None => {
                    info!(generation, "topic service closed the connection");
                    break true;
                }
            }
        };

        // Release the socket before waiting out the reconnect.
        drop(frames);
        if failed {
            self.close_generation(Some(generation)).await;
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UpstreamPublisher for TopicServiceClient {
    async fn publish(&self, id: &str, source: &str, topic: &str, payload: &[u8]) -> Result<()> {
        TopicServiceClient::publish(self, id, source, topic, payload).await
    }
}

impl std::fmt::Debug for TopicServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicServiceClient")
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
