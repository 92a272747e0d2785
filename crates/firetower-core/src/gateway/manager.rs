//! Gateway manager.
//!
//! Owns the bucket, the live sessions and the upstream transport, and wires
//! them together:
//!
//! - local publishes are sent upstream; the topic service broadcasts them
//!   back to every gateway, this one included, so nothing is pushed locally
//! - messages arriving from upstream are dispatched by kind into the bucket
//! - a sweep task periodically drops stale bucket entries

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{GatewayError, Result};
use crate::network::message::kinds;
use crate::network::Message;
use crate::transport::{
    retry, LinkState, ManagementChannel, ManagementDialer, TcpManagementDialer,
    TopicServiceClient, TransportConfig, UpstreamPublisher,
};

use super::bucket::Bucket;
use super::context::GatewayContext;
use super::session::Session;
use super::sharding::{HotTopicSharding, SubscribeHook};

/// Composes bucket, sessions and upstream transport.
pub struct GatewayManager {
    context: GatewayContext,
    bucket: Arc<Bucket>,
    upstream: Arc<TopicServiceClient>,
    dialer: Arc<dyn ManagementDialer>,
    management: Mutex<Option<Arc<dyn ManagementChannel>>>,
    sessions: DashMap<String, Arc<Session>>,
    hook: Option<Arc<dyn SubscribeHook>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayManager {
    /// Build a manager from the context.
    ///
    /// Installs the hot-topic sharding hook when `sharding.hot_topics` is
    /// configured and dials the management channel over plain TCP.
    #[must_use]
    pub fn new(context: GatewayContext) -> Self {
        let config = &context.config;
        let upstream = TopicServiceClient::new(
            TransportConfig::from(&config.topic_service),
            Arc::clone(&context.metrics),
        );
        let sharding = HotTopicSharding::from_config(&config.sharding);
        let hook: Option<Arc<dyn SubscribeHook>> = if sharding.is_empty() {
            None
        } else {
            Some(Arc::new(sharding))
        };
        let dialer = Arc::new(TcpManagementDialer::new(config.topic_service.connect_timeout()));

        Self {
            bucket: Arc::new(Bucket::new(Arc::clone(&context.metrics))),
            upstream,
            dialer,
            management: Mutex::new(None),
            sessions: DashMap::new(),
            hook,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            context,
        }
    }

    /// Replace the management dialer.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn ManagementDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Replace the subscribe hook. `None` allows every subscription unchanged.
    #[must_use]
    pub fn with_hook(mut self, hook: Option<Arc<dyn SubscribeHook>>) -> Self {
        self.hook = hook;
        self
    }

    /// Dial the management channel, connect the upstream transport, then
    /// start the bridge and sweep tasks.
    ///
    /// Both dials retry with capped backoff until they succeed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Shutdown`] if [`shutdown`](Self::shutdown) is
    /// called before the transport is up.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let topic_service = &self.context.config.topic_service;
        let policy = topic_service.backoff_policy();
        let grpc_address = topic_service.grpc_address();

        let channel = retry(policy, &self.shutdown, "management dial", || {
            self.dialer.dial(&grpc_address)
        })
        .await?;
        info!(address = %channel.address(), "management channel ready");
        *self
            .management
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(channel);

        retry(policy, &self.shutdown, "topic service connect", || {
            self.upstream.connect()
        })
        .await?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(Arc::clone(self).bridge()));
        let sweep_secs = self.context.config.bucket.sweep_interval_secs;
        if sweep_secs > 0 {
            tasks.push(tokio::spawn(
                Arc::clone(self).sweep_loop(Duration::from_secs(sweep_secs)),
            ));
        }
        drop(tasks);

        info!(address = %self.upstream.address(), "gateway manager started");
        Ok(())
    }

    /// Register a new session. The receiver is the session's send path.
    pub fn open_session(&self) -> (Arc<Session>, mpsc::Receiver<Arc<Message>>) {
        let id = self.context.ids.next_string();
        let capacity = self.context.config.bucket.session_queue_capacity;
        let (session, rx) = Session::new(id, capacity, self.hook.clone());

        self.sessions
            .insert(session.id().to_string(), Arc::clone(&session));
        self.context.metrics.inc_sessions();
        debug!(session_id = %session.id(), "session opened");
        (session, rx)
    }

    /// Subscribe `session` to `topics` after running the subscribe hook.
    ///
    /// Returns the topics actually recorded, which differ from the request
    /// when the hook rewrote them.
    ///
    /// # Errors
    ///
    /// [`GatewayError::SubscribeDenied`] if the hook rejected the request, in
    /// which case nothing is recorded; [`GatewayError::SessionNotFound`] if
    /// the session is closed.
    pub fn subscribe(&self, session: &Arc<Session>, topics: Vec<String>) -> Result<Vec<String>> {
        if !session.is_live() {
            return Err(GatewayError::SessionNotFound {
                session_id: session.id().to_string(),
            });
        }
        let (topics, allowed) = session.rewrite_topics(topics);
        if !allowed {
            debug!(session_id = %session.id(), "subscribe denied by hook");
            return Err(GatewayError::SubscribeDenied {
                session_id: session.id().to_string(),
            });
        }

        for topic in &topics {
            session.add_topic(topic);
            self.bucket.add_subscribe(topic, session);
        }
        debug!(session_id = %session.id(), topics = ?topics, "subscribed");
        Ok(topics)
    }

    /// Unsubscribe `session` from `topics`, applying the same rewrite as
    /// subscribe so sharded names match. Returns the topics removed.
    pub fn unsubscribe(&self, session: &Session, topics: Vec<String>) -> Vec<String> {
        let (topics, _) = session.rewrite_topics(topics);
        let mut removed = Vec::with_capacity(topics.len());
        for topic in topics {
            let had = session.remove_topic(&topic);
            if self.bucket.remove_subscribe(&topic, session) || had {
                removed.push(topic);
            }
        }
        removed
    }

    /// Publish to the topic service under a fresh message id.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ConnectionClosed`] while the upstream link is down and
    /// [`GatewayError::SendTimeout`] if the outbound queue stays full.
    pub async fn publish(&self, source: &str, topic: &str, payload: &[u8]) -> Result<String> {
        let id = self.context.ids.next_string();
        let publisher: &dyn UpstreamPublisher = self.upstream.as_ref();
        let result = publisher.publish(&id, source, topic, payload).await;

        self.context.metrics.record_publish(result.is_ok());
        match result {
            Ok(()) => Ok(id),
            Err(e) => {
                debug!(topic = %topic, error = %e, "publish failed");
                Err(e)
            }
        }
    }

    /// Close a session and drop all its subscriptions. Returns `false` if no
    /// such session was open.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.close();
        for topic in session.take_topics() {
            self.bucket.remove_subscribe(&topic, &session);
        }
        self.context.metrics.dec_sessions();
        debug!(session_id = %session_id, "session closed");
        true
    }

    /// Dispatch one message received from the topic service.
    pub fn handle_upstream(&self, message: Message) {
        match message.kind.as_str() {
            kinds::PUBLISH => {
                let report = self.bucket.push(Arc::new(message));
                if report.dropped > 0 {
                    debug!(dropped = report.dropped, "fanout dropped messages");
                }
            }
            kinds::OFFLINE_TOPIC_BY_USER => {
                let Some(session) = self.target_session(&message) else {
                    return;
                };
                session.remove_topic(&message.topic);
                self.bucket.remove_subscribe(&message.topic, &session);
                info!(session_id = %session.id(), topic = %message.topic, "session removed from topic");
            }
            kinds::OFFLINE_TOPIC => {
                let removed = self.bucket.remove_topic(&message.topic);
                for session in &removed {
                    session.remove_topic(&message.topic);
                }
                info!(topic = %message.topic, subscribers = removed.len(), "topic taken offline");
            }
            kinds::OFFLINE_USER => {
                if let Some(session_id) = message.payload_str() {
                    if self.close_session(session_id.trim()) {
                        info!(session_id = %session_id, "session taken offline");
                    }
                }
            }
            other => debug!(kind = %other, topic = %message.topic, "ignoring upstream message"),
        }
    }

    /// Stop the transport and close every session. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.upstream.shutdown();

        let ids = self.session_ids();
        for id in &ids {
            self.close_session(id);
        }
        info!(sessions = ids.len(), "gateway manager shut down");
    }

    /// Wait for the bridge and sweep tasks to finish after shutdown.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "gateway task failed");
            }
        }
    }

    #[must_use]
    pub fn context(&self) -> &GatewayContext {
        &self.context
    }

    #[must_use]
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    #[must_use]
    pub fn upstream(&self) -> &Arc<TopicServiceClient> {
        &self.upstream
    }

    /// Management channel, once [`start`](Self::start) has dialled it.
    #[must_use]
    pub fn management(&self) -> Option<Arc<dyn ManagementChannel>> {
        self.management
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn link_state(&self) -> LinkState {
        self.upstream.state()
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Ids of every open session.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancelled once [`shutdown`](Self::shutdown) runs.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn target_session(&self, message: &Message) -> Option<Arc<Session>> {
        let session_id = message.payload_str()?.trim();
        let session = self.session(session_id);
        if session.is_none() {
            debug!(session_id = %session_id, kind = %message.kind, "control message for unknown session");
        }
        session
    }

    async fn bridge(self: Arc<Self>) {
        loop {
            match self.upstream.receive().await {
                Ok(message) => self.handle_upstream(message),
                Err(GatewayError::ConnectionClosed) => {
                    if self.upstream.wait_until_live().await.is_err() {
                        break;
                    }
                    debug!("upstream link back, resuming bridge");
                }
                Err(e) => {
                    warn!(error = %e, "upstream receive failed");
                    break;
                }
            }
        }
        debug!("bridge stopped");
    }

    async fn sweep_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.shutdown.cancelled() => break,
            }
            let report = self.bucket.sweep();
            if report.dead_subscribers > 0 || report.empty_topics > 0 {
                debug!(
                    dead_subscribers = report.dead_subscribers,
                    empty_topics = report.empty_topics,
                    "bucket swept"
                );
            }
        }
    }
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager")
            .field("upstream", &self.upstream)
            .field("sessions", &self.sessions.len())
            .field("topics", &self.bucket.topic_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, TopicServiceConfig};

    fn manager() -> GatewayManager {
        let config = GatewayConfig::new(TopicServiceConfig::new("127.0.0.1:1", "127.0.0.1:1"));
        GatewayManager::new(GatewayContext::new(config))
    }

    fn upstream(kind: &str, topic: &str, payload: &str) -> Message {
        Message::new(kind, "1", "platform", topic, payload.to_string())
    }

    #[test]
    fn test_open_and_close_session() {
        let manager = manager();
        let (session, _rx) = manager.open_session();
        assert_eq!(manager.session_count(), 1);

        manager.subscribe(&session, vec!["room".into()]).unwrap();
        assert_eq!(manager.bucket().subscriber_count("room"), 1);

        assert!(manager.close_session(session.id()));
        assert!(!manager.close_session(session.id()));
        assert!(!session.is_live());
        assert_eq!(manager.bucket().topic_count(), 0);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_subscribe_denied() {
        let deny: Arc<dyn SubscribeHook> =
            Arc::new(|_: &str, topics: Vec<String>| (topics, false));
        let manager = manager().with_hook(Some(deny));
        let (session, _rx) = manager.open_session();

        let result = manager.subscribe(&session, vec!["room".into()]);
        assert!(matches!(result, Err(GatewayError::SubscribeDenied { .. })));
        assert_eq!(manager.bucket().topic_count(), 0);
        assert!(session.topics().is_empty());
    }

    #[test]
    fn test_subscribe_closed_session() {
        let manager = manager();
        let (session, _rx) = manager.open_session();
        manager.close_session(session.id());

        let result = manager.subscribe(&session, vec!["room".into()]);
        assert!(matches!(result, Err(GatewayError::SessionNotFound { .. })));
    }

    #[test]
    fn test_sharded_subscribe_and_unsubscribe() {
        let hook: Arc<dyn SubscribeHook> = Arc::new(HotTopicSharding::new(["live"], 8));
        let manager = manager().with_hook(Some(hook));
        let (session, _rx) = manager.open_session();

        let topics = manager
            .subscribe(&session, vec!["live".into(), "room".into()])
            .unwrap();
        assert!(topics[0].starts_with("live_"));
        assert_eq!(topics[1], "room");

        let removed = manager.unsubscribe(&session, vec!["live".into()]);
        assert_eq!(removed, vec![topics[0].clone()]);
        assert_eq!(manager.bucket().subscriber_count(&topics[0]), 0);
    }

    #[test]
    fn test_upstream_publish_fans_out() {
        let manager = manager();
        let (session, mut rx) = manager.open_session();
        manager.subscribe(&session, vec!["room".into()]).unwrap();

        manager.handle_upstream(upstream(kinds::PUBLISH, "room", "hi"));

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.topic, "room");
        assert_eq!(&delivered.payload[..], b"hi");
    }

    #[test]
    fn test_offline_topic_by_user() {
        let manager = manager();
        let (a, _rx_a) = manager.open_session();
        let (b, _rx_b) = manager.open_session();
        manager.subscribe(&a, vec!["room".into()]).unwrap();
        manager.subscribe(&b, vec!["room".into()]).unwrap();

        manager.handle_upstream(upstream(kinds::OFFLINE_TOPIC_BY_USER, "room", a.id()));

        assert!(!a.is_subscribed("room"));
        assert!(b.is_subscribed("room"));
        assert_eq!(manager.bucket().subscriber_count("room"), 1);
        assert!(a.is_live());
    }

    #[test]
    fn test_offline_topic() {
        let manager = manager();
        let (a, _rx_a) = manager.open_session();
        let (b, _rx_b) = manager.open_session();
        manager.subscribe(&a, vec!["room".into(), "other".into()]).unwrap();
        manager.subscribe(&b, vec!["room".into()]).unwrap();

        manager.handle_upstream(upstream(kinds::OFFLINE_TOPIC, "room", ""));

        assert_eq!(manager.bucket().subscriber_count("room"), 0);
        assert!(!a.is_subscribed("room"));
        assert!(a.is_subscribed("other"));
        assert!(!b.is_subscribed("room"));
    }

    #[test]
    fn test_offline_user() {
        let manager = manager();
        let (session, _rx) = manager.open_session();
        manager.subscribe(&session, vec!["room".into()]).unwrap();

        manager.handle_upstream(upstream(kinds::OFFLINE_USER, "", session.id()));

        assert!(!session.is_live());
        assert!(session.done().is_cancelled());
        assert!(manager.session(session.id()).is_none());
        assert_eq!(manager.bucket().topic_count(), 0);
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let manager = manager();
        let (session, mut rx) = manager.open_session();
        manager.subscribe(&session, vec!["room".into()]).unwrap();

        manager.handle_upstream(upstream("mystery", "room", "x"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected() {
        let manager = manager();
        let result = manager.publish("user", "room", b"hi").await;
        assert!(matches!(result, Err(GatewayError::ConnectionClosed)));
        assert_eq!(
            manager
                .context()
                .metrics
                .publishes
                .with_label_values(&["error"])
                .get() as u64,
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let manager = Arc::new(manager());
        let (a, _rx_a) = manager.open_session();
        let (b, _rx_b) = manager.open_session();

        manager.shutdown();
        manager.shutdown();

        assert!(!a.is_live());
        assert!(!b.is_live());
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.link_state(), LinkState::ShutDown);
        assert!(matches!(manager.start().await, Err(GatewayError::Shutdown)));
    }
}
