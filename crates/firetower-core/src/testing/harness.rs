//! Test harness for integration testing of the gateway.
//!
//! Provides a complete test environment with:
//! - Mock topic service
//! - Started gateway manager connected to it
//! - Client listener on an ephemeral port and a line-based test client

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::config::{BackoffConfig, GatewayConfig, TopicServiceConfig};
use crate::gateway::{GatewayContext, GatewayManager};
use crate::network::{ClientEvent, GatewayListener};

use super::mock_topic_service::MockTopicService;

/// How long test helpers wait before giving up.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Test harness for integration testing.
pub struct GatewayTestHarness {
    /// The mock topic service
    pub service: MockTopicService,
    /// The started manager
    pub manager: Arc<GatewayManager>,
    client_addr: SocketAddr,
    listener_shutdown: broadcast::Sender<()>,
}

impl GatewayTestHarness {
    /// Create a harness with default configuration.
    ///
    /// # Panics
    ///
    /// Panics if any part of the environment fails to start.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Address clients connect to.
    #[must_use]
    pub fn client_address(&self) -> SocketAddr {
        self.client_addr
    }

    /// Open a client connection.
    ///
    /// # Panics
    ///
    /// Panics if the connection fails.
    pub async fn connect_client(&self) -> TestClient {
        TestClient::connect(self.client_addr).await
    }

    /// Stop the listener and manager and the mock service.
    pub async fn shutdown(&mut self) {
        let _ = self.listener_shutdown.send(());
        self.manager.shutdown();
        self.manager.join().await;
        self.service.stop();
    }
}

/// Builder for creating a harness with specific configuration.
pub struct TestHarnessBuilder {
    hot_topics: Vec<String>,
    shard_count: u32,
    session_queue_capacity: usize,
    backoff: BackoffConfig,
    echo: bool,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hot_topics: Vec::new(),
            shard_count: 4,
            session_queue_capacity: 64,
            backoff: BackoffConfig {
                initial_ms: 20,
                max_ms: 200,
            },
            echo: true,
        }
    }

    /// Shard a hot topic.
    #[must_use]
    pub fn hot_topic(mut self, topic: impl Into<String>) -> Self {
        self.hot_topics.push(topic.into());
        self
    }

    #[must_use]
    pub fn shard_count(mut self, count: u32) -> Self {
        self.shard_count = count;
        self
    }

    #[must_use]
    pub fn session_queue_capacity(mut self, capacity: usize) -> Self {
        self.session_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.backoff = BackoffConfig { initial_ms, max_ms };
        self
    }

    /// Whether the mock service echoes publishes back.
    #[must_use]
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Config pointing at `service_addr`.
    #[must_use]
    pub fn config(&self, service_addr: &str) -> GatewayConfig {
        let mut topic_service = TopicServiceConfig::new(service_addr, service_addr);
        topic_service.backoff = self.backoff;
        topic_service.connect_timeout_ms = 1_000;
        topic_service.send_timeout_ms = 500;

        let mut config = GatewayConfig::new(topic_service);
        config.listen.address = "127.0.0.1:0".to_string();
        config.bucket.session_queue_capacity = self.session_queue_capacity;
        config.sharding.hot_topics.clone_from(&self.hot_topics);
        config.sharding.shard_count = self.shard_count;
        config.metrics.enabled = false;
        config
    }

    /// Start the mock service, the manager and the listener.
    ///
    /// # Panics
    ///
    /// Panics if any part of the environment fails to start.
    pub async fn build(self) -> GatewayTestHarness {
        let mut service = MockTopicService::new("127.0.0.1:0");
        let service_addr = service
            .start()
            .await
            .expect("Failed to start mock topic service");
        service.set_echo(self.echo);

        let context = GatewayContext::new(self.config(&service_addr));
        let manager = Arc::new(GatewayManager::new(context));
        tokio::time::timeout(TEST_TIMEOUT, manager.start())
            .await
            .expect("manager start timed out")
            .expect("manager failed to start");

        let socket = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind client listener");
        let client_addr = socket.local_addr().expect("listener has no address");
        let listener = GatewayListener::new(Arc::clone(&manager));
        let listener_shutdown = listener.shutdown_handle();
        tokio::spawn(async move { listener.serve(socket).await });

        GatewayTestHarness {
            service,
            manager,
            client_addr,
            listener_shutdown,
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Line-oriented JSON client.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// # Panics
    ///
    /// Panics if the connection fails.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to gateway");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Send one raw line.
    ///
    /// # Panics
    ///
    /// Panics if the write fails.
    pub async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("Failed to write to gateway");
    }

    pub async fn subscribe(&mut self, topic: &str) {
        self.send_line(&json!({"type": "subscribe", "topic": topic}).to_string())
            .await;
    }

    pub async fn unsubscribe(&mut self, topic: &str) {
        self.send_line(&json!({"type": "unsubscribe", "topic": topic}).to_string())
            .await;
    }

    pub async fn publish(&mut self, topic: &str, data: Value) {
        self.send_line(&json!({"type": "publish", "topic": topic, "data": data}).to_string())
            .await;
    }

    /// Next event, or `None` on timeout or disconnect.
    pub async fn recv(&mut self, timeout: Duration) -> Option<ClientEvent> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => serde_json::from_str(&line).ok(),
            _ => None,
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
