//! Mock topic service for integration testing.
//!
//! A lightweight stand-in for the upstream topic service that:
//! - Accepts gateway connections speaking the `FireHeader` frame protocol
//! - Records every frame received
//! - Broadcasts frames to every connected gateway, echoing publishes back by
//!   default the way the real service fans them out
//! - Can drop all connections to force gateways to reconnect

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_util::codec::FramedRead;

use crate::network::codec::{self, FireCodec};
use crate::network::message::kinds;
use crate::network::Message;

const BROADCAST_CAPACITY: usize = 1024;

struct Shared {
    calls: RwLock<Vec<Message>>,
    echo: AtomicBool,
    connections: AtomicUsize,
    outbound: broadcast::Sender<Bytes>,
    kick: broadcast::Sender<()>,
}

/// Mock topic service for testing.
pub struct MockTopicService {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    shared: Arc<Shared>,
}

impl MockTopicService {
    /// Create a new mock service that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        let (outbound, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (kick, _) = broadcast::channel(1);
        Self {
            address: address.into(),
            shutdown_tx: None,
            shared: Arc::new(Shared {
                calls: RwLock::new(Vec::new()),
                echo: AtomicBool::new(true),
                connections: AtomicUsize::new(0),
                outbound,
                kick,
            }),
        }
    }

    /// Start the service. Returns the address it is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address.clone_from(&actual_address);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => match result {
                        Ok((stream, _addr)) => {
                            let shared = Arc::clone(&shared);
                            let shutdown_rx = shutdown_tx.subscribe();
                            let kick_rx = shared.kick.subscribe();
                            let outbound_rx = shared.outbound.subscribe();
                            shared.connections.fetch_add(1, Ordering::SeqCst);

                            tokio::spawn(async move {
                                Self::handle_connection(stream, Arc::clone(&shared), shutdown_rx, kick_rx, outbound_rx).await;
                                shared.connections.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop accepting and close every connection.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Echo received publishes back to every connection (default on).
    pub fn set_echo(&self, echo: bool) {
        self.shared.echo.store(echo, Ordering::SeqCst);
    }

    /// Number of currently open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Send an encoded frame to every connection. Returns how many
    /// connections were subscribed to the broadcast.
    pub fn broadcast_frame(&self, frame: Bytes) -> usize {
        self.shared.outbound.send(frame).unwrap_or(0)
    }

    /// Encode and broadcast one message.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be framed.
    pub fn broadcast(&self, kind: &str, topic: &str, payload: &[u8]) -> usize {
        let frame = codec::encode(kind, "0", "platform", topic, Some(payload))
            .expect("test frame must encode");
        self.broadcast_frame(frame)
    }

    /// Drop every open connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.shared.kick.send(());
    }

    /// Get all recorded messages.
    pub async fn get_calls(&self) -> Vec<Message> {
        self.shared.calls.read().await.clone()
    }

    /// Get recorded messages for a topic.
    pub async fn get_calls_for_topic(&self, topic: &str) -> Vec<Message> {
        self.shared
            .calls
            .read()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.shared.calls.write().await.clear();
    }

    /// Wait until at least `count` messages were recorded.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.shared.calls.read().await.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Wait until exactly `count` connections are open.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connection_count() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn handle_connection(
        stream: TcpStream,
        shared: Arc<Shared>,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut kick_rx: broadcast::Receiver<()>,
        mut outbound_rx: broadcast::Receiver<Bytes>,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, FireCodec::new());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = kick_rx.recv() => break,
                frame = outbound_rx.recv() => match frame {
                    Ok(frame) => {
                        if writer.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                next = frames.next() => match next {
                    Some(Ok(message)) => {
                        let echo = shared.echo.load(Ordering::SeqCst) && message.kind == kinds::PUBLISH;
                        let frame = if echo { codec::encode_message(&message).ok() } else { None };
                        shared.calls.write().await.push(message);
                        if let Some(frame) = frame {
                            let _ = shared.outbound.send(frame);
                        }
                    }
                    _ => break,
                },
            }
        }
    }
}

impl Drop for MockTopicService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_records_and_echoes() {
        let mut service = MockTopicService::new("127.0.0.1:0");
        let address = service.start().await.unwrap();

        let mut stream = TcpStream::connect(&address).await.unwrap();
        assert!(service.wait_for_connections(1, Duration::from_secs(2)).await);

        let frame = codec::encode(kinds::PUBLISH, "1", "user", "room", Some(b"hi")).unwrap();
        stream.write_all(&frame).await.unwrap();

        assert!(service.wait_for_calls(1, Duration::from_secs(2)).await);
        assert_eq!(service.get_calls_for_topic("room").await[0].id, "1");

        let mut echoed = vec![0u8; frame.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[..], &frame[..]);
    }

    #[tokio::test]
    async fn test_drop_connections() {
        let mut service = MockTopicService::new("127.0.0.1:0");
        let address = service.start().await.unwrap();

        let mut stream = TcpStream::connect(&address).await.unwrap();
        assert!(service.wait_for_connections(1, Duration::from_secs(2)).await);

        service.drop_connections();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(service.wait_for_connections(0, Duration::from_secs(2)).await);
    }
}
