//! TCP listener for accepting gateway clients.
//!
//! The listener accepts connections and spawns a task for each one,
//! delegating to the connection handler, which turns the connection into a
//! gateway session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::GatewayManager;

use super::connection::ConnectionHandler;

/// How long [`GatewayListener::run`] waits for connections to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Holds one connection slot; released on drop, even if the handler panics.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// TCP listener that accepts client connections.
pub struct GatewayListener {
    manager: Arc<GatewayManager>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl GatewayListener {
    /// Create a new listener.
    #[must_use]
    pub fn new(manager: Arc<GatewayManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            manager,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get a shutdown handle to signal the listener to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the configured address and accept connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    pub async fn run(&self) -> Result<()> {
        let address = &self.manager.context().config.listen.address;
        let listener = TcpListener::bind(address).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        let max_connections = self.manager.context().config.listen.max_connections;
        info!(address = %local, "gateway listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let current = self.active_connections.load(Ordering::Relaxed);

                            if current >= max_connections {
                                warn!(
                                    peer = %addr,
                                    active = current,
                                    max = max_connections,
                                    "connection rejected: limit reached"
                                );
                                continue;
                            }
                            if let Err(e) = socket.set_nodelay(true) {
                                debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
                            }

                            let slot = ConnectionSlot::acquire(&self.active_connections);
                            debug!(peer = %addr, active = current + 1, "accepted connection");

                            let manager = Arc::clone(&self.manager);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                let _slot = slot;
                                let handler = ConnectionHandler::new(manager, shutdown_rx);
                                if let Err(e) = handler.handle(socket).await {
                                    match &e {
                                        GatewayError::Shutdown => {
                                            debug!(peer = %addr, "connection closed: shutdown");
                                        }
                                        GatewayError::Io(io_err)
                                            if matches!(
                                                io_err.kind(),
                                                std::io::ErrorKind::UnexpectedEof
                                                    | std::io::ErrorKind::ConnectionReset
                                            ) =>
                                        {
                                            debug!(peer = %addr, "client disconnected");
                                        }
                                        _ => {
                                            error!(peer = %addr, error = %e, "connection error");
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active_connections() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let active = self.active_connections();
        if active > 0 {
            warn!(active, "connections still open after drain timeout");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, TopicServiceConfig};
    use crate::gateway::GatewayContext;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn manager(max_connections: usize) -> Arc<GatewayManager> {
        let mut config =
            GatewayConfig::new(TopicServiceConfig::new("127.0.0.1:1", "127.0.0.1:1"));
        config.listen.max_connections = max_connections;
        Arc::new(GatewayManager::new(GatewayContext::new(config)))
    }

    async fn start(manager: Arc<GatewayManager>) -> (Arc<GatewayListener>, SocketAddr) {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = Arc::new(GatewayListener::new(manager));
        let serving = Arc::clone(&listener);
        tokio::spawn(async move { serving.serve(socket).await });
        (listener, addr)
    }

    #[tokio::test]
    async fn test_listener_opens_session() {
        let manager = manager(10);
        let (listener, addr) = start(Arc::clone(&manager)).await;

        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if manager.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.session_count(), 1);
        assert_eq!(listener.active_connections(), 1);

        let _ = listener.shutdown_handle().send(());
    }

    #[tokio::test]
    async fn test_listener_enforces_limit() {
        let manager = manager(1);
        let (listener, addr) = start(Arc::clone(&manager)).await;

        let _first = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if listener.active_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"{}\n").await.ok();
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap();
        // Rejected connections are closed without a reply.
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(manager.session_count(), 1);

        let _ = listener.shutdown_handle().send(());
    }

    #[tokio::test]
    async fn test_slot_released_when_handler_panics() {
        let active = Arc::new(AtomicUsize::new(0));
        let slot = ConnectionSlot::acquire(&active);
        assert_eq!(active.load(Ordering::Relaxed), 1);

        let task = tokio::spawn(async move {
            let _slot = slot;
            panic!("handler failed");
        });

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_listener_shutdown() {
        let manager = manager(10);
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = GatewayListener::new(manager);
        let shutdown = listener.shutdown_handle();

        let task = tokio::spawn(async move { listener.serve(socket).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown.send(());

        let result = timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }
}
