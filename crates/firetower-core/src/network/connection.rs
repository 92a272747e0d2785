//! Per-connection client handler.
//!
//! Each accepted connection becomes one gateway session. The handler reads
//! JSON request lines and applies them through the manager, while a
//! dedicated writer task drains the session queue and error replies back to
//! the client.

use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::{GatewayManager, Session};
use crate::metrics::GatewayMetrics;
use crate::network::message::sources;
use crate::network::Message;

use super::request::{ClientEvent, ClientRequest, RequestKind};

/// Longest request line accepted from a client.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Pending error replies per connection.
const REPLY_QUEUE_CAPACITY: usize = 64;

type LineSink<S> = SplitSink<Framed<S, LinesCodec>, String>;

/// Handles one client connection.
pub struct ConnectionHandler {
    manager: Arc<GatewayManager>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    #[must_use]
    pub fn new(manager: Arc<GatewayManager>, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            manager,
            shutdown_rx,
        }
    }

    /// Serve the connection until the client disconnects, the session is
    /// closed, or shutdown is signalled. The session is closed on return.
    ///
    /// # Errors
    ///
    /// I/O errors on the read side, or [`GatewayError::Shutdown`].
    #[instrument(skip_all)]
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, messages) = self.manager.open_session();
        let metrics = Arc::clone(&self.manager.context().metrics);
        info!(session_id = %session.id(), "client connected");

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (sink, mut lines) = framed.split();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        let done = session.done();

        let writer = tokio::spawn(write_loop(
            sink,
            messages,
            reply_rx,
            done.clone(),
            Arc::clone(&metrics),
        ));

        let result = loop {
            tokio::select! {
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        metrics.record_bytes_received(line.len() as u64 + 1);
                        self.dispatch(&session, &line, &reply_tx).await;
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!(session_id = %session.id(), "request line too long");
                        break Err(GatewayError::FrontProtocol {
                            message: "request line too long".to_string(),
                        });
                    }
                    Some(Err(LinesCodecError::Io(e))) => break Err(GatewayError::Io(e)),
                    None => {
                        debug!(session_id = %session.id(), "client disconnected");
                        break Ok(());
                    }
                },
                () = done.cancelled() => {
                    debug!(session_id = %session.id(), "session closed by gateway");
                    break Ok(());
                }
                _ = self.shutdown_rx.recv() => break Err(GatewayError::Shutdown),
            }
        };

        self.manager.close_session(session.id());
        drop(reply_tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session_id = %session.id(), error = %e, "writer stopped"),
            Err(e) => warn!(session_id = %session.id(), error = %e, "writer task failed"),
        }
        result
    }

    async fn dispatch(&self, session: &Arc<Session>, line: &str, replies: &mpsc::Sender<String>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let request = match ClientRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "malformed request");
                reply(replies, ClientEvent::error("", e)).await;
                return;
            }
        };

        match request.kind {
            RequestKind::Subscribe => {
                if let Err(e) = self.manager.subscribe(session, request.topics()) {
                    reply(replies, ClientEvent::error(&request.topic, e)).await;
                }
            }
            RequestKind::Unsubscribe => {
                self.manager.unsubscribe(session, request.topics());
            }
            RequestKind::Publish => {
                let outcome = match request.payload() {
                    Ok(payload) => self
                        .manager
                        .publish(sources::USER, &request.topic, &payload)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    reply(replies, ClientEvent::error(&request.topic, e)).await;
                }
            }
        }
    }
}

async fn reply(replies: &mpsc::Sender<String>, event: ClientEvent) {
    match event.to_line() {
        Ok(line) => {
            // Writer gone means the connection is going away anyway.
            let _ = replies.send(line).await;
        }
        Err(e) => debug!(error = %e, "failed to encode reply"),
    }
}

/// The session's send path: forwards queued messages and replies to the
/// client until the session is closed.
async fn write_loop<S>(
    mut sink: LineSink<S>,
    mut messages: mpsc::Receiver<Arc<Message>>,
    mut replies: mpsc::Receiver<String>,
    done: CancellationToken,
    metrics: Arc<GatewayMetrics>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let line = tokio::select! {
            biased;
            () = done.cancelled() => break,
            Some(line) = replies.recv() => line,
            Some(message) = messages.recv() => ClientEvent::from_message(&message).to_line()?,
            else => break,
        };
        metrics.record_bytes_sent(line.len() as u64 + 1);
        sink.send(line).await.map_err(lines_error)?;
    }
    sink.close().await.map_err(lines_error)
}

fn lines_error(e: LinesCodecError) -> GatewayError {
    match e {
        LinesCodecError::Io(e) => GatewayError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => GatewayError::FrontProtocol {
            message: "line too long".to_string(),
        },
    }
}
