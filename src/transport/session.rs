//! One viewer session: a WebSocket connection and its submissions.
//!
//! The session task selects over three sources:
//!
//! - incoming frames from the viewer (submissions)
//! - bridge events for this session's submissions (output, completion)
//! - server shutdown
//!
//! All writes to the socket happen on this task, so per-submission ordering
//! from the bridge is preserved on the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::TransportError;
use crate::bridge::{BridgeEvent, ProcessBridge, Submission};
use crate::changeset::ChangeSet;
use crate::protocol::{ClientMessage, ServerMessage};

type ServerSink = SplitSink<WebSocketStream<TcpStream>, tungstenite::Message>;

/// A connected viewer.
#[derive(Debug)]
pub(crate) struct Session {
    id: String,
    peer: SocketAddr,
    bridge: Arc<ProcessBridge>,
    /// Parent of every submission token; cancelled when the session ends.
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: String,
        peer: SocketAddr,
        bridge: Arc<ProcessBridge>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            bridge,
            cancel,
        }
    }

    /// Upgrade the connection and serve it until either side closes.
    pub(crate) async fn run(self, stream: TcpStream) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                let err = TransportError::ConnectionFailed(e.to_string());
                log::warn!("[Session] {} handshake with {} failed: {err}", self.id, self.peer);
                return;
            }
        };
        log::info!("[Session] {} connected from {}", self.id, self.peer);

        let (mut sink, mut source) = ws.split();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<BridgeEvent>();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    log::info!("[Session] {} closing for shutdown", self.id);
                    let _ = sink.send(tungstenite::Message::Close(None)).await;
                    break;
                }

                // events_tx lives as long as the loop, so recv() never yields None here
                Some(event) = events_rx.recv() => {
                    if let Err(e) = send(&mut sink, &ServerMessage::from(event)).await {
                        log::warn!("[Session] {} write failed: {e}", self.id);
                        break;
                    }
                }

                incoming = source.next() => {
                    let reply = match incoming {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            self.handle_text(&text, &events_tx)
                        }
                        Some(Ok(tungstenite::Message::Binary(_))) => ServerMessage::Rejected {
                            submission: None,
                            reason: "binary frames are not supported".to_string(),
                        },
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            log::info!("[Session] {} closed by peer", self.id);
                            break;
                        }
                        // Ping/pong are answered by tungstenite.
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("[Session] {} read error: {e}", self.id);
                            break;
                        }
                    };
                    if let Err(e) = send(&mut sink, &reply).await {
                        log::warn!("[Session] {} write failed: {e}", self.id);
                        break;
                    }
                }
            }
        }

        // Drops queued submissions and kills running processes.
        self.cancel.cancel();
        log::info!("[Session] {} disconnected", self.id);
    }

    /// Handle one text frame and produce the immediate reply.
    fn handle_text(
        &self,
        text: &str,
        events_tx: &mpsc::UnboundedSender<BridgeEvent>,
    ) -> ServerMessage {
        let payload = match ClientMessage::decode(text) {
            Ok(ClientMessage::Submit { payload }) => payload,
            Err(e) => {
                log::warn!("[Session] {} sent an unreadable frame: {e}", self.id);
                return ServerMessage::Rejected {
                    submission: None,
                    reason: e.to_string(),
                };
            }
        };

        if let Err(e) = ChangeSet::validate_payload(&payload) {
            log::warn!("[Session] {} submitted a malformed change set: {e}", self.id);
            return ServerMessage::Rejected {
                submission: None,
                reason: e.to_string(),
            };
        }

        let submission = Submission {
            session_id: self.id.clone(),
            payload,
            events: events_tx.clone(),
            cancel: self.cancel.child_token(),
        };

        match self.bridge.submit(submission) {
            Ok(submission) => ServerMessage::Accepted { submission },
            Err(e) => {
                log::warn!("[Session] {} submission refused: {e}", self.id);
                ServerMessage::Rejected {
                    submission: None,
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Write one message as a text frame.
async fn send(sink: &mut ServerSink, message: &ServerMessage) -> Result<(), TransportError> {
    sink.send(tungstenite::Message::Text(message.encode()))
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
}
