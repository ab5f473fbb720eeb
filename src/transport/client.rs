//! Viewer-side channel to a bridge server.
//!
//! Outgoing frames go through an unbounded queue drained by a writer task,
//! so [`ChannelClient::submit`] is synchronous and usable from a
//! [`SubmissionSink`]. Incoming frames are read with [`ChannelClient::recv`].

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use super::TransportError;
use crate::changeset::SubmissionSink;
use crate::protocol::{ClientMessage, ServerMessage};

/// Concrete client stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Connected channel to a bridge server.
#[derive(Debug)]
pub struct ChannelClient {
    outbound: mpsc::UnboundedSender<String>,
    reader: SplitStream<WsStream>,
    writer_handle: JoinHandle<()>,
}

impl ChannelClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:5000`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{url}: {e}")))?;
        log::debug!("[Channel] Connected to {url}");

        let (sink, reader) = ws.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer_handle = tokio::spawn(write_loop(sink, rx));

        Ok(Self {
            outbound,
            reader,
            writer_handle,
        })
    }

    /// Queue a serialized change set for authoring.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is gone.
    pub fn submit(&self, payload: String) -> Result<(), TransportError> {
        let frame = ClientMessage::Submit { payload }.encode();
        self.outbound
            .send(frame)
            .map_err(|_closed| TransportError::Closed)
    }

    /// Queue a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is gone.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .send(text.into())
            .map_err(|_closed| TransportError::Closed)
    }

    /// Receive the next server message, `None` once the server closes.
    pub async fn recv(&mut self) -> Option<Result<ServerMessage, TransportError>> {
        loop {
            match self.reader.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(ServerMessage::decode(&text));
                }
                Some(Ok(tungstenite::Message::Binary(_))) => {
                    return Some(Err(TransportError::Protocol(
                        "unexpected binary frame".to_string(),
                    )));
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some(Err(TransportError::ConnectionFailed(format!(
                        "read error: {e}"
                    ))));
                }
            }
        }
    }

    /// Close the connection after queued frames are written.
    pub async fn close(self) {
        drop(self.outbound);
        if let Err(e) = self.writer_handle.await {
            log::debug!("[Channel] Writer task ended abnormally: {e}");
        }
    }
}

impl SubmissionSink for ChannelClient {
    fn submit_payload(&self, payload: String) -> Result<(), TransportError> {
        self.submit(payload)
    }
}

/// Writer task - drains the outbound queue, then sends a close frame.
async fn write_loop(
    mut sink: SplitSink<WsStream, tungstenite::Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(tungstenite::Message::Text(text)).await {
            log::warn!("[Channel] Send failed: {e}");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        log::debug!("[Channel] Close failed: {e}");
    }
}
