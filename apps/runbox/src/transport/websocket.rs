use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::{
    Connector, MAX_RECONNECT_ATTEMPTS, SessionTransport, TransportError, TransportEvent,
    TransportHandle,
};
use crate::protocol::{self, ClientFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces WebSocket-backed transports to the execution service.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    reconnect_base_delay: Duration,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
        }
    }

    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SessionTransport, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let supervisor = Supervisor {
            url: url.to_string(),
            base_delay: self.reconnect_base_delay,
            connected: connected.clone(),
            closing: closing.clone(),
            shutdown: shutdown.clone(),
            event_tx,
        };
        tokio::spawn(supervisor.run(ws_stream, outbound_rx));

        let handle = TransportHandle::new(outbound_tx, connected, closing, shutdown);
        Ok(SessionTransport::new(handle, event_rx))
    }
}

enum PumpEnd {
    /// Explicit close requested through the handle.
    Shutdown,
    /// Every handle was dropped; no more outbound frames can arrive.
    SenderGone,
    /// The socket closed or errored without a close() call.
    SocketLost,
}

struct Supervisor {
    url: String,
    base_delay: Duration,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Supervisor {
    async fn run(self, mut ws: WsStream, mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>) {
        loop {
            let end = self.pump(&mut ws, &mut outbound_rx).await;
            self.connected.store(false, Ordering::SeqCst);
            match end {
                PumpEnd::Shutdown | PumpEnd::SenderGone => break,
                PumpEnd::SocketLost => match self.reconnect().await {
                    Some(next) => {
                        // A reconnected socket never re-sends `execute`:
                        // the job token was consumed by the first one.
                        ws = next;
                        self.connected.store(true, Ordering::SeqCst);
                    }
                    None => {
                        if !self.closing.load(Ordering::SeqCst) {
                            let _ = self.event_tx.send(TransportEvent::Lost);
                        }
                        return;
                    }
                },
            }
        }
        let _ = ws.close(None).await;
    }

    async fn pump(
        &self,
        ws: &mut WsStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    ) -> PumpEnd {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return PumpEnd::Shutdown;
            }
            tokio::select! {
                _ = self.shutdown.notified() => return PumpEnd::Shutdown,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => match protocol::encode_client_frame(&frame) {
                        Ok(text) => {
                            if ws.send(Message::Text(text)).await.is_err() {
                                return PumpEnd::SocketLost;
                            }
                        }
                        Err(err) => tracing::warn!(
                            target: "runbox::transport",
                            error = %err,
                            "failed to encode outbound frame; dropping"
                        ),
                    },
                    None => return PumpEnd::SenderGone,
                },
                inbound = ws.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.deliver(&text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.deliver(&text),
                        Err(_) => tracing::warn!(
                            target: "runbox::transport",
                            "dropping non-utf8 binary frame"
                        ),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return PumpEnd::SocketLost;
                    }
                    // Ping/Pong are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        match protocol::decode_server_frame(text) {
            Ok(frame) => {
                let _ = self.event_tx.send(TransportEvent::Frame(frame));
            }
            Err(err) => tracing::warn!(
                target: "runbox::transport",
                error = %err,
                "dropping undecodable frame"
            ),
        }
    }

    /// Bounded backoff: attempt n waits n times the base delay.
    async fn reconnect(&self) -> Option<WsStream> {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            tokio::time::sleep(self.base_delay * attempt).await;
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            tracing::info!(
                target: "runbox::transport",
                attempt,
                max = MAX_RECONNECT_ATTEMPTS,
                "attempting reconnect"
            );
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => return Some(ws),
                Err(err) => tracing::warn!(
                    target: "runbox::transport",
                    attempt,
                    error = %err,
                    "reconnect attempt failed"
                ),
            }
        }
        None
    }
}
