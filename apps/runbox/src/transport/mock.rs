//! In-process transport pair for exercising the session state machine
//! without sockets. Each `connect` hands the client half back to the
//! caller and delivers a [`MockRemote`] (the server half) to the test.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, Semaphore, mpsc};

use super::{Connector, SessionTransport, TransportError, TransportEvent, TransportHandle};
use crate::protocol::{ClientFrame, ServerFrame};

pub struct MockConnector {
    remotes: mpsc::UnboundedSender<MockRemote>,
    gate: Option<Arc<Semaphore>>,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                remotes: tx,
                gate: None,
                refuse: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Like `new`, but `connect` blocks until the returned semaphore
    /// receives a permit, so tests can observe pre-open states.
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<MockRemote>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        (
            Arc::new(Self {
                remotes: tx,
                gate: Some(gate.clone()),
                refuse: AtomicBool::new(false),
            }),
            rx,
            gate,
        )
    }

    /// Every subsequent `connect` fails with a connection error.
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<SessionTransport, TransportError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| TransportError::Connect {
                    url: url.to_string(),
                    reason: "gate closed".into(),
                })?;
            permit.forget();
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let handle = TransportHandle::new(
            outbound_tx,
            connected.clone(),
            closing.clone(),
            Arc::new(Notify::new()),
        );

        let remote = MockRemote {
            url: url.to_string(),
            outbound: outbound_rx,
            events: event_tx,
            connected,
            closing,
        };
        let _ = self.remotes.send(remote);
        Ok(SessionTransport::new(handle, event_rx))
    }
}

/// The server half of a mock connection.
pub struct MockRemote {
    pub url: String,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl MockRemote {
    /// Next frame the client wrote, waiting for one to arrive.
    pub async fn recv_frame(&mut self) -> Option<ClientFrame> {
        self.outbound.recv().await
    }

    /// Next frame the client wrote, if one is already queued.
    pub fn try_recv_frame(&mut self) -> Option<ClientFrame> {
        self.outbound.try_recv().ok()
    }

    pub fn push_frame(&self, frame: ServerFrame) {
        let _ = self.events.send(TransportEvent::Frame(frame));
    }

    /// Simulates an unexpected drop whose reconnection attempts all
    /// fail: the client side closes and observes `Lost`.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Lost);
    }

    /// True once the client has explicitly closed its handle.
    pub fn client_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}
