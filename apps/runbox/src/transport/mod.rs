use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::protocol::{ClientFrame, ServerFrame};
use crate::telemetry;

pub mod mock;
pub mod websocket;

/// Bound on automatic reconnection after an unexpected socket loss.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded inbound frame, delivered in arrival order.
    Frame(ServerFrame),
    /// The connection dropped unexpectedly and every reconnection
    /// attempt failed. Emitted at most once; the transport stays
    /// closed afterwards.
    Lost,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SessionTransport, TransportError>;
}

/// One duplex connection to the execution service: a cloneable write
/// handle plus the ordered inbound event stream. Exclusively owned by
/// one session at a time.
#[derive(Debug)]
pub struct SessionTransport {
    handle: TransportHandle,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl SessionTransport {
    pub(crate) fn new(
        handle: TransportHandle,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { handle, events }
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.handle, self.events)
    }
}

#[derive(Clone, Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl TransportHandle {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<ClientFrame>,
        connected: Arc<AtomicBool>,
        closing: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            outbound,
            connected,
            closing,
            shutdown,
        }
    }

    /// Writes a frame if the connection is open. A closed transport
    /// drops the frame silently; the drop is counted and logged, not
    /// surfaced as an error.
    pub fn send(&self, frame: ClientFrame) {
        let label = frame.kind_label();
        if !self.is_open() || self.outbound.send(frame).is_err() {
            telemetry::record_dropped_write(label);
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    /// Idempotent explicit close: suppresses reconnection, tears the
    /// socket down, and ends the event stream. Nothing fires after.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so the pump cannot miss the
        // wakeup even if it is not parked yet.
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientFrame;

    fn handle() -> (TransportHandle, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = TransportHandle::new(
            tx,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Notify::new()),
        );
        (handle, rx)
    }

    #[test]
    fn send_after_close_is_counted_not_fatal() {
        let (handle, mut rx) = handle();
        handle.send(ClientFrame::Input { data: "a\n".into() });
        assert!(rx.try_recv().is_ok());

        let before = telemetry::dropped_writes("input");
        handle.close();
        handle.send(ClientFrame::Input { data: "b\n".into() });
        assert!(rx.try_recv().is_err());
        assert!(telemetry::dropped_writes("input") >= before + 1);
    }

    #[test]
    fn close_is_idempotent() {
        let (handle, _rx) = handle();
        assert!(handle.is_open());
        handle.close();
        handle.close();
        assert!(!handle.is_open());
    }
}
