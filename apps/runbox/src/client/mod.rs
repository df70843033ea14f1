//! The execution session state machine. One `ExecutionClient` drives
//! at most one live session at a time: provision a job credential,
//! open the transport, send `execute`, stream frames into the output
//! log, and land in a terminal state. Terminal failures surface as
//! state plus one explanatory output line, never as an `Err` across
//! the UI boundary.

use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::JobBroker;
use crate::terminal::{InputHistory, LineKind, OutputLine, OutputLog};
use crate::transport::{Connector, TransportEvent, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Running,
    Completed,
    Failed,
}

impl SessionState {
    /// A session is in flight; `execute` must be rejected.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Authenticating | SessionState::Running
        )
    }

    /// The protocol carries no explicit "awaiting stdin" signal, so
    /// input is accepted for the whole of `Running`; any prompt shown
    /// while a program is still computing is a presentation guess.
    pub fn accepts_input(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("code must not be empty")]
    InvalidArgument,
    #[error("a session is already active; cancel it first")]
    SessionBusy,
}

struct Inner {
    state: SessionState,
    output: OutputLog,
    history: InputHistory,
    transport: Option<TransportHandle>,
    exit_code: Option<i32>,
    /// Bumped on every session start and every cancel; reader tasks
    /// from a torn-down session see a stale epoch and go inert.
    epoch: u64,
}

pub struct ExecutionClient {
    inner: Arc<Mutex<Inner>>,
    broker: JobBroker,
    connector: Arc<dyn Connector>,
    ws_url: String,
    changes: Arc<watch::Sender<u64>>,
}

impl ExecutionClient {
    pub fn new(broker: JobBroker, connector: Arc<dyn Connector>, ws_url: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                output: OutputLog::new(),
                history: InputHistory::new(),
                transport: None,
                exit_code: None,
                epoch: 0,
            })),
            broker,
            connector,
            ws_url: ws_url.into(),
            changes: Arc::new(changes),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().unwrap().exit_code
    }

    pub fn output_snapshot(&self) -> Vec<OutputLine> {
        self.inner.lock().unwrap().output.snapshot()
    }

    pub fn last_line_open(&self) -> bool {
        self.inner.lock().unwrap().output.last_line_open()
    }

    /// Revision counter bumped on every state or output mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn history_previous(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.history.previous().map(str::to_string)
    }

    pub fn history_next(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.history.next().map(str::to_string)
    }

    /// Runs `code` remotely. Synchronous rejections (`InvalidArgument`,
    /// `SessionBusy`) start no session and touch no output; every
    /// later failure lands in `SessionState::Failed` with one
    /// explanatory line instead of an error return.
    pub async fn execute(&self, code: &str, language: &str) -> Result<(), ExecuteError> {
        if code.trim().is_empty() {
            return Err(ExecuteError::InvalidArgument);
        }
        let epoch = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_active() {
                return Err(ExecuteError::SessionBusy);
            }
            // Starting over discards the previous session's output.
            if let Some(handle) = inner.transport.take() {
                handle.close();
            }
            inner.epoch += 1;
            inner.output.clear();
            inner.history.reset_cursor();
            inner.exit_code = None;
            inner.state = SessionState::Connecting;
            inner.epoch
        };
        self.notify();
        tracing::info!(target: "runbox::client", language, "starting execution session");

        let credential = match self.broker.create_job().await {
            Ok(credential) => credential,
            Err(err) => {
                self.fail(epoch, LineKind::Stderr, format!("Failed to create job: {err}"));
                return Ok(());
            }
        };

        if !self.enter(epoch, SessionState::Authenticating) {
            // Cancelled while provisioning; the credential is simply
            // never used.
            return Ok(());
        }

        let transport = match self.connector.connect(&self.ws_url).await {
            Ok(transport) => transport,
            Err(err) => {
                self.fail(epoch, LineKind::System, format!("Failed to connect: {err}"));
                return Ok(());
            }
        };
        let (handle, events) = transport.into_parts();

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch {
                // Cancelled while the socket was opening.
                handle.close();
                return Ok(());
            }
            // `execute` is the first and only credential-bearing frame.
            handle.send(ClientFrame::Execute {
                job_id: credential.job_id,
                job_token: credential.job_token,
                code: code.to_string(),
                language: language.to_string(),
            });
            inner.transport = Some(handle);
            inner.state = SessionState::Running;
        }
        self.notify();

        let inner = self.inner.clone();
        let changes = self.changes.clone();
        tokio::spawn(run_reader(inner, changes, epoch, events));
        Ok(())
    }

    /// Forwards one line of stdin. No-op outside `Running`.
    pub fn send_input(&self, text: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.accepts_input() {
                return;
            }
            let Some(handle) = inner.transport.as_ref() else {
                return;
            };
            handle.send(ClientFrame::Input {
                data: format!("{text}\n"),
            });
            inner.output.append(LineKind::Input, text);
            inner.history.record(text);
        }
        self.notify();
    }

    /// Explicit teardown: closes the transport without reconnection,
    /// discards the output log, and returns to `Idle`. Idempotent.
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            if let Some(handle) = inner.transport.take() {
                handle.close();
            }
            inner.output.clear();
            inner.history.reset_cursor();
            inner.exit_code = None;
            inner.state = SessionState::Idle;
        }
        self.notify();
    }

    pub fn clear_output(&self) {
        self.cancel();
    }

    fn notify(&self) {
        self.changes.send_modify(|rev| *rev += 1);
    }

    fn enter(&self, epoch: u64, state: SessionState) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch {
                return false;
            }
            inner.state = state;
        }
        self.notify();
        true
    }

    fn fail(&self, epoch: u64, kind: LineKind, line: String) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch {
                return;
            }
            if let Some(handle) = inner.transport.take() {
                handle.close();
            }
            inner.output.append(kind, line);
            inner.history.reset_cursor();
            inner.state = SessionState::Failed;
        }
        self.notify();
    }
}

/// Sole consumer of one session's transport events. Applies each
/// event under the client lock and stops at the first terminal event,
/// a stale epoch, or the end of the stream.
async fn run_reader(
    inner: Arc<Mutex<Inner>>,
    changes: Arc<watch::Sender<u64>>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let done = {
            let mut guard = inner.lock().unwrap();
            if guard.epoch != epoch {
                return;
            }
            apply_event(&mut guard, event)
        };
        changes.send_modify(|rev| *rev += 1);
        if done {
            return;
        }
    }
}

fn apply_event(inner: &mut Inner, event: TransportEvent) -> bool {
    if inner.state != SessionState::Running {
        // Complete/Error already landed; late frames are ignored.
        return true;
    }
    match event {
        TransportEvent::Frame(ServerFrame::Output { stream, data }) => {
            inner.output.append(LineKind::from(stream), data);
            false
        }
        TransportEvent::Frame(ServerFrame::Complete {
            exit_code,
            execution_time,
        }) => {
            inner.output.append(
                LineKind::System,
                format!("\nExecution completed in {execution_time:.3}s (exit code: {exit_code})"),
            );
            inner.exit_code = Some(exit_code);
            inner.history.reset_cursor();
            inner.state = SessionState::Completed;
            if let Some(handle) = inner.transport.take() {
                handle.close();
            }
            true
        }
        TransportEvent::Frame(ServerFrame::Error { message }) => {
            inner
                .output
                .append(LineKind::Stderr, format!("Error: {message}"));
            inner.history.reset_cursor();
            inner.state = SessionState::Failed;
            if let Some(handle) = inner.transport.take() {
                handle.close();
            }
            true
        }
        TransportEvent::Lost => {
            inner.output.append(LineKind::System, "Connection lost");
            inner.history.reset_cursor();
            inner.state = SessionState::Failed;
            if let Some(handle) = inner.transport.take() {
                handle.close();
            }
            true
        }
    }
}
