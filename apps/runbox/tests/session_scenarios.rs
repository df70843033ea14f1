//! End-to-end session tests over the mock transport and a mock job
//! backend: full state sequences, the four scripted scenarios, and
//! cancel/input edge cases.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Semaphore;
use url::Url;

use runbox_client_core::client::{ExecuteError, ExecutionClient, SessionState};
use runbox_client_core::protocol::{ClientFrame, ServerFrame, StreamKind};
use runbox_client_core::session::{JobBackend, JobBroker, JobConfig, JobCredential, ProvisionError};
use runbox_client_core::terminal::LineKind;
use runbox_client_core::transport::Connector;
use runbox_client_core::transport::mock::MockConnector;

fn credential() -> JobCredential {
    JobCredential {
        job_id: "j1".into(),
        job_token: "t1".into(),
        expires_at: "2099-01-01T00:00:00Z".into(),
    }
}

/// Always succeeds with the canned credential.
struct OkJobs {
    calls: AtomicU32,
}

impl OkJobs {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl JobBackend for OkJobs {
    async fn create_job(&self, _base_url: &Url) -> Result<JobCredential, ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(credential())
    }
}

/// Always fails the way an over-subscribed backend does.
struct NoCapacity;

#[async_trait]
impl JobBackend for NoCapacity {
    async fn create_job(&self, _base_url: &Url) -> Result<JobCredential, ProvisionError> {
        Err(ProvisionError::Server {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "no capacity".into(),
        })
    }
}

/// Blocks until the test releases a permit, so pre-provisioning
/// states stay observable.
struct GatedJobs {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl JobBackend for GatedJobs {
    async fn create_job(&self, _base_url: &Url) -> Result<JobCredential, ProvisionError> {
        let permit = self.gate.acquire().await.map_err(|_| {
            ProvisionError::InvalidResponse("gate closed".into())
        })?;
        permit.forget();
        Ok(credential())
    }
}

fn client_with(backend: Arc<dyn JobBackend>, connector: Arc<dyn Connector>) -> ExecutionClient {
    let broker = JobBroker::with_backend(JobConfig::new("http://127.0.0.1:8000").unwrap(), backend);
    ExecutionClient::new(broker, connector, "ws://127.0.0.1:8000/ws/execute")
}

async fn wait_for_state(client: &ExecutionClient, target: SessionState) {
    let mut changes = client.subscribe();
    while client.state() != target {
        changes.changed().await.expect("client dropped");
    }
}

#[test_timeout::tokio_timeout_test]
async fn scenario_successful_run_streams_output_and_completes() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("print(1)", "python").await.unwrap();
    assert_eq!(client.state(), SessionState::Running);

    let mut remote = remotes.recv().await.unwrap();
    assert_eq!(remote.url, "ws://127.0.0.1:8000/ws/execute");
    let frame = remote.recv_frame().await.unwrap();
    assert_eq!(
        frame,
        ClientFrame::Execute {
            job_id: "j1".into(),
            job_token: "t1".into(),
            code: "print(1)".into(),
            language: "python".into(),
        }
    );

    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stdout,
        data: "1\n".into(),
    });
    remote.push_frame(ServerFrame::Complete {
        exit_code: 0,
        execution_time: 0.01,
    });
    wait_for_state(&client, SessionState::Completed).await;

    let output = client.output_snapshot();
    assert_eq!(output.len(), 2);
    assert_eq!(output[0].kind, LineKind::Stdout);
    assert_eq!(output[0].content, "1\n");
    assert_eq!(output[1].kind, LineKind::System);
    assert!(output[1].content.contains("exit code: 0"));
    assert_eq!(client.exit_code(), Some(0));
    assert!(remote.client_closed());
}

#[test_timeout::tokio_timeout_test]
async fn scenario_provisioning_failure_never_opens_transport() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(Arc::new(NoCapacity), connector);

    client.execute("print(1)", "python").await.unwrap();

    assert_eq!(client.state(), SessionState::Failed);
    let output = client.output_snapshot();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].kind, LineKind::Stderr);
    assert!(output[0].content.contains("no capacity"));
    assert!(remotes.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn scenario_connection_loss_fails_session_and_mutes_input() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("input()", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    remote.drop_connection();
    wait_for_state(&client, SessionState::Failed).await;
    assert!(
        client
            .output_snapshot()
            .iter()
            .any(|line| line.content.contains("Connection lost"))
    );

    let lines_before = client.output_snapshot().len();
    client.send_input("5");
    assert!(remote.try_recv_frame().is_none());
    assert_eq!(client.output_snapshot().len(), lines_before);
}

#[test_timeout::tokio_timeout_test]
async fn scenario_send_input_forwards_one_frame_and_records_line() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("n = input()", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    client.send_input("5");
    assert_eq!(
        remote.recv_frame().await.unwrap(),
        ClientFrame::Input { data: "5\n".into() }
    );
    assert!(remote.try_recv_frame().is_none());

    let output = client.output_snapshot();
    let last = output.last().unwrap();
    assert_eq!(last.kind, LineKind::Input);
    assert_eq!(last.content, "5");
    assert_eq!(client.history_previous(), Some("5".to_string()));
}

#[test_timeout::tokio_timeout_test]
async fn execute_walks_the_full_state_sequence() {
    let (connector, mut remotes, connect_gate) = MockConnector::gated();
    let provision_gate = Arc::new(Semaphore::new(0));
    let client = Arc::new(client_with(
        Arc::new(GatedJobs {
            gate: provision_gate.clone(),
        }),
        connector,
    ));

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.execute("print(1)", "python").await })
    };

    wait_for_state(&client, SessionState::Connecting).await;
    assert_eq!(
        client.execute("print(2)", "python").await,
        Err(ExecuteError::SessionBusy)
    );

    provision_gate.add_permits(1);
    wait_for_state(&client, SessionState::Authenticating).await;

    // Input before running must not produce a frame.
    client.send_input("early");
    connect_gate.add_permits(1);
    wait_for_state(&client, SessionState::Running).await;
    task.await.unwrap().unwrap();

    let mut remote = remotes.recv().await.unwrap();
    let first = remote.recv_frame().await.unwrap();
    assert!(matches!(first, ClientFrame::Execute { .. }));
    assert!(remote.try_recv_frame().is_none());
}

#[test_timeout::tokio_timeout_test]
async fn empty_code_is_rejected_without_starting_a_session() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    assert_eq!(
        client.execute("   \n", "python").await,
        Err(ExecuteError::InvalidArgument)
    );
    assert_eq!(client.state(), SessionState::Idle);
    assert!(client.output_snapshot().is_empty());
    assert!(remotes.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn transport_open_failure_is_terminal_for_the_attempt() {
    let (connector, mut remotes) = MockConnector::new();
    connector.refuse_connections();
    let jobs = OkJobs::new();
    let client = client_with(jobs.clone(), connector);

    client.execute("print(1)", "python").await.unwrap();

    assert_eq!(client.state(), SessionState::Failed);
    let output = client.output_snapshot();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].kind, LineKind::System);
    assert!(output[0].content.contains("Failed to connect"));
    // Provisioning happened exactly once; no automatic retry.
    assert_eq!(jobs.calls.load(Ordering::SeqCst), 1);
    assert!(remotes.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn send_input_is_a_no_op_outside_running() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    // Idle: nothing to send.
    client.send_input("before");
    assert!(client.output_snapshot().is_empty());

    client.execute("print(1)", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();
    remote.push_frame(ServerFrame::Complete {
        exit_code: 0,
        execution_time: 0.5,
    });
    wait_for_state(&client, SessionState::Completed).await;

    // Completed: still nothing.
    client.send_input("after");
    assert!(remote.try_recv_frame().is_none());
    assert!(
        client
            .output_snapshot()
            .iter()
            .all(|line| line.kind != LineKind::Input)
    );
}

#[test_timeout::tokio_timeout_test]
async fn history_browse_cursor_resets_when_session_ends() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("input(); input()", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    client.send_input("a");
    client.send_input("b");
    // Browse down to the oldest entry mid-run.
    assert_eq!(client.history_previous(), Some("b".to_string()));
    assert_eq!(client.history_previous(), Some("a".to_string()));

    remote.push_frame(ServerFrame::Complete {
        exit_code: 0,
        execution_time: 0.1,
    });
    wait_for_state(&client, SessionState::Completed).await;

    // Session end leaves browse mode; the next step back starts at
    // the newest entry again.
    assert_eq!(client.history_previous(), Some("b".to_string()));
}

#[test_timeout::tokio_timeout_test]
async fn history_browse_cursor_resets_when_connection_is_lost() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("input(); input()", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    client.send_input("a");
    client.send_input("b");
    assert_eq!(client.history_previous(), Some("b".to_string()));
    assert_eq!(client.history_previous(), Some("a".to_string()));

    remote.drop_connection();
    wait_for_state(&client, SessionState::Failed).await;

    assert_eq!(client.history_previous(), Some("b".to_string()));
}

#[test_timeout::tokio_timeout_test]
async fn cancel_is_idempotent_and_silences_late_frames() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("input()", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    client.cancel();
    assert_eq!(client.state(), SessionState::Idle);
    assert!(client.output_snapshot().is_empty());
    assert!(remote.client_closed());

    client.cancel();
    assert_eq!(client.state(), SessionState::Idle);

    // A frame racing the cancel must not resurrect the session.
    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stdout,
        data: "late\n".into(),
    });
    tokio::task::yield_now().await;
    assert_eq!(client.state(), SessionState::Idle);
    assert!(client.output_snapshot().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn remote_error_frame_fails_the_session() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("boom", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    remote.push_frame(ServerFrame::Error {
        message: "time limit exceeded".into(),
    });
    wait_for_state(&client, SessionState::Failed).await;

    let output = client.output_snapshot();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0].kind, LineKind::Stderr);
    assert!(output[0].content.contains("time limit exceeded"));
    assert!(remote.client_closed());
}

#[test_timeout::tokio_timeout_test]
async fn output_frames_keep_arrival_order_and_open_line_flag() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("print(1)", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();

    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stdout,
        data: "prompt: ".into(),
    });
    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stderr,
        data: "warn\n".into(),
    });
    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stdout,
        data: "done\n".into(),
    });

    let mut changes = client.subscribe();
    while client.output_snapshot().len() < 3 {
        changes.changed().await.unwrap();
    }

    let output = client.output_snapshot();
    let contents: Vec<&str> = output.iter().map(|line| line.content.as_str()).collect();
    assert_eq!(contents, vec!["prompt: ", "warn\n", "done\n"]);
    assert!(!client.last_line_open());

    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stdout,
        data: "half".into(),
    });
    while client.output_snapshot().len() < 4 {
        changes.changed().await.unwrap();
    }
    assert!(client.last_line_open());
}

#[test_timeout::tokio_timeout_test]
async fn new_execute_after_terminal_state_discards_previous_output() {
    let (connector, mut remotes) = MockConnector::new();
    let client = client_with(OkJobs::new(), connector);

    client.execute("print(1)", "python").await.unwrap();
    let mut remote = remotes.recv().await.unwrap();
    remote.recv_frame().await.unwrap();
    remote.push_frame(ServerFrame::Output {
        stream: StreamKind::Stdout,
        data: "old\n".into(),
    });
    remote.push_frame(ServerFrame::Complete {
        exit_code: 0,
        execution_time: 0.1,
    });
    wait_for_state(&client, SessionState::Completed).await;

    client.execute("print(2)", "python").await.unwrap();
    let mut second = remotes.recv().await.unwrap();
    second.recv_frame().await.unwrap();
    assert!(
        client
            .output_snapshot()
            .iter()
            .all(|line| !line.content.contains("old"))
    );
    assert_eq!(client.state(), SessionState::Running);
}
