// ABOUTME: Integration tests for the daemon's Unix socket protocol.
// ABOUTME: Runs a real DaemonServer on a temp socket with fake model processes behind it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use llamasup::catalog::ModelDescriptor;
use llamasup::config::Config;
use llamasup::ipc::{DaemonClient, DaemonServer, Reply, Request, SessionEntry};
use llamasup::session::{SessionRegistry, SessionState};
use llamasup::supervisor::fake::FakeLauncher;
use llamasup::SessionError;

const MODEL: &str = "LLaMA-v2";

struct Daemon {
    socket: PathBuf,
    registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl Daemon {
    async fn start(launcher: FakeLauncher) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("llamasup.sock");
        let config = Config {
            idle_timeout_ms: 300,
            first_output_timeout_ms: 2_000,
            stop_grace_ms: 200,
            startup_check_ms: 10,
            threads: Some(1),
            models: vec![ModelDescriptor::new(
                MODEL,
                "/opt/llama.cpp/main",
                "/models/llama-2-7b.gguf",
            )],
            ..Config::default()
        };
        let registry = Arc::new(SessionRegistry::new(config, Arc::new(launcher)).unwrap());
        let server = DaemonServer::new(registry.clone(), &socket);
        let listener = server.bind().await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(listener, async move {
            let _ = rx.await;
        }));
        Self {
            socket,
            registry,
            shutdown: Some(tx),
            task,
            _dir: dir,
        }
    }

    async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.socket).await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("daemon did not shut down")
            .unwrap();
    }
}

#[tokio::test]
async fn start_then_list_shows_model() {
    let daemon = Daemon::start(FakeLauncher::new()).await;
    let mut client = daemon.client().await;

    assert_eq!(client.call(&Request::Ping).await.unwrap(), Reply::Pong);
    match client
        .call(&Request::Start {
            model: MODEL.to_string(),
        })
        .await
        .unwrap()
    {
        Reply::Started { model, session_id } => {
            assert_eq!(model, MODEL);
            assert!(!session_id.is_empty());
        }
        other => panic!("expected Started, got {other:?}"),
    }

    assert_eq!(
        client.call(&Request::List { all: false }).await.unwrap(),
        Reply::Sessions {
            names: vec![MODEL.to_string()]
        }
    );
    daemon.stop().await;
}

#[tokio::test]
async fn query_round_trip_reports_id_then_response() {
    let daemon = Daemon::start(FakeLauncher::new()).await;
    let mut client = daemon.client().await;

    let mut queued = None;
    let response = client
        .query(MODEL, "What is the capital of France?", |id| queued = Some(id))
        .await
        .unwrap();
    assert_eq!(queued, Some(1));
    assert_eq!(response.query_id, 1);
    assert_eq!(response.text, "echo: What is the capital of France?");
    assert!(!response.truncated);

    // The same connection keeps working.
    let second = client.query(MODEL, "again", |_| {}).await.unwrap();
    assert_eq!(second.query_id, 2);
    daemon.stop().await;
}

#[tokio::test]
async fn query_for_missing_model_is_not_found() {
    let daemon = Daemon::start(FakeLauncher::new()).await;
    let mut client = daemon.client().await;

    let err = client.query("missing", "hi", |_| {}).await.unwrap_err();
    assert_eq!(err, SessionError::NotFound("missing".to_string()));
    assert_eq!(
        client.call(&Request::List { all: true }).await.unwrap(),
        Reply::SessionStates { sessions: vec![] }
    );
    daemon.stop().await;
}

#[tokio::test]
async fn stop_then_query_is_closed_channel() {
    let daemon = Daemon::start(FakeLauncher::new()).await;
    let mut client = daemon.client().await;

    client.query(MODEL, "hi", |_| {}).await.unwrap();
    assert_eq!(
        client
            .call(&Request::Stop {
                model: MODEL.to_string()
            })
            .await
            .unwrap(),
        Reply::Stopped {
            model: MODEL.to_string()
        }
    );
    let err = client.query(MODEL, "hi again", |_| {}).await.unwrap_err();
    assert!(matches!(err, SessionError::ClosedChannel(_)));
    assert_eq!(err.exit_code(), 4);

    // Stop is idempotent over the wire too.
    assert!(matches!(
        client
            .call(&Request::Stop {
                model: MODEL.to_string()
            })
            .await
            .unwrap(),
        Reply::Stopped { .. }
    ));
    daemon.stop().await;
}

#[tokio::test]
async fn status_and_list_all_describe_sessions() {
    let daemon = Daemon::start(FakeLauncher::new()).await;
    let mut client = daemon.client().await;

    assert_eq!(
        client
            .call(&Request::Status {
                model: MODEL.to_string()
            })
            .await
            .unwrap(),
        Reply::Status { status: None }
    );
    client.query(MODEL, "hi", |_| {}).await.unwrap();

    match client
        .call(&Request::Status {
            model: MODEL.to_string(),
        })
        .await
        .unwrap()
    {
        Reply::Status {
            status: Some(status),
        } => {
            assert_eq!(status.name, MODEL);
            assert!(status.pid.is_some());
            assert_ne!(status.state, SessionState::Terminated);
        }
        other => panic!("expected Status, got {other:?}"),
    }

    match client.call(&Request::List { all: true }).await.unwrap() {
        Reply::SessionStates { sessions } => {
            assert_eq!(sessions.len(), 1);
            let SessionEntry { name, state } = &sessions[0];
            assert_eq!(name, MODEL);
            assert_ne!(*state, SessionState::Terminated);
        }
        other => panic!("expected SessionStates, got {other:?}"),
    }
    daemon.stop().await;
}

#[tokio::test]
async fn disconnect_while_queued_cancels_the_query() {
    let launcher = FakeLauncher::new().with_reply_delay(Duration::from_millis(300));
    let daemon = Daemon::start(launcher).await;

    let mut first = daemon.client().await;
    let slow = tokio::spawn(async move { first.query(MODEL, "slow", |_| {}).await });

    // Wait until the first query is the one being answered.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = daemon.registry.status(MODEL).unwrap();
        if status.and_then(|s| s.in_flight).is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "first query never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut second = daemon.client().await;
    second
        .send(&Request::Query {
            model: MODEL.to_string(),
            text: "abandoned".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(second.recv().await.unwrap(), Reply::Queued { query_id: 2 });
    drop(second);

    let response = slow.await.unwrap().unwrap();
    assert_eq!(response.text, "echo: slow");

    // Long enough for the abandoned query to have been answered had it been written.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = daemon.registry.status(MODEL).unwrap().unwrap();
    assert_eq!(status.served, 1);
    assert_eq!(status.queued, 0);
    daemon.stop().await;
}

#[tokio::test]
async fn malformed_request_gets_error_reply() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let daemon = Daemon::start(FakeLauncher::new()).await;
    let stream = tokio::net::UnixStream::connect(&daemon.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"{not json}\n").await.unwrap();
    let mut lines = BufReader::new(reader).lines();
    let line = lines.next_line().await.unwrap().unwrap();
    let reply: Reply = serde_json::from_str(&line).unwrap();
    assert!(matches!(reply, Reply::Error { error: SessionError::Io(_) }));
    daemon.stop().await;
}

#[tokio::test]
async fn second_daemon_cannot_bind_live_socket() {
    let daemon = Daemon::start(FakeLauncher::new()).await;
    let registry = Arc::new(
        SessionRegistry::new(Config::default(), Arc::new(FakeLauncher::new())).unwrap(),
    );
    let rival = DaemonServer::new(registry, &daemon.socket);
    assert!(matches!(rival.bind().await, Err(SessionError::Io(_))));
    daemon.stop().await;
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("stale.sock");
    // Bind and drop a listener so only the file remains.
    drop(tokio::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let registry = Arc::new(
        SessionRegistry::new(Config::default(), Arc::new(FakeLauncher::new())).unwrap(),
    );
    let server = DaemonServer::new(registry, &socket);
    let listener = server.bind().await.unwrap();
    drop(listener);
}
