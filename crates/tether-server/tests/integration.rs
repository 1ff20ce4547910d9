use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use tether_core::errors::ErrorKind;
use tether_core::job::JobStatus;
use tether_core::protocol::{self, ServerMessage};
use tether_engine::ScriptedPlanner;
use tether_executor::{
    ApprovalPrompt, AutoApprove, Command, DenyAll, ExecutorAdapter, ExecutorClient, LocalToolExecutor,
};
use tether_server::{DisconnectReason, ServerHandle, TetherConfig};
use tether_store::{Database, JobStore, SqliteJobRepo};

const TOKEN: &str = "integration-secret";

const PLAN: &str = r#"{
    "phases": [
        {"name": "Explore", "milestones": [
            {"name": "scan", "steps": [{"tool": "list_files", "args": {"path": "."}}]}
        ]},
        {"name": "Implement", "milestones": [
            {"name": "write toggle", "steps": [
                {"tool": "write_file", "args": {"file_path": "src/toggle.js", "content": "export const dark = true;\n"}}
            ]}
        ]}
    ]
}"#;

async fn boot() -> (tempfile::TempDir, ServerHandle) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TetherConfig::default();
    config.server.port = 0;
    config.store.db_path = dir.path().join("tether.db");
    config.auth.tokens = BTreeMap::from([("alice".to_string(), TOKEN.to_string())]);

    let db = Database::open(&config.store.db_path).unwrap();
    let store = Arc::new(JobStore::new(Arc::new(SqliteJobRepo::new(db))));
    let planner = Arc::new(ScriptedPlanner::from_json(PLAN).unwrap());
    let handle = tether_server::start(&config, store, planner).await.unwrap();
    (dir, handle)
}

fn ws_url(handle: &ServerHandle) -> String {
    format!("ws://127.0.0.1:{}/v2/ws/agent", handle.port)
}

async fn next_server_message<S>(stream: &mut S) -> ServerMessage
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return protocol::decode_server(text.as_str()).unwrap();
        }
    }
}

fn adapter(root: &std::path::Path, prompt: Arc<dyn ApprovalPrompt>) -> Arc<ExecutorAdapter> {
    Arc::new(ExecutorAdapter::new(Arc::new(LocalToolExecutor::new(root)), prompt))
}

#[tokio::test]
async fn unknown_token_is_rejected_before_upgrade() {
    let (_dir, handle) = boot().await;
    let url = format!("{}?token=wrong", ws_url(&handle));
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("unexpected error: {other}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn connected_first_and_malformed_frames_keep_channel_open() {
    let (_dir, handle) = boot().await;
    let url = format!("{}?token={TOKEN}", ws_url(&handle));
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let (mut sink, mut stream) = ws.split();

    assert!(matches!(
        next_server_message(&mut stream).await,
        ServerMessage::Connected { .. }
    ));

    sink.send(Message::Text("not json".into())).await.unwrap();
    match next_server_message(&mut stream).await {
        ServerMessage::Error { code, recoverable, .. } => {
            assert_eq!(code, Some(ErrorKind::MalformedMessage));
            assert!(recoverable);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    sink.send(Message::Text(r#"{"type":"heartbeat"}"#.into())).await.unwrap();
    sink.send(Message::Text(r#"{"type":"status","job_id":"job_missing"}"#.into()))
        .await
        .unwrap();
    match next_server_message(&mut stream).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorKind::NotFound)),
        other => panic!("unexpected message: {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn execute_runs_to_completion_through_local_executor() {
    let (_dir, handle) = boot().await;
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("README.md"), "# app\n").unwrap();

    let client = ExecutorClient::new(ws_url(&handle), TOKEN);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let outcome = client
        .run(
            Command::Run {
                instruction: "add dark mode toggle".into(),
                cwd: workdir.path().to_string_lossy().into_owned(),
                auto_approve: false,
            },
            adapter(workdir.path(), Arc::new(AutoApprove)),
            move |message| record.lock().unwrap().push(message.kind()),
        )
        .await
        .unwrap();

    match &outcome.last {
        ServerMessage::Complete {
            files_changed,
            phases_completed,
            milestones_completed,
            ..
        } => {
            assert_eq!(files_changed, &vec!["src/toggle.js".to_string()]);
            assert_eq!(*phases_completed, 2);
            assert_eq!(*milestones_completed, 2);
        }
        other => panic!("unexpected final message: {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(workdir.path().join("src/toggle.js")).unwrap(),
        "export const dark = true;\n"
    );

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&"job_started"));
    assert!(seen.contains(&"approval_request"));
    assert_eq!(seen.iter().filter(|k| **k == "phase_start").count(), 2);

    let job_id = outcome.job_id.expect("job id recorded");
    let status = client
        .run(
            Command::Status { job_id },
            adapter(workdir.path(), Arc::new(DenyAll)),
            |_| {},
        )
        .await
        .unwrap();
    match status.last {
        ServerMessage::JobStatus(summary) => {
            assert_eq!(summary.status, JobStatus::Completed);
            assert_eq!(summary.progress_percent, 100);
            assert_eq!(summary.files_created, vec!["src/toggle.js".to_string()]);
        }
        other => panic!("unexpected status reply: {other:?}"),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn denied_write_never_touches_disk() {
    let (_dir, handle) = boot().await;
    let workdir = tempfile::tempdir().unwrap();

    let client = ExecutorClient::new(ws_url(&handle), TOKEN);
    let outcome = client
        .run(
            Command::Run {
                instruction: "add dark mode toggle".into(),
                cwd: workdir.path().to_string_lossy().into_owned(),
                auto_approve: false,
            },
            adapter(workdir.path(), Arc::new(DenyAll)),
            |_| {},
        )
        .await
        .unwrap();

    match outcome.last {
        ServerMessage::Error { recoverable, .. } => assert!(!recoverable),
        other => panic!("unexpected final message: {other:?}"),
    }
    assert!(!workdir.path().join("src/toggle.js").exists());
    handle.shutdown().await;
}

#[tokio::test]
async fn health_reports_status() {
    let (_dir, handle) = boot().await;
    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{}/health", handle.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_jobs"], 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resumes_the_job() {
    let (_dir, handle) = boot().await;
    let workdir = tempfile::tempdir().unwrap();

    let client = ExecutorClient::new(ws_url(&handle), TOKEN).with_reconnect(20, Duration::from_millis(50));
    let sessions = Arc::clone(&handle.state.sessions);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let mut job = None;
    let mut dropped = false;
    let outcome = client
        .run(
            Command::Run {
                instruction: "add dark mode toggle".into(),
                cwd: workdir.path().to_string_lossy().into_owned(),
                auto_approve: false,
            },
            adapter(workdir.path(), Arc::new(AutoApprove)),
            move |message| {
                record.lock().unwrap().push(message.kind());
                if let ServerMessage::JobStarted { job_id } = message {
                    job = Some(job_id.clone());
                }
                // Cut the first connection once the second phase begins.
                if let (ServerMessage::PhaseStart { phase: 2, .. }, Some(job_id), false) = (message, &job, dropped) {
                    for session in sessions.sessions_for_job(job_id) {
                        sessions.unregister(&session, DisconnectReason::Closed);
                    }
                    dropped = true;
                }
            },
        )
        .await
        .unwrap();

    assert!(matches!(outcome.last, ServerMessage::Complete { .. }), "{:?}", outcome.last);
    assert_eq!(
        std::fs::read_to_string(workdir.path().join("src/toggle.js")).unwrap(),
        "export const dark = true;\n"
    );
    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&"resumed"));
    assert_eq!(seen.last(), Some(&"complete"));
    handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_disabled_surfaces_the_drop() {
    let (_dir, handle) = boot().await;
    let workdir = tempfile::tempdir().unwrap();

    let client = ExecutorClient::new(ws_url(&handle), TOKEN).with_reconnect(0, Duration::from_millis(50));
    let sessions = Arc::clone(&handle.state.sessions);
    let err = client
        .run(
            Command::Run {
                instruction: "add dark mode toggle".into(),
                cwd: workdir.path().to_string_lossy().into_owned(),
                auto_approve: false,
            },
            adapter(workdir.path(), Arc::new(AutoApprove)),
            move |message| {
                if let ServerMessage::JobStarted { job_id } = message {
                    for session in sessions.sessions_for_job(job_id) {
                        sessions.unregister(&session, DisconnectReason::Closed);
                    }
                }
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnect);
    handle.shutdown().await;
}
