//! End-to-end tests: a real server, real WebSocket clients, and fake
//! authoring executables written as shell scripts.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scbridge::{
    BridgeConfig, BridgeEvent, ChangeSetAccumulator, ChannelClient, Outcome, PayloadDelivery,
    ProcessBridge, Server, ServerMessage, Submission, SubmissionId, SubmitError,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Write an executable shell script into `dir`.
fn fake_author(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("author.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Bridge config for a script, with `dir` as the cache directory.
fn config_for(dir: &Path, body: &str) -> BridgeConfig {
    BridgeConfig::new(fake_author(dir, body), dir)
}

async fn start(config: BridgeConfig) -> (Arc<ProcessBridge>, Server) {
    let bridge = Arc::new(ProcessBridge::start(config));
    let server = Server::bind("127.0.0.1:0", Arc::clone(&bridge)).await.unwrap();
    (bridge, server)
}

fn payload(name: &str) -> String {
    let mut changes = ChangeSetAccumulator::new();
    changes.update_node_name(7, name);
    changes.to_payload().unwrap()
}

async fn next_message(client: &mut ChannelClient) -> ServerMessage {
    tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for server message")
        .expect("connection closed")
        .expect("protocol error")
}

async fn expect_accepted(client: &mut ChannelClient) -> SubmissionId {
    match next_message(client).await {
        ServerMessage::Accepted { submission } => submission,
        other => panic!("expected acceptance, got {other:?}"),
    }
}

/// Collect output lines until the submission completes.
async fn collect(client: &mut ChannelClient, id: SubmissionId) -> (Vec<String>, Outcome) {
    let mut lines = Vec::new();
    loop {
        match next_message(client).await {
            ServerMessage::Output { submission, line } => {
                assert_eq!(submission, id);
                lines.push(line);
            }
            ServerMessage::Completed {
                submission,
                outcome,
            } => {
                assert_eq!(submission, id);
                return (lines, outcome);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_output_split_across_chunks_arrives_as_lines() {
    let dir = TempDir::new().unwrap();
    let config = config_for(
        dir.path(),
        r#"cat > "$1/payload.json"
printf '%s' "$2" > "$1/model"
printf 'li'
sleep 0.2
printf 'ne1\nline2\nli'
sleep 0.2
printf 'ne3'"#,
    );
    let (_bridge, server) = start(config).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    let mut changes = ChangeSetAccumulator::new();
    changes
        .update_attributes(12, [("Material", "Steel")])
        .unwrap();
    changes.send(&client).unwrap();

    let id = expect_accepted(&mut client).await;
    let (lines, outcome) = collect(&mut client, id).await;

    assert_eq!(lines, vec!["line1", "line2", "line3"]);
    assert_eq!(outcome, Outcome::Succeeded);

    let received = fs::read_to_string(dir.path().join("payload.json")).unwrap();
    assert_eq!(received, changes.to_payload().unwrap());
    let value: serde_json::Value = serde_json::from_str(&received).unwrap();
    assert_eq!(value["attributes"][0]["nodeId"], 12);
    assert_eq!(value["attributes"][0]["Material"], "Steel");
    let model = fs::read_to_string(dir.path().join("model")).unwrap();
    assert_eq!(model, "microengine");

    server.shutdown();
}

#[tokio::test]
async fn test_attribute_values_reach_the_process_unchanged() {
    let dir = TempDir::new().unwrap();
    let (_bridge, server) = start(config_for(dir.path(), "cat; echo")).await;
    let mut client = ChannelClient::connect(&server.url()).await.unwrap();

    let raw = r#"{"attributes":[{"nodeId":12,"Visible":true,"Count":3,"Tag":null,"Finish":{"grade":2}}]}"#;
    client.submit(raw.to_string()).unwrap();
    let id = expect_accepted(&mut client).await;
    let (lines, outcome) = collect(&mut client, id).await;
    assert_eq!(lines, vec![raw]);
    assert_eq!(outcome, Outcome::Succeeded);

    let mut changes = ChangeSetAccumulator::new();
    changes
        .update_attributes(
            12,
            [
                ("Count", serde_json::json!(3)),
                ("Visible", serde_json::json!(false)),
            ],
        )
        .unwrap();
    changes.send(&client).unwrap();
    let id = expect_accepted(&mut client).await;
    let (lines, _) = collect(&mut client, id).await;
    let sent = changes.to_payload().unwrap();
    assert!(sent.contains(r#"{"nodeId":12,"Count":3,"Visible":false}"#), "sent: {sent}");
    assert_eq!(lines, vec![sent]);

    server.shutdown();
}

#[tokio::test]
async fn test_argument_delivery_passes_payload_as_third_argument() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(dir.path(), r#"printf '%s\n' "$3""#);
    config.payload_delivery = PayloadDelivery::Argument;
    let (_bridge, server) = start(config).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    client.submit(payload("by-argument")).unwrap();
    let id = expect_accepted(&mut client).await;
    let (lines, outcome) = collect(&mut client, id).await;

    assert_eq!(lines, vec![payload("by-argument")]);
    assert_eq!(outcome, Outcome::Succeeded);

    server.shutdown();
}

#[tokio::test]
async fn test_sessions_only_see_their_own_output() {
    let dir = TempDir::new().unwrap();
    let (_bridge, server) = start(config_for(dir.path(), "cat; echo")).await;

    let mut alice = ChannelClient::connect(&server.url()).await.unwrap();
    let mut bob = ChannelClient::connect(&server.url()).await.unwrap();

    alice.submit(payload("alice")).unwrap();
    bob.submit(payload("bob")).unwrap();

    let alice_id = expect_accepted(&mut alice).await;
    let bob_id = expect_accepted(&mut bob).await;
    assert_ne!(alice_id, bob_id);

    let (alice_lines, alice_outcome) = collect(&mut alice, alice_id).await;
    let (bob_lines, bob_outcome) = collect(&mut bob, bob_id).await;

    assert_eq!(alice_lines, vec![payload("alice")]);
    assert_eq!(bob_lines, vec![payload("bob")]);
    assert!(alice_outcome.is_success());
    assert!(bob_outcome.is_success());

    server.shutdown();
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_after_output() {
    let dir = TempDir::new().unwrap();
    let (_bridge, server) = start(config_for(dir.path(), "cat > /dev/null\necho partial\nexit 3")).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    client.submit(payload("x")).unwrap();

    let id = expect_accepted(&mut client).await;
    let (lines, outcome) = collect(&mut client, id).await;

    assert_eq!(lines, vec!["partial"]);
    assert_eq!(outcome, Outcome::Exited { code: Some(3) });

    server.shutdown();
}

#[tokio::test]
async fn test_missing_executable_reports_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let config = BridgeConfig::new(dir.path().join("no-such-author"), dir.path());
    let (_bridge, server) = start(config).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    client.submit(payload("x")).unwrap();

    let id = expect_accepted(&mut client).await;
    let (lines, outcome) = collect(&mut client, id).await;

    assert!(lines.is_empty());
    assert!(matches!(outcome, Outcome::SpawnFailed { .. }));

    server.shutdown();
}

#[tokio::test]
async fn test_hung_process_is_killed_on_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(dir.path(), "echo started\nexec sleep 30");
    config.timeout = Duration::from_millis(300);
    let (_bridge, server) = start(config).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    client.submit(payload("x")).unwrap();

    let started = Instant::now();
    let id = expect_accepted(&mut client).await;
    let (lines, outcome) = collect(&mut client, id).await;

    assert_eq!(lines, vec!["started"]);
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(10));

    server.shutdown();
}

#[tokio::test]
async fn test_submission_beyond_capacity_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(dir.path(), "exec sleep 30");
    config.max_workers = 1;
    config.queue_capacity = 0;
    let (_bridge, server) = start(config).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    client.submit(payload("first")).unwrap();
    client.submit(payload("second")).unwrap();

    expect_accepted(&mut client).await;
    match next_message(&mut client).await {
        ServerMessage::Rejected { submission, reason } => {
            assert_eq!(submission, None);
            assert!(reason.contains("full"), "reason: {reason}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    server.shutdown();
}

#[tokio::test]
async fn test_malformed_change_set_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (bridge, server) = start(config_for(dir.path(), "cat; echo")).await;

    let mut client = ChannelClient::connect(&server.url()).await.unwrap();
    client.submit("not a change set".to_string()).unwrap();
    client
        .send_raw(r#"{"event":"updateAttributes","payload":"{}"}"#)
        .unwrap();

    for _ in 0..2 {
        assert!(matches!(
            next_message(&mut client).await,
            ServerMessage::Rejected { submission: None, .. }
        ));
    }
    assert_eq!(bridge.available(), bridge.config().capacity());

    // The session survives rejections.
    client.submit(payload("after")).unwrap();
    let id = expect_accepted(&mut client).await;
    let (lines, _) = collect(&mut client, id).await;
    assert_eq!(lines, vec![payload("after")]);

    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_kills_running_submission() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(
        dir.path(),
        r#"payload=$(cat)
case "$payload" in
  *slow*) exec sleep 30 ;;
esac
echo done"#,
    );
    config.max_workers = 1;
    config.queue_capacity = 1;
    let (_bridge, server) = start(config).await;

    let mut first = ChannelClient::connect(&server.url()).await.unwrap();
    first.submit(payload("slow")).unwrap();
    expect_accepted(&mut first).await;
    first.close().await;

    // Only finishes if the single worker was freed by the disconnect.
    let mut second = ChannelClient::connect(&server.url()).await.unwrap();
    second.submit(payload("fast")).unwrap();
    let id = expect_accepted(&mut second).await;
    let (lines, outcome) = collect(&mut second, id).await;

    assert_eq!(lines, vec!["done"]);
    assert_eq!(outcome, Outcome::Succeeded);

    server.shutdown();
}

#[tokio::test]
async fn test_cancelled_submissions_complete_as_cancelled() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(dir.path(), "exec sleep 30");
    config.max_workers = 1;
    config.queue_capacity = 1;
    let bridge = ProcessBridge::start(config);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = CancellationToken::new();
    let submit = |payload: &str| {
        bridge.submit(Submission {
            session_id: "test".to_string(),
            payload: payload.to_string(),
            events: events_tx.clone(),
            cancel: session.child_token(),
        })
    };

    let running = submit("{}").unwrap();
    let queued = submit("{}").unwrap();
    assert_eq!(
        submit("{}").unwrap_err(),
        SubmitError::QueueFull { capacity: 2 }
    );

    session.cancel();

    let mut completed = Vec::new();
    while completed.len() < 2 {
        let event = tokio::time::timeout(RECV_TIMEOUT, events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let BridgeEvent::Completed {
            submission,
            outcome,
        } = event
        {
            assert_eq!(outcome, Outcome::Cancelled);
            completed.push(submission);
        }
    }
    completed.sort();
    assert_eq!(completed, vec![running, queued]);

    // Slots are released once both jobs are gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.available(), 2);
}

#[tokio::test]
async fn test_cancelled_queued_submission_frees_its_slot() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(dir.path(), "exec sleep 30");
    config.max_workers = 1;
    config.queue_capacity = 1;
    let bridge = ProcessBridge::start(config);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let submit = |cancel: CancellationToken| {
        bridge.submit(Submission {
            session_id: "test".to_string(),
            payload: "{}".to_string(),
            events: events_tx.clone(),
            cancel,
        })
    };

    let running_session = CancellationToken::new();
    let queued_session = CancellationToken::new();
    let _running = submit(running_session.clone()).unwrap();
    let queued = submit(queued_session.clone()).unwrap();
    assert_eq!(bridge.available(), 0);

    queued_session.cancel();

    let event = tokio::time::timeout(RECV_TIMEOUT, events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        BridgeEvent::Completed {
            submission: queued,
            outcome: Outcome::Cancelled,
        }
    );

    // The running process still holds the only worker.
    let deadline = Instant::now() + RECV_TIMEOUT;
    while bridge.available() < 1 {
        assert!(Instant::now() < deadline, "queued slot was never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bridge.available(), 1);
    assert!(submit(CancellationToken::new()).is_ok());

    running_session.cancel();
    bridge.shutdown();
}

#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let dir = TempDir::new().unwrap();
    let bridge = ProcessBridge::start(config_for(dir.path(), "cat"));
    bridge.shutdown();

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let result = bridge.submit(Submission {
        session_id: "test".to_string(),
        payload: "{}".to_string(),
        events: events_tx,
        cancel: CancellationToken::new(),
    });
    assert_eq!(result, Err(SubmitError::ShuttingDown));
}
