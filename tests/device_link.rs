mod common;

use std::time::Duration;

use common::{LinkHarness, WAIT, eventually, fast_link_options, next_matching};
use frame_gallery::device::scripted::{Behaviour, ConnectOutcome, ScriptedDevice};
use frame_gallery::device::{
    BackoffPolicy, DeviceCommand, DeviceLink, DeviceNotification, LinkOptions, commands,
};
use frame_gallery::broadcast::EventBroadcaster;
use frame_gallery::error::DeviceError;
use frame_gallery::events::GalleryEvent;
use gallery_model::ConnectionState;
use serde_json::json;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn probe() -> DeviceCommand {
    DeviceCommand::new(commands::GET_API_VERSION, json!({}))
}

fn state_of(event: GalleryEvent) -> Option<ConnectionState> {
    match event {
        GalleryEvent::ConnectionStateChanged { state } => Some(state),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backoff_grows_then_resets_after_reconnect() {
    let device = ScriptedDevice::new();
    device.push_connect_outcome(ConnectOutcome::Refuse);
    device.push_connect_outcome(ConnectOutcome::Refuse);
    let harness = LinkHarness::start(device.clone(), fast_link_options());
    let mut events = harness.events.subscribe();

    harness.link.connect();
    let mut attempts = Vec::new();
    loop {
        match next_matching(&mut events, state_of).await {
            ConnectionState::Reconnecting { attempt, .. } => attempts.push(attempt),
            ConnectionState::Connected => break,
            _ => {}
        }
    }
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(device.connect_attempts(), 3);

    // A lost session retries at once; a failure after that starts from the
    // first backoff step again.
    device.push_connect_outcome(ConnectOutcome::Refuse);
    device.drop_connection();
    let mut attempts = Vec::new();
    loop {
        match next_matching(&mut events, state_of).await {
            ConnectionState::Reconnecting { attempt, .. } => attempts.push(attempt),
            ConnectionState::Connected => break,
            _ => {}
        }
    }
    assert_eq!(attempts, vec![0, 1]);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attempt_ceiling_parks_in_failed() {
    let device = ScriptedDevice::new();
    for _ in 0..10 {
        device.push_connect_outcome(ConnectOutcome::Refuse);
    }
    let mut options = fast_link_options();
    options.backoff.max_attempts = Some(2);
    let harness = LinkHarness::start(device.clone(), options);

    let err = harness
        .link
        .ensure_connected(WAIT)
        .await
        .expect_err("gives up");
    assert!(matches!(err, DeviceError::Failed(_)), "{err:?}");
    let attempts = device.connect_attempts();
    assert_eq!(attempts, 2);

    // Parked: no further attempts until asked.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(device.connect_attempts(), attempts);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_is_sent_unless_connected() {
    let device = ScriptedDevice::new();
    let options = LinkOptions {
        backoff: BackoffPolicy {
            base: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
            ..BackoffPolicy::default()
        },
        ..fast_link_options()
    };
    let harness = LinkHarness::start(device.clone(), options);

    // Idle link: refused, but the refusal kicks off a connection.
    let err = harness
        .link
        .send_command(probe(), Duration::from_millis(100))
        .await
        .expect_err("idle link");
    assert_eq!(err, DeviceError::NotConnected);
    harness.link.ensure_connected(WAIT).await.expect("connected");
    assert!(device.calls().is_empty());

    // Lost session followed by a refused reconnect: parked in a long backoff.
    device.push_connect_outcome(ConnectOutcome::Refuse);
    let mut state = harness.link.state_changes();
    device.drop_connection();
    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt: 1, .. }))
        .await
        .expect("backing off");

    let err = harness
        .link
        .send_command(probe(), Duration::from_millis(100))
        .await
        .expect_err("reconnecting link");
    assert_eq!(err, DeviceError::NotConnected);
    assert!(device.calls().is_empty());

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_reconnect_cuts_backoff_short() {
    let device = ScriptedDevice::new();
    device.push_connect_outcome(ConnectOutcome::Refuse);
    let options = LinkOptions {
        backoff: BackoffPolicy {
            base: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter: Duration::ZERO,
            ..BackoffPolicy::default()
        },
        ..fast_link_options()
    };
    let harness = LinkHarness::start(device.clone(), options);
    let mut state = harness.link.state_changes();
    harness.link.connect();
    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .expect("backing off");

    harness.link.reconnect();
    harness
        .link
        .ensure_connected(Duration::from_secs(2))
        .await
        .expect("reconnected well before the 30s backoff");

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_are_served_in_arrival_order() {
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    device.set_latency(Duration::from_millis(40));

    let mut handles = Vec::new();
    for seq in 0..5 {
        let link = harness.link.clone();
        handles.push(tokio::spawn(async move {
            link.send_command(
                DeviceCommand::new(commands::GET_API_VERSION, json!({ "seq": seq })),
                Duration::from_secs(2),
            )
            .await
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.expect("join").expect("command");
    }

    let order: Vec<i64> = device
        .calls()
        .iter()
        .filter_map(|call| call.args.get("seq").and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_timeout_drives_reconnect() {
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    device.push_behaviour(commands::GET_API_VERSION, Behaviour::Hang);

    let err = harness
        .link
        .send_command(probe(), Duration::from_millis(100))
        .await
        .expect_err("times out");
    assert_eq!(err, DeviceError::Timeout(Duration::from_millis(100)));
    assert!(!harness.link.current_state().is_connected());

    harness.link.ensure_connected(WAIT).await.expect("recovers");
    assert_eq!(device.connect_attempts(), 2);
    harness
        .link
        .send_command(probe(), Duration::from_millis(500))
        .await
        .expect("fresh session answers");

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejections_keep_the_session() {
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    device.push_behaviour(
        commands::SELECT_IMAGE,
        Behaviour::Fail(DeviceError::Rejected {
            command: commands::SELECT_IMAGE.into(),
            reason: "bad id".into(),
        }),
    );

    let err = harness
        .link
        .send_command(
            DeviceCommand::new(commands::SELECT_IMAGE, json!({ "content_id": "x" })),
            Duration::from_millis(500),
        )
        .await
        .expect_err("rejected");
    assert!(matches!(err, DeviceError::Rejected { .. }));
    assert_eq!(harness.link.current_state(), ConnectionState::Connected);
    assert_eq!(device.connect_attempts(), 1);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standby_notification_reconnects() {
    let device = ScriptedDevice::new();
    let harness = LinkHarness::connected(device.clone()).await;
    let mut events = harness.events.subscribe();

    assert!(device.notify(DeviceNotification::Standby));
    let lost = next_matching(&mut events, state_of).await;
    assert!(matches!(lost, ConnectionState::Reconnecting { attempt: 0, .. }));
    harness.link.ensure_connected(WAIT).await.expect("reconnected");
    eventually(|| device.connect_attempts() == 2).await;

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_probe_detects_a_silent_device() {
    let device = ScriptedDevice::new();
    let options = LinkOptions {
        health_interval: Duration::from_millis(100),
        health_timeout: Duration::from_millis(50),
        ..fast_link_options()
    };
    let harness = LinkHarness::start(device.clone(), options);
    let probe_task = tokio::spawn(harness.link.clone().run_health_probe(harness.cancel.clone()));
    harness.link.ensure_connected(WAIT).await.expect("connected");

    device.push_behaviour(commands::GET_API_VERSION, Behaviour::Hang);
    eventually(|| device.connect_attempts() >= 2).await;
    harness.link.ensure_connected(WAIT).await.expect("reconnected");
    eventually(|| device.call_count(commands::GET_API_VERSION) >= 2).await;

    harness.cancel.cancel();
    probe_task.await.expect("join").expect("probe");
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pairing_token_is_stored_and_offered_next_time() {
    let dir = tempdir().unwrap();
    let token_path = dir.path().join("state").join("token");
    let options = LinkOptions {
        token_path: Some(token_path.clone()),
        ..fast_link_options()
    };

    let device = ScriptedDevice::new();
    let harness = LinkHarness::start(device.clone(), options.clone());
    harness.link.ensure_connected(WAIT).await.expect("connected");
    assert_eq!(device.last_credentials().unwrap().token, None);
    eventually(|| token_path.exists()).await;
    harness.shutdown().await;

    let events = EventBroadcaster::new(8);
    let link = DeviceLink::new(device.transport(), options, events);
    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(link.clone().run_supervisor(cancel.clone()));
    link.ensure_connected(WAIT).await.expect("connected again");
    assert_eq!(
        device.last_credentials().unwrap().token.as_deref(),
        Some("scripted-pairing-token")
    );
    cancel.cancel();
    supervisor.await.expect("join").expect("supervisor");
}
