mod common;

use std::sync::Arc;
use std::time::Duration;

use secured_publisher::crypto::Aes128EcbTimestamp;
use secured_publisher::rendezvous::{
    ExecutionGate, FeedbackCue, RendezvousTiming, SessionOutcome, TriggerError,
    TriggerRendezvous,
};
use secured_publisher::transport::MockTransport;
use secured_publisher::{Action, ConnectionState, PublishCoordinator};

use common::{controller, params, RecordingFeedback, Seen};

struct Harness {
    transport: Arc<MockTransport>,
    coordinator: Arc<PublishCoordinator>,
    gate: ExecutionGate,
    feedback: Arc<RecordingFeedback>,
    rendezvous: TriggerRendezvous,
}

fn harness() -> Harness {
    let transport = Arc::new(MockTransport::new());
    let coordinator = Arc::new(PublishCoordinator::new(
        controller(&transport),
        Arc::new(Aes128EcbTimestamp),
    ));
    let gate = ExecutionGate::new();
    let feedback = Arc::new(RecordingFeedback::new());
    let rendezvous = TriggerRendezvous::new(
        coordinator.clone(),
        gate.clone(),
        feedback.clone(),
        RendezvousTiming::default(),
    );
    Harness {
        transport,
        coordinator,
        gate,
        feedback,
        rendezvous,
    }
}

fn door() -> Action {
    Action::new("Door", "home/door", "open")
}

#[tokio::test(start_paused = true)]
async fn connection_ready_first_dispatches_after_countdown() {
    let h = harness();
    let handle = h.rendezvous.start(0, &door(), params()).unwrap();
    assert!(h.gate.is_engaged());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.coordinator.controller().state(), ConnectionState::Connected);
    assert!(h.transport.published().is_empty());

    assert_eq!(handle.outcome().await, SessionOutcome::Dispatched);
    assert_eq!(
        h.transport.published(),
        vec![("home/door".to_string(), "open".to_string())]
    );
    assert!(!h.gate.is_engaged());
    assert!(!h.rendezvous.is_active());

    let countdown: Vec<_> = h
        .feedback
        .seen()
        .into_iter()
        .filter_map(|(_, seen)| match seen {
            Seen::Countdown(n) => Some(n),
            _ => None,
        })
        .collect();
    assert_eq!(countdown, vec![3, 2, 1]);
    assert!(h.feedback.saw(&Seen::Cue(FeedbackCue::Success)));
    assert!(h.feedback.saw(&Seen::Background));
    assert!(h.feedback.failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn countdown_first_dispatches_when_connection_arrives() {
    let h = harness();
    h.transport.set_open_delay(Some(Duration::from_secs(5)));
    let handle = h.rendezvous.start(0, &door(), params()).unwrap();

    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(h.transport.published().is_empty());
    assert!(h.gate.is_engaged());

    assert_eq!(handle.outcome().await, SessionOutcome::Dispatched);
    assert_eq!(h.transport.published().len(), 1);
    assert!(!h.gate.is_engaged());
}

#[tokio::test(start_paused = true)]
async fn already_connected_session_needs_no_connect() {
    let h = harness();
    h.coordinator.controller().connect(&params()).await.unwrap();
    let opens_before = h.transport.calls().len();

    let handle = h.rendezvous.start(0, &door(), params()).unwrap();
    assert_eq!(handle.outcome().await, SessionOutcome::Dispatched);
    // Only the publish was added.
    assert_eq!(h.transport.calls().len(), opens_before + 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_countdown_never_dispatches() {
    let h = harness();
    let handle = h.rendezvous.start(0, &door(), params()).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.rendezvous.pending_action(), Some(0));
    assert!(h.rendezvous.cancel());
    assert!(!h.gate.is_engaged());
    assert_eq!(h.rendezvous.pending_action(), None);

    assert_eq!(handle.outcome().await, SessionOutcome::Cancelled);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.transport.published().is_empty());
    assert!(h.feedback.failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_after_countdown_while_connecting_never_dispatches() {
    let h = harness();
    h.transport.set_open_delay(Some(Duration::from_secs(10)));
    let handle = h.rendezvous.start(0, &door(), params()).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.rendezvous.cancel());
    assert_eq!(handle.outcome().await, SessionOutcome::Cancelled);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.coordinator.controller().state(), ConnectionState::Connected);
    assert!(h.transport.published().is_empty());
    assert!(!h.gate.is_engaged());
}

#[tokio::test(start_paused = true)]
async fn connection_timeout_surfaces_only_after_fifteen_seconds() {
    let h = harness();
    h.transport.hang_on_open(true);
    let handle = h.rendezvous.start(0, &door(), params()).unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(h.feedback.failures().is_empty());
    assert!(h.gate.is_engaged());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.feedback.failures().is_empty());

    assert_eq!(
        handle.outcome().await,
        SessionOutcome::Failed(TriggerError::ConnectionTimeout)
    );
    let failures = h.feedback.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].0 >= Duration::from_secs(15));
    assert_eq!(failures[0].1, "connection timeout");
    assert!(h.feedback.saw(&Seen::Cue(FeedbackCue::Failure)));
    assert!(h.transport.published().is_empty());
    assert!(!h.gate.is_engaged());
}

#[tokio::test(start_paused = true)]
async fn connect_failure_is_reported_when_countdown_ends() {
    let h = harness();
    let mut bad = params();
    bad.endpoint = String::new();
    let handle = h.rendezvous.start(0, &door(), bad).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.feedback.failures().is_empty());

    assert!(matches!(
        handle.outcome().await,
        SessionOutcome::Failed(TriggerError::Connect(_))
    ));
    let failures = h.feedback.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].0 >= Duration::from_secs(3));
    assert_eq!(failures[0].1, "MQTT endpoint empty");
}

#[tokio::test(start_paused = true)]
async fn failed_publish_reports_and_releases_gate() {
    let h = harness();
    h.transport.drop_sends(true);
    let handle = h.rendezvous.start(0, &door(), params()).unwrap();

    assert!(matches!(
        handle.outcome().await,
        SessionOutcome::Failed(TriggerError::Dispatch(_))
    ));
    assert_eq!(h.feedback.failures()[0].1, "message dropped");
    assert!(!h.feedback.saw(&Seen::Background));
    assert!(!h.gate.is_engaged());
}

#[tokio::test(start_paused = true)]
async fn empty_topic_is_rejected_up_front() {
    let h = harness();
    let action = Action::new("Unused", "", "");
    assert_eq!(
        h.rendezvous.start(3, &action, params()).unwrap_err(),
        TriggerError::TopicEmpty
    );
    assert!(!h.gate.is_engaged());
    assert!(h.transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn new_trigger_replaces_live_session() {
    let h = harness();
    let first = h.rendezvous.start(0, &door(), params()).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let garage = Action::new("Garage", "home/garage", "toggle");
    let second = h.rendezvous.start(1, &garage, params()).unwrap();
    assert_eq!(first.outcome().await, SessionOutcome::Cancelled);
    assert_eq!(second.outcome().await, SessionOutcome::Dispatched);
    assert_eq!(
        h.transport.published(),
        vec![("home/garage".to_string(), "toggle".to_string())]
    );
    assert!(!h.gate.is_engaged());
}
