mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use secured_publisher::connection::{
    ConnectError, ConnectParams, ConnectionController, ConnectionState, PublishError,
    SessionTuning,
};
use secured_publisher::crypto::ConvertError;
use secured_publisher::transport::{MockCall, MockTransport, TransportError};

use common::{controller, params, StubConverter};

#[tokio::test]
async fn empty_fields_fail_fast_without_network() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);

    let cases = [
        (
            ConnectParams {
                endpoint: "  ".into(),
                ..params()
            },
            ConnectError::EndpointEmpty,
        ),
        (
            ConnectParams {
                certificate_pem: String::new(),
                ..params()
            },
            ConnectError::CertificateEmpty,
        ),
        (
            ConnectParams {
                private_key_pem: String::new(),
                ..params()
            },
            ConnectError::PrivateKeyEmpty,
        ),
    ];
    for (params, expected) in cases {
        assert_eq!(controller.connect(&params).await, Err(expected.clone()));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(controller.last_error(), Some(expected));
    }
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn conversion_failure_maps_to_client_certificates_error() {
    let transport = Arc::new(MockTransport::new());
    let controller = ConnectionController::new(
        transport.clone(),
        Arc::new(StubConverter {
            fail_identity: true,
        }),
        SessionTuning::default(),
    );

    assert_eq!(
        controller.connect(&params()).await,
        Err(ConnectError::ClientCertificatesCreateFailure(
            ConvertError::CertificateFormatIncorrect
        ))
    );
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn connect_opens_session_with_endpoint_and_trust() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    let mut states = controller.subscribe_state();

    let mut with_root = params();
    with_root.endpoint = "mqtts://broker.local".into();
    with_root.root_ca_pem = Some("ROOT".into());
    controller.connect(&with_root).await.unwrap();

    assert_eq!(controller.state(), ConnectionState::Connected);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
    assert_eq!(
        transport.calls(),
        vec![MockCall::Open {
            host: "broker.local".into(),
            port: 8883,
            client_id: "smp-test".into(),
            pinned_root: true,
        }]
    );

    // Already connected: no second session.
    controller.connect(&with_root).await.unwrap();
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);

    controller.disconnect().await.unwrap();
    assert!(transport.calls().is_empty());

    controller.connect(&params()).await.unwrap();
    controller.disconnect().await.unwrap();
    controller.disconnect().await.unwrap();
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert_eq!(
        transport
            .calls()
            .iter()
            .filter(|c| **c == MockCall::Close)
            .count(),
        1
    );
}

#[tokio::test]
async fn publish_validates_before_io() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();

    assert_eq!(
        controller.publish("", "home/door").await,
        Err(PublishError::MessageEmpty)
    );
    assert_eq!(
        controller.publish("open", "").await,
        Err(PublishError::TopicEmpty)
    );
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn publish_when_disconnected_reports_last_connect_error() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);

    assert_eq!(
        controller.publish("open", "home/door").await,
        Err(PublishError::ClientNotConnected(None))
    );

    transport.fail_open_with(Some(TransportError::NameResolution(
        "failed to lookup address information".into(),
    )));
    assert!(controller.connect(&params()).await.is_err());
    assert_eq!(
        controller.publish("open", "home/door").await,
        Err(PublishError::ClientNotConnected(Some(
            ConnectError::Transport(TransportError::NameResolution(
                "failed to lookup address information".into()
            ))
        )))
    );
}

#[tokio::test]
async fn publish_is_acknowledged() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();

    controller.publish("open", "home/door").await.unwrap();
    assert_eq!(
        transport.published(),
        vec![("home/door".to_string(), "open".to_string())]
    );
    assert_eq!(controller.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_times_out_and_late_ack_is_ignored() {
    let transport = Arc::new(MockTransport::new());
    transport.set_manual_ack(true);
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();

    let started = Instant::now();
    assert_eq!(
        controller.publish("open", "home/door").await,
        Err(PublishError::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(controller.pending_acks(), 0);

    let late_id = match transport.calls().last() {
        Some(MockCall::Send { id, .. }) => *id,
        other => panic!("expected a send, got {:?}", other),
    };
    transport.ack(late_id);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(controller.pending_acks(), 0);
    assert_eq!(controller.state(), ConnectionState::Connected);

    transport.set_manual_ack(false);
    controller.publish("close", "home/door").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ack_before_timeout_resolves_publish() {
    let transport = Arc::new(MockTransport::new());
    transport.set_manual_ack(true);
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();

    let publishing = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.publish("open", "home/door").await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    let id = match transport.calls().last() {
        Some(MockCall::Send { id, .. }) => *id,
        other => panic!("expected a send, got {:?}", other),
    };
    transport.ack(id);
    assert_eq!(publishing.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn dropped_message_is_reported() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();
    transport.drop_sends(true);

    assert_eq!(
        controller.publish("open", "home/door").await,
        Err(PublishError::MessageDropped)
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_send_times_out() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();
    transport.stall_sends(true);

    let started = Instant::now();
    assert_eq!(
        controller.publish("open", "home/door").await,
        Err(PublishError::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(controller.pending_acks(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_send_does_not_block_other_publishes() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();
    transport.stall_sends(true);

    let started = Instant::now();
    let stalled = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.publish("open", "home/door").await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    transport.stall_sends(false);

    controller.publish("close", "home/door").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        transport.published(),
        vec![("home/door".to_string(), "close".to_string())]
    );

    assert_eq!(stalled.await.unwrap(), Err(PublishError::Timeout));
}

#[tokio::test]
async fn lost_session_moves_to_disconnected() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();
    let mut states = controller.subscribe_state();

    transport.lose_connection(Some(TransportError::ConnectionFailed("reset".into())));
    states
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(
        controller.last_error(),
        Some(ConnectError::Transport(TransportError::ConnectionFailed(
            "reset".into()
        )))
    );
    assert!(matches!(
        controller.publish("open", "home/door").await,
        Err(PublishError::ClientNotConnected(Some(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_aborts_a_hanging_connect() {
    let transport = Arc::new(MockTransport::new());
    transport.hang_on_open(true);
    let controller = controller(&transport);

    let connecting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(&params()).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.state(), ConnectionState::Connecting);

    controller.disconnect().await.unwrap();
    assert_eq!(
        connecting.await.unwrap(),
        Err(ConnectError::Transport(TransportError::Closed))
    );
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}
