mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use secured_publisher::coordinator::MIN_BUSY_INTERVAL;
use secured_publisher::crypto::{
    decrypt_timestamp_block, Aes128EcbTimestamp, EncrypterError, TimestampEncrypter,
};
use secured_publisher::transport::MockTransport;
use secured_publisher::{DispatchError, PublishCoordinator, PublishError};

use common::{controller, params};

const TIMESTAMP_KEY: &str = "000102030405060708090a0b0c0d0e0f";

async fn connected() -> (Arc<MockTransport>, PublishCoordinator) {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();
    let coordinator = PublishCoordinator::new(controller, Arc::new(Aes128EcbTimestamp));
    (transport, coordinator)
}

#[tokio::test]
async fn placeholder_replaced_by_encrypted_block() {
    let (transport, coordinator) = connected().await;
    coordinator.set_timestamp_key(Some(TIMESTAMP_KEY.to_string()));

    coordinator.publish("unlock:%T", "home/door").await.unwrap();

    let published = transport.published();
    assert_eq!(published.len(), 1);
    let block = published[0].1.strip_prefix("unlock:").unwrap();
    assert_eq!(block.len(), 32);
    assert!(block.chars().all(|c| c.is_ascii_hexdigit()));

    let ts = decrypt_timestamp_block(TIMESTAMP_KEY, block).unwrap();
    let now = secured_publisher::now_unix_secs().unwrap();
    assert!((now as i64 - ts as i64).abs() <= 5);
}

#[tokio::test]
async fn message_unchanged_without_placeholder_or_key() {
    let (transport, coordinator) = connected().await;

    coordinator.publish("unlock:%T", "home/door").await.unwrap();
    coordinator.set_timestamp_key(Some(TIMESTAMP_KEY.to_string()));
    coordinator.publish("plain", "home/door").await.unwrap();
    coordinator.set_timestamp_key(Some("   ".to_string()));
    coordinator.publish("again:%T", "home/door").await.unwrap();

    let payloads: Vec<_> = transport.published().into_iter().map(|(_, p)| p).collect();
    assert_eq!(payloads, vec!["unlock:%T", "plain", "again:%T"]);
}

#[tokio::test]
async fn encryption_failure_short_circuits() {
    let (transport, coordinator) = connected().await;
    coordinator.set_timestamp_key(Some("not-hex".to_string()));

    assert_eq!(
        coordinator.publish("unlock:%T", "home/door").await,
        Err(DispatchError::Encrypt(EncrypterError::KeyFormatIncorrect))
    );
    assert!(transport.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn encryption_failure_waits_for_minimum_interval() {
    let (transport, coordinator) = connected().await;
    coordinator.set_timestamp_key(Some("not-hex".to_string()));

    let started = Instant::now();
    assert_eq!(
        coordinator.publish_with_feedback("unlock:%T", "home/door").await,
        Err(DispatchError::Encrypt(EncrypterError::KeyFormatIncorrect))
    );
    assert!(started.elapsed() >= MIN_BUSY_INTERVAL);
    assert!(transport.published().is_empty());
}

struct FixedBlock;

impl TimestampEncrypter for FixedBlock {
    fn encrypt_timestamp(&self, _key_hex: &str) -> Result<String, EncrypterError> {
        Ok("ab".repeat(16))
    }
}

#[tokio::test]
async fn every_placeholder_gets_the_same_block() {
    let transport = Arc::new(MockTransport::new());
    let controller = controller(&transport);
    controller.connect(&params()).await.unwrap();
    let coordinator = PublishCoordinator::new(controller, Arc::new(FixedBlock));
    coordinator.set_timestamp_key(Some(TIMESTAMP_KEY.to_string()));

    coordinator.publish("%T/%T", "t").await.unwrap();
    let block = "ab".repeat(16);
    assert_eq!(transport.published()[0].1, format!("{}/{}", block, block));
}

#[tokio::test(start_paused = true)]
async fn configuration_errors_are_reported_immediately() {
    let transport = Arc::new(MockTransport::new());
    let coordinator = PublishCoordinator::new(controller(&transport), Arc::new(Aes128EcbTimestamp));

    let started = Instant::now();
    assert_eq!(
        coordinator.publish_with_feedback("open", "home/door").await,
        Err(DispatchError::Publish(PublishError::ClientNotConnected(None)))
    );
    assert!(started.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn transient_results_wait_for_minimum_interval() {
    let (transport, coordinator) = connected().await;

    let started = Instant::now();
    coordinator
        .publish_with_feedback("open", "home/door")
        .await
        .unwrap();
    assert!(started.elapsed() >= MIN_BUSY_INTERVAL);

    transport.drop_sends(true);
    let started = Instant::now();
    assert_eq!(
        coordinator.publish_with_feedback("open", "home/door").await,
        Err(DispatchError::Publish(PublishError::MessageDropped))
    );
    assert!(started.elapsed() >= MIN_BUSY_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn slow_results_are_not_delayed_further() {
    let (transport, coordinator) = connected().await;
    transport.set_manual_ack(true);

    let started = Instant::now();
    assert_eq!(
        coordinator.publish_with_feedback("open", "home/door").await,
        Err(DispatchError::Publish(PublishError::Timeout))
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(6));
}
