//! In-memory transport that records every call.
//!
//! Used by the test suites and by `smp --dry-run`. Behavior is scripted through
//! setters; by default sessions open immediately and every publish is acked.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use super::{MqttTransport, SessionOptions, TransportError, TransportEvent, TrustPolicy};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    Open {
        host: String,
        port: u16,
        client_id: String,
        pinned_root: bool,
    },
    Close,
    Send {
        topic: String,
        payload: Vec<u8>,
        id: u16,
    },
}

#[derive(Clone, Debug, Default)]
struct Script {
    open_failure: Option<TransportError>,
    open_delay: Option<Duration>,
    hang_open: bool,
    manual_ack: bool,
    drop_sends: bool,
    stall_sends: bool,
}

pub struct MockTransport {
    calls: Mutex<Vec<MockCall>>,
    script: Mutex<Script>,
    events: broadcast::Sender<TransportEvent>,
    open: AtomicBool,
    session: AtomicU64,
    next_id: AtomicU16,
    closed: Notify,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            events,
            open: AtomicBool::new(false),
            session: AtomicU64::new(0),
            next_id: AtomicU16::new(1),
            closed: Notify::new(),
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Payloads sent so far, as `(topic, payload)` text pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Send { topic, payload, .. } => {
                    Some((topic, String::from_utf8_lossy(&payload).into_owned()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn fail_open_with(&self, error: Option<TransportError>) {
        self.with_script(|s| s.open_failure = error);
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.with_script(|s| s.open_delay = delay);
    }

    /// Make `open` wait until `close` is called.
    pub fn hang_on_open(&self, hang: bool) {
        self.with_script(|s| s.hang_open = hang);
    }

    /// Stop acking publishes automatically; use [`MockTransport::ack`].
    pub fn set_manual_ack(&self, manual: bool) {
        self.with_script(|s| s.manual_ack = manual);
    }

    /// Refuse publishes the way a client with a full queue would.
    pub fn drop_sends(&self, drop: bool) {
        self.with_script(|s| s.drop_sends = drop);
    }

    /// Make `send` never return, like a client whose inflight window stays full.
    pub fn stall_sends(&self, stall: bool) {
        self.with_script(|s| s.stall_sends = stall);
    }

    pub fn ack(&self, id: u16) {
        let _ = self.events.send(TransportEvent::Delivered(id));
    }

    /// Simulate the broker dropping the current session.
    pub fn lose_connection(&self, error: Option<TransportError>) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::ConnectionLost {
            session: self.session.load(Ordering::SeqCst),
            error,
        });
    }

    fn with_script(&self, f: impl FnOnce(&mut Script)) {
        if let Ok(mut script) = self.script.lock() {
            f(&mut script);
        }
    }

    fn script(&self) -> Script {
        self.script.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, call: MockCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn open(&self, options: SessionOptions) -> Result<u64, TransportError> {
        self.record(MockCall::Open {
            host: options.endpoint.host.clone(),
            port: options.endpoint.port,
            client_id: options.client_id.clone(),
            pinned_root: matches!(options.trust, TrustPolicy::Pinned(_)),
        });
        let script = self.script();

        if script.hang_open {
            self.closed.notified().await;
            return Err(TransportError::Closed);
        }
        if let Some(delay) = script.open_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closed.notified() => return Err(TransportError::Closed),
            }
        }
        if let Some(err) = script.open_failure {
            return Err(err);
        }

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.open.store(true, Ordering::SeqCst);
        Ok(session)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(MockCall::Close);
        self.open.store(false, Ordering::SeqCst);
        self.closed.notify_waiters();
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<u16, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let script = self.script();
        if script.drop_sends {
            return Err(TransportError::MessageDropped);
        }
        if script.stall_sends {
            std::future::pending::<()>().await;
        }

        let mut id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        self.record(MockCall::Send {
            topic: topic.to_string(),
            payload,
            id,
        });
        if !script.manual_ack {
            self.ack(id);
        }
        Ok(id)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
