//! rumqttc-backed transport: one mutual-TLS MQTT 3.1.1 session at a time.
//!
//! The event loop runs on its own task. Message ids are assigned by rumqttc
//! when the publish leaves the client, so `send` waits for the matching
//! `Outgoing::Publish` before returning the id to the caller.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{build_client_config, MqttTransport, SessionOptions, TransportError, TransportEvent};

const REQUEST_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 64;

type PendingIds = Arc<StdMutex<VecDeque<oneshot::Sender<u16>>>>;

struct Session {
    id: u64,
    client: AsyncClient,
    pending_ids: PendingIds,
    task: JoinHandle<()>,
}

pub struct RumqttTransport {
    session: Mutex<Option<Session>>,
    send_lock: Mutex<()>,
    events: broadcast::Sender<TransportEvent>,
    next_session: AtomicU64,
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session: Mutex::new(None),
            send_lock: Mutex::new(()),
            events,
            next_session: AtomicU64::new(1),
        }
    }

    async fn shutdown_session(session: Session) {
        if let Err(e) = session.client.disconnect().await {
            log::debug!("MQTT disconnect request not delivered: {}", e);
        }
        session.task.abort();
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn open(&self, options: SessionOptions) -> Result<u64, TransportError> {
        if let Some(previous) = self.session.lock().await.take() {
            Self::shutdown_session(previous).await;
        }

        let tls = build_client_config(&options.identity, &options.trust)?;
        let mut mqtt = MqttOptions::new(
            options.client_id.clone(),
            options.endpoint.host.clone(),
            options.endpoint.port,
        );
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(tls)));

        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let pending_ids: PendingIds = Arc::new(StdMutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(drive_event_loop(
            id,
            eventloop,
            self.events.clone(),
            pending_ids.clone(),
            ready_tx,
        ));

        log::info!(
            "opening MQTT session {} to {}:{} as {}",
            id,
            options.endpoint.host,
            options.endpoint.port,
            options.client_id
        );
        *self.session.lock().await = Some(Session {
            id,
            client,
            pending_ids,
            task,
        });

        let outcome = match ready_rx.await {
            Ok(result) => result,
            // Event loop task went away before reporting, i.e. close() raced us.
            Err(_) => Err(TransportError::Closed),
        };
        if let Err(e) = outcome {
            let mut slot = self.session.lock().await;
            if slot.as_ref().map(|s| s.id) == Some(id) {
                if let Some(session) = slot.take() {
                    session.task.abort();
                }
            }
            return Err(e);
        }
        Ok(id)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            log::info!("closing MQTT session {}", session.id);
            Self::shutdown_session(session).await;
        }
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<u16, TransportError> {
        // Publishes must reach the event loop in the same order their id slots are queued.
        let _ordered = self.send_lock.lock().await;
        let (client, pending_ids) = {
            let slot = self.session.lock().await;
            let session = slot.as_ref().ok_or(TransportError::NotConnected)?;
            (session.client.clone(), session.pending_ids.clone())
        };

        let (id_tx, id_rx) = oneshot::channel();
        push_pending(&pending_ids, id_tx);
        // Also unqueues the slot when the caller gives up mid-request.
        let mut queued = QueuedSlot {
            pending: &pending_ids,
            armed: true,
        };
        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            log::warn!("MQTT publish request rejected: {}", e);
            return Err(TransportError::MessageDropped);
        }
        queued.armed = false;

        match id_rx.await {
            Ok(0) | Err(_) => Err(TransportError::MessageDropped),
            Ok(id) => Ok(id),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

async fn drive_event_loop(
    session: u64,
    mut eventloop: EventLoop,
    events: broadcast::Sender<TransportEvent>,
    pending_ids: PendingIds,
    ready: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    log::info!("MQTT session {} connected", session);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    let err = TransportError::Refused(format!("{:?}", ack.code));
                    report_failure(session, &events, &mut ready, err);
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = events.send(TransportEvent::Delivered(ack.pkid));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if let Some(tx) = pop_pending_front(&pending_ids) {
                    let _ = tx.send(pkid);
                }
            }
            Ok(_) => {}
            Err(e) => {
                let err = map_connection_error(&e);
                log::warn!("MQTT session {} ended: {}", session, e);
                report_failure(session, &events, &mut ready, err);
                break;
            }
        }
    }
}

fn report_failure(
    session: u64,
    events: &broadcast::Sender<TransportEvent>,
    ready: &mut Option<oneshot::Sender<Result<(), TransportError>>>,
    err: TransportError,
) {
    match ready.take() {
        Some(tx) => {
            let _ = tx.send(Err(err));
        }
        None => {
            let _ = events.send(TransportEvent::ConnectionLost {
                session,
                error: Some(err),
            });
        }
    }
}

fn map_connection_error(err: &ConnectionError) -> TransportError {
    match err {
        ConnectionError::Io(io) => {
            let text = io.to_string();
            let lowered = text.to_lowercase();
            if lowered.contains("lookup") || lowered.contains("resolve") || lowered.contains("not known") {
                TransportError::NameResolution(text)
            } else {
                TransportError::ConnectionFailed(text)
            }
        }
        ConnectionError::Tls(tls) => TransportError::Tls(tls.to_string()),
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{:?}", code)),
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

fn push_pending(pending: &PendingIds, tx: oneshot::Sender<u16>) {
    if let Ok(mut queue) = pending.lock() {
        queue.push_back(tx);
    }
}

fn pop_pending_front(pending: &PendingIds) -> Option<oneshot::Sender<u16>> {
    pending.lock().ok().and_then(|mut queue| queue.pop_front())
}

fn pop_pending_back(pending: &PendingIds) {
    if let Ok(mut queue) = pending.lock() {
        queue.pop_back();
    }
}

/// An id slot whose publish request has not reached the client yet.
struct QueuedSlot<'a> {
    pending: &'a PendingIds,
    armed: bool,
}

impl Drop for QueuedSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            pop_pending_back(self.pending);
        }
    }
}
