//! Confirmation flow for tag-triggered actions.
//!
//! A trigger session runs two waits side by side: a cancelable countdown and a
//! connection-readiness wait bounded by a timeout. The action is published
//! once both have finished, exactly once, and never after cancellation.
//! While a session is live the [`ExecutionGate`] is engaged so focus-driven
//! connect/disconnect stays out of the way of the manual connect.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectError, ConnectParams, ConnectionState};
use crate::coordinator::{
    connect_error_message, is_blocking_configuration_error, is_blocking_connect_error,
    DispatchError, PublishCoordinator,
};
use crate::settings::Action;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("action index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("MQTT topic empty")]
    TopicEmpty,
    #[error("connection timeout")]
    ConnectionTimeout,
    #[error("{}", connect_error_message(.0))]
    Connect(ConnectError),
    #[error("{}", .0.user_message())]
    Dispatch(DispatchError),
}

impl TriggerError {
    /// Whether retrying the tag cannot help until the settings are fixed.
    pub fn is_blocking_configuration_error(&self) -> bool {
        match self {
            Self::IndexOutOfRange(_) | Self::TopicEmpty => true,
            Self::ConnectionTimeout => false,
            Self::Connect(e) => is_blocking_connect_error(e),
            Self::Dispatch(e) => is_blocking_configuration_error(e),
        }
    }
}

/// How a trigger session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Dispatched,
    Failed(TriggerError),
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedbackCue {
    /// One countdown step.
    Tick,
    /// Quadruple pulse after a successful publish.
    Success,
    Failure,
}

/// User-facing side of a trigger session.
pub trait TriggerFeedback: Send + Sync {
    fn countdown(&self, action_title: &str, remaining: u32);
    fn cue(&self, cue: FeedbackCue);
    fn failed(&self, message: &str);
    fn request_background(&self);
}

/// Feedback sink that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFeedback;

impl TriggerFeedback for LogFeedback {
    fn countdown(&self, action_title: &str, remaining: u32) {
        log::info!("executing \"{}\" in {}s", action_title, remaining);
    }

    fn cue(&self, cue: FeedbackCue) {
        log::debug!("feedback cue {:?}", cue);
    }

    fn failed(&self, message: &str) {
        log::warn!("trigger failed: {}", message);
    }

    fn request_background(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RendezvousTiming {
    pub countdown_secs: u32,
    pub tick: Duration,
    pub connect_timeout: Duration,
    pub background_delay: Duration,
}

impl Default for RendezvousTiming {
    fn default() -> Self {
        Self {
            countdown_secs: 3,
            tick: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(15),
            background_delay: Duration::from_millis(600),
        }
    }
}

// -------------------- Execution gate --------------------

/// Process-wide "trigger execution in progress" flag. Reentrant.
#[derive(Clone, Debug, Default)]
pub struct ExecutionGate {
    depth: Arc<AtomicUsize>,
}

impl ExecutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) -> ExecutionGuard {
        self.depth.fetch_add(1, Ordering::SeqCst);
        ExecutionGuard {
            depth: self.depth.clone(),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }
}

/// Holds the gate engaged until dropped.
#[derive(Debug)]
pub struct ExecutionGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

// -------------------- Session --------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(TriggerError),
}

#[derive(Debug)]
struct Flags {
    countdown_done: bool,
    connection: Readiness,
    cancelled: bool,
    resolved: bool,
}

enum Step {
    Wait,
    Dispatch,
    Fail(TriggerError),
}

struct TriggerSession {
    id: u64,
    action_index: usize,
    cancel: CancellationToken,
    flags: Mutex<Flags>,
    guard: Mutex<Option<ExecutionGuard>>,
}

impl TriggerSession {
    /// Apply `update` and decide, in the same critical section, whether to resolve.
    fn advance(&self, update: impl FnOnce(&mut Flags)) -> Step {
        let Ok(mut flags) = self.flags.lock() else {
            return Step::Wait;
        };
        update(&mut flags);
        if flags.cancelled || flags.resolved || !flags.countdown_done {
            return Step::Wait;
        }
        match flags.connection.clone() {
            Readiness::Pending => Step::Wait,
            Readiness::Ready => {
                flags.resolved = true;
                Step::Dispatch
            }
            Readiness::Failed(e) => {
                flags.resolved = true;
                Step::Fail(e)
            }
        }
    }

    /// Mark cancelled unless already resolved. Returns whether it took effect.
    fn cancel(&self) -> bool {
        let took_effect = match self.flags.lock() {
            Ok(mut flags) if !flags.resolved && !flags.cancelled => {
                flags.cancelled = true;
                true
            }
            _ => false,
        };
        if took_effect {
            self.cancel.cancel();
            self.release_gate();
        }
        took_effect
    }

    fn release_gate(&self) {
        let guard = self.guard.lock().ok().and_then(|mut slot| slot.take());
        drop(guard);
    }
}

/// Handle to a started trigger session.
#[derive(Debug)]
pub struct TriggerHandle {
    id: u64,
    task: JoinHandle<SessionOutcome>,
}

impl TriggerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the session to end.
    pub async fn outcome(self) -> SessionOutcome {
        self.task.await.unwrap_or(SessionOutcome::Cancelled)
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<TriggerSession>>>>;

pub struct TriggerRendezvous {
    coordinator: Arc<PublishCoordinator>,
    gate: ExecutionGate,
    feedback: Arc<dyn TriggerFeedback>,
    timing: RendezvousTiming,
    current: SessionSlot,
    next_id: AtomicU64,
}

impl TriggerRendezvous {
    pub fn new(
        coordinator: Arc<PublishCoordinator>,
        gate: ExecutionGate,
        feedback: Arc<dyn TriggerFeedback>,
        timing: RendezvousTiming,
    ) -> Self {
        Self {
            coordinator,
            gate,
            feedback,
            timing,
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether a session is waiting on its countdown or connection.
    pub fn is_active(&self) -> bool {
        self.current.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Action index of the live session, if any.
    pub fn pending_action(&self) -> Option<usize> {
        self.current
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|s| s.action_index))
    }

    /// Start confirming `action`. A previous live session is cancelled first.
    pub fn start(
        &self,
        action_index: usize,
        action: &Action,
        params: ConnectParams,
    ) -> Result<TriggerHandle, TriggerError> {
        if action.topic.is_empty() {
            return Err(TriggerError::TopicEmpty);
        }
        self.cancel();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Engage before the manual connect is issued.
        let guard = self.gate.engage();
        let session = Arc::new(TriggerSession {
            id,
            action_index,
            cancel: CancellationToken::new(),
            flags: Mutex::new(Flags {
                countdown_done: false,
                connection: Readiness::Pending,
                cancelled: false,
                resolved: false,
            }),
            guard: Mutex::new(Some(guard)),
        });
        if let Ok(mut slot) = self.current.lock() {
            *slot = Some(session.clone());
        }
        log::info!("trigger session {} started for action {}", id, action_index);

        let runner = SessionRunner {
            coordinator: self.coordinator.clone(),
            feedback: self.feedback.clone(),
            timing: self.timing,
            session,
            action: action.clone(),
            params,
            current: self.current.clone(),
        };
        let task = tokio::spawn(runner.run());
        Ok(TriggerHandle { id, task })
    }

    /// Cancel the live session, if it has not dispatched yet.
    pub fn cancel(&self) -> bool {
        let session = self.current.lock().ok().and_then(|mut slot| slot.take());
        match session {
            Some(session) => {
                let cancelled = session.cancel();
                if cancelled {
                    log::info!("trigger session {} cancelled by user", session.id);
                }
                cancelled
            }
            None => false,
        }
    }
}

struct SessionRunner {
    coordinator: Arc<PublishCoordinator>,
    feedback: Arc<dyn TriggerFeedback>,
    timing: RendezvousTiming,
    session: Arc<TriggerSession>,
    action: Action,
    params: ConnectParams,
    current: SessionSlot,
}

impl SessionRunner {
    async fn run(self) -> SessionOutcome {
        let (from_countdown, from_connection) =
            tokio::join!(self.run_countdown(), self.await_connection());
        let outcome = from_countdown
            .or(from_connection)
            .unwrap_or(SessionOutcome::Cancelled);

        self.session.release_gate();
        if let Ok(mut slot) = self.current.lock() {
            if slot.as_ref().map(|s| s.id) == Some(self.session.id) {
                *slot = None;
            }
        }
        outcome
    }

    async fn run_countdown(&self) -> Option<SessionOutcome> {
        for remaining in (1..=self.timing.countdown_secs).rev() {
            self.feedback.countdown(&self.action.title, remaining);
            self.feedback.cue(FeedbackCue::Tick);
            tokio::select! {
                _ = self.session.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.timing.tick) => {}
            }
        }
        let step = self.session.advance(|f| f.countdown_done = true);
        self.execute(step).await
    }

    async fn await_connection(&self) -> Option<SessionOutcome> {
        let controller = self.coordinator.controller().clone();
        let mut states = controller.subscribe_state();

        let (failed_tx, mut failed_rx) = oneshot::channel::<ConnectError>();
        if controller.state() != ConnectionState::Connected {
            let params = self.params.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.connect(&params).await {
                    let _ = failed_tx.send(e);
                }
            });
        } else {
            drop(failed_tx);
        }

        let readiness = tokio::select! {
            _ = self.session.cancel.cancelled() => return None,
            ready = tokio::time::timeout(self.timing.connect_timeout, wait_connected(&mut states)) => {
                match ready {
                    Ok(true) => Readiness::Ready,
                    Ok(false) | Err(_) => Readiness::Failed(TriggerError::ConnectionTimeout),
                }
            }
            Ok(e) = &mut failed_rx => Readiness::Failed(TriggerError::Connect(e)),
        };
        if let Readiness::Failed(e) = &readiness {
            log::warn!("trigger session {}: {}", self.session.id, e);
        }

        let step = self.session.advance(|f| f.connection = readiness);
        self.execute(step).await
    }

    async fn execute(&self, step: Step) -> Option<SessionOutcome> {
        match step {
            Step::Wait => None,
            Step::Fail(e) => {
                self.report_failure(&e);
                Some(SessionOutcome::Failed(e))
            }
            Step::Dispatch => {
                let result = self
                    .coordinator
                    .publish(&self.action.message, &self.action.topic)
                    .await;
                self.session.release_gate();
                match result {
                    Ok(()) => {
                        log::info!(
                            "trigger session {} published action {}",
                            self.session.id,
                            self.session.action_index
                        );
                        self.feedback.cue(FeedbackCue::Success);
                        tokio::time::sleep(self.timing.background_delay).await;
                        self.feedback.request_background();
                        Some(SessionOutcome::Dispatched)
                    }
                    Err(e) => {
                        let e = TriggerError::Dispatch(e);
                        self.report_failure(&e);
                        Some(SessionOutcome::Failed(e))
                    }
                }
            }
        }
    }

    fn report_failure(&self, error: &TriggerError) {
        if error.is_blocking_configuration_error() {
            log::warn!(
                "trigger session {} failed, settings need fixing: {}",
                self.session.id,
                error
            );
        } else {
            log::warn!("trigger session {} failed: {}", self.session.id, error);
        }
        self.feedback.cue(FeedbackCue::Failure);
        self.feedback.failed(&error.to_string());
    }
}

async fn wait_connected(states: &mut watch::Receiver<ConnectionState>) -> bool {
    loop {
        let connected = *states.borrow_and_update() == ConnectionState::Connected;
        if connected {
            return true;
        }
        if states.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TriggerSession {
        TriggerSession {
            id: 1,
            action_index: 0,
            cancel: CancellationToken::new(),
            flags: Mutex::new(Flags {
                countdown_done: false,
                connection: Readiness::Pending,
                cancelled: false,
                resolved: false,
            }),
            guard: Mutex::new(None),
        }
    }

    #[test]
    fn gate_is_reentrant_and_released_on_drop() {
        let gate = ExecutionGate::new();
        assert!(!gate.is_engaged());
        let a = gate.engage();
        let b = gate.engage();
        drop(a);
        assert!(gate.is_engaged());
        drop(b);
        assert!(!gate.is_engaged());
    }

    #[test]
    fn dispatch_decided_once_in_either_order() {
        for countdown_first in [true, false] {
            let s = session();
            let first = if countdown_first {
                s.advance(|f| f.countdown_done = true)
            } else {
                s.advance(|f| f.connection = Readiness::Ready)
            };
            assert!(matches!(first, Step::Wait));
            let second = if countdown_first {
                s.advance(|f| f.connection = Readiness::Ready)
            } else {
                s.advance(|f| f.countdown_done = true)
            };
            assert!(matches!(second, Step::Dispatch));
            assert!(matches!(s.advance(|_| {}), Step::Wait));
        }
    }

    #[test]
    fn cancelled_session_never_dispatches() {
        let s = session();
        s.advance(|f| f.countdown_done = true);
        assert!(s.cancel());
        assert!(matches!(
            s.advance(|f| f.connection = Readiness::Ready),
            Step::Wait
        ));
        assert!(!s.cancel());
    }

    #[test]
    fn connection_failure_waits_for_countdown() {
        let s = session();
        let step = s.advance(|f| f.connection = Readiness::Failed(TriggerError::ConnectionTimeout));
        assert!(matches!(step, Step::Wait));
        let step = s.advance(|f| f.countdown_done = true);
        assert!(matches!(step, Step::Fail(TriggerError::ConnectionTimeout)));
    }

    #[test]
    fn cancel_releases_gate() {
        let gate = ExecutionGate::new();
        let s = session();
        if let Ok(mut slot) = s.guard.lock() {
            *slot = Some(gate.engage());
        }
        assert!(gate.is_engaged());
        s.cancel();
        assert!(!gate.is_engaged());
    }

    #[test]
    fn trigger_failures_classified_by_cause() {
        use crate::connection::PublishError;
        use crate::crypto::EncrypterError;
        use crate::transport::TransportError;

        assert!(TriggerError::Connect(ConnectError::EndpointEmpty).is_blocking_configuration_error());
        assert!(TriggerError::Connect(ConnectError::CertificateEmpty)
            .is_blocking_configuration_error());
        assert!(TriggerError::TopicEmpty.is_blocking_configuration_error());
        assert!(TriggerError::Dispatch(DispatchError::Publish(PublishError::MessageEmpty))
            .is_blocking_configuration_error());

        assert!(!TriggerError::ConnectionTimeout.is_blocking_configuration_error());
        assert!(!TriggerError::Connect(ConnectError::Transport(TransportError::Refused(
            "not authorized".into()
        )))
        .is_blocking_configuration_error());
        assert!(!TriggerError::Dispatch(DispatchError::Encrypt(
            EncrypterError::KeyFormatIncorrect
        ))
        .is_blocking_configuration_error());
    }
}
