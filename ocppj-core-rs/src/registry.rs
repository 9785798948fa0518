//! Pending-call registry
//!
//! Correlates outbound Calls with their CallResult/CallError by MessageId.
//! Every resolution path (answer, expiry, cancellation, connection loss)
//! goes through the same remove-under-lock step, so each entry resolves
//! exactly once and the loser of a race sees it as already gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{CallFailure, RegistryError};
use crate::frame::{CallError, CallResult};
use crate::types::{Action, MessageId, NodeId};

pub type CallOutcome = Result<CallResult, CallFailure>;

/// Bookkeeping for one outbound Call awaiting its answer
#[derive(Debug)]
pub struct PendingCall {
    pub message_id: MessageId,
    pub destination: NodeId,
    /// Session the Call left through
    pub via: NodeId,
    pub action: Action,
    pub deadline: Instant,
    ticket: u64,
    sink: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn resolve(self, outcome: CallOutcome) {
        // The handle may already be gone; nobody is left to tell
        let _ = self.sink.send(outcome);
    }
}

#[derive(Debug, Default)]
pub struct PendingCallRegistry {
    calls: Mutex<HashMap<MessageId, PendingCall>>,
    next_ticket: AtomicU64,
}

impl PendingCallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start tracking a Call. Deadline is now + `timeout`.
    pub fn register(
        self: &Arc<Self>,
        message_id: MessageId,
        destination: NodeId,
        via: NodeId,
        action: Action,
        timeout: Duration,
    ) -> Result<CompletionHandle, RegistryError> {
        let deadline = Instant::now() + timeout;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (sink, rx) = oneshot::channel();

        let mut calls = self.calls.lock();
        if calls.contains_key(&message_id) {
            return Err(RegistryError::DuplicateMessageId(message_id));
        }
        trace!("Pending {} {} -> {} via {}", message_id, action, destination, via);
        calls.insert(
            message_id.clone(),
            PendingCall {
                message_id: message_id.clone(),
                destination,
                via,
                action,
                deadline,
                ticket,
                sink,
            },
        );
        drop(calls);

        Ok(CompletionHandle {
            message_id,
            deadline,
            ticket,
            rx,
            registry: Arc::downgrade(self),
            settled: false,
        })
    }

    /// Resolve a pending call with the peer's answer.
    ///
    /// Only an answer arriving over the session the Call left through is
    /// accepted; anything else leaves the entry pending.
    pub fn complete(
        &self,
        message_id: &MessageId,
        arrival: &NodeId,
        answer: Result<CallResult, CallError>,
    ) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock();
        let via = calls.get(message_id).map(|c| c.via.clone());
        match via {
            Some(via) if &via == arrival => {}
            Some(via) => {
                drop(calls);
                warn!(
                    "Answer for {} arrived from {}, call left via {}",
                    message_id, arrival, via
                );
                return Err(RegistryError::UnknownCorrelation(message_id.clone()));
            }
            None => return Err(RegistryError::UnknownCorrelation(message_id.clone())),
        }
        let call = Self::take_locked(&mut calls, message_id)
            .ok_or_else(|| RegistryError::UnknownCorrelation(message_id.clone()))?;
        drop(calls);
        debug!("Completed {} ({})", message_id, call.action);
        call.resolve(answer.map_err(CallFailure::Rejected));
        Ok(())
    }

    /// Resolve one call with `Timeout`. False if it already resolved.
    pub fn expire(&self, message_id: &MessageId) -> bool {
        match self.take(message_id) {
            Some(call) => {
                debug!("Call {} ({}) to {} timed out", message_id, call.action, call.destination);
                call.resolve(Err(CallFailure::Timeout));
                true
            }
            None => false,
        }
    }

    /// Resolve every call whose deadline is at or before `now` with `Timeout`
    pub fn expire_due(&self, now: Instant) -> usize {
        let due = self.take_where(|call| call.deadline <= now);
        let count = due.len();
        for call in due {
            debug!("Call {} ({}) to {} timed out", call.message_id, call.action, call.destination);
            call.resolve(Err(CallFailure::Timeout));
        }
        count
    }

    /// Resolve one call with `Cancelled`. No-op if it already resolved.
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        match self.take(message_id) {
            Some(call) => {
                call.resolve(Err(CallFailure::Cancelled));
                true
            }
            None => false,
        }
    }

    fn cancel_ticket(&self, message_id: &MessageId, ticket: u64) {
        if let Some(call) = self.take_ticket(message_id, ticket) {
            trace!("Cancelled {}", message_id);
            call.resolve(Err(CallFailure::Cancelled));
        }
    }

    fn expire_ticket(&self, message_id: &MessageId, ticket: u64) {
        if let Some(call) = self.take_ticket(message_id, ticket) {
            debug!("Call {} ({}) to {} timed out", message_id, call.action, call.destination);
            call.resolve(Err(CallFailure::Timeout));
        }
    }

    /// Remove `message_id` only if it is still the registration `ticket`.
    /// The id may have been reused by a newer call after this one resolved.
    fn take_ticket(&self, message_id: &MessageId, ticket: u64) -> Option<PendingCall> {
        let mut calls = self.calls.lock();
        if calls.get(message_id).map(|c| c.ticket) != Some(ticket) {
            return None;
        }
        Self::take_locked(&mut calls, message_id)
    }

    /// Resolve every call that left through session `via` with `ConnectionLost`
    pub fn fail_via(&self, via: &NodeId) -> usize {
        let lost = self.take_where(|call| &call.via == via);
        let count = lost.len();
        if count > 0 {
            warn!("Connection to {} lost with {} calls pending", via, count);
        }
        for call in lost {
            call.resolve(Err(CallFailure::ConnectionLost));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.calls.lock().contains_key(message_id)
    }

    /// Number of pending calls that left through `via`
    pub fn pending_via(&self, via: &NodeId) -> usize {
        self.calls.lock().values().filter(|c| &c.via == via).count()
    }

    fn take(&self, message_id: &MessageId) -> Option<PendingCall> {
        Self::take_locked(&mut self.calls.lock(), message_id)
    }

    fn take_locked(
        calls: &mut HashMap<MessageId, PendingCall>,
        message_id: &MessageId,
    ) -> Option<PendingCall> {
        let call = calls.remove(message_id)?;
        assert_eq!(
            &call.message_id, message_id,
            "pending call stored under a foreign message id"
        );
        Some(call)
    }

    fn take_where(&self, predicate: impl Fn(&PendingCall) -> bool) -> Vec<PendingCall> {
        let mut calls = self.calls.lock();
        let ids: Vec<MessageId> = calls
            .values()
            .filter(|c| predicate(c))
            .map(|c| c.message_id.clone())
            .collect();
        ids.iter().filter_map(|id| calls.remove(id)).collect()
    }

    /// Spawn a task calling `expire_due` every `interval`.
    ///
    /// The task holds only a weak reference and stops once the registry is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let expired = registry.expire_due(Instant::now());
                if expired > 0 {
                    trace!("Sweeper expired {} calls", expired);
                }
            }
        })
    }
}

/// Caller side of a pending call.
///
/// Dropping the handle before it resolves cancels the call.
#[derive(Debug)]
pub struct CompletionHandle {
    message_id: MessageId,
    deadline: Instant,
    ticket: u64,
    rx: oneshot::Receiver<CallOutcome>,
    registry: Weak<PendingCallRegistry>,
    settled: bool,
}

impl CompletionHandle {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the answer, or `Timeout` once the deadline passes
    pub async fn wait(mut self) -> CallOutcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Registry dropped with the call still pending
            Ok(Err(_)) => Err(CallFailure::ConnectionLost),
            Err(_) => {
                if let Some(registry) = self.registry.upgrade() {
                    registry.expire_ticket(&self.message_id, self.ticket);
                }
                // Whoever won the remove has sent its outcome by now
                self.rx.try_recv().unwrap_or(Err(CallFailure::Timeout))
            }
        };
        self.settled = true;
        outcome
    }

    /// Cancel the call; no-op if the answer already arrived
    pub fn cancel(mut self) {
        self.cancel_pending();
    }

    fn cancel_pending(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.cancel_ticket(&self.message_id, self.ticket);
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
