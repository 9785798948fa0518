//! Calls relayed to plain OCPP-J peers
//!
//! A plain peer answers without routing information, so the relay has to
//! remember who originated each Call it passed on. Entries are keyed by
//! `(peer, message id)`; a second Call with the same id to the same peer is
//! refused while the first is still in transit. Unanswered entries expire.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::RegistryError;
use crate::types::{MessageId, NodeId};

#[derive(Debug)]
struct TransitEntry {
    origin: NodeId,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct TransitTable {
    entries: Mutex<HashMap<(NodeId, MessageId), TransitEntry>>,
}

impl TransitTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that `origin`'s Call `message_id` went to `peer`.
    ///
    /// An expired entry under the same key is replaced; a live one is not.
    pub fn reserve(
        &self,
        peer: &NodeId,
        message_id: &MessageId,
        origin: &NodeId,
        timeout: Duration,
    ) -> Result<(), RegistryError> {
        let now = Instant::now();
        let key = (peer.clone(), message_id.clone());
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            if existing.deadline > now {
                debug!(
                    "Call {} from {} collides with one from {} in transit to {}",
                    message_id, origin, existing.origin, peer
                );
                return Err(RegistryError::DuplicateMessageId(message_id.clone()));
            }
        }
        entries.insert(
            key,
            TransitEntry {
                origin: origin.clone(),
                deadline: now + timeout,
            },
        );
        Ok(())
    }

    /// Origin of the Call `peer` is answering, if it is still in transit
    pub fn take(&self, peer: &NodeId, message_id: &MessageId) -> Option<NodeId> {
        let entry = self
            .entries
            .lock()
            .remove(&(peer.clone(), message_id.clone()))?;
        (entry.deadline > Instant::now()).then_some(entry.origin)
    }

    pub fn release(&self, peer: &NodeId, message_id: &MessageId) {
        self.entries.lock().remove(&(peer.clone(), message_id.clone()));
    }

    /// Drop everything in transit to `peer`
    pub fn forget_peer(&self, peer: &NodeId) {
        self.entries.lock().retain(|(p, _), _| p != peer);
    }

    /// Drop entries whose deadline is at or before `now`
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.deadline > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Spawn a task calling `purge_expired` every `interval`, stopping once
    /// the table is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let table: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                let purged = table.purge_expired(Instant::now());
                if purged > 0 {
                    trace!("Purged {} unanswered transit entries", purged);
                }
            }
        })
    }
}
