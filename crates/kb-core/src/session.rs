//! ExclusiveSessionGate - the single guided-flow slot
//!
//! At most one guided multi-step interaction (an admin setup flow) is active
//! process-wide. While a session holds the slot, every event from that
//! conversation/actor pair is routed only to the flow handler. Claiming and
//! releasing are atomic with respect to concurrent dispatch checks.

use parking_lot::Mutex;
use tracing::{debug, info};

use kb_common::SessionKey;

#[derive(Debug, Default)]
pub struct ExclusiveSessionGate {
    slot: Mutex<Option<SessionKey>>,
}

impl ExclusiveSessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `key`.
    ///
    /// Succeeds when the slot is free or already held by the same key;
    /// refuses when another session is active.
    pub fn claim(&self, key: SessionKey) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            Some(current) if current != key => {
                debug!(
                    chat_id = key.chat_id,
                    actor_id = key.actor_id,
                    "Exclusive session slot already held, claim refused"
                );
                false
            }
            _ => {
                info!(
                    chat_id = key.chat_id,
                    actor_id = key.actor_id,
                    "Exclusive session claimed"
                );
                *slot = Some(key);
                true
            }
        }
    }

    /// Release the slot if held by `key`; returns whether anything changed.
    pub fn release(&self, key: SessionKey) -> bool {
        let mut slot = self.slot.lock();
        if *slot == Some(key) {
            info!(
                chat_id = key.chat_id,
                actor_id = key.actor_id,
                "Exclusive session released"
            );
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn matches(&self, key: SessionKey) -> bool {
        *self.slot.lock() == Some(key)
    }

    pub fn current(&self) -> Option<SessionKey> {
        *self.slot.lock()
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }
}
