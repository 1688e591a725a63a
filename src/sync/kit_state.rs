//! Sync state surfaced to the application

use crate::events::{EventDispatcher, KitEvent};
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KitState {
    Idle,
    ApiSyncing { found_transactions: usize },
    /// Progress of the block download in `[0, 1]`
    Syncing { progress: f64 },
    Synced,
    NotSynced { error: String },
}

impl KitState {
    pub fn is_syncing(&self) -> bool {
        matches!(self, KitState::ApiSyncing { .. } | KitState::Syncing { .. })
    }
}

/// Holds the current state and reports every change
pub struct KitStateManager {
    state: Mutex<KitState>,
    initial_best_height: Mutex<u32>,
    events: Arc<EventDispatcher>,
}

impl KitStateManager {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            state: Mutex::new(KitState::Idle),
            initial_best_height: Mutex::new(0),
            events,
        }
    }

    pub fn state(&self) -> KitState {
        lock(&self.state).clone()
    }

    pub fn set_state(&self, new_state: KitState) {
        let mut state = lock(&self.state);
        if *state == new_state {
            return;
        }
        log::debug!("Kit state: {:?}", new_state);
        *state = new_state.clone();
        drop(state);
        self.events.emit(KitEvent::KitStateUpdated(new_state));
    }

    pub fn set_api_syncing(&self, found_transactions: usize) {
        self.set_state(KitState::ApiSyncing { found_transactions });
    }

    pub fn set_syncing_started(&self, local_best_height: u32) {
        *lock(&self.initial_best_height) = local_best_height;
        self.set_state(KitState::Syncing { progress: 0.0 });
    }

    /// Progress between the height download started at and `max_height`
    pub fn set_progress(&self, current_height: u32, max_height: u32) {
        let initial = *lock(&self.initial_best_height);
        let progress = if max_height <= initial || current_height >= max_height {
            1.0
        } else {
            current_height.saturating_sub(initial) as f64 / (max_height - initial) as f64
        };
        if progress >= 1.0 {
            self.set_state(KitState::Synced);
        } else {
            self.set_state(KitState::Syncing { progress });
        }
    }

    pub fn set_synced(&self) {
        self.set_state(KitState::Synced);
    }

    pub fn set_not_synced(&self, error: impl Into<String>) {
        self.set_state(KitState::NotSynced { error: error.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_are_reported_once() {
        let events = Arc::new(EventDispatcher::new());
        let mut subscription = events.subscribe();
        let manager = KitStateManager::new(events);

        manager.set_synced();
        manager.set_synced();
        manager.set_not_synced("no peers");

        assert!(matches!(subscription.try_recv(), Some(KitEvent::KitStateUpdated(KitState::Synced))));
        match subscription.try_recv() {
            Some(KitEvent::KitStateUpdated(KitState::NotSynced { error })) => assert_eq!(error, "no peers"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_progress() {
        let manager = KitStateManager::new(Arc::new(EventDispatcher::new()));
        manager.set_syncing_started(100);
        manager.set_progress(150, 200);
        assert_eq!(manager.state(), KitState::Syncing { progress: 0.5 });
        assert!(manager.state().is_syncing());

        manager.set_progress(200, 200);
        assert_eq!(manager.state(), KitState::Synced);
    }
}
