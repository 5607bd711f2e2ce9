//! Group replay guard: rejects duplicate `(kind, group, sender device,
//! unique id)` events inside the replay window and bounds the seen-set by
//! evicting entries older than the window.

use std::collections::HashMap;
use std::sync::Mutex;

use aim_core::constants::within_window;
use aim_core::types::Timestamp;
use aim_core::AimError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub kind: String,
    pub group_id: String,
    pub sender_device_id: String,
    pub unique_id: String,
}

pub struct ReplayGuard {
    window_ms: i64,
    seen: Mutex<HashMap<ReplayKey, Timestamp>>,
}

impl ReplayGuard {
    pub fn new(window_ms: i64) -> Self {
        Self { window_ms, seen: Mutex::new(HashMap::new()) }
    }

    /// Admit an event or reject it. `occurred_at` must lie inside
    /// `now ± window`; a key already seen within the window is a replay.
    pub fn check_and_record(
        &self,
        key: ReplayKey,
        occurred_at: Timestamp,
        now: Timestamp,
    ) -> Result<(), AimError> {
        if !within_window(occurred_at, now, self.window_ms) {
            return Err(AimError::ReplayOutOfWindow);
        }
        let mut seen = self.seen.lock().unwrap();
        let horizon = now - self.window_ms;
        seen.retain(|_, recorded| *recorded > horizon);
        if seen.contains_key(&key) {
            return Err(AimError::ReplayRejected);
        }
        seen.insert(key, now);
        Ok(())
    }

    pub fn seen_len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(uid: &str) -> ReplayKey {
        ReplayKey {
            kind: "group_event".into(),
            group_id: "grp1".into(),
            sender_device_id: "dev_1".into(),
            unique_id: uid.into(),
        }
    }

    #[test]
    fn duplicate_within_window_is_rejected() {
        let guard = ReplayGuard::new(10_000);
        assert!(guard.check_and_record(key("e1"), 1_000, 1_000).is_ok());
        assert!(matches!(
            guard.check_and_record(key("e1"), 1_000, 1_500),
            Err(AimError::ReplayRejected)
        ));
        assert!(guard.check_and_record(key("e2"), 1_000, 1_500).is_ok());
    }

    #[test]
    fn out_of_window_timestamps_are_rejected() {
        let guard = ReplayGuard::new(1_000);
        assert!(matches!(
            guard.check_and_record(key("old"), 0, 10_000),
            Err(AimError::ReplayOutOfWindow)
        ));
        assert!(matches!(
            guard.check_and_record(key("future"), 20_000, 10_000),
            Err(AimError::ReplayOutOfWindow)
        ));
    }

    #[test]
    fn old_entries_are_evicted() {
        let guard = ReplayGuard::new(1_000);
        guard.check_and_record(key("e1"), 1_000, 1_000).unwrap();
        assert_eq!(guard.seen_len(), 1);
        // Well past the window: the old entry is swept and the key readmits.
        guard.check_and_record(key("e1"), 10_000, 10_000).unwrap();
        assert_eq!(guard.seen_len(), 1);
    }
}
