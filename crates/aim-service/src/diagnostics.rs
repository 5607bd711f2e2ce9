//! Audit ring and diagnostics bundle export. Everything that leaves the
//! process through this path goes through the redactor first.

use std::collections::VecDeque;
use std::sync::Mutex;

use aim_core::types::{now_ms, Timestamp};
use serde::{Deserialize, Serialize};

use crate::enroll::EnrollmentAudit;

const AUDIT_RING_CAP: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: Timestamp,
    pub kind: String,
    pub reason: String,
    pub detail: String,
}

/// Bounded in-memory audit history. Append-only within its window; old
/// events fall off the front.
pub struct AuditRing {
    mu: Mutex<VecDeque<AuditEvent>>,
}

impl AuditRing {
    pub fn new() -> Self {
        Self { mu: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, kind: &str, reason: &str, detail: &str) {
        let mut ring = self.mu.lock().unwrap();
        if ring.len() >= AUDIT_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(AuditEvent {
            at: now_ms(),
            kind: kind.to_string(),
            reason: reason.to_string(),
            detail: detail.to_string(),
        });
    }

    /// Events at or after `cutoff`, oldest first.
    pub fn since(&self, cutoff: Timestamp) -> Vec<AuditEvent> {
        self.mu.lock().unwrap().iter().filter(|e| e.at >= cutoff).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mu.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditRing {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrollmentAudit for AuditRing {
    fn rejected(&self, reason: &'static str, detail: &str) {
        self.push("enrollment", reason, detail);
    }

    fn accepted(&self, token_id: &str, node_group: &str) {
        self.push("enrollment", "ACCEPTED", &format!("token_id={token_id} group={node_group}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_windowed() {
        let ring = AuditRing::new();
        for i in 0..(AUDIT_RING_CAP + 10) {
            ring.push("test", "REASON", &format!("event {i}"));
        }
        assert_eq!(ring.len(), AUDIT_RING_CAP);
        assert!(ring.since(now_ms() + 1_000).is_empty());
        assert_eq!(ring.since(0).len(), AUDIT_RING_CAP);
    }
}
