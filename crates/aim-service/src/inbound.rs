//! Inbound pipeline: policy gate, contact trust, device auth, decryption,
//! replay guard, persistence, and receipt emission. One bad envelope never
//! takes the subscriber down; failures are counted and sanitized into logs.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use aim_core::interfaces::{IdentityManager, SessionManager};
use aim_core::message::{ConversationType, Direction, Message, MessageStatus};
use aim_core::types::now_ms;
use aim_core::wire::{PrivateEnvelope, Wire, WireKind};
use aim_core::AimError;
use aim_store::GroupState;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::config::PrivacyMode;
use crate::events::{EventBus, ServiceEvent};
use crate::metrics::Metrics;
use crate::outbound::Outbound;
use crate::replay::{ReplayGuard, ReplayKey};
use crate::sanitize::Sanitizer;
use crate::stores::StoresHandle;

/// Content type carrying group membership snapshots instead of chat text.
pub const GROUP_STATE_CONTENT_TYPE: &str = "application/x-aim-group-state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    QueueAsRequest,
    Reject,
}

/// The policy gate: known contacts are accepted, blocked senders rejected,
/// strangers fall through to the privacy mode.
pub fn evaluate_policy(
    is_known_contact: bool,
    is_blocked: bool,
    mode: PrivacyMode,
) -> PolicyDecision {
    if is_blocked {
        return PolicyDecision::Reject;
    }
    if is_known_contact {
        return PolicyDecision::Accept;
    }
    match mode {
        PrivacyMode::Everyone => PolicyDecision::Accept,
        PrivacyMode::ContactsOnly => PolicyDecision::QueueAsRequest,
        PrivacyMode::Nobody => PolicyDecision::Reject,
    }
}

pub struct Inbound {
    pub identity: Arc<dyn IdentityManager>,
    pub sessions: Arc<dyn SessionManager>,
    pub stores: StoresHandle,
    pub replay: Arc<ReplayGuard>,
    pub privacy: Arc<Mutex<PrivacyMode>>,
    pub blocked: Arc<Mutex<HashSet<String>>>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
    pub sanitizer: Arc<Sanitizer>,
    pub outbound: Arc<Outbound>,
}

impl Inbound {
    /// The single transport ingress. Never propagates an error.
    pub async fn handle_envelope(&self, env: PrivateEnvelope) {
        let sender_fp = self.sanitizer.fingerprint(&env.sender_id);
        if let Err(e) = self.process(env).await {
            self.metrics.count_error(e.category());
            let msg = self.sanitizer.redact_line(&e.to_string());
            warn!(sender = %sender_fp, category = %e.category(), error = %msg, "inbound message dropped");
        }
    }

    async fn process(&self, env: PrivateEnvelope) -> Result<(), AimError> {
        let wire = Wire::from_json(&env.payload)
            .map_err(|e| AimError::InvalidArgument(format!("undecodable wire: {e}")))?;
        let sender = wire.sender.clone();
        if sender.is_empty() || sender != env.sender_id {
            return Err(AimError::InvalidArgument("wire sender mismatch".into()));
        }

        match wire.kind {
            WireKind::Receipt => self.process_receipt(&wire),
            WireKind::DeviceRevoke => self.process_revocation(&wire),
            WireKind::Chat | WireKind::GroupEvent => self.process_message(&sender, wire).await,
        }
    }

    // ── Latency-critical kinds ───────────────────────────────────────────────

    fn process_receipt(&self, wire: &Wire) -> Result<(), AimError> {
        let body = wire
            .receipt
            .as_ref()
            .ok_or_else(|| AimError::InvalidArgument("receipt wire without body".into()))?;
        self.identity.verify_device(
            &wire.sender,
            &wire.sender_device,
            &wire.signing_bytes(),
            &wire.device_sig,
        )?;
        let stores = self.stores.current();
        match stores.messages.update_status(&body.message_id, body.status) {
            Ok(status) => {
                self.events.publish(ServiceEvent::MessageStatusChanged {
                    message_id: body.message_id.clone(),
                    status,
                });
                Ok(())
            }
            // A receipt for a purged or unknown message is not an error.
            Err(AimError::MessageNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn process_revocation(&self, wire: &Wire) -> Result<(), AimError> {
        let rev = wire
            .revocation
            .as_ref()
            .ok_or_else(|| AimError::InvalidArgument("revoke wire without body".into()))?;
        // Replay-guard revocations across every conversation.
        self.replay.check_and_record(
            ReplayKey {
                kind: "device_revoke".into(),
                group_id: String::new(),
                sender_device_id: wire.sender_device.clone(),
                unique_id: wire.wire_id.clone(),
            },
            wire.occurred_at,
            now_ms(),
        )?;
        self.identity.apply_device_revocation(&wire.sender, rev)
    }

    // ── Chat / group events ──────────────────────────────────────────────────

    async fn process_message(&self, sender: &str, wire: Wire) -> Result<(), AimError> {
        // 1. Policy gate.
        let decision = evaluate_policy(
            self.identity.has_contact(sender),
            self.blocked.lock().unwrap().contains(sender),
            *self.privacy.lock().unwrap(),
        );
        if decision == PolicyDecision::Reject {
            return Err(AimError::PolicyRejected);
        }

        // 2. Contact trust: a known card fingerprint must not change.
        if let Some(claimed) = &wire.contact_fingerprint {
            if let Some(record) = self.identity.contact(sender) {
                if !record.fingerprint.is_empty() && record.fingerprint != *claimed {
                    self.events.publish(ServiceEvent::SecurityAlert {
                        sender: sender.to_string(),
                        detail: "contact card fingerprint changed".into(),
                    });
                    return Err(AimError::ContactFingerprintMismatch(
                        self.sanitizer.fingerprint(sender),
                    ));
                }
            }
        }

        // 3. Device authentication.
        self.identity.verify_device(
            sender,
            &wire.sender_device,
            &wire.signing_bytes(),
            &wire.device_sig,
        )?;
        if let Some(rev) = &wire.revocation {
            // Revocations may ride along inbound; same replay guard.
            let guarded = self.replay.check_and_record(
                ReplayKey {
                    kind: "device_revoke".into(),
                    group_id: String::new(),
                    sender_device_id: wire.sender_device.clone(),
                    unique_id: format!("{}|rev", wire.wire_id),
                },
                wire.occurred_at,
                now_ms(),
            );
            if guarded.is_ok() {
                self.identity.apply_device_revocation(sender, rev)?;
            }
        }

        // 4. Content resolution.
        let (content, content_type) = self.resolve_content(sender, &wire)?;

        // 5. Replay guard, group only.
        if wire.conversation_type == ConversationType::Group {
            self.replay.check_and_record(
                ReplayKey {
                    kind: "group_event".into(),
                    group_id: wire.conversation_id.clone(),
                    sender_device_id: wire.sender_device.clone(),
                    unique_id: wire.wire_id.clone(),
                },
                wire.occurred_at,
                now_ms(),
            )?;
        }

        // Group membership snapshots update group state instead of the
        // message log.
        if wire.kind == WireKind::GroupEvent && content_type == GROUP_STATE_CONTENT_TYPE {
            let state: GroupState = serde_json::from_slice(&content)
                .map_err(|e| AimError::InvalidArgument(format!("group state: {e}")))?;
            self.stores.current().groups.upsert(state)?;
            if !wire.latency_critical() {
                self.outbound.emit_receipt(sender, &wire.wire_id, MessageStatus::Delivered).await;
            }
            return Ok(());
        }

        // 6. Persist.
        let mut msg = Message {
            id: wire.wire_id.clone(),
            contact_id: sender.to_string(),
            conversation_id: wire.conversation_id.clone(),
            conversation_type: wire.conversation_type,
            thread_id: wire.thread_id.clone(),
            content,
            content_type,
            timestamp: wire.occurred_at,
            direction: Direction::In,
            status: MessageStatus::Delivered,
            edited: false,
        };
        msg.normalize();

        let stores = self.stores.current();
        match decision {
            PolicyDecision::Accept => {
                match stores.messages.save_message(msg.clone()) {
                    Ok(()) => {}
                    Err(AimError::MessageIdConflict(id)) => {
                        // Same id, different payload: an abuse signal.
                        self.events.publish(ServiceEvent::SecurityAlert {
                            sender: sender.to_string(),
                            detail: "conflicting payload under an existing message id".into(),
                        });
                        return Err(AimError::State(format!(
                            "conflicting re-delivery of {id}"
                        )));
                    }
                    Err(e) => return Err(e),
                }
                self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                self.events.publish(ServiceEvent::MessageReceived { message: msg });
            }
            PolicyDecision::QueueAsRequest => {
                stores.inbox.append(sender, msg)?;
                self.events
                    .publish(ServiceEvent::MessageRequestQueued { sender: sender.to_string() });
            }
            PolicyDecision::Reject => unreachable!("rejected above"),
        }

        // 7. Delivered receipt.
        if !wire.latency_critical() {
            self.outbound.emit_receipt(sender, &wire.wire_id, MessageStatus::Delivered).await;
        }
        debug!(sender = %self.sanitizer.fingerprint(sender), "inbound message processed");
        Ok(())
    }

    fn resolve_content(&self, sender: &str, wire: &Wire) -> Result<(Vec<u8>, String), AimError> {
        let content_type =
            wire.content_type.clone().unwrap_or_else(|| "text/plain".to_string());
        if let Some(ct_b64) = &wire.ciphertext {
            let ct = base64::engine::general_purpose::STANDARD
                .decode(ct_b64)
                .map_err(|_| AimError::DecryptFailed)?;
            let plain = self.sessions.decrypt(sender, &ct)?;
            return Ok((plain, content_type));
        }
        if let Some(plain) = &wire.plain {
            return Ok((plain.clone().into_bytes(), content_type));
        }
        Err(AimError::InvalidArgument("wire carries neither ciphertext nor plain".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_gate_matrix() {
        use PolicyDecision::*;
        // Blocked wins over everything.
        assert_eq!(evaluate_policy(true, true, PrivacyMode::Everyone), Reject);
        assert_eq!(evaluate_policy(false, true, PrivacyMode::Everyone), Reject);
        // Known contacts are accepted in every mode.
        assert_eq!(evaluate_policy(true, false, PrivacyMode::Everyone), Accept);
        assert_eq!(evaluate_policy(true, false, PrivacyMode::ContactsOnly), Accept);
        assert_eq!(evaluate_policy(true, false, PrivacyMode::Nobody), Accept);
        // Strangers fall through to the mode.
        assert_eq!(evaluate_policy(false, false, PrivacyMode::Everyone), Accept);
        assert_eq!(evaluate_policy(false, false, PrivacyMode::ContactsOnly), QueueAsRequest);
        assert_eq!(evaluate_policy(false, false, PrivacyMode::Nobody), Reject);
    }
}
