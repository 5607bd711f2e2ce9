//! Outbound pipeline: wire composition, device signing, metadata hardening,
//! publish with timeout, and the pending-retry bookkeeping shared with the
//! retry scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aim_core::constants::{
    backoff_ms, MESSAGE_ID_PREFIX, PUBLISH_TIMEOUT_MS, RETRY_MAX_ATTEMPTS,
};
use aim_core::interfaces::{IdentityManager, SessionManager, Transport};
use aim_core::message::{ConversationType, Direction, Message, MessageStatus, PendingMessage};
use aim_core::types::{now_ms, Timestamp};
use aim_core::wire::{PrivateEnvelope, ReceiptBody, Wire, WireKind};
use aim_core::{AimError, CancelToken};
use base64::Engine as _;
use rand::{Rng, RngCore};
use tracing::{debug, info, warn};

use crate::events::{EventBus, ServiceEvent};
use crate::harden::{harden, HardeningConfig};
use crate::metrics::Metrics;
use crate::stores::StoresHandle;

/// How retry-pass failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Normal tick: bump counts, escalate to terminal failure at the cap.
    Escalate,
    /// Startup recovery scan: log failures, touch nothing.
    LogOnly,
}

pub struct Outbound {
    pub transport: Arc<dyn Transport>,
    pub identity: Arc<dyn IdentityManager>,
    pub sessions: Arc<dyn SessionManager>,
    pub stores: StoresHandle,
    pub harden_cfg: HardeningConfig,
    pub metrics: Arc<Metrics>,
    pub events: EventBus,
    pub net_active: Arc<AtomicBool>,
}

fn new_message_id() -> String {
    let mut raw = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("{MESSAGE_ID_PREFIX}{}", hex::encode(raw))
}

/// Backoff with ±10% jitter so a burst of failures does not re-align.
pub fn jittered_backoff_ms(attempt: u32) -> i64 {
    let base = backoff_ms(attempt) as f64;
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    (base * factor) as i64
}

impl Outbound {
    // ── Composition ──────────────────────────────────────────────────────────

    /// Compose the wire for one recipient. Encryption is per recipient
    /// session; group fan-out builds one wire per member.
    fn build_wire(&self, msg: &Message, recipient: &str) -> Result<Wire, AimError> {
        let kind = match msg.conversation_type {
            ConversationType::Direct => WireKind::Chat,
            ConversationType::Group => WireKind::GroupEvent,
        };
        let ciphertext = if self.sessions.has_session(recipient) {
            let ct = self.sessions.encrypt(recipient, &msg.content)?;
            Some(base64::engine::general_purpose::STANDARD.encode(ct))
        } else {
            None
        };
        let plain = if ciphertext.is_none() {
            Some(String::from_utf8_lossy(&msg.content).into_owned())
        } else {
            None
        };

        let mut wire = Wire {
            kind,
            wire_id: msg.id.clone(),
            sender: self.identity.identity(),
            sender_device: String::new(),
            conversation_id: msg.conversation_id.clone(),
            conversation_type: msg.conversation_type,
            thread_id: msg.thread_id.clone(),
            occurred_at: msg.timestamp,
            ciphertext,
            plain,
            content_type: Some(msg.content_type.clone()),
            contact_fingerprint: Some(self.identity.own_fingerprint()),
            revocation: None,
            receipt: None,
            device_sig: String::new(),
            padding: String::new(),
        };
        self.sign_wire(&mut wire)?;
        Ok(wire)
    }

    /// Fill in the active device id and signature. Must run after every other
    /// field is final; padding is excluded from the signed bytes.
    pub fn sign_wire(&self, wire: &mut Wire) -> Result<(), AimError> {
        // The device id is part of the signed bytes, so set it first.
        let probe = self.identity.active_device_auth(b"probe")?;
        wire.sender_device = probe.device_id;
        let auth = self.identity.active_device_auth(&wire.signing_bytes())?;
        wire.device_sig = auth.signature;
        Ok(())
    }

    // ── Publish ──────────────────────────────────────────────────────────────

    async fn publish_with_timeout(&self, env: PrivateEnvelope) -> Result<(), AimError> {
        if !self.net_active.load(Ordering::SeqCst) {
            return Err(AimError::NetworkInactive);
        }
        match tokio::time::timeout(
            std::time::Duration::from_millis(PUBLISH_TIMEOUT_MS),
            self.transport.publish_private(env),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AimError::PublishTimeout(PUBLISH_TIMEOUT_MS)),
        }
    }

    /// Harden then publish one wire to one recipient. Cancellation during the
    /// hardening delay returns `Cancelled` (nothing was sent); cancellation
    /// during the publish itself is on-the-wire-unknown and reported as a
    /// network error.
    pub async fn harden_and_publish(
        &self,
        cancel: &CancelToken,
        wire: Wire,
        recipient: &str,
    ) -> Result<(), AimError> {
        if cancel.is_cancelled() {
            return Err(AimError::Cancelled);
        }
        let hardened = harden(wire, &self.harden_cfg);
        if !hardened.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(hardened.delay) => {}
                _ = cancel.cancelled() => return Err(AimError::Cancelled),
            }
        }

        let env = PrivateEnvelope {
            id: hardened.wire.wire_id.clone(),
            sender_id: hardened.wire.sender.clone(),
            recipient: recipient.to_string(),
            payload: hardened.wire.to_json(),
        };
        tokio::select! {
            result = self.publish_with_timeout(env) => result,
            _ = cancel.cancelled() => {
                Err(AimError::Transport("cancelled mid-publish; delivery unknown".into()))
            }
        }
    }

    /// Recipients for one message under the current state: the direct peer,
    /// or every group member except ourselves.
    fn recipients_for(&self, msg: &Message) -> Vec<String> {
        match msg.conversation_type {
            ConversationType::Direct => vec![msg.contact_id.clone()],
            ConversationType::Group => {
                let own = self.identity.identity();
                self.stores
                    .current()
                    .groups
                    .get(&msg.conversation_id)
                    .map(|g| g.members.into_iter().filter(|m| *m != own).collect())
                    .unwrap_or_default()
            }
        }
    }

    /// Wire build → sign → harden → publish for every recipient.
    pub async fn dispatch_message(
        &self,
        cancel: &CancelToken,
        msg: &Message,
    ) -> Result<(), AimError> {
        let recipients = self.recipients_for(msg);
        if recipients.is_empty() {
            return Err(AimError::InvalidArgument(format!(
                "no recipients for conversation {}",
                msg.conversation_id
            )));
        }
        for recipient in recipients {
            let wire = self.build_wire(msg, &recipient)?;
            self.harden_and_publish(cancel, wire, &recipient).await?;
        }
        Ok(())
    }

    // ── Client sends ─────────────────────────────────────────────────────────

    /// Compose, persist and publish one message. A transient publish failure
    /// leaves the message pending in the retry queue; any other failure is
    /// terminal for the call.
    pub async fn send_message(
        &self,
        cancel: &CancelToken,
        conversation_type: ConversationType,
        peer_or_group: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<Message, AimError> {
        if peer_or_group.is_empty() {
            return Err(AimError::InvalidArgument("empty recipient".into()));
        }
        let now = now_ms();
        let mut msg = Message {
            id: new_message_id(),
            contact_id: if conversation_type == ConversationType::Direct {
                peer_or_group.to_string()
            } else {
                self.identity.identity()
            },
            conversation_id: if conversation_type == ConversationType::Group {
                peer_or_group.to_string()
            } else {
                String::new()
            },
            conversation_type,
            thread_id: None,
            content,
            content_type: content_type.to_string(),
            timestamp: now,
            direction: Direction::Out,
            status: MessageStatus::Pending,
            edited: false,
        };
        msg.normalize();
        let stores = self.stores.current();
        stores.messages.save_message(msg.clone())?;

        match self.dispatch_message(cancel, &msg).await {
            Ok(()) => {
                let status = stores.messages.update_status(&msg.id, MessageStatus::Sent)?;
                stores.messages.remove_pending(&msg.id)?;
                self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                msg.status = status;
                Ok(msg)
            }
            Err(AimError::Cancelled) => {
                // Cancelled before anything hit the wire: no retry entry.
                Err(AimError::Cancelled)
            }
            Err(e) if e.is_retryable() => {
                let entry = PendingMessage {
                    message_id: msg.id.clone(),
                    retry_count: 0,
                    next_retry_at: now_ms() + jittered_backoff_ms(1),
                    last_error: e.to_string(),
                };
                stores.messages.upsert_pending(entry)?;
                self.metrics.count_error(e.category());
                debug!(message = %msg.id, error = %e, "publish failed; queued for retry");
                Ok(msg)
            }
            Err(e) => {
                let _ = stores.messages.update_status(&msg.id, MessageStatus::Failed);
                let _ = stores.messages.remove_pending(&msg.id);
                self.metrics.count_error(e.category());
                Err(e)
            }
        }
    }

    /// Emit a latency-critical receipt. Failures are logged, never retried.
    pub async fn emit_receipt(&self, recipient: &str, message_id: &str, status: MessageStatus) {
        let mut wire = Wire {
            kind: WireKind::Receipt,
            wire_id: new_message_id(),
            sender: self.identity.identity(),
            sender_device: String::new(),
            conversation_id: recipient.to_string(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            occurred_at: now_ms(),
            ciphertext: None,
            plain: None,
            content_type: None,
            contact_fingerprint: None,
            revocation: None,
            receipt: Some(ReceiptBody { message_id: message_id.to_string(), status }),
            device_sig: String::new(),
            padding: String::new(),
        };
        if let Err(e) = self.sign_wire(&mut wire) {
            warn!(error = %e, "failed to sign receipt");
            return;
        }
        let cancel = CancelToken::new();
        match self.harden_and_publish(&cancel, wire, recipient).await {
            Ok(()) => {
                self.metrics.receipts_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!(error = %e, "receipt publish failed"),
        }
    }

    // ── Retry pass ───────────────────────────────────────────────────────────

    /// Drain pending entries due at `horizon`. With `Escalate`, the retry cap
    /// turns a persistent network failure into a terminal `failed`; with
    /// `LogOnly` (startup scan) counters are never bumped.
    pub async fn process_due_pending(&self, horizon: Timestamp, policy: RetryPolicy) {
        let stores = self.stores.current();
        let due = stores.messages.due_pending(horizon);
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), ?policy, "processing due pending messages");

        for (pending, msg) in due {
            self.metrics.retry_attempts_total.fetch_add(1, Ordering::Relaxed);
            let cancel = CancelToken::new();
            match self.dispatch_message(&cancel, &msg).await {
                Ok(()) => {
                    let status_result =
                        stores.messages.update_status(&msg.id, MessageStatus::Sent);
                    let removed = stores.messages.remove_pending(&msg.id);
                    if let (Ok(status), Ok(())) = (status_result, removed) {
                        self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                        self.events.publish(ServiceEvent::MessageStatusChanged {
                            message_id: msg.id.clone(),
                            status,
                        });
                    }
                }
                Err(e) if policy == RetryPolicy::LogOnly => {
                    info!(message = %msg.id, error = %e, "startup scan publish failed; untouched");
                }
                Err(e) if e.is_retryable() => {
                    let attempts = pending.retry_count + 1;
                    if attempts > RETRY_MAX_ATTEMPTS {
                        warn!(message = %msg.id, attempts, "retry cap exceeded; failing message");
                        let _ = stores.messages.update_status(&msg.id, MessageStatus::Failed);
                        let _ = stores.messages.remove_pending(&msg.id);
                        self.events.publish(ServiceEvent::MessageStatusChanged {
                            message_id: msg.id.clone(),
                            status: MessageStatus::Failed,
                        });
                    } else {
                        let entry = PendingMessage {
                            message_id: msg.id.clone(),
                            retry_count: attempts,
                            next_retry_at: now_ms() + jittered_backoff_ms(attempts),
                            last_error: e.to_string(),
                        };
                        let _ = stores.messages.upsert_pending(entry);
                    }
                    self.metrics.count_error(e.category());
                }
                Err(e) => {
                    // Non-network failures are recorded but never retried.
                    warn!(message = %msg.id, error = %e, "pending publish failed terminally");
                    let entry = PendingMessage {
                        message_id: msg.id.clone(),
                        retry_count: pending.retry_count,
                        next_retry_at: i64::MAX,
                        last_error: e.to_string(),
                    };
                    let _ = stores.messages.upsert_pending(entry);
                    self.metrics.count_error(e.category());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_stays_monotonic_in_expectation() {
        for n in 1..=RETRY_MAX_ATTEMPTS {
            let ms = jittered_backoff_ms(n);
            let nominal = backoff_ms(n);
            assert!(ms >= nominal * 9 / 10 && ms <= nominal * 11 / 10, "attempt {n}: {ms}");
        }
    }
}
