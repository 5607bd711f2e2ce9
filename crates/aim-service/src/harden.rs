//! Metadata hardening: size-bucket padding plus batch-window and jitter
//! delay. Latency-critical wires (receipts, device revocations) skip both.

use std::time::Duration;

use aim_core::constants::{
    BATCH_WINDOW_MAX_MS, JITTER_MAX_CEILING_MS, PAD_BUCKETS,
};
use aim_core::wire::Wire;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct HardeningConfig {
    pub enabled: bool,
    pub batch_window_ms: u64,
    pub jitter_max_ms: u64,
}

impl HardeningConfig {
    pub fn new(enabled: bool, batch_window_ms: u64, jitter_max_ms: u64) -> Self {
        Self {
            enabled,
            batch_window_ms: batch_window_ms.min(BATCH_WINDOW_MAX_MS),
            jitter_max_ms: jitter_max_ms.min(JITTER_MAX_CEILING_MS),
        }
    }
}

/// A wire ready for publish plus the delay the caller must observe first.
#[derive(Debug, Clone)]
pub struct HardenedWire {
    pub wire: Wire,
    pub delay: Duration,
}

/// Pad the wire's JSON form up to the smallest size bucket that holds it and
/// pick the publish delay. Wires longer than the largest bucket keep an
/// empty padding but still take the delay.
pub fn harden(mut wire: Wire, cfg: &HardeningConfig) -> HardenedWire {
    if wire.latency_critical() || !cfg.enabled {
        wire.padding = String::new();
        return HardenedWire { wire, delay: Duration::ZERO };
    }

    wire.padding = String::new();
    let base_len = wire.to_json().len();

    if let Some(&target) = PAD_BUCKETS.iter().find(|&&b| b >= base_len) {
        // Binary-search the longest run of '0' that keeps the serialized
        // length at or under the bucket.
        let mut lo = 0usize;
        let mut hi = target;
        let mut best = 0usize;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            wire.padding = "0".repeat(mid);
            if wire.to_json().len() <= target {
                best = mid;
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }
        wire.padding = "0".repeat(best);
    }

    let jitter = if cfg.jitter_max_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=cfg.jitter_max_ms)
    };
    HardenedWire { wire, delay: Duration::from_millis(cfg.batch_window_ms + jitter) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_core::message::ConversationType;
    use aim_core::wire::WireKind;

    fn wire(kind: WireKind, plain: &str) -> Wire {
        Wire {
            kind,
            wire_id: "msg1_0102030405060708090a0b0c".into(),
            sender: "aim1sender".into(),
            sender_device: "dev_1".into(),
            conversation_id: "aim1peer".into(),
            conversation_type: ConversationType::Direct,
            thread_id: None,
            occurred_at: 1_700_000_000_000,
            ciphertext: None,
            plain: Some(plain.into()),
            content_type: Some("text/plain".into()),
            contact_fingerprint: None,
            revocation: None,
            receipt: None,
            device_sig: String::new(),
            padding: String::new(),
        }
    }

    #[test]
    fn padded_wire_lands_exactly_on_a_bucket() {
        let cfg = HardeningConfig::new(true, 50, 30);
        let hardened = harden(wire(WireKind::Chat, "hello"), &cfg);
        assert!(!hardened.wire.padding.is_empty());
        let len = hardened.wire.to_json().len();
        assert!(PAD_BUCKETS.contains(&len), "serialized length {len} must be a bucket");
        let ms = hardened.delay.as_millis() as u64;
        assert!((50..=80).contains(&ms), "delay {ms} outside [50, 80]");
    }

    #[test]
    fn every_bucket_is_reachable() {
        let cfg = HardeningConfig::new(true, 0, 0);
        for payload_len in [1usize, 200, 600, 1500, 3000, 6000] {
            let w = wire(WireKind::Chat, &"x".repeat(payload_len));
            let hardened = harden(w, &cfg);
            let len = hardened.wire.to_json().len();
            assert!(PAD_BUCKETS.contains(&len), "len {len} for payload {payload_len}");
        }
    }

    #[test]
    fn oversized_wire_keeps_empty_padding() {
        let cfg = HardeningConfig::new(true, 10, 0);
        let w = wire(WireKind::Chat, &"x".repeat(9_000));
        let hardened = harden(w, &cfg);
        assert!(hardened.wire.padding.is_empty());
        assert_eq!(hardened.delay, Duration::from_millis(10));
    }

    #[test]
    fn latency_critical_skips_padding_and_delay() {
        let cfg = HardeningConfig::new(true, 50, 30);
        let hardened = harden(wire(WireKind::Receipt, ""), &cfg);
        assert!(hardened.wire.padding.is_empty());
        assert_eq!(hardened.delay, Duration::ZERO);
    }

    #[test]
    fn disabled_hardening_passes_through() {
        let cfg = HardeningConfig::new(false, 50, 30);
        let hardened = harden(wire(WireKind::Chat, "hello"), &cfg);
        assert!(hardened.wire.padding.is_empty());
        assert_eq!(hardened.delay, Duration::ZERO);
    }

    #[test]
    fn config_clamps_windows() {
        let cfg = HardeningConfig::new(true, 10_000, 10_000);
        assert_eq!(cfg.batch_window_ms, BATCH_WINDOW_MAX_MS);
        assert_eq!(cfg.jitter_max_ms, JITTER_MAX_CEILING_MS);
    }
}
