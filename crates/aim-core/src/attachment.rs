use serde::{Deserialize, Serialize};

use crate::error::AimError;
use crate::types::Timestamp;

// ── Class & pin state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentClass {
    Image,
    File,
}

impl AttachmentClass {
    /// Derived from the MIME type: image iff it starts with `image/`.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            AttachmentClass::Image
        } else {
            AttachmentClass::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentClass::Image => "image",
            AttachmentClass::File => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    Pinned,
    Unpinned,
}

// ── Metadata ─────────────────────────────────────────────────────────────────

/// Index entry for one stored attachment. The opaque blob lives alongside as
/// `blobs/{id}.bin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Backfilled from `mime_type` when loading older index versions.
    #[serde(default = "default_class")]
    pub class: AttachmentClass,
    pub size: u64,
    pub created_at: Timestamp,
    pub last_access_at: Timestamp,
    /// Backfilled to `unpinned` when loading older index versions.
    #[serde(default = "default_pin")]
    pub pin_state: PinState,
}

fn default_class() -> AttachmentClass {
    AttachmentClass::File
}

fn default_pin() -> PinState {
    PinState::Unpinned
}

impl AttachmentMeta {
    pub fn pinned(&self) -> bool {
        self.pin_state == PinState::Pinned
    }
}

// ── Limits ───────────────────────────────────────────────────────────────────

/// Per-class storage limits; zero means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClassLimits {
    pub max_item_bytes: u64,
    pub quota_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttachmentClassLimits {
    pub image: ClassLimits,
    pub file: ClassLimits,
}

impl AttachmentClassLimits {
    pub fn for_class(&self, class: AttachmentClass) -> ClassLimits {
        match class {
            AttachmentClass::Image => self.image,
            AttachmentClass::File => self.file,
        }
    }
}

/// Per-class TTLs applied by the GC, milliseconds; zero disables the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttachmentTtls {
    pub image_ms: i64,
    pub file_ms: i64,
}

impl AttachmentTtls {
    pub fn for_class(&self, class: AttachmentClass) -> i64 {
        match class {
            AttachmentClass::Image => self.image_ms,
            AttachmentClass::File => self.file_ms,
        }
    }
}

// ── Hard-cap policy ──────────────────────────────────────────────────────────

/// Percentages of the class quota steering write-time admission and GC.
/// Invariant: `aggressive_target <= high_watermark <= full_cap`, all in 1..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardCapPolicy {
    pub high_watermark: u8,
    pub full_cap: u8,
    pub aggressive_target: u8,
}

impl Default for HardCapPolicy {
    fn default() -> Self {
        Self { high_watermark: 85, full_cap: 100, aggressive_target: 70 }
    }
}

impl HardCapPolicy {
    pub fn validate(&self) -> Result<(), AimError> {
        for (name, v) in [
            ("high_watermark", self.high_watermark),
            ("full_cap", self.full_cap),
            ("aggressive_target", self.aggressive_target),
        ] {
            if !(1..=100).contains(&v) {
                return Err(AimError::InvalidArgument(format!(
                    "hard-cap {name} must be within 1..=100, got {v}"
                )));
            }
        }
        if self.aggressive_target > self.high_watermark || self.high_watermark > self.full_cap {
            return Err(AimError::InvalidArgument(
                "hard-cap policy requires aggressive_target <= high_watermark <= full_cap".into(),
            ));
        }
        Ok(())
    }

    pub fn fraction_of(quota: u64, pct: u8) -> u64 {
        (quota as u128 * pct as u128 / 100) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_from_mime() {
        assert_eq!(AttachmentClass::from_mime("image/png"), AttachmentClass::Image);
        assert_eq!(AttachmentClass::from_mime("image/jpeg"), AttachmentClass::Image);
        assert_eq!(AttachmentClass::from_mime("application/pdf"), AttachmentClass::File);
        assert_eq!(AttachmentClass::from_mime("text/plain"), AttachmentClass::File);
    }

    #[test]
    fn hard_cap_ordering_enforced() {
        assert!(HardCapPolicy::default().validate().is_ok());
        let bad = HardCapPolicy { high_watermark: 50, full_cap: 40, aggressive_target: 30 };
        assert!(bad.validate().is_err());
        let zero = HardCapPolicy { high_watermark: 0, full_cap: 100, aggressive_target: 0 };
        assert!(zero.validate().is_err());
    }
}
