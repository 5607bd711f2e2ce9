//! Public-serving autodegrade: a two-state machine fed by resource-pressure
//! signals sampled inline with the retry loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use aim_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::config::DegradeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeMode {
    Normal,
    Degraded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PressureSignals {
    pub memory_bytes: u64,
    pub pending_len: usize,
    pub loop_lag_ms: u64,
    pub soft_cap_exceeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    Recovered,
}

struct Inner {
    mode: DegradeMode,
    /// When the current contiguous pressure (or calm) streak began.
    streak_since: Option<Timestamp>,
}

/// Holds the degrade mode and decides transitions. The soft-cap flag is
/// sticky between evaluations: any serve that tripped the soft bandwidth
/// limiter marks pressure for the next sample.
pub struct DegradeState {
    cfg: DegradeConfig,
    soft_cap_flag: AtomicBool,
    mu: Mutex<Inner>,
}

impl DegradeState {
    pub fn new(cfg: DegradeConfig) -> Self {
        Self {
            cfg,
            soft_cap_flag: AtomicBool::new(false),
            mu: Mutex::new(Inner { mode: DegradeMode::Normal, streak_since: None }),
        }
    }

    pub fn mode(&self) -> DegradeMode {
        self.mu.lock().unwrap().mode
    }

    pub fn config(&self) -> &DegradeConfig {
        &self.cfg
    }

    /// Called by the serving path whenever a serve exceeded the soft limit.
    pub fn flag_soft_cap(&self) {
        self.soft_cap_flag.store(true, Ordering::SeqCst);
    }

    fn any_pressure(&self, s: &PressureSignals) -> bool {
        s.memory_bytes >= self.cfg.memory_bytes
            || s.pending_len >= self.cfg.pending_len
            || s.loop_lag_ms >= self.cfg.loop_lag_ms
            || s.soft_cap_exceeded
    }

    /// Evaluate one sample. `Normal → Degraded` after pressure holds for the
    /// overload window; `Degraded → Normal` after calm holds for the recovery
    /// window.
    pub fn evaluate(&self, mut signals: PressureSignals, now: Timestamp) -> Option<Transition> {
        signals.soft_cap_exceeded |= self.soft_cap_flag.swap(false, Ordering::SeqCst);
        let pressure = self.any_pressure(&signals);

        let mut inner = self.mu.lock().unwrap();
        match inner.mode {
            DegradeMode::Normal => {
                if !pressure {
                    inner.streak_since = None;
                    return None;
                }
                let since = *inner.streak_since.get_or_insert(now);
                if now - since >= self.cfg.overload_window_ms {
                    inner.mode = DegradeMode::Degraded;
                    inner.streak_since = None;
                    Some(Transition::Entered)
                } else {
                    None
                }
            }
            DegradeMode::Degraded => {
                if pressure {
                    inner.streak_since = None;
                    return None;
                }
                let since = *inner.streak_since.get_or_insert(now);
                if now - since >= self.cfg.recovery_window_ms {
                    inner.mode = DegradeMode::Normal;
                    inner.streak_since = None;
                    Some(Transition::Recovered)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DegradeConfig {
        DegradeConfig {
            memory_bytes: 1_000,
            pending_len: 10,
            loop_lag_ms: 500,
            overload_window_ms: 1_000,
            recovery_window_ms: 2_000,
            ..DegradeConfig::default()
        }
    }

    fn pressured() -> PressureSignals {
        PressureSignals { pending_len: 50, ..Default::default() }
    }

    #[test]
    fn sustained_pressure_degrades() {
        let st = DegradeState::new(cfg());
        assert_eq!(st.evaluate(pressured(), 0), None, "streak just started");
        assert_eq!(st.evaluate(pressured(), 500), None);
        assert_eq!(st.evaluate(pressured(), 1_000), Some(Transition::Entered));
        assert_eq!(st.mode(), DegradeMode::Degraded);
    }

    #[test]
    fn blip_does_not_degrade() {
        let st = DegradeState::new(cfg());
        st.evaluate(pressured(), 0);
        assert_eq!(st.evaluate(PressureSignals::default(), 500), None, "calm resets streak");
        st.evaluate(pressured(), 600);
        assert_eq!(st.evaluate(pressured(), 1_400), None, "window measured from new streak");
        assert_eq!(st.mode(), DegradeMode::Normal);
    }

    #[test]
    fn sustained_calm_recovers() {
        let st = DegradeState::new(cfg());
        st.evaluate(pressured(), 0);
        st.evaluate(pressured(), 1_000);
        assert_eq!(st.mode(), DegradeMode::Degraded);

        assert_eq!(st.evaluate(PressureSignals::default(), 1_500), None);
        assert_eq!(st.evaluate(pressured(), 2_000), None, "pressure resets recovery streak");
        assert_eq!(st.evaluate(PressureSignals::default(), 3_000), None);
        assert_eq!(
            st.evaluate(PressureSignals::default(), 5_000),
            Some(Transition::Recovered)
        );
        assert_eq!(st.mode(), DegradeMode::Normal);
    }

    #[test]
    fn soft_cap_flag_is_sticky_until_sampled() {
        let st = DegradeState::new(cfg());
        st.flag_soft_cap();
        assert_eq!(st.evaluate(PressureSignals::default(), 0), None, "pressure via flag");
        // Flag consumed: the next calm sample really is calm.
        st.evaluate(PressureSignals::default(), 100);
        assert_eq!(st.mode(), DegradeMode::Normal);
    }
}
