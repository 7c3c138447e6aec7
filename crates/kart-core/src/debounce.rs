//! Button debouncing: raw line levels in, one activation per press out.
//!
//! ```text
//! Idle ──press edge──▶ Armed ──held ≥ window──▶ (Confirmed: emit) ──▶ Cooldown ──elapsed──▶ Idle
//!                        │
//!                        └──release before window──▶ Idle
//! ```
//!
//! The debouncer only sees levels and timestamps, so it is driven the same
//! way by a polling sampler, an interrupt handler, or a test feeding a
//! synthetic edge sequence. Its refractory period is independent of the
//! playback cooldown: a confirmed press is always handed on, and the
//! coordinator decides whether it plays.

use std::time::{Duration, Instant};

/// Logical level of a button line, after polarity is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Pressed,
    Released,
}

impl Level {
    /// Map a raw line value. Buttons wired to ground with a pull-up read
    /// low when pressed (`active_low = true`).
    pub fn from_raw(high: bool, active_low: bool) -> Self {
        if high != active_low {
            Level::Pressed
        } else {
            Level::Released
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceTiming {
    /// How long the line must stay pressed before the press counts.
    pub window: Duration,
    /// Refractory period after a confirmed press. Must exceed the longest
    /// mechanical bounce of the switch.
    pub cooldown: Duration,
}

impl Default for DebounceTiming {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(50),
            cooldown: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Armed { since: Instant },
    Cooldown { until: Instant },
}

/// A confirmed press of the button bound to `slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub slot: String,
    pub at: Instant,
}

/// Per-line debouncer.
#[derive(Debug)]
pub struct Debouncer {
    slot: String,
    timing: DebounceTiming,
    state: DebounceState,
    level: Level,
}

impl Debouncer {
    pub fn new(slot: impl Into<String>, timing: DebounceTiming) -> Self {
        Self {
            slot: slot.into(),
            timing,
            state: DebounceState::Idle,
            level: Level::Released,
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Feed the line level observed at `now`. A change from the previous
    /// level is an edge; an unchanged level just lets time pass.
    pub fn observe(&mut self, level: Level, now: Instant) -> Option<Activation> {
        let edge = level != self.level;
        self.level = level;

        if let DebounceState::Cooldown { until } = self.state {
            if now < until {
                return None;
            }
            self.state = DebounceState::Idle;
        }

        match self.state {
            DebounceState::Idle => {
                if edge && level == Level::Pressed {
                    self.state = DebounceState::Armed { since: now };
                }
                None
            }
            DebounceState::Armed { since } => {
                if level == Level::Released {
                    self.state = DebounceState::Idle;
                    return None;
                }
                if now.duration_since(since) >= self.timing.window {
                    self.state = DebounceState::Cooldown {
                        until: now + self.timing.cooldown,
                    };
                    return Some(Activation {
                        slot: self.slot.clone(),
                        at: now,
                    });
                }
                None
            }
            DebounceState::Cooldown { .. } => None,
        }
    }
}
