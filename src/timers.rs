//! Virtual-time timer bank.
//!
//! Each distinct wait an engine performs is a named timer id.  Timers are
//! armed against a caller-supplied monotonic clock (milliseconds) and never
//! fire on their own: the owner calls [`Timers::expire`] with the current
//! time, and every due timer is reported to a [`TimerDelegate`] in deadline
//! order.  The engines implement the delegate with their event queue, so
//! the timer bank knows nothing about events.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  start(id, now, ms)        one-shot: fires once, then freed  │
//! │  start_reload(id, now, first, period)                        │
//! │                            reload: re-arms itself each fire  │
//! │  stop(id)                  cancel; a stopped timer never     │
//! │                            reports a late expiry             │
//! │                                                              │
//! │  expire(now, delegate) ──▶ delegate.on_timer_fired(id)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use core::fmt::Debug;

use log::{debug, warn};

/// Receives timer expiries from [`Timers::expire`].
pub trait TimerDelegate<T> {
    fn on_timer_fired(&mut self, id: T);
}

/// Internal bookkeeping for an armed timer.
#[derive(Debug, Clone, Copy)]
struct TimerEntry<T> {
    id: T,
    deadline_ms: u64,
    /// Re-arm period for reloading timers.
    period_ms: Option<u32>,
}

/// Fixed-capacity timer bank (no heap).
pub struct Timers<T, const N: usize> {
    slots: [Option<TimerEntry<T>>; N],
}

impl<T: Copy + Eq + Debug, const N: usize> Timers<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; N],
        }
    }

    /// Arm a one-shot timer, replacing any running timer with the same id.
    /// Returns `false` if the bank is full.
    pub fn start(&mut self, id: T, now_ms: u64, after_ms: u64) -> bool {
        self.arm(TimerEntry {
            id,
            deadline_ms: now_ms.saturating_add(after_ms),
            period_ms: None,
        })
    }

    /// Arm a reloading timer: first expiry after `first_ms`, then every
    /// `period_ms`.
    pub fn start_reload(&mut self, id: T, now_ms: u64, first_ms: u32, period_ms: u32) -> bool {
        self.arm(TimerEntry {
            id,
            deadline_ms: now_ms + u64::from(first_ms),
            period_ms: Some(period_ms.max(1)),
        })
    }

    pub fn stop(&mut self, id: T) {
        for slot in &mut self.slots {
            if slot.is_some_and(|e| e.id == id) {
                *slot = None;
            }
        }
    }

    pub fn stop_all(&mut self) {
        self.slots = [None; N];
    }

    pub fn is_running(&self, id: T) -> bool {
        self.slots.iter().flatten().any(|e| e.id == id)
    }

    /// Milliseconds until `id` fires, if it is armed.
    pub fn remaining_ms(&self, id: T, now_ms: u64) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.id == id)
            .map(|e| e.deadline_ms.saturating_sub(now_ms))
    }

    /// Earliest deadline across all armed timers.
    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.iter().flatten().map(|e| e.deadline_ms).min()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Report every timer due at `now_ms`, earliest first.  One-shot timers
    /// are freed; reloading timers move to their next period (periods
    /// missed entirely are skipped, not replayed).  Returns the number of
    /// expiries reported.
    pub fn expire(&mut self, now_ms: u64, delegate: &mut dyn TimerDelegate<T>) -> usize {
        let mut fired = 0;
        while let Some(idx) = self.earliest_due(now_ms) {
            let Some(entry) = self.slots[idx] else {
                break;
            };
            match entry.period_ms {
                Some(period) => {
                    let mut next = entry.deadline_ms + u64::from(period);
                    if next <= now_ms {
                        next = now_ms + u64::from(period);
                    }
                    self.slots[idx] = Some(TimerEntry {
                        deadline_ms: next,
                        ..entry
                    });
                }
                None => self.slots[idx] = None,
            }
            debug!("Timers: {:?} fired at {} ms", entry.id, now_ms);
            delegate.on_timer_fired(entry.id);
            fired += 1;
        }
        fired
    }

    // ── Internal ──────────────────────────────────────────────

    fn arm(&mut self, entry: TimerEntry<T>) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_some_and(|e| e.id == entry.id)) {
            *slot = Some(entry);
            return true;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
            return true;
        }
        warn!("Timers: no free slot for {:?}", entry.id);
        false
    }

    fn earliest_due(&self, now_ms: u64) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|e| (i, e.deadline_ms)))
            .filter(|&(_, deadline)| deadline <= now_ms)
            .min_by_key(|&(_, deadline)| deadline)
            .map(|(i, _)| i)
    }
}

impl<T: Copy + Eq + Debug, const N: usize> Default for Timers<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
