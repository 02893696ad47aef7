//! Aggregate alarm counts and single-pass guards

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use voltage_alarm_store::AlarmRecord;

/// Tallies over a record set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmCounts {
    /// Records not yet normal
    pub alarms: u64,
    pub open: u64,
    pub total: u64,
    /// Records that require acknowledgement and have none
    pub unacked: u64,
}

impl AlarmCounts {
    pub fn tally(&mut self, record: &AlarmRecord) {
        self.total += 1;
        if record.is_open() {
            self.open += 1;
        }
        if !record.is_normal() {
            self.alarms += 1;
        }
        if record.is_ack_required() && !record.is_acknowledged() {
            self.unacked += 1;
        }
    }
}

impl std::ops::AddAssign for AlarmCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.alarms += rhs.alarms;
        self.open += rhs.open;
        self.total += rhs.total;
        self.unacked += rhs.unacked;
    }
}

/// Held while a pass runs; a second caller gets `None` instead of waiting.
/// The flag is released on drop, including on early return and panic unwinding.
#[must_use]
pub struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
