//! Flow control.
//!
//! Each member watches its own receive queue with a [`FlowReporter`] and
//! publishes a `Flow` message whenever its hysteresis state flips. Every
//! member feeds those reports into a [`FlowMonitor`], whose
//! [`should_wait`](FlowMonitor::should_wait) answer backs the `wait()` call.
//!
//! ```text
//!   queue len ─┬─ > upper ──▶ stopped ─┬─ < lower ──▶ running
//!              │                       │
//!   running ◀──┘ (otherwise unchanged) └─▶ stopped
//! ```

use std::collections::{HashMap, HashSet};

use crate::message::FlowReport;
use crate::types::MemberId;

// ============================================================================
// Local reporter
// ============================================================================

/// Tracks the local receive queue against the flow-control limits.
#[derive(Debug, Clone)]
pub struct FlowReporter {
    lower: usize,
    upper: usize,
    stopped: bool,
}

impl FlowReporter {
    /// Creates a reporter with the given limits.
    pub fn new(lower: usize, upper: usize) -> Self {
        debug_assert!(lower < upper, "flow-control lower limit must be below upper");
        Self {
            lower,
            upper,
            stopped: false,
        }
    }

    /// Returns true if the local queue currently asks the group to pause.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Updates the queue length.
    ///
    /// Returns a report to broadcast if the hysteresis state flipped.
    pub fn update(&mut self, queue_len: usize) -> Option<FlowReport> {
        let flip = if self.stopped {
            queue_len < self.lower
        } else {
            queue_len > self.upper
        };
        if !flip {
            return None;
        }

        self.stopped = !self.stopped;
        tracing::debug!(
            queue_len,
            stopped = self.stopped,
            "local flow-control state changed"
        );
        Some(FlowReport {
            queue_len: queue_len as u64,
            stopped: self.stopped,
        })
    }
}

// ============================================================================
// Group monitor
// ============================================================================

/// Aggregates flow-control reports of the group.
#[derive(Debug, Default)]
pub struct FlowMonitor {
    reports: HashMap<MemberId, FlowReport>,
    exempt: HashSet<MemberId>,
}

impl FlowMonitor {
    /// Creates a monitor with no reports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a report from a member.
    pub fn on_report(&mut self, from: &MemberId, report: FlowReport) {
        let was_waiting = self.should_wait();
        self.reports.insert(from.clone(), report);
        let waiting = self.should_wait();
        if was_waiting != waiting {
            tracing::debug!(
                member = %from,
                queue_len = report.queue_len,
                waiting,
                stopped = ?self.stopped_members(),
                "group flow-control state changed"
            );
        }
    }

    /// Marks whether a member's reports count towards flow control.
    ///
    /// Members that are not synced (joiners, donors) must not stall the
    /// group.
    pub fn set_counted(&mut self, member: &MemberId, counted: bool) {
        if counted {
            self.exempt.remove(member);
        } else {
            self.exempt.insert(member.clone());
        }
    }

    /// Forgets every member not in `members`.
    pub fn retain_members(&mut self, members: &[MemberId]) {
        self.reports.retain(|m, _| members.contains(m));
        self.exempt.retain(|m| members.contains(m));
    }

    /// Returns true if some counted member asked the group to pause.
    pub fn should_wait(&self) -> bool {
        self.reports
            .iter()
            .any(|(m, r)| r.stopped && !self.exempt.contains(m))
    }

    /// Returns the members currently asking the group to pause.
    pub fn stopped_members(&self) -> Vec<MemberId> {
        let mut stopped: Vec<MemberId> = self
            .reports
            .iter()
            .filter(|(m, r)| r.stopped && !self.exempt.contains(*m))
            .map(|(m, _)| m.clone())
            .collect();
        stopped.sort();
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> MemberId {
        MemberId::new(name).expect("valid member id")
    }

    #[test]
    fn reporter_hysteresis() {
        let mut r = FlowReporter::new(2, 4);
        for len in 0..=4 {
            assert!(r.update(len).is_none(), "no flip at {len}");
        }
        let report = r.update(5).expect("stop above upper");
        assert!(report.stopped);
        assert_eq!(report.queue_len, 5);

        // Between the limits nothing changes.
        assert!(r.update(4).is_none());
        assert!(r.update(2).is_none());
        assert!(r.is_stopped());

        let report = r.update(1).expect("release below lower");
        assert!(!report.stopped);
        assert!(r.update(3).is_none());
    }

    #[test]
    fn monitor_waits_for_counted_members_only() {
        let mut m = FlowMonitor::new();
        let a = id("a");
        let b = id("b");
        assert!(!m.should_wait());

        m.set_counted(&b, false);
        m.on_report(
            &b,
            FlowReport {
                queue_len: 100,
                stopped: true,
            },
        );
        assert!(!m.should_wait(), "joiner must not stall the group");

        m.on_report(
            &a,
            FlowReport {
                queue_len: 20,
                stopped: true,
            },
        );
        assert!(m.should_wait());
        assert_eq!(m.stopped_members(), vec![a.clone()]);

        m.set_counted(&b, true);
        assert_eq!(m.stopped_members(), vec![a.clone(), b.clone()]);

        m.retain_members(std::slice::from_ref(&b));
        assert_eq!(m.stopped_members(), vec![b.clone()]);

        m.on_report(
            &b,
            FlowReport {
                queue_len: 0,
                stopped: false,
            },
        );
        assert!(!m.should_wait());
    }
}
