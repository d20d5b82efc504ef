use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free per-queue packet counters, updated from the capture thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    seen: AtomicU64,
    accepted: AtomicU64,
    rewritten: AtomicU64,
    dropped: AtomicU64,
    dedup_dropped: AtomicU64,
    held: AtomicU64,
    released: AtomicU64,
    passthrough: AtomicU64,
    verdict_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Seen,
    Accepted,
    Rewritten,
    Dropped,
    DedupDropped,
    Held,
    Released,
    Passthrough,
    VerdictErrors,
}

impl WorkerStats {
    pub(crate) fn add(&self, counter: Counter, n: u64) {
        let slot = match counter {
            Counter::Seen => &self.seen,
            Counter::Accepted => &self.accepted,
            Counter::Rewritten => &self.rewritten,
            Counter::Dropped => &self.dropped,
            Counter::DedupDropped => &self.dedup_dropped,
            Counter::Held => &self.held,
            Counter::Released => &self.released,
            Counter::Passthrough => &self.passthrough,
            Counter::VerdictErrors => &self.verdict_errors,
        };
        slot.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            seen: self.seen.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rewritten: self.rewritten.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dedup_dropped: self.dedup_dropped.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            verdict_errors: self.verdict_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one queue's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub seen: u64,
    pub accepted: u64,
    /// Accepted packets whose advertised window was lowered.
    pub rewritten: u64,
    /// Packets discarded by the drop stage.
    pub dropped: u64,
    /// Duplicate pure ACKs discarded.
    pub dedup_dropped: u64,
    /// Packets parked in the reorder buffer.
    pub held: u64,
    /// Parked packets later accepted by a flush.
    pub released: u64,
    /// Packets accepted unmodified because they were not IPv4/TCP.
    pub passthrough: u64,
    pub verdict_errors: u64,
}

/// Summary of one emulator run, serialized by `--stats-json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub events_scheduled: usize,
    pub events_executed: usize,
    pub controller_ticks: u64,
    pub interrupted: bool,
    pub elapsed_ms: u64,
    pub queues: BTreeMap<u16, QueueStatsSnapshot>,
}

impl RunReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let stats = WorkerStats::default();
        stats.incr(Counter::Seen);
        stats.incr(Counter::Seen);
        stats.incr(Counter::Accepted);
        stats.add(Counter::Released, 3);
        let snap = stats.snapshot();
        assert_eq!(snap.seen, 2);
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.released, 3);
        assert_eq!(snap.dropped, 0);
    }

    #[test]
    fn run_report_json_shape() {
        let mut report = RunReport {
            run_id: "exp-7".into(),
            events_scheduled: 4,
            events_executed: 4,
            controller_ticks: 12,
            ..Default::default()
        };
        report.queues.insert(
            1,
            QueueStatsSnapshot {
                seen: 10,
                accepted: 9,
                dropped: 1,
                ..Default::default()
            },
        );

        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["run_id"], "exp-7");
        assert_eq!(value["controller_ticks"], 12);
        assert_eq!(value["queues"]["1"]["dropped"], 1);

        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queues[&1].seen, 10);
    }
}
