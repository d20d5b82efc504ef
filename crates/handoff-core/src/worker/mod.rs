//! Per-queue packet pipeline.
//!
//! Every intercepted packet runs through the stages in fixed order:
//!
//! ```text
//! drop ─▶ reorder ─▶ parse ─▶ dedup ─▶ window ─▶ accept(mark)
//!  │        │          │        │
//!  ▼        ▼          ▼        ▼
//! Drop   Deferred/   accept   Drop
//!        accept      (fail open)
//! ```
//!
//! The first stage that decides a packet's fate ends the walk. Stage state
//! is guarded by one lock per stage so the scheduler thread can reconfigure
//! a stage while the capture thread is processing packets; no two stage
//! locks are ever held at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::capture::{Packet, Verdict};
use crate::config::{WindowConfig, WorkerConfig};
use crate::protocol::tcp::{rewrite_window, TcpSegment};
use crate::stats::{Counter, QueueStatsSnapshot, WorkerStats};

pub mod dedup;
pub mod drop;
pub mod reorder;
pub mod window;

pub use dedup::DedupState;
pub use drop::DropState;
pub use reorder::{ReorderPhase, ReorderState, ReorderStep};
pub use window::{WindowMode, WindowState};

/// What to do with the packet just handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Issue(Verdict),
    /// Held by the reorder stage; the verdict comes with a later flush.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub decision: Decision,
    /// Previously held packet ids to accept now, in order.
    pub released: Vec<u32>,
    /// Mark for released packets.
    pub mark: u32,
}

impl Outcome {
    fn issue(verdict: Verdict, mark: u32) -> Self {
        Self {
            decision: Decision::Issue(verdict),
            released: Vec::new(),
            mark,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Worker {
    queue: u16,
    mark: AtomicU32,
    drop: Mutex<DropState>,
    reorder: Mutex<ReorderState>,
    dedup: Mutex<DedupState>,
    window: Mutex<WindowState>,
    stats: WorkerStats,
    min_window: u16,
    ack_resync_bytes: u32,
}

impl Worker {
    pub fn new(queue: u16, config: &WorkerConfig, window: &WindowConfig) -> Self {
        Self {
            queue,
            mark: AtomicU32::new(0),
            drop: Mutex::new(DropState::Disarmed),
            reorder: Mutex::new(ReorderState::new(config.reorder_capacity)),
            dedup: Mutex::new(DedupState::default()),
            window: Mutex::new(WindowState::default()),
            stats: WorkerStats::default(),
            min_window: config.min_window,
            ack_resync_bytes: window.ack_resync_bytes,
        }
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn mark(&self) -> u32 {
        self.mark.load(Ordering::SeqCst)
    }

    pub fn set_mark(&self, mark: u32) {
        self.mark.store(mark, Ordering::SeqCst);
    }

    pub fn arm_drop(&self, budget: u32) {
        *lock(&self.drop) = DropState::arm(budget);
    }

    pub fn drop_state(&self) -> DropState {
        *lock(&self.drop)
    }

    /// Arms the reorder stage. Returns the effective buffer count.
    pub fn arm_reorder(&self, count: u32, offset: u32) -> usize {
        let mut reorder = lock(&self.reorder);
        let effective = reorder.arm(count as usize, offset);
        if effective < count as usize {
            warn!(
                queue = self.queue,
                requested = count,
                effective,
                capacity = reorder.capacity(),
                "reorder count truncated to free buffer space"
            );
        }
        effective
    }

    pub fn reorder_phase(&self) -> ReorderPhase {
        lock(&self.reorder).phase()
    }

    pub fn set_dedup(&self, enabled: bool) {
        lock(&self.dedup).set_enabled(enabled);
    }

    pub fn dedup_state(&self) -> DedupState {
        *lock(&self.dedup)
    }

    /// Pins the advertised window, floored at the configured minimum.
    pub fn set_window(&self, window: u32) {
        let window = window.max(self.min_window as u32);
        lock(&self.window).set_fixed(window);
    }

    /// Runs `f` with the window state locked.
    pub fn with_window<R>(&self, f: impl FnOnce(&mut WindowState) -> R) -> R {
        f(&mut lock(&self.window))
    }

    pub fn window_state(&self) -> WindowState {
        lock(&self.window).clone()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_verdict_error(&self) {
        self.stats.incr(Counter::VerdictErrors);
    }

    /// Runs one packet through the pipeline.
    pub fn handle(&self, packet: &Packet) -> Outcome {
        self.stats.incr(Counter::Seen);
        let mark = self.mark();

        if lock(&self.drop).on_packet() {
            self.stats.incr(Counter::Dropped);
            return Outcome::issue(Verdict::Drop, mark);
        }

        let mut released = Vec::new();
        let step = lock(&self.reorder).on_packet(packet.id, &mut released);
        if !released.is_empty() {
            self.stats.add(Counter::Released, released.len() as u64);
            debug!(queue = self.queue, count = released.len(), "reorder flush");
        }
        match step {
            ReorderStep::Held => {
                self.stats.incr(Counter::Held);
                return Outcome {
                    decision: Decision::Deferred,
                    released,
                    mark,
                };
            }
            ReorderStep::Passed => {
                self.stats.incr(Counter::Accepted);
                return Outcome {
                    decision: Decision::Issue(Verdict::accept(mark)),
                    released,
                    mark,
                };
            }
            ReorderStep::Bypass => {}
        }

        let verdict = self.filter(packet, mark);
        match verdict {
            Verdict::Drop => self.stats.incr(Counter::DedupDropped),
            Verdict::Accept { .. } => self.stats.incr(Counter::Accepted),
        }
        Outcome {
            decision: Decision::Issue(verdict),
            released,
            mark,
        }
    }

    fn filter(&self, packet: &Packet, mark: u32) -> Verdict {
        let seg = match TcpSegment::parse(&packet.payload) {
            Ok(seg) => seg,
            Err(e) => {
                trace!(queue = self.queue, id = packet.id, error = %e, "not tcp/ipv4, passing through");
                self.stats.incr(Counter::Passthrough);
                return Verdict::accept(mark);
            }
        };

        if lock(&self.dedup).is_duplicate(&seg) {
            trace!(queue = self.queue, ack = seg.ack, "duplicate ack dropped");
            return Verdict::Drop;
        }

        let clamp = {
            let mut window = lock(&self.window);
            window.account_ack(seg.ack, self.ack_resync_bytes);
            window.clamp(seg.window)
        };
        lock(&self.dedup).record_ack(seg.ack);

        match clamp {
            Some(tuned) => {
                let mut buf = BytesMut::from(&packet.payload[..]);
                rewrite_window(&mut buf, &seg, tuned);
                self.stats.incr(Counter::Rewritten);
                Verdict::Accept {
                    mark,
                    payload: Some(buf.freeze()),
                }
            }
            None => Verdict::accept(mark),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("mark", &self.mark())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tcp::tcp_checksum_valid;
    use crate::protocol::PacketBuilder;
    use bytes::Bytes;

    fn worker() -> Worker {
        Worker::new(1, &WorkerConfig::default(), &WindowConfig::default())
    }

    fn pkt(id: u32, payload: Bytes) -> Packet {
        Packet { id, payload }
    }

    fn ack(id: u32, ack: u32, window: u16) -> Packet {
        pkt(id, PacketBuilder::new().ack(ack).window(window).build())
    }

    #[test]
    fn default_accepts_with_current_mark() {
        let w = worker();
        w.set_mark(2);
        let out = w.handle(&ack(1, 100, 5000));
        assert_eq!(out.decision, Decision::Issue(Verdict::accept(2)));
        assert!(out.released.is_empty());
    }

    #[test]
    fn drop_budget_then_accept() {
        let w = worker();
        w.arm_drop(2);
        let verdicts: Vec<_> = (0..3).map(|i| w.handle(&ack(i, i, 100)).decision).collect();
        assert_eq!(verdicts[0], Decision::Issue(Verdict::Drop));
        assert_eq!(verdicts[1], Decision::Issue(Verdict::Drop));
        assert!(matches!(verdicts[2], Decision::Issue(Verdict::Accept { .. })));
        assert_eq!(w.stats().dropped, 2);
    }

    #[test]
    fn reorder_then_flush_with_current_mark() {
        let w = worker();
        w.set_mark(7);
        w.arm_reorder(2, 1);
        assert_eq!(w.handle(&ack(1, 0, 10)).decision, Decision::Deferred);
        assert_eq!(w.handle(&ack(2, 0, 10)).decision, Decision::Deferred);
        let out = w.handle(&ack(3, 0, 10));
        assert_eq!(out.decision, Decision::Issue(Verdict::accept(7)));
        assert_eq!(out.released, vec![2, 1]);
        assert_eq!(out.mark, 7);
    }

    #[test]
    fn dedup_drops_second_identical_pure_ack() {
        let w = worker();
        w.set_dedup(true);
        let first = w.handle(&ack(1, 900, 100));
        let second = w.handle(&ack(2, 900, 100));
        assert!(matches!(first.decision, Decision::Issue(Verdict::Accept { .. })));
        assert_eq!(second.decision, Decision::Issue(Verdict::Drop));
        assert_eq!(w.stats().dedup_dropped, 1);
    }

    #[test]
    fn dedup_tracks_ack_without_enabled_suppression() {
        let w = worker();
        w.handle(&ack(1, 900, 100));
        assert_eq!(w.dedup_state().last_ack(), Some(900));
        w.set_dedup(true);
        assert_eq!(w.handle(&ack(2, 900, 100)).decision, Decision::Issue(Verdict::Drop));
    }

    #[test]
    fn window_rewritten_with_valid_checksum() {
        let w = worker();
        w.set_window(1000);
        let input = ack(1, 10, 4000);
        let out = w.handle(&input);
        let Decision::Issue(Verdict::Accept {
            payload: Some(bytes),
            ..
        }) = out.decision
        else {
            panic!("expected rewritten accept, got {:?}", out.decision);
        };
        let seg = TcpSegment::parse(&bytes).unwrap();
        assert_eq!(seg.window, 1000);
        assert!(tcp_checksum_valid(&bytes, &seg));
        assert_eq!(w.stats().rewritten, 1);
    }

    #[test]
    fn window_larger_than_advertised_leaves_packet_alone() {
        let w = worker();
        w.set_window(8000);
        let out = w.handle(&ack(1, 10, 4000));
        assert_eq!(out.decision, Decision::Issue(Verdict::accept(0)));
    }

    #[test]
    fn set_window_floors_to_minimum() {
        let w = worker();
        w.set_window(3);
        assert_eq!(w.window_state().tuned(), 10);
    }

    #[test]
    fn non_tcp_fails_open() {
        let w = worker();
        w.set_dedup(true);
        w.set_window(10);
        let out = w.handle(&pkt(1, Bytes::from_static(&[0x60, 0, 0, 0])));
        assert_eq!(out.decision, Decision::Issue(Verdict::accept(0)));
        assert_eq!(w.stats().passthrough, 1);
    }

    #[test]
    fn sampling_counts_acked_bytes() {
        let w = worker();
        w.with_window(|s| s.enter(WindowMode::Adaptive, 5000));
        w.handle(&ack(1, 1000, 60000));
        w.handle(&ack(2, 3048, 60000));
        assert_eq!(w.window_state().received(), 2048);
    }
}
