//! Reorder stage.
//!
//! Holds the first `count` packets, lets the next `offset` packets through,
//! then releases the held packets most-recent-first and disarms.
//!
//! ```text
//! Disarmed ──arm──▶ Buffering{remaining} ──remaining=0──▶ Passing{offset}
//!     ▲                      │ offset=0                        │ offset=0
//!     └────────── flush ◀────┴─────────────────────────────────┘
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReorderPhase {
    #[default]
    Disarmed,
    Buffering {
        remaining: usize,
        offset: u32,
    },
    Passing {
        offset: u32,
    },
}

/// What the stage did with the packet it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderStep {
    /// Stage disarmed; the packet continues down the pipeline.
    Bypass,
    /// Packet held in the buffer; its verdict is issued at flush time.
    Held,
    /// Packet is inside the offset window and is accepted unmodified.
    Passed,
}

#[derive(Debug)]
pub struct ReorderState {
    phase: ReorderPhase,
    held: Vec<u32>,
    capacity: usize,
}

impl ReorderState {
    pub fn new(capacity: usize) -> Self {
        Self {
            phase: ReorderPhase::Disarmed,
            held: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn phase(&self) -> ReorderPhase {
        self.phase
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arms the stage. Returns the number of packets that will actually be
    /// buffered, which is `count` truncated to the free buffer space.
    ///
    /// Packets still held from an earlier arm stay in the buffer and are
    /// released with the next flush.
    pub fn arm(&mut self, count: usize, offset: u32) -> usize {
        let free = self.capacity.saturating_sub(self.held.len());
        let count = count.min(free);
        if count == 0 {
            return 0;
        }
        self.phase = ReorderPhase::Buffering {
            remaining: count,
            offset,
        };
        count
    }

    /// Feeds one packet id. Released ids are appended to `released` in
    /// release order.
    pub fn on_packet(&mut self, id: u32, released: &mut Vec<u32>) -> ReorderStep {
        match self.phase {
            ReorderPhase::Disarmed => ReorderStep::Bypass,
            ReorderPhase::Buffering { remaining, offset } => {
                self.held.push(id);
                let remaining = remaining - 1;
                self.phase = if remaining > 0 {
                    ReorderPhase::Buffering { remaining, offset }
                } else if offset > 0 {
                    ReorderPhase::Passing { offset }
                } else {
                    self.flush(released);
                    ReorderPhase::Disarmed
                };
                ReorderStep::Held
            }
            ReorderPhase::Passing { offset } => {
                let offset = offset - 1;
                self.phase = if offset > 0 {
                    ReorderPhase::Passing { offset }
                } else {
                    self.flush(released);
                    ReorderPhase::Disarmed
                };
                ReorderStep::Passed
            }
        }
    }

    fn flush(&mut self, released: &mut Vec<u32>) {
        released.extend(self.held.drain(..).rev());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut ReorderState, ids: impl IntoIterator<Item = u32>) -> Vec<(u32, ReorderStep, Vec<u32>)> {
        ids.into_iter()
            .map(|id| {
                let mut released = Vec::new();
                let step = state.on_packet(id, &mut released);
                (id, step, released)
            })
            .collect()
    }

    #[test]
    fn buffers_passes_then_flushes_in_reverse() {
        let mut state = ReorderState::new(16);
        assert_eq!(state.arm(3, 2), 3);

        let steps = feed(&mut state, 1..=6);
        assert_eq!(steps[0].1, ReorderStep::Held);
        assert_eq!(steps[1].1, ReorderStep::Held);
        assert_eq!(steps[2].1, ReorderStep::Held);
        assert_eq!(steps[3].1, ReorderStep::Passed);
        assert!(steps[3].2.is_empty());
        assert_eq!(steps[4].1, ReorderStep::Passed);
        assert_eq!(steps[4].2, vec![3, 2, 1]);
        assert_eq!(steps[5].1, ReorderStep::Bypass);
        assert_eq!(state.phase(), ReorderPhase::Disarmed);
        assert_eq!(state.held(), 0);
    }

    #[test]
    fn zero_offset_flushes_on_last_buffered_packet() {
        let mut state = ReorderState::new(16);
        state.arm(2, 0);
        let steps = feed(&mut state, [10, 11]);
        assert_eq!(steps[0].2, Vec::<u32>::new());
        assert_eq!(steps[1].1, ReorderStep::Held);
        assert_eq!(steps[1].2, vec![11, 10]);
        assert_eq!(state.phase(), ReorderPhase::Disarmed);
    }

    #[test]
    fn count_truncated_to_capacity() {
        let mut state = ReorderState::new(4);
        assert_eq!(state.arm(100, 1), 4);
        let steps = feed(&mut state, 0..5);
        assert!(steps[..4].iter().all(|s| s.1 == ReorderStep::Held));
        assert_eq!(steps[4].2, vec![3, 2, 1, 0]);
        assert!(state.held() <= state.capacity());
    }

    #[test]
    fn zero_count_leaves_stage_untouched() {
        let mut state = ReorderState::new(4);
        assert_eq!(state.arm(0, 5), 0);
        assert_eq!(state.phase(), ReorderPhase::Disarmed);
    }

    #[test]
    fn rearm_keeps_previously_held_ids() {
        let mut state = ReorderState::new(8);
        state.arm(3, 1);
        feed(&mut state, [1, 2]);
        assert_eq!(state.arm(2, 0), 2);
        let steps = feed(&mut state, [3, 4]);
        assert_eq!(steps[1].2, vec![4, 3, 2, 1]);
    }
}
