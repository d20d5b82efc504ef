/// Drop stage: discards the next `budget` packets, then disarms itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropState {
    #[default]
    Disarmed,
    Armed {
        remaining: u32,
    },
}

impl DropState {
    /// Arms with `budget` packets to drop. A zero budget disarms.
    pub fn arm(budget: u32) -> Self {
        if budget == 0 {
            DropState::Disarmed
        } else {
            DropState::Armed { remaining: budget }
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, DropState::Armed { .. })
    }

    /// Consumes one packet. Returns `true` when the packet must be dropped.
    pub fn on_packet(&mut self) -> bool {
        match *self {
            DropState::Disarmed => false,
            DropState::Armed { remaining } => {
                let left = remaining.saturating_sub(1);
                *self = if left == 0 {
                    DropState::Disarmed
                } else {
                    DropState::Armed { remaining: left }
                };
                true
            }
        }
    }
}
