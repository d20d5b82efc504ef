//! Receive-window tuning state for one queue.
//!
//! The stage rewrites the advertised window of forwarded segments down to
//! `tuned` whenever rewriting is permitted and a tuning mode is active. In
//! `Burst` and `Adaptive` modes it also accumulates acknowledged bytes for
//! the controller's next sample.

/// Which regime currently owns `tuned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowMode {
    /// No rewriting.
    #[default]
    Off,
    /// Constant window set by an action.
    Fixed,
    /// Controller raises the window from the bandwidth-delay estimate.
    Burst,
    /// Controller scales the window from measured utilization.
    Adaptive,
}

impl WindowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowMode::Off => "off",
            WindowMode::Fixed => "fixed",
            WindowMode::Burst => "burst",
            WindowMode::Adaptive => "adaptive",
        }
    }

    fn samples(&self) -> bool {
        matches!(self, WindowMode::Burst | WindowMode::Adaptive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    /// Global rewrite switch, cleared by a controller init with rewriting disabled.
    permitted: bool,
    mode: WindowMode,
    tuned: u32,
    received: u64,
    /// Highest ack observed, for serial-number accounting.
    high_ack: Option<u32>,
    resyncs: u64,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            permitted: true,
            mode: WindowMode::Off,
            tuned: 0,
            received: 0,
            high_ack: None,
            resyncs: 0,
        }
    }
}

impl WindowState {
    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    pub fn tuned(&self) -> u32 {
        self.tuned
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_permitted(&self) -> bool {
        self.permitted
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// True when forwarded segments are subject to window rewriting.
    pub fn is_active(&self) -> bool {
        self.permitted && self.mode != WindowMode::Off
    }

    /// Window to advertise instead of `advertised`, if it must be lowered.
    pub fn clamp(&self, advertised: u16) -> Option<u16> {
        if !self.is_active() {
            return None;
        }
        let tuned = self.tuned.min(u16::MAX as u32) as u16;
        (tuned < advertised).then_some(tuned)
    }

    /// Accounts one acknowledgment number.
    ///
    /// Acks are compared to the highest ack seen using 32-bit serial
    /// arithmetic. Only forward progress counts, and only while a sampling
    /// mode is active. The first ack seeds the high-water mark; an advance
    /// larger than `resync_bytes` moves the mark without counting.
    pub fn account_ack(&mut self, ack: u32, resync_bytes: u32) {
        let Some(high) = self.high_ack else {
            self.high_ack = Some(ack);
            return;
        };
        let delta = ack.wrapping_sub(high) as i32;
        if delta <= 0 {
            return;
        }
        self.high_ack = Some(ack);
        if delta as u32 > resync_bytes {
            self.resyncs += 1;
            return;
        }
        if self.is_active() && self.mode.samples() {
            self.received = self.received.saturating_add(delta as u64);
        }
    }

    /// Returns the bytes accumulated since the last sample and resets the count.
    pub fn take_received(&mut self) -> u64 {
        std::mem::take(&mut self.received)
    }

    pub fn set_tuned(&mut self, window: u32) {
        self.tuned = window.min(u16::MAX as u32);
    }

    pub fn set_fixed(&mut self, window: u32) {
        self.set_tuned(window);
        self.mode = WindowMode::Fixed;
    }

    /// Enters a sampling mode seeded with `seed`. The byte count restarts and
    /// the next ack only seeds the high-water mark.
    pub fn enter(&mut self, mode: WindowMode, seed: u32) {
        self.set_tuned(seed);
        self.received = 0;
        self.high_ack = None;
        self.mode = mode;
    }

    /// Leaves the current sampling mode, freezing the window. Returns the
    /// frozen window.
    pub fn leave(&mut self) -> u32 {
        if self.mode.samples() {
            self.mode = WindowMode::Fixed;
        }
        self.received = 0;
        self.tuned
    }

    /// Controller bind: sets the rewrite switch and enters adaptive mode.
    pub fn bind(&mut self, permitted: bool, seed: u32) {
        self.permitted = permitted;
        self.enter(WindowMode::Adaptive, seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESYNC: u32 = 64 * 1024 * 1024;

    #[test]
    fn inactive_by_default() {
        let state = WindowState::default();
        assert!(!state.is_active());
        assert_eq!(state.clamp(1000), None);
    }

    #[test]
    fn clamps_only_downwards() {
        let mut state = WindowState::default();
        state.set_fixed(500);
        assert_eq!(state.clamp(1000), Some(500));
        assert_eq!(state.clamp(500), None);
        assert_eq!(state.clamp(100), None);
    }

    #[test]
    fn permission_gates_rewrite() {
        let mut state = WindowState::default();
        state.bind(false, 100);
        assert_eq!(state.mode(), WindowMode::Adaptive);
        assert_eq!(state.clamp(1000), None);
        state.account_ack(1, RESYNC);
        state.account_ack(1001, RESYNC);
        assert_eq!(state.received(), 0);
    }

    #[test]
    fn first_ack_seeds_then_forward_progress_counts() {
        let mut state = WindowState::default();
        state.enter(WindowMode::Burst, 10);
        state.account_ack(5000, RESYNC);
        assert_eq!(state.received(), 0);
        state.account_ack(6000, RESYNC);
        state.account_ack(5500, RESYNC);
        state.account_ack(6000, RESYNC);
        state.account_ack(7448, RESYNC);
        assert_eq!(state.received(), 2448);
        assert_eq!(state.take_received(), 2448);
        assert_eq!(state.received(), 0);
    }

    #[test]
    fn ack_wraparound_counts_forward_distance() {
        let mut state = WindowState::default();
        state.enter(WindowMode::Adaptive, 10);
        state.account_ack(u32::MAX - 99, RESYNC);
        state.account_ack(100, RESYNC);
        assert_eq!(state.received(), 200);
    }

    #[test]
    fn huge_jump_resyncs_without_counting() {
        let mut state = WindowState::default();
        state.enter(WindowMode::Adaptive, 10);
        state.account_ack(0, 1000);
        state.account_ack(5000, 1000);
        assert_eq!(state.received(), 0);
        assert_eq!(state.resyncs(), 1);
        state.account_ack(5500, 1000);
        assert_eq!(state.received(), 500);
    }

    #[test]
    fn fixed_mode_does_not_sample() {
        let mut state = WindowState::default();
        state.set_fixed(100);
        state.account_ack(0, RESYNC);
        state.account_ack(100, RESYNC);
        assert_eq!(state.received(), 0);
    }

    #[test]
    fn tuned_saturates_at_u16() {
        let mut state = WindowState::default();
        state.set_fixed(1 << 20);
        assert_eq!(state.tuned(), u16::MAX as u32);
    }

    #[test]
    fn leave_freezes_window() {
        let mut state = WindowState::default();
        state.enter(WindowMode::Burst, 300);
        state.set_tuned(900);
        assert_eq!(state.leave(), 900);
        assert_eq!(state.mode(), WindowMode::Fixed);
        assert_eq!(state.clamp(2000), Some(900));
    }
}
