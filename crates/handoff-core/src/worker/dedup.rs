use crate::protocol::TcpSegment;

/// Duplicate-ACK suppression state.
///
/// `last_ack` is the ack number of the last packet that reached the window
/// stage; it is tracked whether or not suppression is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupState {
    enabled: bool,
    last_ack: Option<u32>,
}

impl DedupState {
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_ack(&self) -> Option<u32> {
        self.last_ack
    }

    /// True when `seg` is a pure ACK repeating the last observed ack number.
    pub fn is_duplicate(&self, seg: &TcpSegment) -> bool {
        self.enabled && seg.is_ack_only() && self.last_ack == Some(seg.ack)
    }

    pub fn record_ack(&mut self, ack: u32) {
        self.last_ack = Some(ack);
    }
}
