//! Packet interception.
//!
//! A [`CaptureSource`] yields intercepted packets for one queue and accepts
//! verdicts for them. Verdicts may be issued out of order and for packets
//! received earlier (the reorder stage depends on this).
//!
//! * [`NfQueueOpener`] binds kernel NFQUEUE queues over netlink (Linux only).
//! * [`MemoryOpener`] provides channel-backed queues for tests and dry runs.

use bytes::Bytes;

use crate::config::CaptureConfig;
use crate::error::CaptureError;

pub mod memory;
#[cfg(target_os = "linux")]
pub mod nfqueue;
pub mod session;

pub use memory::{MemoryOpener, MemoryQueue};
#[cfg(target_os = "linux")]
pub use nfqueue::NfQueueOpener;
pub use session::CaptureSession;

/// One intercepted packet, starting at the IP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub payload: Bytes,
}

/// Final disposition of an intercepted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Re-inject with `mark`. `payload` replaces the packet bytes when set.
    Accept { mark: u32, payload: Option<Bytes> },
    Drop,
}

impl Verdict {
    pub fn accept(mark: u32) -> Self {
        Verdict::Accept {
            mark,
            payload: None,
        }
    }
}

pub trait CaptureSource: Send {
    fn queue(&self) -> u16;

    /// Waits up to the configured receive timeout for the next packet.
    /// `Ok(None)` means the wait timed out.
    fn receive(&mut self) -> Result<Option<Packet>, CaptureError>;

    fn set_verdict(&mut self, id: u32, verdict: &Verdict) -> Result<(), CaptureError>;

    /// Unbinds the queue. Idempotent.
    fn close(&mut self) -> Result<(), CaptureError>;
}

/// Creates capture sources for queue ids.
pub trait CaptureOpener: Send {
    fn open(
        &self,
        queue: u16,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureSource>, CaptureError>;
}
