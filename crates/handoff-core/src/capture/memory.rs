//! Channel-backed capture queues.
//!
//! [`MemoryOpener`] hands out [`MemoryCapture`] sources and keeps the peer
//! end of each one as a [`MemoryQueue`], through which a test injects packets
//! and observes the verdicts the pipeline issued.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::{CaptureOpener, CaptureSource, Packet, Verdict};
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// Test-side end of one in-memory queue.
#[derive(Clone)]
pub struct MemoryQueue {
    queue: u16,
    packets: Sender<Packet>,
    verdicts: Receiver<(u32, Verdict)>,
}

impl MemoryQueue {
    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn inject(&self, id: u32, payload: Bytes) -> Result<(), CaptureError> {
        self.packets
            .send(Packet { id, payload })
            .map_err(|_| CaptureError::Closed)
    }

    /// Waits for the next verdict issued by the pipeline.
    pub fn next_verdict(&self, timeout: Duration) -> Option<(u32, Verdict)> {
        self.verdicts.recv_timeout(timeout).ok()
    }

    /// Collects verdicts until `count` arrived or `timeout` passes without one.
    pub fn collect_verdicts(&self, count: usize, timeout: Duration) -> Vec<(u32, Verdict)> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match self.next_verdict(timeout) {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }
}

pub struct MemoryCapture {
    queue: u16,
    packets: Receiver<Packet>,
    verdicts: Sender<(u32, Verdict)>,
    recv_timeout: Duration,
    closed: bool,
}

impl CaptureSource for MemoryCapture {
    fn queue(&self) -> u16 {
        self.queue
    }

    fn receive(&mut self) -> Result<Option<Packet>, CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }
        match self.packets.recv_timeout(self.recv_timeout) {
            Ok(pkt) => Ok(Some(pkt)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn set_verdict(&mut self, id: u32, verdict: &Verdict) -> Result<(), CaptureError> {
        self.verdicts
            .send((id, verdict.clone()))
            .map_err(|_| CaptureError::Closed)
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    queues: BTreeMap<u16, MemoryQueue>,
    refuse: BTreeSet<u16>,
    opened: Vec<u16>,
}

/// Opener for in-memory queues. Clones share the same registry.
#[derive(Clone, Default)]
pub struct MemoryOpener {
    inner: Arc<Mutex<Registry>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `open` of `queue` fail.
    pub fn refuse(&self, queue: u16) {
        self.registry().refuse.insert(queue);
    }

    /// Test-side end of the most recent `open` of `queue`.
    pub fn queue(&self, queue: u16) -> Option<MemoryQueue> {
        self.registry().queues.get(&queue).cloned()
    }

    /// Queue ids in open order, repeats included.
    pub fn opened(&self) -> Vec<u16> {
        self.registry().opened.clone()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CaptureOpener for MemoryOpener {
    fn open(
        &self,
        queue: u16,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let mut registry = self.registry();
        if registry.refuse.contains(&queue) {
            return Err(CaptureError::Configure {
                queue,
                reason: "refused by test opener".into(),
            });
        }
        let (packet_tx, packet_rx) = unbounded();
        let (verdict_tx, verdict_rx) = unbounded();
        registry.queues.insert(
            queue,
            MemoryQueue {
                queue,
                packets: packet_tx,
                verdicts: verdict_rx,
            },
        );
        registry.opened.push(queue);
        Ok(Box::new(MemoryCapture {
            queue,
            packets: packet_rx,
            verdicts: verdict_tx,
            recv_timeout: config.recv_timeout,
            closed: false,
        }))
    }
}
