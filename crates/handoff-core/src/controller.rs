//! # Adaptive receive-window controller
//!
//! Periodically samples the bytes acknowledged on the bound queue and resizes
//! the window the worker advertises.
//!
//! * **Burst**: grows the window towards the bandwidth-delay estimate
//!   `(received × rtt / interval) >> scale_shift`, never shrinking it.
//! * **Adaptive**: compares the congestion-window estimate
//!   `received >> scale_shift`, capped at the current window, against the
//!   current window. Utilization above
//!   `threshold` grows the window by `pace`; below the low watermark it
//!   shrinks by `pace / 4`.
//!
//! Each link (identified by its routing mark) remembers the last window that
//! worked for it. A handover snapshots the outgoing link's window and seeds
//! the worker from the incoming link's history.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::WindowConfig;
use crate::worker::{WindowMode, Worker};

/// Largest window the TCP header can carry without scaling.
pub const MAX_WINDOW: u32 = u16::MAX as u32;

/// Per-link history used to seed the window after a handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkProfile {
    pub mark: u32,
    pub rtt_ms: u64,
    pub window: u32,
}

/// Parameters of a controller init event.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerParams {
    pub enable_rewrite: bool,
    pub start_ms: u64,
    pub burst_interval_ms: u64,
    pub threshold: f64,
    pub pace: f64,
    pub links: [LinkProfile; 2],
}

/// Slot 0 is reserved; live profiles occupy slots 1 and 2.
const LINK_SLOTS: usize = 3;

/// Window after one burst sample. Never below `current`, saturates at [`MAX_WINDOW`].
pub fn burst_estimate(current: u32, received: u64, rtt_ms: u64, interval_ms: u64, shift: u32) -> u32 {
    let scaled = received as f64 * rtt_ms as f64 / interval_ms.max(1) as f64;
    let estimate = ((scaled as u64) >> shift).min(MAX_WINDOW as u64) as u32;
    current.max(estimate).min(MAX_WINDOW)
}

/// Window after one adaptive sample.
pub fn adapt_window(
    current: u32,
    received: u64,
    shift: u32,
    threshold: f64,
    pace: f64,
    low_utilization: f64,
) -> u32 {
    if current == 0 {
        return 0;
    }
    let cwnd = (received >> shift).min(current as u64) as f64;
    let utilization = cwnd / current as f64;
    let next = if utilization > threshold {
        current as f64 * (1.0 + pace)
    } else if utilization < low_utilization {
        current as f64 * (1.0 - pace / 4.0)
    } else {
        current as f64
    };
    (next.max(0.0) as u64).min(MAX_WINDOW as u64) as u32
}

#[derive(Debug)]
pub struct AdaptiveController {
    bound: Option<Arc<Worker>>,
    links: [Option<LinkProfile>; LINK_SLOTS],
    active_mark: u32,
    last_fire_ms: u64,
    interval_ms: u64,
    burst_interval_ms: u64,
    threshold: f64,
    pace: f64,
    config: WindowConfig,
    ticks: u64,
}

impl AdaptiveController {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            bound: None,
            links: [None; LINK_SLOTS],
            active_mark: 0,
            last_fire_ms: 0,
            interval_ms: 0,
            burst_interval_ms: 0,
            threshold: 1.0,
            pace: 0.0,
            config,
            ticks: 0,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn bound_queue(&self) -> Option<u16> {
        self.bound.as_ref().map(|w| w.queue())
    }

    pub fn active_mark(&self) -> u32 {
        self.active_mark
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// History of the link routed with `mark`.
    pub fn link(&self, mark: u32) -> Option<LinkProfile> {
        self.links[1..].iter().flatten().find(|l| l.mark == mark).copied()
    }

    fn link_mut(&mut self, mark: u32) -> Option<&mut LinkProfile> {
        self.links[1..].iter_mut().flatten().find(|l| l.mark == mark)
    }

    fn clamp_interval(&self, ms: u64) -> u64 {
        ms.max(self.config.min_interval_ms)
    }

    /// Binds the controller to `worker` and seeds it from the first link.
    pub fn bind(&mut self, worker: Arc<Worker>, params: &ControllerParams) {
        if let Some(prev) = &self.bound {
            warn!(
                previous = prev.queue(),
                queue = worker.queue(),
                "controller rebound, previous binding replaced"
            );
        }
        let first = params.links[0];
        self.links = [None, Some(params.links[0]), Some(params.links[1])];
        self.active_mark = first.mark;
        self.burst_interval_ms = params.burst_interval_ms;
        self.threshold = params.threshold;
        self.pace = params.pace;
        self.interval_ms = self.clamp_interval(first.rtt_ms);
        self.last_fire_ms = params.start_ms;

        worker.with_window(|w| w.bind(params.enable_rewrite, first.window));
        info!(
            queue = worker.queue(),
            rewrite = params.enable_rewrite,
            mark = first.mark,
            window = first.window,
            interval_ms = self.interval_ms,
            "controller bound"
        );
        self.bound = Some(worker);
    }

    /// Drops the binding if it targets `queue`.
    pub fn unbind_queue(&mut self, queue: u16) {
        if self.bound_queue() == Some(queue) {
            self.bound = None;
            info!(queue, "controller unbound");
        }
    }

    /// Next tick time, relative to the run start. `None` while unbound.
    pub fn next_fire(&self) -> Option<u64> {
        self.bound
            .as_ref()
            .map(|_| self.last_fire_ms.saturating_add(self.interval_ms))
    }

    /// Runs one sample on the bound worker and advances the fire time.
    pub fn tick(&mut self) {
        let Some(worker) = self.bound.clone() else {
            return;
        };
        self.last_fire_ms = self.last_fire_ms.saturating_add(self.interval_ms);
        self.ticks += 1;

        let rtt_ms = self.link(self.active_mark).map_or(0, |l| l.rtt_ms);
        let interval_ms = self.interval_ms;
        let shift = self.config.scale_shift;
        let (threshold, pace, low) = (self.threshold, self.pace, self.config.low_utilization);

        let (mode, before, after, received) = worker.with_window(|w| {
            let received = w.take_received();
            let before = w.tuned();
            let after = match w.mode() {
                WindowMode::Burst => burst_estimate(before, received, rtt_ms, interval_ms, shift),
                WindowMode::Adaptive => adapt_window(before, received, shift, threshold, pace, low),
                WindowMode::Off | WindowMode::Fixed => before,
            };
            w.set_tuned(after);
            (w.mode(), before, after, received)
        });
        if after != before {
            debug!(
                queue = worker.queue(),
                mode = mode.as_str(),
                received,
                before,
                after,
                "window resized"
            );
        }
    }

    /// True when the controller is bound to `worker`'s queue. Logs otherwise.
    fn owns(&self, worker: &Worker, action: &'static str) -> bool {
        let owned = self.bound_queue() == Some(worker.queue());
        if !owned {
            warn!(
                queue = worker.queue(),
                bound = ?self.bound_queue(),
                action,
                "controller not bound to queue, action skipped"
            );
        }
        owned
    }

    /// Enters or leaves burst mode on `worker`.
    pub fn set_burst(&mut self, worker: &Worker, enable: bool) {
        if !self.owns(worker, "set-burst") {
            return;
        }
        let mark = self.active_mark;
        if enable {
            let seed = self.link(mark).map_or(0, |l| l.window);
            worker.with_window(|w| w.enter(WindowMode::Burst, seed));
            self.interval_ms = self.clamp_interval(self.burst_interval_ms);
            return;
        }
        let frozen = worker.with_window(|w| {
            if w.mode() == WindowMode::Burst {
                Some(w.leave())
            } else {
                None
            }
        });
        if let (Some(frozen), Some(link)) = (frozen, self.link_mut(mark)) {
            if frozen > link.window {
                link.window = frozen;
            }
        }
    }

    /// Enters or leaves adaptive mode on `worker`.
    pub fn set_adapt(&mut self, worker: &Worker, enable: bool) {
        if !self.owns(worker, "set-adapt") {
            return;
        }
        if enable {
            let link = self.link(self.active_mark).unwrap_or_default();
            worker.with_window(|w| w.enter(WindowMode::Adaptive, link.window));
            self.interval_ms = self.clamp_interval(link.rtt_ms);
        } else {
            worker.with_window(|w| {
                if w.mode() == WindowMode::Adaptive {
                    w.leave();
                }
            });
        }
    }

    /// Switches the active link to `mark`.
    ///
    /// The outgoing link keeps the worker's current window when one was set;
    /// the worker is re-seeded from the incoming link with sampling disabled.
    pub fn handover(&mut self, worker: &Worker, mark: u32) {
        if !self.owns(worker, "sol-update") {
            return;
        }
        let Some(incoming) = self.link(mark) else {
            warn!(queue = worker.queue(), mark, "handover to unknown link ignored");
            return;
        };
        let outgoing = self.active_mark;
        let current = worker.with_window(|w| w.tuned());
        if current > 0 {
            if let Some(link) = self.link_mut(outgoing) {
                link.window = current;
            }
        }
        self.active_mark = mark;
        worker.with_window(|w| w.set_fixed(incoming.window));
        info!(
            queue = worker.queue(),
            from = outgoing,
            to = mark,
            window = incoming.window,
            "handover"
        );
    }
}
