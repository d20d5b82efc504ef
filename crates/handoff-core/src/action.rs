//! # Actions and dispatcher
//!
//! [`Action`] is the closed catalog of reconfiguration commands a timeline can
//! schedule. The [`Dispatcher`] owns every bound queue (capture session plus
//! worker) and the adaptive controller, and applies actions to them.
//!
//! Failures never propagate: an action that cannot be applied is logged and
//! becomes a no-op, so one bad event cannot stop the run.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::{CaptureOpener, CaptureSession};
use crate::config::EmulatorConfig;
use crate::controller::{AdaptiveController, ControllerParams};
use crate::scheduler::Dispatch;
use crate::stats::QueueStatsSnapshot;
use crate::worker::Worker;

/// Queue ids must be below this.
pub const MAX_QUEUES: u16 = 0xFF;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    InitQueue { queue: u16 },
    StartQueue { queue: u16 },
    StopQueue { queue: u16 },
    TeardownQueue { queue: u16 },
    SetMark { queue: u16, mark: u32 },
    SetDrop { queue: u16, count: u32 },
    SetReorder { queue: u16, count: u32, offset: u32 },
    SetDedup { queue: u16, enable: bool },
    SetRwnd { queue: u16, window: u32 },
    SetBurst { queue: u16, enable: bool },
    SetAdapt { queue: u16, enable: bool },
    InitTcpScheduler { queue: u16, params: Box<ControllerParams> },
    SolUpdate { queue: u16, mark: u32 },
    Sleep { duration_ms: u64 },
    RunCommand { command: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::InitQueue { .. } => "init-queue",
            Action::StartQueue { .. } => "start-queue",
            Action::StopQueue { .. } => "stop-queue",
            Action::TeardownQueue { .. } => "teardown-queue",
            Action::SetMark { .. } => "set-mark",
            Action::SetDrop { .. } => "set-drop",
            Action::SetReorder { .. } => "set-reorder",
            Action::SetDedup { .. } => "set-dedup",
            Action::SetRwnd { .. } => "set-rwnd",
            Action::SetBurst { .. } => "set-burst",
            Action::SetAdapt { .. } => "set-adapt",
            Action::InitTcpScheduler { .. } => "init-tcp-scheduler",
            Action::SolUpdate { .. } => "sol-update",
            Action::Sleep { .. } => "sleep",
            Action::RunCommand { .. } => "run-command",
        }
    }

    /// Target queue, for actions that have one.
    pub fn queue(&self) -> Option<u16> {
        match *self {
            Action::InitQueue { queue }
            | Action::StartQueue { queue }
            | Action::StopQueue { queue }
            | Action::TeardownQueue { queue }
            | Action::SetMark { queue, .. }
            | Action::SetDrop { queue, .. }
            | Action::SetReorder { queue, .. }
            | Action::SetDedup { queue, .. }
            | Action::SetRwnd { queue, .. }
            | Action::SetBurst { queue, .. }
            | Action::SetAdapt { queue, .. }
            | Action::InitTcpScheduler { queue, .. }
            | Action::SolUpdate { queue, .. } => Some(queue),
            Action::Sleep { .. } | Action::RunCommand { .. } => None,
        }
    }
}

struct BoundQueue {
    worker: Arc<Worker>,
    session: CaptureSession,
}

pub struct Dispatcher {
    opener: Box<dyn CaptureOpener>,
    config: EmulatorConfig,
    queues: BTreeMap<u16, BoundQueue>,
    controller: AdaptiveController,
    /// Final counters of queues already torn down.
    retired: BTreeMap<u16, QueueStatsSnapshot>,
}

impl Dispatcher {
    pub fn new(opener: Box<dyn CaptureOpener>, config: EmulatorConfig) -> Self {
        let controller = AdaptiveController::new(config.window.clone());
        Self {
            opener,
            config,
            queues: BTreeMap::new(),
            controller,
            retired: BTreeMap::new(),
        }
    }

    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    pub fn worker(&self, queue: u16) -> Option<Arc<Worker>> {
        self.queues.get(&queue).map(|q| q.worker.clone())
    }

    pub fn bound_queues(&self) -> Vec<u16> {
        self.queues.keys().copied().collect()
    }

    /// Counters of every queue seen so far; live queues win over retired ones.
    pub fn queue_stats(&self) -> BTreeMap<u16, QueueStatsSnapshot> {
        let mut out = self.retired.clone();
        for (id, q) in &self.queues {
            out.insert(*id, q.worker.stats());
        }
        out
    }

    /// Tears down every bound queue.
    pub fn shutdown(&mut self) {
        let ids: Vec<u16> = self.queues.keys().copied().collect();
        for queue in ids {
            self.teardown(queue);
        }
    }

    pub fn execute(&mut self, action: &Action) {
        debug!(action = action.name(), queue = ?action.queue(), "executing");
        match action {
            Action::InitQueue { queue } => self.init(*queue),
            Action::StartQueue { queue } => {
                if let Some(q) = self.bound(*queue, action) {
                    q.session.start();
                }
            }
            Action::StopQueue { queue } => {
                if let Some(q) = self.bound(*queue, action) {
                    q.session.stop();
                }
            }
            Action::TeardownQueue { queue } => {
                if self.bound(*queue, action).is_some() {
                    self.teardown(*queue);
                }
            }
            Action::SetMark { queue, mark } => {
                if let Some(q) = self.bound(*queue, action) {
                    q.worker.set_mark(*mark);
                }
            }
            Action::SetDrop { queue, count } => {
                if let Some(q) = self.bound(*queue, action) {
                    q.worker.arm_drop(*count);
                }
            }
            Action::SetReorder {
                queue,
                count,
                offset,
            } => {
                if let Some(q) = self.bound(*queue, action) {
                    if *count == 0 {
                        debug!(queue, "reorder with zero count ignored");
                    } else {
                        q.worker.arm_reorder(*count, *offset);
                    }
                }
            }
            Action::SetDedup { queue, enable } => {
                if let Some(q) = self.bound(*queue, action) {
                    q.worker.set_dedup(*enable);
                }
            }
            Action::SetRwnd { queue, window } => {
                if let Some(q) = self.bound(*queue, action) {
                    q.worker.set_window(*window);
                }
            }
            Action::SetBurst { queue, enable } => {
                if let Some(worker) = self.bound(*queue, action).map(|q| q.worker.clone()) {
                    self.controller.set_burst(&worker, *enable);
                }
            }
            Action::SetAdapt { queue, enable } => {
                if let Some(worker) = self.bound(*queue, action).map(|q| q.worker.clone()) {
                    self.controller.set_adapt(&worker, *enable);
                }
            }
            Action::InitTcpScheduler { queue, params } => {
                if let Some(worker) = self.bound(*queue, action).map(|q| q.worker.clone()) {
                    self.controller.bind(worker, params);
                }
            }
            Action::SolUpdate { queue, mark } => {
                if let Some(worker) = self.bound(*queue, action).map(|q| q.worker.clone()) {
                    self.controller.handover(&worker, *mark);
                }
            }
            Action::Sleep { duration_ms } => {
                thread::sleep(Duration::from_millis(*duration_ms));
            }
            Action::RunCommand { command } => run_command(command),
        }
    }

    fn bound(&self, queue: u16, action: &Action) -> Option<&BoundQueue> {
        let q = self.queues.get(&queue);
        if q.is_none() {
            warn!(queue, action = action.name(), "queue not bound, action skipped");
        }
        q
    }

    fn init(&mut self, queue: u16) {
        if queue >= MAX_QUEUES {
            warn!(queue, max = MAX_QUEUES, "queue id out of range");
            return;
        }
        if self.queues.contains_key(&queue) {
            warn!(queue, "queue already bound");
            return;
        }
        let source = match self.opener.open(queue, &self.config.capture) {
            Ok(source) => source,
            Err(e) => {
                error!(queue, error = %e, "failed to open capture source, queue left unbound");
                return;
            }
        };
        let worker = Arc::new(Worker::new(queue, &self.config.worker, &self.config.window));
        match CaptureSession::spawn(source, worker.clone(), &self.config.capture, &self.config.trace) {
            Ok(session) => {
                info!(queue, "queue bound");
                self.queues.insert(queue, BoundQueue { worker, session });
            }
            Err(e) => error!(queue, error = %e, "failed to spawn capture thread"),
        }
    }

    fn teardown(&mut self, queue: u16) {
        let Some(mut q) = self.queues.remove(&queue) else {
            return;
        };
        self.controller.unbind_queue(queue);
        q.session.shutdown();
        let stats = q.worker.stats();
        info!(
            queue,
            seen = stats.seen,
            accepted = stats.accepted,
            dropped = stats.dropped,
            dedup_dropped = stats.dedup_dropped,
            held = stats.held,
            released = stats.released,
            rewritten = stats.rewritten,
            passthrough = stats.passthrough,
            "queue torn down"
        );
        self.retired.insert(queue, stats);
    }
}

impl Dispatch for Dispatcher {
    fn dispatch(&mut self, action: &Action) {
        self.execute(action);
    }

    fn next_tick(&self) -> Option<u64> {
        self.controller.next_fire()
    }

    fn tick(&mut self) {
        self.controller.tick();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_command(command: &str) {
    match Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if status.success() => debug!(command, "command finished"),
        Ok(status) => warn!(command, code = ?status.code(), "command exited with failure"),
        Err(e) => warn!(command, error = %e, "failed to spawn command"),
    }
}
