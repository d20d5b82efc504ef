use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, trace, warn};

use super::{CaptureSource, Packet, Verdict};
use crate::config::{CaptureConfig, TraceConfig};
use crate::error::CaptureError;
use crate::protocol::TcpSegment;
use crate::worker::{Decision, Worker};

/// Target of the per-packet sequence/ack trace lines.
pub const PACKET_TRACE_TARGET: &str = "handoff::packet";

enum Control {
    Start,
    Stop,
    Shutdown,
}

/// Capture thread bound to one queue.
///
/// The thread starts stopped. While running it receives packets, runs them
/// through the queue's [`Worker`] and issues the verdicts; while stopped it
/// only polls for control messages.
pub struct CaptureSession {
    queue: u16,
    control: Sender<Control>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureSession {
    pub fn spawn(
        source: Box<dyn CaptureSource>,
        worker: Arc<Worker>,
        config: &CaptureConfig,
        trace: &TraceConfig,
    ) -> anyhow::Result<Self> {
        let queue = source.queue();
        let (tx, rx) = unbounded();
        let idle = config.idle;
        let trace_source = trace.source;
        let handle = thread::Builder::new()
            .name(format!("capture-q{queue}"))
            .spawn(move || {
                session_loop(source, worker, rx, idle, trace_source);
            })?;
        Ok(Self {
            queue,
            control: tx,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    /// Resumes packet delivery. Returns false if the capture thread is gone.
    pub fn start(&self) -> bool {
        self.send(Control::Start, "start")
    }

    /// Pauses packet delivery. Returns false if the capture thread is gone.
    pub fn stop(&self) -> bool {
        self.send(Control::Stop, "stop")
    }

    fn send(&self, msg: Control, what: &'static str) -> bool {
        let delivered = self.control.send(msg).is_ok();
        if !delivered {
            warn!(queue = self.queue, command = what, "capture thread has exited");
        }
        delivered
    }

    /// Stops the thread and waits for it. The source is closed on the way out.
    pub fn shutdown(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(queue = self.queue, "capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies one control message. Returns false on shutdown.
fn apply(msg: Option<Control>, running: &mut bool, queue: u16) -> bool {
    match msg {
        Some(Control::Start) => {
            if !*running {
                debug!(queue, "capture started");
            }
            *running = true;
            true
        }
        Some(Control::Stop) => {
            if *running {
                debug!(queue, "capture stopped");
            }
            *running = false;
            true
        }
        Some(Control::Shutdown) | None => false,
    }
}

fn session_loop(
    mut source: Box<dyn CaptureSource>,
    worker: Arc<Worker>,
    control: Receiver<Control>,
    idle: std::time::Duration,
    trace_source: Option<std::net::Ipv4Addr>,
) {
    let queue = source.queue();
    let mut running = false;

    'outer: loop {
        loop {
            match control.try_recv() {
                Ok(msg) => {
                    if !apply(Some(msg), &mut running, queue) {
                        break 'outer;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        if !running {
            let msg = match control.recv_timeout(idle) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => None,
            };
            if !apply(msg, &mut running, queue) {
                break;
            }
            continue;
        }

        match source.receive() {
            Ok(Some(packet)) => {
                if let Some(src) = trace_source {
                    trace_packet(&packet, src);
                }
                process(source.as_mut(), &worker, &packet);
            }
            Ok(None) => {}
            Err(CaptureError::Closed) => {
                warn!(queue, "capture source closed underneath the session");
                break;
            }
            Err(e) => {
                warn!(queue, error = %e, "capture receive failed");
                thread::sleep(idle);
            }
        }
    }

    if let Err(e) = source.close() {
        warn!(queue, error = %e, "failed to close capture source");
    }
    info!(queue, "capture session ended");
}

fn process(source: &mut dyn CaptureSource, worker: &Worker, packet: &Packet) {
    let outcome = worker.handle(packet);
    if let Decision::Issue(verdict) = &outcome.decision {
        issue(source, worker, packet.id, verdict);
    }
    if !outcome.released.is_empty() {
        let release = Verdict::accept(outcome.mark);
        for id in &outcome.released {
            issue(source, worker, *id, &release);
        }
    }
}

fn issue(source: &mut dyn CaptureSource, worker: &Worker, id: u32, verdict: &Verdict) {
    if let Err(e) = source.set_verdict(id, verdict) {
        worker.record_verdict_error();
        warn!(queue = worker.queue(), id, error = %e, "verdict failed");
    }
}

fn trace_packet(packet: &Packet, src: std::net::Ipv4Addr) {
    let Ok(seg) = TcpSegment::parse(&packet.payload) else {
        return;
    };
    if seg.src != src {
        return;
    }
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    trace!(
        target: PACKET_TRACE_TARGET,
        "packet,{},{},{},{}",
        now_ms,
        seg.src_port,
        seg.seq,
        seg.ack
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureOpener, MemoryOpener};
    use crate::config::{WindowConfig, WorkerConfig};
    use crate::protocol::PacketBuilder;
    use std::time::Duration;

    fn setup() -> (CaptureSession, crate::capture::MemoryQueue, Arc<Worker>) {
        let opener = MemoryOpener::new();
        let config = CaptureConfig {
            recv_timeout: Duration::from_millis(5),
            ..Default::default()
        };
        let source = opener.open(1, &config).unwrap();
        let queue = opener.queue(1).unwrap();
        let worker = Arc::new(Worker::new(1, &WorkerConfig::default(), &WindowConfig::default()));
        let session =
            CaptureSession::spawn(source, worker.clone(), &config, &TraceConfig::default()).unwrap();
        (session, queue, worker)
    }

    #[test]
    fn stopped_session_issues_no_verdicts() {
        let (mut session, queue, _worker) = setup();
        queue.inject(1, PacketBuilder::new().build()).unwrap();
        assert!(queue.next_verdict(Duration::from_millis(50)).is_none());
        session.start();
        let (id, verdict) = queue.next_verdict(Duration::from_secs(2)).unwrap();
        assert_eq!(id, 1);
        assert_eq!(verdict, Verdict::accept(0));
        session.shutdown();
    }

    #[test]
    fn released_packets_follow_the_triggering_verdict() {
        let (mut session, queue, worker) = setup();
        worker.set_mark(5);
        worker.arm_reorder(2, 1);
        session.start();
        for id in 1..=3 {
            queue.inject(id, PacketBuilder::new().build()).unwrap();
        }
        let got = queue.collect_verdicts(3, Duration::from_secs(2));
        let ids: Vec<u32> = got.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert!(got.iter().all(|(_, v)| *v == Verdict::accept(5)));
        session.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut session, _queue, _worker) = setup();
        assert!(session.start());
        session.shutdown();
        session.shutdown();
    }

    #[test]
    fn control_after_thread_exit_is_reported() {
        let (mut session, _queue, _worker) = setup();
        session.shutdown();
        assert!(!session.start());
        assert!(!session.stop());
    }
}
