//! # Integration tests: timeline → scheduler → dispatcher → capture pipeline
//!
//! Queues are in-memory ([`MemoryOpener`]), so packets are injected and their
//! verdicts observed without touching the kernel. Scripted runs use a
//! [`ManualClock`] and finish instantly.

use std::time::Duration;

use bytes::Bytes;
use handoff_core::action::{Action, Dispatcher};
use handoff_core::capture::{MemoryOpener, MemoryQueue, Verdict};
use handoff_core::config::EmulatorConfig;
use handoff_core::protocol::tcp::tcp_checksum_valid;
use handoff_core::protocol::{PacketBuilder, TcpSegment};
use handoff_core::scheduler::{EventScheduler, Fired, ManualClock};
use handoff_core::stats::RunReport;
use handoff_core::timeline::Timeline;

const WAIT: Duration = Duration::from_secs(2);

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Routes library logs through the test harness (`RUST_LOG` selects levels).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn bound_queue(queue: u16) -> (Dispatcher, MemoryQueue) {
    init_tracing();
    let opener = MemoryOpener::new();
    let mut d = Dispatcher::new(Box::new(opener.clone()), EmulatorConfig::default());
    d.execute(&Action::InitQueue { queue });
    d.execute(&Action::StartQueue { queue });
    let q = opener.queue(queue).expect("queue opened");
    (d, q)
}

fn data(seq: u32) -> Bytes {
    PacketBuilder::new().seq(seq).payload(&[0u8; 100]).build()
}

fn pure_ack(ack: u32) -> Bytes {
    PacketBuilder::new().ack(ack).build()
}

fn ids(verdicts: &[(u32, Verdict)]) -> Vec<u32> {
    verdicts.iter().map(|(id, _)| *id).collect()
}

// ─── Packet pipeline ────────────────────────────────────────────────────────

#[test]
fn accepted_packets_carry_the_current_mark() {
    let (mut d, q) = bound_queue(0);
    d.execute(&Action::SetMark { queue: 0, mark: 7 });

    q.inject(1, data(1)).unwrap();
    let (id, verdict) = q.next_verdict(WAIT).expect("verdict");
    assert_eq!(id, 1);
    assert_eq!(verdict, Verdict::accept(7));

    d.execute(&Action::TeardownQueue { queue: 0 });
    let stats = d.queue_stats()[&0].clone();
    assert_eq!(stats.seen, 1);
    assert_eq!(stats.accepted, 1);
}

#[test]
fn handover_drops_then_reorders() {
    let (mut d, q) = bound_queue(0);
    d.execute(&Action::StopQueue { queue: 0 });
    d.execute(&Action::SetMark { queue: 0, mark: 2 });
    d.execute(&Action::SetDrop { queue: 0, count: 2 });
    d.execute(&Action::SetReorder {
        queue: 0,
        count: 3,
        offset: 1,
    });

    for id in 1..=7 {
        q.inject(id, data(id * 100)).unwrap();
    }
    // Stopped: nothing is read.
    assert!(q.next_verdict(Duration::from_millis(100)).is_none());

    d.execute(&Action::StartQueue { queue: 0 });
    let verdicts = q.collect_verdicts(7, WAIT);
    assert_eq!(ids(&verdicts), vec![1, 2, 6, 5, 4, 3, 7]);
    assert_eq!(verdicts[0].1, Verdict::Drop);
    assert_eq!(verdicts[1].1, Verdict::Drop);
    for (_, v) in &verdicts[2..] {
        assert_eq!(*v, Verdict::accept(2));
    }

    let stats = d.worker(0).unwrap().stats();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.held, 3);
    assert_eq!(stats.released, 3);
}

#[test]
fn duplicate_pure_acks_are_suppressed() {
    let (mut d, q) = bound_queue(0);
    d.execute(&Action::SetDedup {
        queue: 0,
        enable: true,
    });

    q.inject(1, pure_ack(100)).unwrap();
    q.inject(2, pure_ack(100)).unwrap();
    q.inject(3, PacketBuilder::new().ack(100).payload(b"data").build())
        .unwrap();
    q.inject(4, pure_ack(200)).unwrap();

    let verdicts = q.collect_verdicts(4, WAIT);
    assert_eq!(ids(&verdicts), vec![1, 2, 3, 4]);
    assert_eq!(verdicts[1].1, Verdict::Drop);
    assert!(matches!(verdicts[0].1, Verdict::Accept { .. }));
    assert!(matches!(verdicts[2].1, Verdict::Accept { .. }));
    assert!(matches!(verdicts[3].1, Verdict::Accept { .. }));

    d.execute(&Action::SetDedup {
        queue: 0,
        enable: false,
    });
    q.inject(5, pure_ack(200)).unwrap();
    assert!(matches!(
        q.next_verdict(WAIT),
        Some((5, Verdict::Accept { .. }))
    ));
    assert_eq!(d.worker(0).unwrap().stats().dedup_dropped, 1);
}

#[test]
fn fixed_window_is_rewritten_with_valid_checksum() {
    let (mut d, q) = bound_queue(0);
    d.execute(&Action::SetRwnd {
        queue: 0,
        window: 300,
    });

    q.inject(1, PacketBuilder::new().ack(5).window(0xFFFF).build())
        .unwrap();
    q.inject(2, PacketBuilder::new().ack(6).window(200).build())
        .unwrap();

    let verdicts = q.collect_verdicts(2, WAIT);
    let Verdict::Accept {
        payload: Some(rewritten),
        ..
    } = &verdicts[0].1
    else {
        panic!("expected rewritten payload, got {:?}", verdicts[0].1);
    };
    let seg = TcpSegment::parse(rewritten).unwrap();
    assert_eq!(seg.window, 300);
    assert!(tcp_checksum_valid(rewritten, &seg));

    // Already below the tuned window: untouched.
    assert_eq!(verdicts[1].1, Verdict::accept(0));
}

#[test]
fn non_tcp_packets_pass_through() {
    let (_d, q) = bound_queue(0);
    q.inject(1, Bytes::from_static(&[0x60, 0, 0, 0])).unwrap();
    assert_eq!(q.next_verdict(WAIT), Some((1, Verdict::accept(0))));
}

// ─── Scripted runs ──────────────────────────────────────────────────────────

const SCRIPT: &str = "\
# queue 0 lives for one second on link 1, hands over to link 2 at 500 ms
0,INIT,0,1,1000
0,INIT_SCHED,0,1,20,90,10,0,1,500,40,2,2000,80
500,HANDOVER,0,2,50,0,0,0
500,SOLUTION,0,2,0,0,0,0,0,1
";

#[test]
fn scripted_run_interleaves_controller_ticks() {
    init_tracing();
    let opener = MemoryOpener::new();
    let config = EmulatorConfig::default();
    let mut sched = EventScheduler::new(&config.scheduler).with_tick_trace(true);
    let mut dispatcher = Dispatcher::new(Box::new(opener.clone()), config);

    let timeline = Timeline::parse(SCRIPT);
    assert!(timeline.errors.is_empty());
    let scheduled = timeline.schedule_into(&mut sched);
    // init, start, mark, teardown, init-sched, stop, start, mark, sol, adapt
    assert_eq!(scheduled, 10);

    let summary = sched.run(&mut dispatcher, &ManualClock::new());
    assert!(!summary.interrupted);
    assert_eq!(summary.events_executed, 10);

    // Link 1 ticks every 40 ms until the handover; adaptive mode on link 2
    // ticks every 80 ms from the last fire until teardown at 1000 ms.
    let ticks: Vec<u64> = summary
        .fired
        .iter()
        .filter_map(|f| match f {
            Fired::Tick { fire_ms } => Some(*fire_ms),
            Fired::Event { .. } => None,
        })
        .collect();
    let expected: Vec<u64> = (1..=12)
        .map(|i| i * 40)
        .chain((0..6).map(|i| 560 + i * 80))
        .collect();
    assert_eq!(ticks, expected);
    assert_eq!(summary.ticks, dispatcher.controller().ticks());

    for pair in summary.fired.windows(2) {
        assert!(pair[0].fire_ms() <= pair[1].fire_ms());
    }

    assert_eq!(dispatcher.controller().active_mark(), 2);
    assert!(dispatcher.bound_queues().is_empty());
    assert_eq!(dispatcher.controller().bound_queue(), None);
    assert_eq!(opener.opened(), vec![0]);

    let report = RunReport {
        run_id: "it".into(),
        events_scheduled: scheduled,
        events_executed: summary.events_executed,
        controller_ticks: summary.ticks,
        interrupted: summary.interrupted,
        elapsed_ms: summary.elapsed_ms,
        queues: dispatcher.queue_stats(),
    };
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["events_executed"], 10);
    assert!(json["queues"]["0"].is_object());
}

#[test]
fn malformed_lines_do_not_stop_the_run() {
    init_tracing();
    let opener = MemoryOpener::new();
    let config = EmulatorConfig::default();
    let mut sched = EventScheduler::new(&config.scheduler);
    let mut dispatcher = Dispatcher::new(Box::new(opener.clone()), config);

    let timeline = Timeline::parse("0,INIT,1,0,100\n10,NOPE,1\n20,3,1,1\n30,2,9,1,0,0,0,0\n");
    assert_eq!(timeline.errors.len(), 1);
    timeline.schedule_into(&mut sched);

    // The handover on unbound queue 9 is skipped with a warning.
    let summary = sched.run(&mut dispatcher, &ManualClock::new());
    assert_eq!(summary.events_executed, 7);
    assert!(dispatcher.queue_stats().contains_key(&1));
    assert!(!dispatcher.queue_stats().contains_key(&9));
}
