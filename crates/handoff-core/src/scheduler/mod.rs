//! # Event scheduler
//!
//! Single real-time loop that merges the scripted actions with the adaptive
//! controller's recurring tick.
//!
//! Events are collected up front and sorted once by `(fire_ms, index)`. The
//! loop then repeatedly picks the earlier of the next scripted event and the
//! controller's next fire time (ties go to the scripted event), waits until
//! that time has elapsed since the run started, and executes it on the calling
//! thread. The run ends when the last scripted event has executed.
//!
//! Waiting is a fixed-tick sleep loop against a monotonic [`Clock`]: a smaller
//! tick lowers dispatch jitter at the cost of more wakeups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::action::Action;
use crate::config::SchedulerConfig;
use crate::error::ScheduleError;

pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

/// Executes what the scheduler picks.
pub trait Dispatch {
    fn dispatch(&mut self, action: &Action);

    /// Controller fire time in run-relative milliseconds, if it is bound.
    fn next_tick(&self) -> Option<u64>;

    fn tick(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEvent {
    pub fire_ms: u64,
    pub action: Action,
    index: usize,
}

impl ScheduledEvent {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// One executed entry, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    /// Scripted event, by insertion index.
    Event { index: usize, fire_ms: u64 },
    Tick { fire_ms: u64 },
}

impl Fired {
    pub fn fire_ms(&self) -> u64 {
        match *self {
            Fired::Event { fire_ms, .. } | Fired::Tick { fire_ms } => fire_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fired: Vec<Fired>,
    pub events_executed: usize,
    pub ticks: u64,
    pub interrupted: bool,
    pub elapsed_ms: u64,
}

pub struct EventScheduler {
    events: Vec<ScheduledEvent>,
    capacity: usize,
    tick: Duration,
    closed: bool,
    stop: Option<Arc<AtomicBool>>,
    trace_ticks: bool,
}

impl EventScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            events: Vec::new(),
            capacity: config.max_events,
            tick: config.tick,
            closed: false,
            stop: None,
            trace_ticks: false,
        }
    }

    /// Ends the run early once `flag` is set.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Also records controller ticks in [`RunSummary::fired`].
    pub fn with_tick_trace(mut self, enabled: bool) -> Self {
        self.trace_ticks = enabled;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[ScheduledEvent] {
        &self.events
    }

    pub fn schedule(&mut self, fire_ms: u64, action: Action) -> Result<(), ScheduleError> {
        if self.closed {
            return Err(ScheduleError::Closed);
        }
        if self.events.len() >= self.capacity {
            return Err(ScheduleError::Full {
                capacity: self.capacity,
            });
        }
        let index = self.events.len();
        self.events.push(ScheduledEvent {
            fire_ms,
            action,
            index,
        });
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Sleeps in ticks until `fire_ms` has elapsed since `origin`.
    /// Returns false if the stop flag was raised while waiting.
    fn wait_until(&self, clock: &dyn Clock, origin: u64, fire_ms: u64) -> bool {
        while clock.now_ms().saturating_sub(origin) < fire_ms {
            if self.stopped() {
                return false;
            }
            clock.sleep(self.tick);
        }
        !self.stopped()
    }

    /// Runs every scheduled event against `dispatcher`. Scheduling is closed
    /// from here on.
    pub fn run<D: Dispatch + ?Sized>(&mut self, dispatcher: &mut D, clock: &dyn Clock) -> RunSummary {
        self.closed = true;
        self.events.sort_by_key(|e| (e.fire_ms, e.index));

        let origin = clock.now_ms();
        let mut summary = RunSummary::default();
        info!(events = self.events.len(), tick_ms = self.tick.as_millis() as u64, "run started");

        let mut cursor = 0;
        while cursor < self.events.len() {
            let event_fire = self.events[cursor].fire_ms;
            let tick_fire = dispatcher.next_tick().filter(|t| *t < event_fire);

            let fire_ms = tick_fire.unwrap_or(event_fire);
            if !self.wait_until(clock, origin, fire_ms) {
                warn!(remaining = self.events.len() - cursor, "run interrupted");
                summary.interrupted = true;
                break;
            }

            match tick_fire {
                Some(fire_ms) => {
                    dispatcher.tick();
                    summary.ticks += 1;
                    if self.trace_ticks {
                        summary.fired.push(Fired::Tick { fire_ms });
                    }
                }
                None => {
                    let event = &self.events[cursor];
                    debug!(
                        index = event.index,
                        fire_ms = event.fire_ms,
                        action = event.action.name(),
                        "event"
                    );
                    dispatcher.dispatch(&event.action);
                    summary.fired.push(Fired::Event {
                        index: event.index,
                        fire_ms: event.fire_ms,
                    });
                    summary.events_executed += 1;
                    cursor += 1;
                }
            }
        }

        summary.elapsed_ms = clock.now_ms().saturating_sub(origin);
        info!(
            executed = summary.events_executed,
            ticks = summary.ticks,
            elapsed_ms = summary.elapsed_ms,
            interrupted = summary.interrupted,
            "run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Records dispatched actions and emulates a controller firing every
    /// `interval` ms from 0 once `bound`.
    #[derive(Default)]
    struct Recorder {
        dispatched: Vec<Action>,
        next: Option<u64>,
        interval: u64,
        ticks: u64,
    }

    impl Dispatch for Recorder {
        fn dispatch(&mut self, action: &Action) {
            self.dispatched.push(action.clone());
        }

        fn next_tick(&self) -> Option<u64> {
            self.next
        }

        fn tick(&mut self) {
            self.ticks += 1;
            self.next = self.next.map(|n| n + self.interval);
        }
    }

    fn sleep(ms: u64) -> Action {
        Action::Sleep { duration_ms: ms }
    }

    fn config(max_events: usize) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(10),
            max_events,
        }
    }

    #[test]
    fn executes_in_time_order_with_stable_ties() {
        let mut sched = EventScheduler::new(&config(16));
        sched.schedule(200, sleep(0)).unwrap();
        sched.schedule(100, sleep(1)).unwrap();
        sched.schedule(100, sleep(2)).unwrap();
        sched.schedule(0, sleep(3)).unwrap();

        let mut rec = Recorder::default();
        let clock = ManualClock::new();
        let summary = sched.run(&mut rec, &clock);

        assert_eq!(rec.dispatched, vec![sleep(3), sleep(1), sleep(2), sleep(0)]);
        assert_eq!(summary.events_executed, 4);
        assert!(clock.now_ms() >= 200);
        assert!(!summary.interrupted);
    }

    #[test]
    fn ticks_interleave_and_ties_favor_events() {
        let mut sched = EventScheduler::new(&config(16)).with_tick_trace(true);
        sched.schedule(20, sleep(0)).unwrap();
        sched.schedule(35, sleep(1)).unwrap();

        let mut rec = Recorder {
            next: Some(10),
            interval: 10,
            ..Default::default()
        };
        let summary = sched.run(&mut rec, &ManualClock::new());

        assert_eq!(
            summary.fired,
            vec![
                Fired::Tick { fire_ms: 10 },
                Fired::Event { index: 0, fire_ms: 20 },
                Fired::Tick { fire_ms: 20 },
                Fired::Tick { fire_ms: 30 },
                Fired::Event { index: 1, fire_ms: 35 },
            ]
        );
        assert_eq!(summary.ticks, 3);
    }

    #[test]
    fn controller_alone_never_extends_the_run() {
        let mut sched = EventScheduler::new(&config(4));
        let mut rec = Recorder {
            next: Some(0),
            interval: 1,
            ..Default::default()
        };
        let summary = sched.run(&mut rec, &ManualClock::new());
        assert_eq!(summary.ticks, 0);
        assert_eq!(summary.events_executed, 0);
    }

    #[test]
    fn events_keep_insertion_order_until_run() {
        let mut sched = EventScheduler::new(&config(8));
        sched.schedule(50, sleep(0)).unwrap();
        sched.schedule(10, sleep(1)).unwrap();
        let pending: Vec<(u64, usize)> = sched.events().iter().map(|e| (e.fire_ms, e.index())).collect();
        assert_eq!(pending, vec![(50, 0), (10, 1)]);

        sched.run(&mut Recorder::default(), &ManualClock::new());
        let sorted: Vec<(u64, usize)> = sched.events().iter().map(|e| (e.fire_ms, e.index())).collect();
        assert_eq!(sorted, vec![(10, 1), (50, 0)]);
    }

    #[test]
    fn full_table_rejects_and_closed_after_run() {
        let mut sched = EventScheduler::new(&config(2));
        sched.schedule(0, sleep(0)).unwrap();
        sched.schedule(0, sleep(0)).unwrap();
        assert_eq!(
            sched.schedule(0, sleep(0)),
            Err(ScheduleError::Full { capacity: 2 })
        );

        sched.run(&mut Recorder::default(), &ManualClock::new());
        let mut sched2 = EventScheduler::new(&config(2));
        sched2.run(&mut Recorder::default(), &ManualClock::new());
        assert_eq!(sched2.schedule(5, sleep(0)), Err(ScheduleError::Closed));
    }

    #[test]
    fn stop_flag_interrupts() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut sched = EventScheduler::new(&config(4)).with_stop_flag(flag);
        sched.schedule(1000, sleep(0)).unwrap();
        let mut rec = Recorder::default();
        let summary = sched.run(&mut rec, &ManualClock::new());
        assert!(summary.interrupted);
        assert!(rec.dispatched.is_empty());
    }

    proptest! {
        #[test]
        fn order_law(times in proptest::collection::vec(0u64..500, 0..40)) {
            let mut sched = EventScheduler::new(&config(64));
            for (i, t) in times.iter().enumerate() {
                sched.schedule(*t, sleep(i as u64)).unwrap();
            }
            let summary = sched.run(&mut Recorder::default(), &ManualClock::new());

            let order: Vec<(u64, usize)> = summary
                .fired
                .iter()
                .map(|f| match *f {
                    Fired::Event { index, fire_ms } => (fire_ms, index),
                    Fired::Tick { .. } => unreachable!(),
                })
                .collect();
            prop_assert_eq!(order.len(), times.len());
            for pair in order.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
