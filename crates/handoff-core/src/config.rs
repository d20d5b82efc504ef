use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

/// Kernel queue depth bound for one capture session.
pub const DEFAULT_QUEUE_MAXLEN: u32 = 4096;
/// Largest packet copied to user space.
pub const DEFAULT_COPY_RANGE: u32 = 0xFFFF;
/// Event table capacity.
pub const DEFAULT_MAX_EVENTS: usize = 0xFFFF;
pub const DEFAULT_REORDER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmulatorConfigInput {
    pub version: u32,
    pub scheduler: SchedulerConfigInput,
    pub capture: CaptureConfigInput,
    pub worker: WorkerConfigInput,
    pub window: WindowConfigInput,
    pub trace: TraceConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub tick_ms: Option<u64>,
    pub max_events: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfigInput {
    pub queue_maxlen: Option<u32>,
    pub copy_range: Option<u32>,
    pub recv_timeout_ms: Option<u64>,
    pub idle_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfigInput {
    pub reorder_capacity: Option<usize>,
    pub min_window: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowConfigInput {
    pub scale_shift: Option<u32>,
    pub low_utilization: Option<f64>,
    pub ack_resync_bytes: Option<u32>,
    pub min_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TraceConfigInput {
    pub source: Option<String>,
}

/// Event scheduler pacing.
///
/// The scheduler waits for each fire time by sleeping in fixed ticks against a
/// monotonic clock. A smaller tick lowers dispatch jitter at the cost of more
/// wakeups.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub max_events: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub queue_maxlen: u32,
    pub copy_range: u32,
    /// Upper bound on how long a blocked receive can delay a control message.
    pub recv_timeout: Duration,
    /// Sleep between control polls while the queue is stopped.
    pub idle: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_maxlen: DEFAULT_QUEUE_MAXLEN,
            copy_range: DEFAULT_COPY_RANGE,
            recv_timeout: Duration::from_millis(100),
            idle: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub reorder_capacity: usize,
    pub min_window: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reorder_capacity: DEFAULT_REORDER_CAPACITY,
            min_window: 10,
        }
    }
}

/// Receive-window controller tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// Bytes are converted to window units with `>> scale_shift`.
    pub scale_shift: u32,
    /// Utilization below which the adaptive regime shrinks the window.
    pub low_utilization: f64,
    /// Ack advances larger than this are treated as a resync, not throughput.
    pub ack_resync_bytes: u32,
    pub min_interval_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            scale_shift: 10,
            low_utilization: 0.7,
            ack_resync_bytes: 64 * 1024 * 1024,
            min_interval_ms: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceConfig {
    /// Packets from this source address produce `handoff::packet` trace lines.
    pub source: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmulatorConfig {
    pub version: u32,
    pub scheduler: SchedulerConfig,
    pub capture: CaptureConfig,
    pub worker: WorkerConfig,
    pub window: WindowConfig,
    pub trace: TraceConfig,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            scheduler: SchedulerConfig::default(),
            capture: CaptureConfig::default(),
            worker: WorkerConfig::default(),
            window: WindowConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl EmulatorConfigInput {
    pub fn resolve(self) -> Result<EmulatorConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let sched_default = SchedulerConfig::default();
        let tick_ms = self
            .scheduler
            .tick_ms
            .unwrap_or(sched_default.tick.as_millis() as u64);
        if tick_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.tick_ms",
                reason: "must be at least 1".into(),
            });
        }
        let scheduler = SchedulerConfig {
            tick: Duration::from_millis(tick_ms),
            max_events: self
                .scheduler
                .max_events
                .unwrap_or(sched_default.max_events)
                .max(1),
        };

        let cap_default = CaptureConfig::default();
        let copy_range = self.capture.copy_range.unwrap_or(cap_default.copy_range);
        if !(64..=DEFAULT_COPY_RANGE).contains(&copy_range) {
            return Err(ConfigError::Invalid {
                key: "capture.copy_range",
                reason: format!("{} outside 64..=65535", copy_range),
            });
        }
        let capture = CaptureConfig {
            queue_maxlen: self
                .capture
                .queue_maxlen
                .unwrap_or(cap_default.queue_maxlen)
                .max(1),
            copy_range,
            recv_timeout: self
                .capture
                .recv_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(cap_default.recv_timeout)
                .max(Duration::from_millis(1)),
            idle: self
                .capture
                .idle_ms
                .map(Duration::from_millis)
                .unwrap_or(cap_default.idle),
        };

        let worker_default = WorkerConfig::default();
        let worker = WorkerConfig {
            reorder_capacity: self
                .worker
                .reorder_capacity
                .unwrap_or(worker_default.reorder_capacity)
                .max(1),
            min_window: self.worker.min_window.unwrap_or(worker_default.min_window),
        };

        let window_default = WindowConfig::default();
        let low_utilization = self
            .window
            .low_utilization
            .unwrap_or(window_default.low_utilization);
        if !(0.0..=1.0).contains(&low_utilization) {
            return Err(ConfigError::Invalid {
                key: "window.low_utilization",
                reason: format!("{} outside 0.0..=1.0", low_utilization),
            });
        }
        let scale_shift = self.window.scale_shift.unwrap_or(window_default.scale_shift);
        if scale_shift > 16 {
            return Err(ConfigError::Invalid {
                key: "window.scale_shift",
                reason: format!("{} exceeds 16", scale_shift),
            });
        }
        let window = WindowConfig {
            scale_shift,
            low_utilization,
            ack_resync_bytes: self
                .window
                .ack_resync_bytes
                .unwrap_or(window_default.ack_resync_bytes)
                .clamp(1, i32::MAX as u32),
            min_interval_ms: self
                .window
                .min_interval_ms
                .unwrap_or(window_default.min_interval_ms)
                .max(1),
        };

        let source = match self.trace.source {
            Some(raw) if !raw.trim().is_empty() => {
                Some(raw.trim().parse::<Ipv4Addr>().map_err(|e| ConfigError::Invalid {
                    key: "trace.source",
                    reason: e.to_string(),
                })?)
            }
            _ => None,
        };

        Ok(EmulatorConfig {
            version,
            scheduler,
            capture,
            worker,
            window,
            trace: TraceConfig { source },
        })
    }
}

impl EmulatorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EmulatorConfig::default());
        }
        let parsed: EmulatorConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}
