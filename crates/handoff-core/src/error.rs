use thiserror::Error;

// ── Capture ─────────────────────────────────────────────────────────

/// Failure of the packet capture source (open, configure, receive, verdict).
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture socket: {0}")]
    Open(#[source] std::io::Error),
    #[error("failed to configure queue {queue}: {reason}")]
    Configure { queue: u16, reason: String },
    #[error("netlink error {errno} on queue {queue}")]
    Netlink { queue: u16, errno: i32 },
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed capture message: {0}")]
    Malformed(&'static str),
    #[error("capture source closed")]
    Closed,
}

// ── Packet headers ──────────────────────────────────────────────────

/// Header decoding failure. The pipeline treats every variant as pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("packet shorter than an IPv4 header ({0} bytes)")]
    TooShortForIp(usize),
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("invalid IPv4 header length {0}")]
    BadIhl(u8),
    #[error("not a TCP packet (protocol {0})")]
    NotTcp(u8),
    #[error("packet too short for TCP header ({0} bytes)")]
    TooShortForTcp(usize),
    #[error("invalid TCP data offset {0}")]
    BadDataOffset(u8),
}

// ── Scheduling ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("event table full ({capacity} events)")]
    Full { capacity: usize },
    #[error("events cannot be added once the scheduler is running")]
    Closed,
}

// ── Timeline ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("line {line}: missing field `{field}`")]
    MissingField { line: usize, field: &'static str },
    #[error("line {line}: invalid value `{value}` for `{field}`")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: unknown event type `{kind}`")]
    UnknownEvent { line: usize, kind: String },
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
