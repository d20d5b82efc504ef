//! # Timeline loader
//!
//! Turns the line-oriented experiment script into scheduled [`Action`]s.
//!
//! ```text
//! time_ms,event,args...
//! 0,INIT,0,1,5000            # or 0,0,0,1,5000
//! 1200,HANDOVER,0,2,50,3,1,0
//! ```
//!
//! | event (id)     | fields                                                         |
//! |----------------|----------------------------------------------------------------|
//! | INIT (0)       | queue, mark, end_ms                                            |
//! | CMD (1)        | shell command (rest of the line)                               |
//! | HANDOVER (2)   | queue, mark, gap_ms, reorder_count, reorder_offset, drop_count |
//! | SET_DEDUP (3)  | queue, enable                                                  |
//! | HANDLE_RW (4)  | reserved, ignored                                              |
//! | INIT_SCHED (5) | queue, rewrite, burst_ms, threshold%, pace%, start_ms, (mark, window, rtt_ms) x2 |
//! | SOLUTION (6)   | queue, mark, freeze, freeze_ms, dedup, smooth_ms, burst_ms, adapt |
//!
//! Numbers are decimal or `0x`-prefixed hex. Blank lines and lines starting
//! with `#` are skipped; malformed lines are reported and skipped.

use std::str::FromStr;

use tracing::{debug, warn};

use crate::action::Action;
use crate::controller::{ControllerParams, LinkProfile};
use crate::error::TimelineError;
use crate::scheduler::EventScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Init,
    Cmd,
    Handover,
    SetDedup,
    HandleRw,
    InitSched,
    Solution,
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_uppercase().as_str() {
            "0" | "INIT" => EventKind::Init,
            "1" | "CMD" => EventKind::Cmd,
            "2" | "HANDOVER" | "HO" => EventKind::Handover,
            "3" | "SET_DEDUP" | "HANDLEDUP" => EventKind::SetDedup,
            "4" | "HANDLE_RW" | "HANDLERW" => EventKind::HandleRw,
            "5" | "INIT_SCHED" => EventKind::InitSched,
            "6" | "SOLUTION" => EventKind::Solution,
            _ => return Err(()),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub at_ms: u64,
    pub action: Action,
    /// 1-based source line.
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    pub errors: Vec<TimelineError>,
}

impl Timeline {
    /// Parses a whole script. Malformed lines are logged and collected in
    /// `errors`; the rest still load.
    pub fn parse(text: &str) -> Self {
        let mut timeline = Timeline::default();
        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            match parse_line(line, raw) {
                Ok(actions) => timeline.entries.extend(
                    actions
                        .into_iter()
                        .map(|(at_ms, action)| TimelineEntry { at_ms, action, line }),
                ),
                Err(e) => {
                    warn!(error = %e, "skipping timeline line");
                    timeline.errors.push(e);
                }
            }
        }
        debug!(
            entries = timeline.entries.len(),
            errors = timeline.errors.len(),
            "timeline parsed"
        );
        timeline
    }

    /// Schedules every entry. Entries the scheduler rejects are logged and
    /// skipped. Returns how many were scheduled.
    pub fn schedule_into(self, scheduler: &mut EventScheduler) -> usize {
        let mut scheduled = 0;
        for entry in self.entries {
            match scheduler.schedule(entry.at_ms, entry.action) {
                Ok(()) => scheduled += 1,
                Err(e) => {
                    warn!(line = entry.line, error = %e, "event rejected");
                }
            }
        }
        scheduled
    }
}

struct Fields<'a> {
    line: usize,
    parts: std::str::Split<'a, char>,
}

fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl<'a> Fields<'a> {
    fn raw(&mut self, field: &'static str) -> Result<&'a str, TimelineError> {
        self.parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(TimelineError::MissingField {
                line: self.line,
                field,
            })
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, TimelineError> {
        let raw = self.raw(field)?;
        parse_number(raw).ok_or_else(|| TimelineError::InvalidField {
            line: self.line,
            field,
            value: raw.to_string(),
        })
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, TimelineError> {
        let line = self.line;
        let v = self.u64(field)?;
        u32::try_from(v).map_err(|_| TimelineError::InvalidField {
            line,
            field,
            value: v.to_string(),
        })
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, TimelineError> {
        let line = self.line;
        let v = self.u64(field)?;
        u16::try_from(v).map_err(|_| TimelineError::InvalidField {
            line,
            field,
            value: v.to_string(),
        })
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, TimelineError> {
        Ok(self.u64(field)? > 0)
    }

    fn rest(self) -> String {
        self.parts.collect::<Vec<_>>().join(",").trim().to_string()
    }
}

/// Parses one script line into `(fire_ms, action)` pairs in insertion order.
/// Blank and comment lines yield nothing.
pub fn parse_line(line: usize, text: &str) -> Result<Vec<(u64, Action)>, TimelineError> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(Vec::new());
    }
    let mut f = Fields {
        line,
        parts: text.split(','),
    };
    let t = f.u64("time_ms")?;
    let kind_raw = f.raw("event")?;
    let kind = kind_raw
        .parse::<EventKind>()
        .map_err(|_| TimelineError::UnknownEvent {
            line,
            kind: kind_raw.to_string(),
        })?;

    let mut out = Vec::new();
    match kind {
        EventKind::Init => {
            let queue = f.u16("queue")?;
            let mark = f.u32("mark")?;
            let end = f.u64("end_ms")?;
            out.push((t, Action::InitQueue { queue }));
            out.push((t, Action::StartQueue { queue }));
            if mark > 0 {
                out.push((t, Action::SetMark { queue, mark }));
            }
            out.push((end, Action::TeardownQueue { queue }));
        }
        EventKind::Cmd => {
            let command = f.rest();
            if command.is_empty() {
                return Err(TimelineError::MissingField {
                    line,
                    field: "command",
                });
            }
            out.push((t, Action::RunCommand { command }));
        }
        EventKind::Handover => {
            let queue = f.u16("queue")?;
            let mark = f.u32("mark")?;
            let gap = f.u64("gap_ms")?;
            let reorder_count = f.u32("reorder_count")?;
            let reorder_offset = f.u32("reorder_offset")?;
            let drop_count = f.u32("drop_count")?;
            out.push((t, Action::StopQueue { queue }));
            out.push((t.saturating_add(gap), Action::StartQueue { queue }));
            out.push((t, Action::SetMark { queue, mark }));
            if drop_count > 0 {
                out.push((
                    t,
                    Action::SetDrop {
                        queue,
                        count: drop_count,
                    },
                ));
            }
            if reorder_count > 0 {
                out.push((
                    t,
                    Action::SetReorder {
                        queue,
                        count: reorder_count,
                        offset: reorder_offset,
                    },
                ));
            }
        }
        EventKind::SetDedup => {
            let queue = f.u16("queue")?;
            let enable = f.flag("enable")?;
            out.push((t, Action::SetDedup { queue, enable }));
        }
        EventKind::HandleRw => {
            debug!(line, "reserved HANDLE_RW event ignored");
        }
        EventKind::InitSched => {
            let queue = f.u16("queue")?;
            let enable_rewrite = f.flag("rewrite")?;
            let burst_interval_ms = f.u64("burst_ms")?;
            let threshold = f.u64("threshold")? as f64 / 100.0;
            let pace = f.u64("pace")? as f64 / 100.0;
            let start_ms = f.u64("start_ms")?;
            let mut links = [LinkProfile::default(); 2];
            for link in &mut links {
                link.mark = f.u32("link_mark")?;
                link.window = f.u32("link_window")?;
                link.rtt_ms = f.u64("link_rtt_ms")?;
            }
            out.push((
                t,
                Action::InitTcpScheduler {
                    queue,
                    params: Box::new(ControllerParams {
                        enable_rewrite,
                        start_ms,
                        burst_interval_ms,
                        threshold,
                        pace,
                        links,
                    }),
                },
            ));
        }
        EventKind::Solution => {
            let queue = f.u16("queue")?;
            let mark = f.u32("mark")?;
            let freeze = f.flag("freeze")?;
            let freeze_ms = f.u64("freeze_ms")?;
            let dedup = f.flag("dedup")?;
            let smooth_ms = f.u64("smooth_ms")?;
            let burst_ms = f.u64("burst_ms")?;
            let adapt = f.flag("adapt")?;

            out.push((t, Action::SolUpdate { queue, mark }));
            if freeze {
                out.push((t, Action::SetRwnd { queue, window: 0 }));
            }
            let resume = t.saturating_add(freeze_ms);
            if dedup {
                out.push((
                    resume,
                    Action::SetDedup {
                        queue,
                        enable: true,
                    },
                ));
                out.push((
                    resume.saturating_add(smooth_ms),
                    Action::SetDedup {
                        queue,
                        enable: false,
                    },
                ));
            }
            if burst_ms > 0 {
                out.push((
                    resume,
                    Action::SetBurst {
                        queue,
                        enable: true,
                    },
                ));
                out.push((
                    resume.saturating_add(burst_ms),
                    Action::SetBurst {
                        queue,
                        enable: false,
                    },
                ));
            }
            if adapt {
                out.push((
                    resume.saturating_add(burst_ms),
                    Action::SetAdapt {
                        queue,
                        enable: true,
                    },
                ));
            }
        }
    }
    Ok(out)
}
