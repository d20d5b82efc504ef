//! Handover emulation core.
//!
//! Intercepts live TCP packets through a kernel packet queue and applies a
//! scripted, time-ordered sequence of manipulations that reproduce the
//! network-layer side effects of a mobile handover between two radio links:
//! path marking, receive-window tuning, drops, reordering and duplicate-ACK
//! suppression. A closed-loop controller retunes the receive window from
//! observed throughput on the same clock as the scripted actions.

pub mod action;
pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod timeline;
pub mod worker;
