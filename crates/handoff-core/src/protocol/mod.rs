//! IPv4/TCP header access for the packet pipeline.

pub mod tcp;

pub use tcp::{PacketBuilder, TcpSegment};
