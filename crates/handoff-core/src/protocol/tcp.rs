//! # IPv4 / TCP header view
//!
//! Zero-copy accessors over an intercepted IPv4 packet carrying TCP, plus the
//! one mutation the pipeline performs: overwriting the advertised receive
//! window and recomputing the TCP checksum.
//!
//! ```text
//!  IPv4 (IHL*4 bytes)        TCP (doff*4 bytes)
//! +------------------------+-------------------------------------------+
//! | .. proto=6 .. src dst  | sport dport seq ack off|flags window csum |
//! +------------------------+-------------------------------------------+
//!                            0     2     4   8   12         14     16
//! ```

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ParseError;

pub const IPV4_MIN_HEADER: usize = 20;
pub const TCP_MIN_HEADER: usize = 20;
pub const IPPROTO_TCP: u8 = 6;

const TCP_WINDOW_OFFSET: usize = 14;
const TCP_CHECKSUM_OFFSET: usize = 16;

/// Decoded header fields of an IPv4/TCP packet.
///
/// Offsets are relative to the start of the IP header. `end` is the end of the
/// TCP segment: the IP total length, bounded by the captured length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    ip_header_len: usize,
    tcp_header_len: usize,
    end: usize,
}

impl TcpSegment {
    /// Parses the IPv4 and TCP headers of `packet`.
    pub fn parse(packet: &[u8]) -> Result<Self, ParseError> {
        if packet.len() < IPV4_MIN_HEADER {
            return Err(ParseError::TooShortForIp(packet.len()));
        }
        let version = packet[0] >> 4;
        if version != 4 {
            return Err(ParseError::NotIpv4(version));
        }
        let ihl = packet[0] & 0x0F;
        if ihl < 5 {
            return Err(ParseError::BadIhl(ihl));
        }
        let ip_header_len = ihl as usize * 4;
        let protocol = packet[9];
        if protocol != IPPROTO_TCP {
            return Err(ParseError::NotTcp(protocol));
        }
        if packet.len() < ip_header_len + TCP_MIN_HEADER {
            return Err(ParseError::TooShortForTcp(packet.len()));
        }

        let tcp = &packet[ip_header_len..];
        let doff = tcp[12] >> 4;
        if doff < 5 {
            return Err(ParseError::BadDataOffset(doff));
        }

        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let end = if total_len >= ip_header_len + TCP_MIN_HEADER {
            total_len.min(packet.len())
        } else {
            packet.len()
        };

        Ok(Self {
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
            src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
            dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
            seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
            window: u16::from_be_bytes([tcp[14], tcp[15]]),
            ip_header_len,
            tcp_header_len: doff as usize * 4,
            end,
        })
    }

    /// Bytes of TCP payload carried after the TCP header (options included in the header).
    pub fn payload_len(&self) -> usize {
        self.end
            .saturating_sub(self.ip_header_len + self.tcp_header_len)
    }

    /// True when the segment carries no payload (pure acknowledgment).
    pub fn is_ack_only(&self) -> bool {
        self.payload_len() == 0
    }

    fn segment_range(&self) -> std::ops::Range<usize> {
        self.ip_header_len..self.end
    }
}

/// Overwrites the advertised window of the TCP segment in `packet` and
/// recomputes the TCP checksum. `seg` must have been parsed from `packet`.
pub fn rewrite_window(packet: &mut [u8], seg: &TcpSegment, window: u16) {
    let base = seg.ip_header_len;
    packet[base + TCP_WINDOW_OFFSET..base + TCP_WINDOW_OFFSET + 2]
        .copy_from_slice(&window.to_be_bytes());
    packet[base + TCP_CHECKSUM_OFFSET..base + TCP_CHECKSUM_OFFSET + 2].copy_from_slice(&[0, 0]);
    let csum = tcp_checksum(packet, seg);
    packet[base + TCP_CHECKSUM_OFFSET..base + TCP_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&csum.to_be_bytes());
}

/// TCP checksum over the IPv4 pseudo-header and the segment as currently
/// stored in `packet` (the checksum field is included as-is).
pub fn tcp_checksum(packet: &[u8], seg: &TcpSegment) -> u16 {
    let range = seg.segment_range();
    let segment_len = range.len() as u32;
    let mut sum = 0u32;
    sum = add_words(sum, &seg.src.octets());
    sum = add_words(sum, &seg.dst.octets());
    sum += IPPROTO_TCP as u32;
    sum += segment_len;
    sum = add_words(sum, &packet[range]);
    !fold(sum)
}

/// True when the stored TCP checksum of `packet` is consistent.
pub fn tcp_checksum_valid(packet: &[u8], seg: &TcpSegment) -> bool {
    tcp_checksum(packet, seg) == 0
}

/// Internet checksum of an IPv4 header (checksum field included as-is).
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !fold(add_words(0, header))
}

fn add_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Builds well-formed IPv4/TCP packets with valid checksums.
///
/// Used by the in-memory capture source, tests and benchmarks.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    window: u16,
    payload: Vec<u8>,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 5201,
            dst_port: 40000,
            seq: 1,
            ack: 1,
            window: 0xFFFF,
            payload: Vec::new(),
        }
    }
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addrs(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.src = src;
        self.dst = dst;
        self
    }

    pub fn ports(mut self, src: u16, dst: u16) -> Self {
        self.src_port = src;
        self.dst_port = dst;
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(&self) -> Bytes {
        let total_len = IPV4_MIN_HEADER + TCP_MIN_HEADER + self.payload.len();
        let mut buf = BytesMut::with_capacity(total_len);

        // IPv4
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(total_len as u16);
        buf.put_u16(0x1c46);
        buf.put_u16(0x4000);
        buf.put_u8(64);
        buf.put_u8(IPPROTO_TCP);
        buf.put_u16(0);
        buf.put_slice(&self.src.octets());
        buf.put_slice(&self.dst.octets());

        // TCP
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(5 << 4);
        buf.put_u8(0x10); // ACK
        buf.put_u16(self.window);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_slice(&self.payload);

        let ip_csum = ipv4_header_checksum(&buf[..IPV4_MIN_HEADER]);
        buf[10..12].copy_from_slice(&ip_csum.to_be_bytes());

        if let Ok(seg) = TcpSegment::parse(&buf) {
            let csum = tcp_checksum(&buf, &seg);
            let at = IPV4_MIN_HEADER + TCP_CHECKSUM_OFFSET;
            buf[at..at + 2].copy_from_slice(&csum.to_be_bytes());
        }
        buf.freeze()
    }
}
