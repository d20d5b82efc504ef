//! NFQUEUE capture over a raw `NETLINK_NETFILTER` socket.
//!
//! Wire layout of every message exchanged with the kernel:
//!
//! ```text
//! nlmsghdr (16, host order) | nfgenmsg (family, version, res_id BE) | nlattr*
//! nlattr: len u16 | type u16 | data | pad to 4
//! ```

use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;

use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use super::{CaptureOpener, CaptureSource, Packet, Verdict};
use crate::config::CaptureConfig;
use crate::error::CaptureError;

const NETLINK_NETFILTER: i32 = 12;
const NFNL_SUBSYS_QUEUE: u16 = 3;

const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;
const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;
const NFQNL_COPY_PACKET: u8 = 2;

const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_MARK: u16 = 3;
const NFQA_PAYLOAD: u16 = 10;
const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_QUEUE_MAXLEN: u16 = 3;

const NLM_F_REQUEST: u16 = 1;
const NLM_F_ACK: u16 = 4;
const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
/// Attribute type bits above this mask are flags (nested / byte order).
const NLA_TYPE_MASK: u16 = 0x3FFF;

const NF_DROP: u32 = 0;
const NF_ACCEPT: u32 = 1;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// One outgoing nfnetlink message.
struct NlMessage {
    buf: BytesMut,
}

impl NlMessage {
    fn new(msg: u16, flags: u16, seq: u32, family: u8, queue: u16) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_ne(0); // patched in finish()
        buf.put_u16_ne((NFNL_SUBSYS_QUEUE << 8) | msg);
        buf.put_u16_ne(flags);
        buf.put_u32_ne(seq);
        buf.put_u32_ne(0);
        buf.put_u8(family);
        buf.put_u8(0);
        buf.put_u16(queue);
        Self { buf }
    }

    fn attr(mut self, ty: u16, data: &[u8]) -> Self {
        let len = 4 + data.len();
        self.buf.put_u16_ne(len as u16);
        self.buf.put_u16_ne(ty);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, align4(len) - len);
        self
    }

    fn finish(mut self) -> Bytes {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf.freeze()
    }
}

/// Iterates `(type, data)` over the attributes in `data`.
fn attrs(mut data: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        if data.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([data[0], data[1]]) as usize;
        let ty = u16::from_ne_bytes([data[2], data[3]]) & NLA_TYPE_MASK;
        if len < 4 || len > data.len() {
            return None;
        }
        let value = &data[4..len];
        data = &data[align4(len).min(data.len())..];
        Some((ty, value))
    })
}

fn parse_packet(body: &[u8]) -> Result<Packet, CaptureError> {
    if body.len() < NFGENMSG_LEN {
        return Err(CaptureError::Malformed("packet message shorter than nfgenmsg"));
    }
    let mut id = None;
    let mut payload = None;
    for (ty, value) in attrs(&body[NFGENMSG_LEN..]) {
        match ty {
            NFQA_PACKET_HDR if value.len() >= 4 => {
                id = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            NFQA_PAYLOAD => payload = Some(Bytes::copy_from_slice(value)),
            _ => {}
        }
    }
    match (id, payload) {
        (Some(id), Some(payload)) => Ok(Packet { id, payload }),
        (None, _) => Err(CaptureError::Malformed("packet message without packet header")),
        (Some(id), None) => Ok(Packet {
            id,
            payload: Bytes::new(),
        }),
    }
}

/// Sizes the receive buffer for a full queue of full-size packets. Tries
/// `SO_RCVBUFFORCE` first, which bypasses `rmem_max` with CAP_NET_ADMIN.
fn size_recv_buffer(socket: &Socket, queue: u16, config: &CaptureConfig) {
    let want = (config.queue_maxlen as usize)
        .saturating_mul(config.copy_range as usize)
        .min(i32::MAX as usize);
    let value = want as libc::c_int;
    // SAFETY: `value` is a valid c_int for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUFFORCE,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return;
    }
    debug!(queue, error = %io::Error::last_os_error(), "forced receive buffer refused");
    if let Err(e) = socket.set_recv_buffer_size(want) {
        warn!(queue, bytes = want, error = %e, "failed to grow netlink receive buffer");
    }
}

/// Opens kernel NFQUEUE queues.
#[derive(Debug, Default, Clone, Copy)]
pub struct NfQueueOpener;

impl CaptureOpener for NfQueueOpener {
    fn open(
        &self,
        queue: u16,
        config: &CaptureConfig,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        Ok(Box::new(NfQueue::bind(queue, config)?))
    }
}

pub struct NfQueue {
    socket: Socket,
    queue: u16,
    seq: u32,
    bound: bool,
    buf: Vec<u8>,
    pending: VecDeque<Packet>,
}

impl NfQueue {
    pub fn bind(queue: u16, config: &CaptureConfig) -> Result<Self, CaptureError> {
        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::RAW,
            Some(Protocol::from(NETLINK_NETFILTER)),
        )
        .map_err(CaptureError::Open)?;

        // SAFETY: sockaddr_nl is plain old data; an all-zero value is valid
        // and asks the kernel to assign the port id.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CaptureError::Open(io::Error::last_os_error()));
        }

        size_recv_buffer(&socket, queue, config);
        socket.set_read_timeout(Some(config.recv_timeout))?;

        let mut nfq = Self {
            socket,
            queue,
            seq: 0,
            bound: false,
            buf: vec![0u8; config.copy_range as usize + 4096],
            pending: VecDeque::new(),
        };

        // Older kernels need the PF rebind; newer ones ignore it.
        if let Err(e) = nfq.config_cmd(NFQNL_CFG_CMD_PF_UNBIND, libc::AF_INET as u8, 0) {
            debug!(queue, error = %e, "pf unbind ignored");
        }
        if let Err(e) = nfq.config_cmd(NFQNL_CFG_CMD_PF_BIND, libc::AF_INET as u8, 0) {
            debug!(queue, error = %e, "pf bind ignored");
        }
        nfq.config_cmd(NFQNL_CFG_CMD_BIND, libc::AF_UNSPEC as u8, queue)?;
        nfq.bound = true;

        let mut params = [0u8; 5];
        params[..4].copy_from_slice(&config.copy_range.to_be_bytes());
        params[4] = NFQNL_COPY_PACKET;
        let seq = nfq.next_seq();
        let msg = NlMessage::new(NFQNL_MSG_CONFIG, NLM_F_REQUEST | NLM_F_ACK, seq, libc::AF_UNSPEC as u8, queue)
            .attr(NFQA_CFG_PARAMS, &params)
            .finish();
        nfq.request(&msg, seq)?;

        let seq = nfq.next_seq();
        let msg = NlMessage::new(NFQNL_MSG_CONFIG, NLM_F_REQUEST | NLM_F_ACK, seq, libc::AF_UNSPEC as u8, queue)
            .attr(NFQA_CFG_QUEUE_MAXLEN, &config.queue_maxlen.to_be_bytes())
            .finish();
        if let Err(e) = nfq.request(&msg, seq) {
            warn!(queue, error = %e, "queue maxlen not applied");
        }

        info!(queue, copy_range = config.copy_range, maxlen = config.queue_maxlen, "nfqueue bound");
        Ok(nfq)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn config_cmd(&mut self, cmd: u8, family: u8, queue: u16) -> Result<(), CaptureError> {
        let seq = self.next_seq();
        // nfqnl_msg_config_cmd: command, pad, pf (BE)
        let data = [cmd, 0, 0, family];
        let msg = NlMessage::new(NFQNL_MSG_CONFIG, NLM_F_REQUEST | NLM_F_ACK, seq, family, queue)
            .attr(NFQA_CFG_CMD, &data)
            .finish();
        self.request(&msg, seq)
    }

    fn send(&self, msg: &[u8]) -> Result<(), CaptureError> {
        // SAFETY: zeroed sockaddr_nl addresses the kernel (pid 0).
        let mut dst: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        dst.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `msg` and `dst` are valid for the duration of the call.
        let sent = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &dst as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(CaptureError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn recv_datagram(&mut self) -> io::Result<usize> {
        // SAFETY: `buf` is valid for writes of its full length.
        let n = unsafe {
            libc::recv(
                self.socket.as_raw_fd(),
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Sends `msg` and waits for the kernel acknowledgment of `seq`.
    fn request(&mut self, msg: &[u8], seq: u32) -> Result<(), CaptureError> {
        self.send(msg)?;
        loop {
            let n = match self.recv_datagram() {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(CaptureError::Configure {
                        queue: self.queue,
                        reason: format!("no acknowledgment: {e}"),
                    })
                }
            };
            let mut acked = None;
            self.split(n, |ty, hdr_seq, body, pending| {
                if ty == libc::NLMSG_ERROR as u16 && hdr_seq == seq {
                    let errno = if body.len() >= 4 {
                        -i32::from_ne_bytes([body[0], body[1], body[2], body[3]])
                    } else {
                        0
                    };
                    acked = Some(errno);
                } else if ty == (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET {
                    if let Ok(pkt) = parse_packet(body) {
                        pending.push_back(pkt);
                    }
                }
            });
            match acked {
                Some(0) => return Ok(()),
                Some(errno) => {
                    return Err(CaptureError::Netlink {
                        queue: self.queue,
                        errno,
                    })
                }
                None => continue,
            }
        }
    }

    /// Walks the netlink messages in the first `n` bytes of the receive buffer.
    fn split(&mut self, n: usize, mut f: impl FnMut(u16, u32, &[u8], &mut VecDeque<Packet>)) {
        let mut data = &self.buf[..n];
        while data.len() >= NLMSG_HDRLEN {
            let len = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if len < NLMSG_HDRLEN || len > data.len() {
                warn!(queue = self.queue, len, "truncated netlink message");
                break;
            }
            let ty = u16::from_ne_bytes([data[4], data[5]]);
            let seq = u32::from_ne_bytes([data[8], data[9], data[10], data[11]]);
            f(ty, seq, &data[NLMSG_HDRLEN..len], &mut self.pending);
            data = &data[align4(len).min(data.len())..];
        }
    }
}

impl CaptureSource for NfQueue {
    fn queue(&self) -> u16 {
        self.queue
    }

    fn receive(&mut self) -> Result<Option<Packet>, CaptureError> {
        if let Some(pkt) = self.pending.pop_front() {
            return Ok(Some(pkt));
        }
        if !self.bound {
            return Err(CaptureError::Closed);
        }
        let n = match self.recv_datagram() {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(None)
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!(queue = self.queue, "netlink receive buffer overrun, packets lost");
                return Ok(None);
            }
            Err(e) => return Err(CaptureError::Io(e)),
        };
        let queue = self.queue;
        self.split(n, |ty, _, body, pending| {
            if ty == (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET {
                match parse_packet(body) {
                    Ok(pkt) => pending.push_back(pkt),
                    Err(e) => warn!(queue, error = %e, "skipping packet message"),
                }
            } else if ty == libc::NLMSG_ERROR as u16 && body.len() >= 4 {
                let errno = -i32::from_ne_bytes([body[0], body[1], body[2], body[3]]);
                if errno != 0 {
                    warn!(queue, errno, "netlink error report");
                }
            }
        });
        Ok(self.pending.pop_front())
    }

    fn set_verdict(&mut self, id: u32, verdict: &Verdict) -> Result<(), CaptureError> {
        let seq = self.next_seq();
        let mut hdr = [0u8; 8];
        let (code, mark, payload) = match verdict {
            Verdict::Accept { mark, payload } => (NF_ACCEPT, Some(*mark), payload.as_ref()),
            Verdict::Drop => (NF_DROP, None, None),
        };
        hdr[..4].copy_from_slice(&code.to_be_bytes());
        hdr[4..].copy_from_slice(&id.to_be_bytes());

        let mut msg = NlMessage::new(NFQNL_MSG_VERDICT, NLM_F_REQUEST, seq, libc::AF_UNSPEC as u8, self.queue)
            .attr(NFQA_VERDICT_HDR, &hdr);
        if let Some(mark) = mark {
            msg = msg.attr(NFQA_MARK, &mark.to_be_bytes());
        }
        if let Some(payload) = payload {
            msg = msg.attr(NFQA_PAYLOAD, payload);
        }
        self.send(&msg.finish())
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        if !self.bound {
            return Ok(());
        }
        self.bound = false;
        let queue = self.queue;
        self.config_cmd(NFQNL_CFG_CMD_UNBIND, libc::AF_UNSPEC as u8, queue)?;
        info!(queue, "nfqueue unbound");
        Ok(())
    }
}

impl Drop for NfQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(queue = self.queue, error = %e, "nfqueue unbind failed");
        }
    }
}
