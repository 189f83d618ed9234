//! Per-flow host-side session state.
//!
//! A `TcpSession` owns the real OS socket for one guest flow plus the
//! three independent pause reasons (rate, peer flow control, ring
//! pressure) and the queue of records waiting for ring space. The session
//! is paused iff any reason holds; it resumes only when all three clear.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::key::FlowKey;
use crate::record::NetEvent;
use crate::shmem::RingProducer;

/// A record waiting for ring space, in delivery order. Keeping `End`,
/// `Close` and `Error` in the same queue as data is what guarantees the
/// data-before-FIN ordering.
pub(crate) enum RingItem {
    Connected,
    Data(Vec<u8>),
    End,
    Close,
    Error(String),
}

/// Per-second byte budget for one session. A zero cap means unlimited.
pub(crate) struct RateLimiter {
    cap: u64,
    used: u64,
    window: Instant,
    paused_until: Option<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(cap: u64) -> Self {
        Self { cap, used: 0, window: Instant::now(), paused_until: None }
    }

    /// Reset the accounting when the current second has elapsed.
    pub(crate) fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window) >= Duration::from_secs(1) {
            self.window = now;
            self.used = 0;
        }
    }

    /// True once the budget for this second is spent.
    pub(crate) fn exhausted(&self) -> bool {
        self.cap > 0 && self.used >= self.cap
    }

    pub(crate) fn record(&mut self, bytes: usize) {
        self.used += bytes as u64;
    }

    /// Pause until the next second boundary.
    pub(crate) fn pause(&mut self) {
        self.paused_until = Some(self.window + Duration::from_secs(1));
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused_until.is_some()
    }

    pub(crate) fn paused_until(&self) -> Option<Instant> {
        self.paused_until
    }

    pub(crate) fn ready_to_resume(&self, now: Instant) -> bool {
        self.paused_until.is_some_and(|until| now >= until)
    }

    pub(crate) fn resume(&mut self, now: Instant) {
        self.paused_until = None;
        self.roll(now);
    }
}

/// Host-side state for one TCP flow.
pub(crate) struct TcpSession {
    pub key: FlowKey,
    pub token: Token,
    pub stream: Option<mio::net::TcpStream>,
    /// Non-blocking connect still resolving.
    pub connecting: bool,
    /// Interest currently registered with the poller.
    registered: Option<Interest>,
    /// Guest-bound writes the kernel would not take yet.
    pub send_backlog: VecDeque<Vec<u8>>,
    /// Records waiting for ring space.
    pub outq: VecDeque<RingItem>,
    pub rate: RateLimiter,
    /// Paused by the stack's `tcp-pause`.
    pub flow_paused: bool,
    pub remote_ended: bool,
    pub end_delivered: bool,
    /// Guest requested a graceful close; our write side is shut down.
    pub local_shutdown: bool,
    /// Socket gone; session lingers only until `outq` drains.
    pub dead: bool,
}

impl TcpSession {
    pub(crate) fn new(key: FlowKey, token: Token, stream: mio::net::TcpStream, rate_cap: u64) -> Self {
        Self {
            key,
            token,
            stream: Some(stream),
            connecting: true,
            registered: None,
            send_backlog: VecDeque::new(),
            outq: VecDeque::new(),
            rate: RateLimiter::new(rate_cap),
            flow_paused: false,
            remote_ended: false,
            end_delivered: false,
            local_shutdown: false,
            dead: false,
        }
    }

    /// A session that never got a socket (connect failed immediately); it
    /// exists only to push the error record through the ring.
    pub(crate) fn failed(key: FlowKey, token: Token, error: String) -> Self {
        let mut session = Self {
            key,
            token,
            stream: None,
            connecting: false,
            registered: None,
            send_backlog: VecDeque::new(),
            outq: VecDeque::new(),
            rate: RateLimiter::new(0),
            flow_paused: false,
            remote_ended: false,
            end_delivered: false,
            local_shutdown: false,
            dead: true,
        };
        session.outq.push_back(RingItem::Error(error));
        session
    }

    pub(crate) fn ring_paused(&self) -> bool {
        !self.outq.is_empty()
    }

    /// Paused iff any of the three pressures holds.
    pub(crate) fn paused(&self) -> bool {
        self.rate.is_paused() || self.flow_paused || self.ring_paused()
    }

    /// Flush queued records into the ring, in order, stopping at the first
    /// one that does not fit.
    pub(crate) fn flush(&mut self, ring: &mut RingProducer) {
        while let Some(item) = self.outq.front_mut() {
            match item {
                RingItem::Data(data) => {
                    let n = ring.write_tcp_data(&self.key, data);
                    if n == data.len() {
                        self.outq.pop_front();
                    } else {
                        if n > 0 {
                            data.drain(..n);
                        }
                        return;
                    }
                }
                RingItem::Connected => {
                    if !ring.try_write_event(&NetEvent::TcpConnected { key: self.key }) {
                        return;
                    }
                    self.outq.pop_front();
                }
                RingItem::End => {
                    if !ring.try_write_event(&NetEvent::TcpEnd { key: self.key }) {
                        return;
                    }
                    self.end_delivered = true;
                    self.outq.pop_front();
                }
                RingItem::Close => {
                    if !ring.try_write_event(&NetEvent::TcpClose { key: self.key }) {
                        return;
                    }
                    self.outq.pop_front();
                }
                RingItem::Error(message) => {
                    let event = NetEvent::TcpError { key: self.key, message: message.clone() };
                    if !ring.try_write_event(&event) {
                        return;
                    }
                    self.outq.pop_front();
                }
            }
        }
    }

    /// Write guest payload to the socket, backlogging whatever the kernel
    /// does not take. Returns an error only on a fatal socket failure.
    pub(crate) fn write_guest_payload(&mut self, data: Vec<u8>) -> io::Result<()> {
        self.send_backlog.push_back(data);
        if self.connecting {
            return Ok(());
        }
        self.drain_backlog()
    }

    /// Flush the write backlog until the kernel blocks or it empties.
    pub(crate) fn drain_backlog(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while let Some(front) = self.send_backlog.front_mut() {
            match stream.write(front) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket wrote zero"));
                }
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read inbound bytes until the socket blocks, the remote ends, a
    /// pause reason trips, or the socket fails. Records are flushed into
    /// the ring inline; the loop stops while any record cannot fit, and
    /// the reactor's drain interval re-enters it once space opens. The
    /// poller is edge-triggered, so stopping early without dropping
    /// READABLE interest would lose the wakeup.
    pub(crate) fn read_socket(&mut self, ring: &mut RingProducer, read_buf: &mut [u8]) {
        loop {
            if self.connecting || self.dead || self.remote_ended || self.paused() {
                return;
            }

            let now = Instant::now();
            self.rate.roll(now);
            if self.rate.exhausted() {
                debug!(key = %self.key, "rate limit reached, pausing until next second");
                self.rate.pause();
                return;
            }

            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.read(read_buf) {
                Ok(0) => {
                    debug!(key = %self.key, "remote end of stream");
                    self.remote_ended = true;
                    self.outq.push_back(RingItem::End);
                    if self.local_shutdown {
                        self.outq.push_back(RingItem::Close);
                        self.dead = true;
                    }
                    self.flush(ring);
                    return;
                }
                Ok(n) => {
                    self.rate.record(n);
                    self.outq.push_back(RingItem::Data(read_buf[..n].to_vec()));
                    self.flush(ring);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    trace!(key = %self.key, error = %e, "socket read failed");
                    self.fail(e.to_string());
                    self.flush(ring);
                    return;
                }
            }
        }
    }

    /// Abandon the socket and queue an error record.
    pub(crate) fn fail(&mut self, message: String) {
        self.stream = None;
        self.registered = None;
        self.dead = true;
        self.outq.push_back(RingItem::Error(message));
    }

    /// Reconcile the poller registration with the session state.
    pub(crate) fn update_interest(&mut self, registry: &Registry) {
        let connecting = self.connecting;
        let idle_readable = !self.paused() && !self.remote_ended && !self.dead;
        let has_backlog = !self.send_backlog.is_empty();
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut want: Option<Interest> = None;
        if connecting {
            want = Some(Interest::READABLE | Interest::WRITABLE);
        } else {
            if idle_readable {
                want = Some(Interest::READABLE);
            }
            if has_backlog {
                want = Some(match want {
                    Some(i) => i | Interest::WRITABLE,
                    None => Interest::WRITABLE,
                });
            }
        }

        if want == self.registered {
            return;
        }
        let result = match (self.registered, want) {
            (None, Some(interest)) => registry.register(stream, self.token, interest),
            (Some(_), Some(interest)) => registry.reregister(stream, self.token, interest),
            (Some(_), None) => registry.deregister(stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => self.registered = want,
            Err(e) => trace!(key = %self.key, error = %e, "poller registration failed"),
        }
    }

    /// Done when the socket is gone and every record reached the ring.
    pub(crate) fn reapable(&self) -> bool {
        self.dead && self.outq.is_empty()
    }
}

/// Host-side state for one UDP flow: a real socket plus replies waiting
/// for ring space. Sessions live until the reactor stops.
pub(crate) struct UdpSession {
    pub key: FlowKey,
    pub token: Token,
    pub socket: mio::net::UdpSocket,
    pub pending: VecDeque<NetEvent>,
    pub last_active: Instant,
}

impl UdpSession {
    pub(crate) fn new(key: FlowKey, token: Token, socket: mio::net::UdpSocket) -> Self {
        Self { key, token, socket, pending: VecDeque::new(), last_active: Instant::now() }
    }

    /// Flush pending reply records into the ring, in order.
    pub(crate) fn flush(&mut self, ring: &mut RingProducer) {
        while let Some(event) = self.pending.front() {
            if !ring.try_write_event(event) {
                return;
            }
            self.pending.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    #[test]
    fn test_rate_limiter_boundary() {
        let mut rate = RateLimiter::new(1000);
        let now = Instant::now();
        rate.roll(now);

        rate.record(999);
        assert!(!rate.exhausted());
        rate.record(1);
        // Exactly at the cap: the next byte must wait.
        assert!(rate.exhausted());

        rate.pause();
        assert!(rate.is_paused());
        assert!(!rate.ready_to_resume(now));
        assert!(rate.ready_to_resume(now + Duration::from_secs(2)));

        rate.resume(now + Duration::from_secs(2));
        assert!(!rate.is_paused());
        assert!(!rate.exhausted());
    }

    #[test]
    fn test_rate_limiter_unlimited() {
        let mut rate = RateLimiter::new(0);
        rate.record(u32::MAX as usize);
        assert!(!rate.exhausted());
    }

    #[test]
    fn test_rate_limiter_window_rolls() {
        let mut rate = RateLimiter::new(10);
        rate.record(10);
        assert!(rate.exhausted());
        sleep(Duration::from_millis(5));
        rate.roll(Instant::now());
        // Window not yet elapsed: still exhausted.
        assert!(rate.exhausted());
        rate.roll(Instant::now() + Duration::from_secs(1));
        assert!(!rate.exhausted());
    }

    #[test]
    fn test_pause_composition() {
        let key = FlowKey::tcp(Ipv4Addr::new(192, 168, 127, 3), 1, Ipv4Addr::new(1, 1, 1, 1), 2);
        let mut session = TcpSession::failed(key, Token(7), "x".into());
        session.outq.clear();
        session.dead = false;

        assert!(!session.paused());
        session.flow_paused = true;
        assert!(session.paused());
        session.outq.push_back(RingItem::End);
        session.rate.pause();

        // All three reasons must clear before the session resumes.
        session.flow_paused = false;
        assert!(session.paused());
        session.outq.clear();
        assert!(session.paused());
        session.rate.resume(Instant::now());
        assert!(!session.paused());
    }

    #[test]
    fn test_flush_orders_end_after_data() {
        let key = FlowKey::tcp(Ipv4Addr::new(192, 168, 127, 3), 1, Ipv4Addr::new(1, 1, 1, 1), 2);
        // A tiny ring forces several flush rounds.
        let (_stdin, mut ring, mut guest) = crate::shmem::shared_region_with_capacity(160);

        let mut session = TcpSession::failed(key, Token(7), "unused".into());
        session.outq.clear();
        session.dead = false;
        session.outq.push_back(RingItem::Data(vec![0x11; 300]));
        session.outq.push_back(RingItem::End);

        let mut got_data = 0usize;
        let mut got_end = false;
        for _ in 0..64 {
            session.flush(&mut ring);
            while let Some(event) = guest.read_event() {
                match event {
                    NetEvent::TcpData { data, .. } => {
                        assert!(!got_end, "data must never follow the end record");
                        got_data += data.len();
                    }
                    NetEvent::TcpEnd { .. } => {
                        assert_eq!(got_data, 300, "end only after all data");
                        got_end = true;
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            }
            if got_end {
                break;
            }
        }
        assert!(got_end);
        assert!(session.end_delivered);
        assert!(session.outq.is_empty());
    }
}
