//! Host socket reactor.
//!
//! Single-threaded mio event loop owning every real OS socket. Inputs are
//! the control channel from the guest worker (delivered via a waker), the
//! sockets' readiness events, and a short drain interval that retries
//! ring-blocked records as the guest frees space. Outputs are records in
//! the shared ring and socket writes.
//!
//! Connections to the virtual gateway are rewritten to loopback so the
//! guest can reach host-resident services.

mod session;

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::control::{self, ControlMsg, Inbox, Outbox};
use crate::key::{FlowKey, FlowProto};
use crate::packet::{GATEWAY_IP, to_std};
use crate::record::NetEvent;
use crate::shmem::RingProducer;

use session::{RingItem, TcpSession, UdpSession};

/// Waker token; socket tokens start above it.
const WAKER_TOKEN: Token = Token(0);

/// Socket read buffer.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Poll timeout while any session has records waiting for ring space.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Poll timeout when fully idle.
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// TCP keepalive idle time on NAT sockets.
const KEEPALIVE_SECS: libc::c_int = 30;

/// Reactor construction parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactorConfig {
    /// Per-TCP-session inbound rate cap in bytes/second; 0 = unlimited.
    pub rate_limit: u64,
}

/// Handle used by the VM façade to stop the reactor.
pub struct ReactorHandle {
    shutdown_tx: Sender<()>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Ask the reactor to tear down all sessions and exit its loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.waker.wake();
    }
}

/// The host-side socket reactor.
pub struct HostReactor {
    poll: Poll,
    inbox: Inbox,
    shutdown: Receiver<()>,
    ring: RingProducer,
    config: ReactorConfig,
    tcp: HashMap<FlowKey, TcpSession>,
    udp: HashMap<FlowKey, UdpSession>,
    by_token: HashMap<Token, (FlowProto, FlowKey)>,
    next_token: usize,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl HostReactor {
    /// Build a reactor around the ring producer. Returns the reactor, the
    /// stop handle, and the control outbox for the guest-side stack.
    pub fn new(
        ring: RingProducer,
        config: ReactorConfig,
    ) -> io::Result<(Self, ReactorHandle, Outbox)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (inbox, outbox) = control::channel(Arc::clone(&waker));
        let (shutdown_tx, shutdown) = bounded(1);

        let reactor = Self {
            poll,
            inbox,
            shutdown,
            ring,
            config,
            tcp: HashMap::new(),
            udp: HashMap::new(),
            by_token: HashMap::new(),
            next_token: 1,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        };
        let handle = ReactorHandle { shutdown_tx, waker };
        Ok((reactor, handle, outbox))
    }

    /// Run the event loop until [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) {
        info!(rate_limit = self.config.rate_limit, "host reactor started");
        let mut events = Events::with_capacity(256);

        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed, shutting reactor down");
                break;
            }

            if self.shutdown.try_recv().is_ok() {
                info!("host reactor shutting down");
                break;
            }

            self.drain_control();

            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .filter(|e| e.token() != WAKER_TOKEN)
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable);
            }

            self.flush_blocked();
            self.resume_rate_paused();
        }

        self.teardown();
        info!("host reactor stopped");
    }

    /// Next poll timeout: short while records wait for ring space, exact
    /// when a rate-paused session is due to resume, long otherwise.
    fn poll_timeout(&self) -> Duration {
        let mut timeout = IDLE_INTERVAL;
        if self.tcp.values().any(|s| !s.outq.is_empty())
            || self.udp.values().any(|s| !s.pending.is_empty())
        {
            timeout = DRAIN_INTERVAL;
        }
        let now = Instant::now();
        for session in self.tcp.values() {
            if let Some(until) = session.rate.paused_until() {
                let wait = until.saturating_duration_since(now).max(Duration::from_millis(1));
                timeout = timeout.min(wait);
            }
        }
        timeout
    }

    fn drain_control(&mut self) {
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                ControlMsg::TcpConnect { key } => self.tcp_connect(key),
                ControlMsg::TcpSend { key, data } => self.tcp_send(key, data),
                ControlMsg::TcpClose { key, destroy } => self.tcp_close(key, destroy),
                ControlMsg::TcpPause { key } => self.tcp_set_flow_pause(key, true),
                ControlMsg::TcpResume { key } => self.tcp_set_flow_pause(key, false),
                ControlMsg::UdpSend { key, data } => self.udp_send(key, data),
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn tcp_connect(&mut self, key: FlowKey) {
        if self.tcp.contains_key(&key) {
            // Stale session for a reused tuple: replace it.
            debug!(key = %key, "replacing stale session");
            self.remove_tcp(key);
        }

        // Reaching the virtual gateway means reaching the host itself.
        let dst_ip = if key.dst_ip == to_std(GATEWAY_IP) { Ipv4Addr::LOCALHOST } else { key.dst_ip };
        let addr = SocketAddr::V4(SocketAddrV4::new(dst_ip, key.dst_port));

        let token = self.alloc_token();
        let session = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => {
                set_keepalive(&stream);
                debug!(key = %key, addr = %addr, "connecting");
                let mut session = TcpSession::new(key, token, stream, self.config.rate_limit);
                session.update_interest(self.poll.registry());
                session
            }
            Err(e) => {
                warn!(key = %key, addr = %addr, error = %e, "connect failed");
                TcpSession::failed(key, token, e.to_string())
            }
        };
        self.by_token.insert(token, (FlowProto::Tcp, key));
        self.tcp.insert(key, session);

        self.flush_tcp(key);
    }

    fn tcp_send(&mut self, key: FlowKey, data: Vec<u8>) {
        let Some(session) = self.tcp.get_mut(&key) else {
            trace!(key = %key, "payload for unknown session dropped");
            return;
        };
        if let Err(e) = session.write_guest_payload(data) {
            warn!(key = %key, error = %e, "socket write failed");
            session.fail(e.to_string());
        }
        session.update_interest(self.poll.registry());
        session.flush(&mut self.ring);
        self.reap_tcp(key);
    }

    fn tcp_close(&mut self, key: FlowKey, destroy: bool) {
        if destroy {
            debug!(key = %key, "abortive close");
            self.remove_tcp(key);
            return;
        }
        let Some(session) = self.tcp.get_mut(&key) else {
            return;
        };
        debug!(key = %key, "graceful close");
        session.local_shutdown = true;
        if let Some(stream) = session.stream.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
        if session.remote_ended {
            // Both directions are done.
            session.outq.push_back(RingItem::Close);
            session.dead = true;
            session.flush(&mut self.ring);
        }
        self.reap_tcp(key);
    }

    fn tcp_set_flow_pause(&mut self, key: FlowKey, paused: bool) {
        let Some(session) = self.tcp.get_mut(&key) else {
            return;
        };
        let was_paused = session.paused();
        session.flow_paused = paused;
        session.update_interest(self.poll.registry());
        let unpaused = was_paused && !session.paused();
        if unpaused {
            self.read_tcp(key);
        }
    }

    fn udp_send(&mut self, key: FlowKey, data: Vec<u8>) {
        if !self.udp.contains_key(&key) {
            let bind: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            match mio::net::UdpSocket::bind(bind) {
                Ok(mut socket) => {
                    let token = self.alloc_token();
                    if let Err(e) =
                        self.poll.registry().register(&mut socket, token, Interest::READABLE)
                    {
                        warn!(key = %key, error = %e, "udp socket registration failed");
                        return;
                    }
                    self.by_token.insert(token, (FlowProto::Udp, key));
                    self.udp.insert(key, UdpSession::new(key, token, socket));
                    debug!(key = %key, "udp session created");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "udp socket creation failed");
                    return;
                }
            }
        }

        let Some(session) = self.udp.get_mut(&key) else {
            return;
        };
        session.last_active = Instant::now();
        let dst = SocketAddr::V4(SocketAddrV4::new(key.dst_ip, key.dst_port));
        if let Err(e) = session.socket.send_to(&data, dst) {
            // UDP errors are benign; the guest sees silence, not a reset.
            debug!(key = %key, error = %e, "udp send failed");
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(&(proto, key)) = self.by_token.get(&token) else {
            trace!(token = token.0, "event for unknown token");
            return;
        };
        match proto {
            FlowProto::Tcp => self.tcp_event(key, readable, writable),
            FlowProto::Udp => self.udp_event(key),
        }
    }

    fn tcp_event(&mut self, key: FlowKey, readable: bool, writable: bool) {
        {
            let Some(session) = self.tcp.get_mut(&key) else {
                return;
            };

            if session.connecting && (writable || readable) {
                match connect_result(session) {
                    ConnectState::Pending => {}
                    ConnectState::Connected => {
                        debug!(key = %key, "connected");
                        session.connecting = false;
                        session.outq.push_back(RingItem::Connected);
                        session.flush(&mut self.ring);
                        if let Err(e) = session.drain_backlog() {
                            session.fail(e.to_string());
                        }
                        session.update_interest(self.poll.registry());
                    }
                    ConnectState::Failed(e) => {
                        warn!(key = %key, error = %e, "connect failed");
                        session.fail(e);
                        session.flush(&mut self.ring);
                    }
                }
                self.reap_tcp(key);
                // Fall through to reads with refreshed state.
                return self.read_tcp(key);
            }

            if writable {
                if let Err(e) = session.drain_backlog() {
                    warn!(key = %key, error = %e, "socket write failed");
                    session.fail(e.to_string());
                }
                session.update_interest(self.poll.registry());
            }
        }

        if readable {
            self.read_tcp(key);
        }
        self.reap_tcp(key);
    }

    /// Pull inbound bytes from the socket into the ring queue.
    fn read_tcp(&mut self, key: FlowKey) {
        let Some(session) = self.tcp.get_mut(&key) else {
            return;
        };
        session.read_socket(&mut self.ring, self.read_buf.as_mut_slice());
        session.flush(&mut self.ring);
        session.update_interest(self.poll.registry());
        self.reap_tcp(key);
    }

    fn udp_event(&mut self, key: FlowKey) {
        let Some(session) = self.udp.get_mut(&key) else {
            return;
        };
        let mut buf = [0u8; 64 * 1024];
        loop {
            match session.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    session.last_active = Instant::now();
                    let src_ip = match from {
                        SocketAddr::V4(v4) => *v4.ip(),
                        SocketAddr::V6(_) => continue,
                    };
                    session.pending.push_back(NetEvent::UdpRecv {
                        src_ip,
                        src_port: from.port(),
                        dst_ip: key.src_ip,
                        dst_port: key.src_port,
                        data: buf[..n].to_vec(),
                    });
                    session.flush(&mut self.ring);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(key = %key, error = %e, "udp recv failed");
                    break;
                }
            }
        }
    }

    /// Retry ring-blocked records; called every loop iteration so the
    /// drain interval bounds how long the guest waits after freeing space.
    fn flush_blocked(&mut self) {
        let blocked: Vec<FlowKey> =
            self.tcp.iter().filter(|(_, s)| !s.outq.is_empty()).map(|(k, _)| *k).collect();
        for key in blocked {
            let was_paused = self.tcp.get(&key).is_some_and(|s| s.paused());
            self.flush_tcp(key);
            let unpaused =
                was_paused && self.tcp.get(&key).is_some_and(|s| !s.paused() && !s.connecting);
            if unpaused {
                // The socket may have gone readable while we ignored it.
                self.read_tcp(key);
            }
        }

        let blocked: Vec<FlowKey> =
            self.udp.iter().filter(|(_, s)| !s.pending.is_empty()).map(|(k, _)| *k).collect();
        for key in blocked {
            if let Some(session) = self.udp.get_mut(&key) {
                session.flush(&mut self.ring);
            }
        }
    }

    fn flush_tcp(&mut self, key: FlowKey) {
        if let Some(session) = self.tcp.get_mut(&key) {
            session.flush(&mut self.ring);
            session.update_interest(self.poll.registry());
        }
        self.reap_tcp(key);
    }

    /// Resume sessions whose rate-limit window has passed.
    fn resume_rate_paused(&mut self) {
        let now = Instant::now();
        let due: Vec<FlowKey> = self
            .tcp
            .iter()
            .filter(|(_, s)| s.rate.ready_to_resume(now))
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(session) = self.tcp.get_mut(&key) {
                session.rate.resume(now);
                trace!(key = %key, "rate limit window passed, resuming");
            }
            self.read_tcp(key);
        }
    }

    fn reap_tcp(&mut self, key: FlowKey) {
        let done = self.tcp.get(&key).is_some_and(|s| s.reapable());
        if done {
            self.remove_tcp(key);
        }
    }

    fn remove_tcp(&mut self, key: FlowKey) {
        if let Some(mut session) = self.tcp.remove(&key) {
            self.by_token.remove(&session.token);
            if let Some(mut stream) = session.stream.take() {
                let _ = self.poll.registry().deregister(&mut stream);
            }
            debug!(key = %key, "tcp session removed");
        }
    }

    /// Drop every session and socket.
    fn teardown(&mut self) {
        let keys: Vec<FlowKey> = self.tcp.keys().copied().collect();
        for key in keys {
            self.remove_tcp(key);
        }
        for (_, mut session) in self.udp.drain() {
            let _ = self.poll.registry().deregister(&mut session.socket);
        }
        self.by_token.clear();
    }
}

enum ConnectState {
    Pending,
    Connected,
    Failed(String),
}

/// Resolve a non-blocking connect after a readiness event.
fn connect_result(session: &mut TcpSession) -> ConnectState {
    let Some(stream) = session.stream.as_ref() else {
        return ConnectState::Pending;
    };
    match stream.take_error() {
        Ok(Some(e)) => return ConnectState::Failed(e.to_string()),
        Err(e) => return ConnectState::Failed(e.to_string()),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => ConnectState::Connected,
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => ConnectState::Pending,
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => ConnectState::Pending,
        Err(e) => ConnectState::Failed(e.to_string()),
    }
}

/// Enable TCP keepalive with a 30 s idle time on a NAT socket.
fn set_keepalive(stream: &mio::net::TcpStream) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            &KEEPALIVE_SECS as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
