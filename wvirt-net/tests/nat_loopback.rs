//! End-to-end NAT tests: the guest-side stack and the host reactor wired
//! through a real shared region, against real sockets on loopback.
//!
//! The test plays the guest kernel: it emits raw TCP/UDP frames into the
//! stack, pumps ring events, and checks the frames the stack synthesizes
//! back.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use smoltcp::wire::{Ipv4Address, TcpControl};

use wvirt_net::packet::GATEWAY_IP;
use wvirt_net::shmem::{GuestTransport, shared_region, shared_region_with_capacity};
use wvirt_net::test_util::{
    TcpMeta, drain_stack_frames, frame_with_prefix, guest_tcp_frame, guest_udp_frame,
    parse_tcp_frame, parse_udp_frame,
};
use wvirt_net::{HostReactor, NetConfig, NetStack, ReactorConfig};

const LOOPBACK: Ipv4Address = Ipv4Address([127, 0, 0, 1]);

/// Serve one connection: read until b'\n', write `body`, close.
fn start_body_server(body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind server");
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while let Ok(1) = stream.read(&mut byte) {
            if byte[0] == b'\n' {
                break;
            }
            request.push(byte[0]);
        }
        stream.write_all(&body).expect("write body");
        // Closing sends the FIN right after the body.
    });
    addr
}

/// Drive the guest side of one TCP exchange and return the received body.
struct GuestPeer {
    stack: NetStack,
    transport: GuestTransport,
}

impl GuestPeer {
    /// Feed pending ring events into the stack and drain its frames.
    fn pump(&mut self) -> Vec<Vec<u8>> {
        while let Some(event) = self.transport.read_event() {
            self.stack.handle_event(event);
        }
        drain_stack_frames(&mut self.stack)
    }

    fn pump_tcp_until<F>(&mut self, deadline: Duration, mut stop: F) -> Vec<TcpMeta>
    where
        F: FnMut(&TcpMeta) -> bool,
    {
        let start = Instant::now();
        let mut segments = Vec::new();
        loop {
            let mut done = false;
            for frame in self.pump() {
                if let Some(meta) = parse_tcp_frame(&frame) {
                    done |= stop(&meta);
                    segments.push(meta);
                }
            }
            if done {
                return segments;
            }
            assert!(start.elapsed() < deadline, "timed out waiting for TCP segments");
            self.transport.wait_for_io(Duration::from_millis(20));
        }
    }

    fn send_frame(&mut self, frame: Vec<u8>) {
        self.stack.push_guest_bytes(&frame_with_prefix(&frame));
    }
}

/// Run a complete client exchange against `server_addr` (dialed at
/// `dial_ip`, which may be the virtual gateway). Returns the body bytes
/// the guest received, asserting ordering invariants along the way.
fn run_tcp_exchange(
    peer: &mut GuestPeer,
    dial_ip: Ipv4Address,
    dst_port: u16,
    src_port: u16,
    deadline: Duration,
) -> Vec<u8> {
    let macs = *peer.stack.macs();
    let guest_isn = 100u32;

    peer.send_frame(guest_tcp_frame(
        &macs, dial_ip, src_port, dst_port, guest_isn, None, TcpControl::Syn, &[],
    ));

    let segments = peer.pump_tcp_until(deadline, |m| m.syn);
    let syn_ack = segments.iter().find(|m| m.syn).expect("SYN-ACK");
    assert_eq!(syn_ack.ack, Some(guest_isn.wrapping_add(1)));
    assert_eq!(syn_ack.src_port, dst_port);
    assert_eq!(syn_ack.dst_port, src_port);

    let mut guest_seq = guest_isn.wrapping_add(1);
    let mut expect_seq = syn_ack.seq.wrapping_add(1);

    // Handshake ACK, then the request line.
    peer.send_frame(guest_tcp_frame(
        &macs, dial_ip, src_port, dst_port, guest_seq, Some(expect_seq), TcpControl::None, &[],
    ));
    peer.send_frame(guest_tcp_frame(
        &macs, dial_ip, src_port, dst_port, guest_seq, Some(expect_seq), TcpControl::Psh, b"GET\n",
    ));
    guest_seq = guest_seq.wrapping_add(4);

    // Collect the body; the FIN must arrive only after every byte.
    let mut body = Vec::new();
    let start = Instant::now();
    let mut fin_seen = false;
    while !fin_seen {
        for frame in peer.pump() {
            let Some(meta) = parse_tcp_frame(&frame) else { continue };
            if !meta.payload.is_empty() {
                assert!(!fin_seen, "payload after FIN");
                assert_eq!(meta.seq, expect_seq, "in-order, gap-free delivery");
                expect_seq = expect_seq.wrapping_add(meta.payload.len() as u32);
                body.extend_from_slice(&meta.payload);
            }
            if meta.fin {
                fin_seen = true;
                expect_seq = expect_seq.wrapping_add(1);
            }
            assert!(!meta.rst, "unexpected RST");
        }
        if fin_seen {
            break;
        }
        assert!(start.elapsed() < deadline, "timed out receiving body");
        peer.transport.wait_for_io(Duration::from_millis(20));
    }

    // Close our side as well.
    peer.send_frame(guest_tcp_frame(
        &macs, dial_ip, src_port, dst_port, guest_seq, Some(expect_seq), TcpControl::Fin, &[],
    ));

    body
}

fn build_plane(
    ring_capacity: Option<usize>,
    config: ReactorConfig,
) -> (GuestPeer, wvirt_net::ReactorHandle, thread::JoinHandle<()>) {
    let _ = tracing_subscriber::fmt::try_init();
    let (_stdin, ring, transport) = match ring_capacity {
        Some(capacity) => shared_region_with_capacity(capacity),
        None => shared_region(),
    };
    let (mut reactor, handle, outbox) = HostReactor::new(ring, config).expect("reactor");
    let reactor_thread = thread::spawn(move || reactor.run());
    let stack = NetStack::new(NetConfig::default(), outbox);
    (GuestPeer { stack, transport }, handle, reactor_thread)
}

#[test]
fn test_tcp_download_via_loopback() {
    let body: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let addr = start_body_server(body.clone());

    let (mut peer, handle, reactor_thread) = build_plane(None, ReactorConfig::default());
    let received =
        run_tcp_exchange(&mut peer, LOOPBACK, addr.port(), 49000, Duration::from_secs(10));
    assert_eq!(received, body);

    handle.stop();
    reactor_thread.join().unwrap();
}

#[test]
fn test_gateway_dial_reaches_host_loopback() {
    let body = b"host-resident service".to_vec();
    let addr = start_body_server(body.clone());

    let (mut peer, handle, reactor_thread) = build_plane(None, ReactorConfig::default());
    // Dialing the virtual gateway must land on 127.0.0.1.
    let received =
        run_tcp_exchange(&mut peer, GATEWAY_IP, addr.port(), 49001, Duration::from_secs(10));
    assert_eq!(received, body);

    handle.stop();
    reactor_thread.join().unwrap();
}

#[test]
fn test_sequential_connections_reuse_cleanly() {
    let body_a = vec![0xaa; 8 * 1024];
    let body_b = vec![0xbb; 8 * 1024];
    let addr_a = start_body_server(body_a.clone());
    let addr_b = start_body_server(body_b.clone());

    let (mut peer, handle, reactor_thread) = build_plane(None, ReactorConfig::default());

    let first =
        run_tcp_exchange(&mut peer, LOOPBACK, addr_a.port(), 49100, Duration::from_secs(10));
    assert_eq!(first, body_a);

    // A second, fresh connection must not trip over state from the first.
    let second =
        run_tcp_exchange(&mut peer, LOOPBACK, addr_b.port(), 49101, Duration::from_secs(10));
    assert_eq!(second, body_b);
    assert_eq!(peer.stack.flow_count(), 0, "no lingering flows");

    handle.stop();
    reactor_thread.join().unwrap();
}

#[test]
fn test_connect_refused_resets_guest() {
    // Bind then drop to find a port with nothing listening.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let (mut peer, handle, reactor_thread) = build_plane(None, ReactorConfig::default());
    let macs = *peer.stack.macs();

    peer.send_frame(guest_tcp_frame(
        &macs, LOOPBACK, 49200, port, 7, None, TcpControl::Syn, &[],
    ));

    let segments = peer.pump_tcp_until(Duration::from_secs(10), |m| m.rst);
    assert!(segments.iter().any(|m| m.rst));
    assert_eq!(peer.stack.flow_count(), 0);

    handle.stop();
    reactor_thread.join().unwrap();
}

#[test]
fn test_udp_exchange_via_loopback() {
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind udp");
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let (n, from) = server.recv_from(&mut buf).expect("recv");
        let mut reply = b"re:".to_vec();
        reply.extend_from_slice(&buf[..n]);
        server.send_to(&reply, from).expect("reply");
    });

    let (mut peer, handle, reactor_thread) = build_plane(None, ReactorConfig::default());
    let macs = *peer.stack.macs();

    peer.send_frame(guest_udp_frame(&macs, LOOPBACK, 5353, addr.port(), b"query"));

    let start = Instant::now();
    let reply = loop {
        let frames = peer.pump();
        if let Some(reply) = frames.iter().find_map(|f| parse_udp_frame(f)) {
            break reply;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "timed out waiting for UDP reply");
        peer.transport.wait_for_io(Duration::from_millis(20));
    };

    let (src_ip, src_port, dst_ip, dst_port, payload) = reply;
    assert_eq!(src_ip, LOOPBACK);
    assert_eq!(src_port, addr.port());
    assert_eq!(dst_ip, wvirt_net::packet::GUEST_IP);
    assert_eq!(dst_port, 5353);
    assert_eq!(payload, b"re:query");

    handle.stop();
    reactor_thread.join().unwrap();
}

#[test]
fn test_small_ring_backpressure_loses_nothing() {
    // A 16 KiB ring forces the reactor through its pending-queue path.
    let body: Vec<u8> = (0..256 * 1024).map(|i| (i % 239) as u8).collect();
    let addr = start_body_server(body.clone());

    let (mut peer, handle, reactor_thread) =
        build_plane(Some(16 * 1024), ReactorConfig::default());
    let received =
        run_tcp_exchange(&mut peer, LOOPBACK, addr.port(), 49300, Duration::from_secs(30));
    assert_eq!(received.len(), body.len());
    assert_eq!(received, body);

    handle.stop();
    reactor_thread.join().unwrap();
}

#[test]
fn test_rate_limit_slows_transfer() {
    let body = vec![0x58u8; 24 * 1024];
    let addr = start_body_server(body.clone());

    // 8 KiB/s over 24 KiB needs at least two full window resets.
    let (mut peer, handle, reactor_thread) =
        build_plane(None, ReactorConfig { rate_limit: 8 * 1024 });

    let start = Instant::now();
    let received =
        run_tcp_exchange(&mut peer, LOOPBACK, addr.port(), 49400, Duration::from_secs(30));
    let elapsed = start.elapsed();

    assert_eq!(received, body, "rate limiting must not lose bytes");
    assert!(
        elapsed >= Duration::from_millis(1800),
        "24 KiB at 8 KiB/s finished too fast: {elapsed:?}"
    );

    handle.stop();
    reactor_thread.join().unwrap();
}
