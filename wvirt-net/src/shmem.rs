//! Shared-memory transport between the host reactor and the guest worker.
//!
//! One region per VM instance, carrying two independent lanes:
//! - a 4 KiB stdin bounce slot (host writes, guest reads)
//! - a 1 MiB ring of typed records (host writes, guest reads)
//!
//! Every lane is strictly single-writer/single-reader; the handles returned
//! by [`shared_region`] enforce that at the type level. `io_ready` is the
//! sole wake primitive: it is bumped with release ordering on every new
//! event and paired with a condvar so the single guest-side waiter can
//! block with a timeout. A waiter that snapshots the counter and then
//! misses an event observes the bumped value on its next load.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::key::FlowKey;
use crate::record::{NetEvent, TCP_DATA};

/// Size of the stdin bounce slot.
pub const STDIN_SLOT_SIZE: usize = 4096;

/// Size of the net-event ring.
pub const NET_RING_SIZE: usize = 1 << 20;

/// `u16 LE length | u8 type` precedes every ring record.
const RECORD_HEADER: usize = 3;

/// TCP data payloads are split so a single record never monopolises the ring.
const MAX_TCP_CHUNK: usize = 60 * 1024;

/// Transport failure surfaced to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is stopped")]
    Stopped,
    #[error("stdin chunk of {0} bytes exceeds the {STDIN_SLOT_SIZE}-byte slot")]
    ChunkTooLarge(usize),
}

struct SharedRegion {
    io_ready: AtomicU32,
    stdin_flag: AtomicU32,
    stdin_size: AtomicU32,
    net_head: AtomicU32,
    net_tail: AtomicU32,
    stopped: AtomicBool,
    stdin_slot: UnsafeCell<[u8; STDIN_SLOT_SIZE]>,
    net_ring: UnsafeCell<Box<[u8]>>,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

// Byte-level access is partitioned by the flag/cursor protocol: the slot is
// only written while stdin_flag is 0 and only read while it is 1; ring bytes
// in [tail, head) belong to the consumer, the rest to the producer.
unsafe impl Sync for SharedRegion {}
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    fn new(ring_capacity: usize) -> Self {
        Self {
            io_ready: AtomicU32::new(0),
            stdin_flag: AtomicU32::new(0),
            stdin_size: AtomicU32::new(0),
            net_head: AtomicU32::new(0),
            net_tail: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            stdin_slot: UnsafeCell::new([0u8; STDIN_SLOT_SIZE]),
            net_ring: UnsafeCell::new(vec![0u8; ring_capacity].into_boxed_slice()),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
        }
    }

    fn capacity(&self) -> usize {
        unsafe { (&*self.net_ring.get()).len() }
    }

    /// Bump the wake counter and wake the waiter. Taking the lock around the
    /// notify pairs with the counter re-check inside `wait_for_io`.
    fn notify(&self) {
        self.io_ready.fetch_add(1, Ordering::AcqRel);
        let _guard = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake_cv.notify_all();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify();
    }

    fn used(&self) -> usize {
        let head = self.net_head.load(Ordering::Acquire) as usize;
        let tail = self.net_tail.load(Ordering::Acquire) as usize;
        (head + self.capacity() - tail) % self.capacity()
    }

    /// Free ring bytes; one byte is always kept unused so that
    /// `head == tail` unambiguously means empty.
    fn available(&self) -> usize {
        self.capacity() - 1 - self.used()
    }

    fn copy_in(&self, offset: usize, src: &[u8]) {
        let cap = self.capacity();
        let ring = unsafe { (*self.net_ring.get()).as_mut_ptr() };
        let first = src.len().min(cap - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ring.add(offset), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), ring, src.len() - first);
            }
        }
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let cap = self.capacity();
        let ring = unsafe { (*self.net_ring.get()).as_ptr() };
        let first = dst.len().min(cap - offset);
        unsafe {
            std::ptr::copy_nonoverlapping(ring.add(offset), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(ring, dst.as_mut_ptr().add(first), dst.len() - first);
            }
        }
    }
}

/// Host-side stdin lane. Owned by the VM façade.
pub struct StdinWriter {
    region: Arc<SharedRegion>,
}

/// Host-side ring lane. Owned by the reactor.
pub struct RingProducer {
    region: Arc<SharedRegion>,
    scratch: Vec<u8>,
}

/// Guest-side consumer for both lanes. Owned by the guest worker.
pub struct GuestTransport {
    region: Arc<SharedRegion>,
}

/// Create a fresh region and split it into its three single-role handles.
pub fn shared_region() -> (StdinWriter, RingProducer, GuestTransport) {
    shared_region_with_capacity(NET_RING_SIZE)
}

/// Like [`shared_region`] with an explicit ring capacity (mainly for tests
/// that need to exercise backpressure without megabytes of traffic).
pub fn shared_region_with_capacity(
    ring_capacity: usize,
) -> (StdinWriter, RingProducer, GuestTransport) {
    let region = Arc::new(SharedRegion::new(ring_capacity));
    (
        StdinWriter { region: Arc::clone(&region) },
        RingProducer { region: Arc::clone(&region), scratch: Vec::new() },
        GuestTransport { region },
    )
}

impl StdinWriter {
    /// Write one chunk (at most 4 KiB) into the stdin slot, spin-waiting
    /// with backoff while the guest has not consumed the previous chunk.
    pub fn write_stdin(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        if chunk.len() > STDIN_SLOT_SIZE {
            return Err(TransportError::ChunkTooLarge(chunk.len()));
        }

        let mut backoff = 0u32;
        loop {
            if self.region.stopped.load(Ordering::Acquire) {
                return Err(TransportError::Stopped);
            }
            if self.region.stdin_flag.load(Ordering::Acquire) == 0 {
                break;
            }
            match backoff {
                0..=5 => std::hint::spin_loop(),
                6..=10 => std::thread::yield_now(),
                _ => std::thread::sleep(Duration::from_micros(
                    50u64 << (backoff - 11).min(6),
                )),
            }
            backoff += 1;
        }

        unsafe {
            let slot = &mut *self.region.stdin_slot.get();
            slot[..chunk.len()].copy_from_slice(chunk);
        }
        self.region.stdin_size.store(chunk.len() as u32, Ordering::Release);
        self.region.stdin_flag.store(1, Ordering::Release);
        self.region.notify();
        Ok(())
    }

    /// Mark the transport stopped and wake everything blocked on it.
    pub fn shutdown(&self) {
        self.region.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.region.stopped.load(Ordering::Acquire)
    }
}

impl RingProducer {
    /// Free bytes in the ring.
    pub fn available(&self) -> usize {
        self.region.available()
    }

    /// Write a single record, all-or-nothing. Returns false (and leaves the
    /// cursors untouched) when the ring does not have room.
    pub fn try_write_event(&mut self, event: &NetEvent) -> bool {
        let mut payload = std::mem::take(&mut self.scratch);
        payload.clear();
        event.encode_payload(&mut payload);
        let ok = self.write_record(event.kind(), &[&payload]);
        self.scratch = payload;
        ok
    }

    /// Write TCP payload bytes for `key` as one or more `TCP_DATA` records,
    /// shrinking the final chunk to whatever the ring can still take.
    /// Returns the number of data bytes accepted.
    pub fn write_tcp_data(&mut self, key: &FlowKey, data: &[u8]) -> usize {
        let key_text = key.to_string();
        let overhead = RECORD_HEADER + 1 + key_text.len();

        let mut written = 0;
        while written < data.len() {
            let free = self.region.available();
            if free <= overhead {
                break;
            }
            let chunk = (data.len() - written).min(MAX_TCP_CHUNK).min(free - overhead);

            let mut prefix = [0u8; 1 + u8::MAX as usize];
            prefix[0] = key_text.len() as u8;
            prefix[1..1 + key_text.len()].copy_from_slice(key_text.as_bytes());

            let accepted = self.write_record(
                TCP_DATA,
                &[&prefix[..1 + key_text.len()], &data[written..written + chunk]],
            );
            debug_assert!(accepted);
            written += chunk;
        }
        written
    }

    pub fn is_stopped(&self) -> bool {
        self.region.stopped.load(Ordering::Acquire)
    }

    fn write_record(&self, kind: u8, parts: &[&[u8]]) -> bool {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        let total = RECORD_HEADER + payload_len;
        if self.region.available() < total {
            return false;
        }

        let cap = self.region.capacity();
        let head = self.region.net_head.load(Ordering::Acquire) as usize;

        let header = [
            (payload_len as u16).to_le_bytes()[0],
            (payload_len as u16).to_le_bytes()[1],
            kind,
        ];
        self.region.copy_in(head, &header);
        let mut offset = (head + RECORD_HEADER) % cap;
        for part in parts {
            self.region.copy_in(offset, part);
            offset = (offset + part.len()) % cap;
        }

        // Publish the whole record at once; the consumer never sees a
        // partially written one.
        self.region.net_head.store(((head + total) % cap) as u32, Ordering::Release);
        self.region.notify();
        true
    }
}

impl GuestTransport {
    /// True when the stdin slot holds unread bytes.
    pub fn stdin_ready(&self) -> bool {
        self.region.stdin_flag.load(Ordering::Acquire) == 1
    }

    /// True when the ring holds at least one record.
    pub fn ring_ready(&self) -> bool {
        self.region.net_head.load(Ordering::Acquire) != self.region.net_tail.load(Ordering::Acquire)
    }

    /// Take the current stdin chunk, freeing the slot for the next writer.
    pub fn read_stdin(&mut self) -> Option<Vec<u8>> {
        if !self.stdin_ready() {
            return None;
        }
        let size = self.region.stdin_size.load(Ordering::Acquire) as usize;
        let mut out = vec![0u8; size];
        unsafe {
            let slot = &*self.region.stdin_slot.get();
            out.copy_from_slice(&slot[..size]);
        }
        self.region.stdin_flag.store(0, Ordering::Release);
        self.region.notify();
        Some(out)
    }

    /// Consume exactly one record, non-blocking. Undecodable records are
    /// skipped (they indicate a producer bug, not a recoverable condition).
    pub fn read_event(&mut self) -> Option<NetEvent> {
        loop {
            let cap = self.region.capacity();
            let head = self.region.net_head.load(Ordering::Acquire) as usize;
            let tail = self.region.net_tail.load(Ordering::Acquire) as usize;
            if head == tail {
                return None;
            }

            let mut header = [0u8; RECORD_HEADER];
            self.region.copy_out(tail, &mut header);
            let len = u16::from_le_bytes([header[0], header[1]]) as usize;
            let kind = header[2];

            let mut payload = vec![0u8; len];
            self.region.copy_out((tail + RECORD_HEADER) % cap, &mut payload);

            self.region
                .net_tail
                .store(((tail + RECORD_HEADER + len) % cap) as u32, Ordering::Release);

            match NetEvent::decode(kind, &payload) {
                Ok(event) => return Some(event),
                Err(err) => {
                    warn!(kind, len, error = %err, "skipping undecodable ring record");
                }
            }
        }
    }

    /// Block until stdin or the ring is ready, the transport stops, or the
    /// timeout elapses. Returns readiness.
    pub fn wait_for_io(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stdin_ready() || self.ring_ready() {
                return true;
            }
            if self.region.stopped.load(Ordering::Acquire) {
                return false;
            }

            let seen = self.region.io_ready.load(Ordering::Acquire);
            if self.stdin_ready() || self.ring_ready() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let guard = self.region.wake.lock().unwrap_or_else(PoisonError::into_inner);
            if self.region.io_ready.load(Ordering::Acquire) != seen {
                continue;
            }
            let (_guard, _timed_out) = self
                .region
                .wake_cv
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.region.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_key() -> FlowKey {
        FlowKey::tcp(Ipv4Addr::new(192, 168, 127, 3), 40000, Ipv4Addr::new(1, 2, 3, 4), 80)
    }

    #[test]
    fn test_stdin_roundtrip_preserves_order() {
        let (mut writer, _ring, mut guest) = shared_region();

        writer.write_stdin(b"hello ").unwrap();
        assert_eq!(guest.read_stdin().unwrap(), b"hello ");
        writer.write_stdin(b"world").unwrap();
        assert_eq!(guest.read_stdin().unwrap(), b"world");
        assert!(guest.read_stdin().is_none());
    }

    #[test]
    fn test_stdin_chunk_too_large() {
        let (mut writer, _ring, _guest) = shared_region();
        let big = vec![0u8; STDIN_SLOT_SIZE + 1];
        assert_eq!(
            writer.write_stdin(&big),
            Err(TransportError::ChunkTooLarge(STDIN_SLOT_SIZE + 1))
        );
    }

    #[test]
    fn test_stdin_write_fails_after_shutdown() {
        let (mut writer, _ring, _guest) = shared_region();
        writer.shutdown();
        assert_eq!(writer.write_stdin(b"x"), Err(TransportError::Stopped));
    }

    #[test]
    fn test_stdin_writer_blocks_until_consumed() {
        let (mut writer, _ring, mut guest) = shared_region();
        writer.write_stdin(b"first").unwrap();

        let handle = std::thread::spawn(move || {
            writer.write_stdin(b"second").unwrap();
            writer
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(guest.read_stdin().unwrap(), b"first");
        handle.join().unwrap();
        assert_eq!(guest.read_stdin().unwrap(), b"second");
    }

    #[test]
    fn test_ring_event_roundtrip() {
        let (_stdin, mut ring, mut guest) = shared_region();

        assert!(ring.try_write_event(&NetEvent::TcpConnected { key: test_key() }));
        assert!(ring.try_write_event(&NetEvent::TcpEnd { key: test_key() }));

        assert_eq!(guest.read_event().unwrap(), NetEvent::TcpConnected { key: test_key() });
        assert_eq!(guest.read_event().unwrap(), NetEvent::TcpEnd { key: test_key() });
        assert!(guest.read_event().is_none());
    }

    #[test]
    fn test_ring_full_rejects_whole_record() {
        let (_stdin, mut ring, mut guest) = shared_region_with_capacity(64);

        let big = NetEvent::TcpData { key: test_key(), data: vec![0u8; 128] };
        assert!(!ring.try_write_event(&big));
        assert!(guest.read_event().is_none());

        // A record that fits still goes through untouched.
        assert!(ring.try_write_event(&NetEvent::TcpEnd { key: test_key() }));
        assert_eq!(guest.read_event().unwrap(), NetEvent::TcpEnd { key: test_key() });
    }

    #[test]
    fn test_ring_capacity_minus_one_is_full() {
        let (_stdin, mut ring, _guest) = shared_region_with_capacity(64);
        // 3-byte header + payload; a 61-byte record would occupy all 64
        // bytes, which the one-slack-byte rule forbids.
        assert_eq!(ring.available(), 63);
        let key = test_key();
        let key_len = key.to_string().len();
        let fits = 63 - RECORD_HEADER - 1 - key_len;
        assert_eq!(ring.write_tcp_data(&key, &vec![0xaa; fits + 16]), fits);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_write_tcp_data_partial_accept() {
        let (_stdin, mut ring, mut guest) = shared_region_with_capacity(128);
        let key = test_key();

        let data = vec![0x42u8; 512];
        let accepted = ring.write_tcp_data(&key, &data);
        assert!(accepted > 0 && accepted < data.len());

        // Drain and re-offer the remainder; every byte arrives in order.
        let mut received = Vec::new();
        let mut offset = accepted;
        loop {
            while let Some(event) = guest.read_event() {
                match event {
                    NetEvent::TcpData { data, .. } => received.extend_from_slice(&data),
                    other => panic!("unexpected event {other:?}"),
                }
            }
            if offset == data.len() {
                break;
            }
            offset += ring.write_tcp_data(&key, &data[offset..]);
        }
        assert_eq!(received, data);
    }

    #[test]
    fn test_ring_wraps_around() {
        let (_stdin, mut ring, mut guest) = shared_region_with_capacity(256);
        let key = test_key();

        // Push enough traffic through a small ring that the cursors wrap
        // several times.
        for round in 0u8..32 {
            let data = vec![round; 100];
            let mut sent = 0;
            while sent < data.len() {
                sent += ring.write_tcp_data(&key, &data[sent..]);
                while let Some(NetEvent::TcpData { data: chunk, .. }) = guest.read_event() {
                    assert!(chunk.iter().all(|&b| b == round));
                }
            }
        }
    }

    #[test]
    fn test_wait_for_io_times_out() {
        let (_stdin, _ring, guest) = shared_region();
        let start = Instant::now();
        assert!(!guest.wait_for_io(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_for_io_wakes_on_stdin() {
        let (mut writer, _ring, guest) = shared_region();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.write_stdin(b"wake").unwrap();
        });

        assert!(guest.wait_for_io(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_spsc_stress_order_preserved() {
        let (_stdin, mut ring, mut guest) = shared_region_with_capacity(4096);
        let key = test_key();
        let total: usize = 256 * 1024;

        let producer = std::thread::spawn(move || {
            let mut sent = 0usize;
            let mut value = 0u8;
            while sent < total {
                let take = 997.min(total - sent);
                let chunk: Vec<u8> = (0..take)
                    .map(|_| {
                        value = value.wrapping_add(1);
                        value
                    })
                    .collect();
                let mut off = 0;
                while off < take {
                    let n = ring.write_tcp_data(&key, &chunk[off..]);
                    off += n;
                    if n == 0 {
                        std::thread::yield_now();
                    }
                }
                sent += take;
            }
        });

        let mut received = 0usize;
        let mut expect = 0u8;
        while received < total {
            match guest.read_event() {
                Some(NetEvent::TcpData { data, .. }) => {
                    for b in data {
                        expect = expect.wrapping_add(1);
                        assert_eq!(b, expect);
                        received += 1;
                    }
                }
                Some(other) => panic!("unexpected event {other:?}"),
                None => {
                    guest.wait_for_io(Duration::from_millis(5));
                }
            }
        }
        producer.join().unwrap();
    }
}
