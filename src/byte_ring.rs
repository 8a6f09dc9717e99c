//! Fixed-capacity receive ring shared by the link reader and the command consumer
//!
//! `ByteRing` is the plain circular buffer. `SharedRing` wraps it in a mutex and
//! condition variable: the link reader thread is the only appender, the dispatch
//! thread is the only drainer. Blocking reads re-check both the deadline and the
//! predicate on every wakeup.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default ring size, comfortably above one worst-case protocol frame
pub const DEFAULT_CAPACITY: usize = 1024;

/// Most bytes we accept without seeing a line terminator
pub const MAX_UNTERMINATED: usize = 255;

const LINE_TERMINATOR: u8 = b'\n';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("receive ring overflow (capacity {capacity} bytes)")]
    Overflow { capacity: usize },

    #[error("{pending} bytes received without a line terminator (limit {limit}); check the serial line and reset the machine")]
    Flood { pending: usize, limit: usize },

    #[error("receive ring closed")]
    Closed,
}

/// Non-growable FIFO of bytes.
///
/// Holds at most `capacity - 1` bytes so that `head == tail` always means empty.
#[derive(Debug)]
pub struct ByteRing {
    buffer: Box<[u8]>,
    head: usize,
    tail: usize,
    /// Bytes past `head` already searched for a terminator
    scanned: usize,
    flood_limit: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must hold at least one byte");
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            scanned: 0,
            flood_limit: MAX_UNTERMINATED.min(capacity - 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        (self.tail + self.buffer.len() - self.head) % self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes of the current line seen so far without a terminator
    pub fn partial_line_len(&self) -> usize {
        self.scanned
    }

    pub fn append(&mut self, byte: u8) -> Result<(), RingError> {
        if self.len() == self.buffer.len() - 1 {
            return Err(RingError::Overflow { capacity: self.buffer.len() });
        }
        self.buffer[self.tail] = byte;
        self.tail = (self.tail + 1) % self.buffer.len();
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buffer[self.head];
        self.head = (self.head + 1) % self.buffer.len();
        self.scanned = self.scanned.saturating_sub(1);
        Some(byte)
    }

    /// Remove and return everything up to and including the first terminator.
    ///
    /// Returns `Ok(None)` while no terminator has arrived. The search resumes
    /// where the previous call stopped.
    pub fn drain_line(&mut self) -> Result<Option<Vec<u8>>, RingError> {
        let len = self.len();
        let capacity = self.buffer.len();

        while self.scanned < len {
            let index = (self.head + self.scanned) % capacity;
            if self.buffer[index] == LINE_TERMINATOR {
                let line_len = self.scanned + 1;
                let mut line = Vec::with_capacity(line_len);
                for _ in 0..line_len {
                    if let Some(byte) = self.pop() {
                        line.push(byte);
                    }
                }
                self.scanned = 0;
                return Ok(Some(line));
            }
            self.scanned += 1;
        }

        if self.scanned > self.flood_limit {
            return Err(RingError::Flood { pending: self.scanned, limit: self.flood_limit });
        }
        Ok(None)
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.scanned = 0;
    }
}

#[derive(Debug)]
struct RingState {
    ring: ByteRing,
    closed: bool,
}

/// `ByteRing` behind a lock, with notify-on-append wakeups for blocked readers
#[derive(Debug)]
pub struct SharedRing {
    state: Mutex<RingState>,
    readable: Condvar,
    timeout: Duration,
}

impl SharedRing {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RingState { ring: ByteRing::new(capacity), closed: false }),
            readable: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured read timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ring.is_empty()
    }

    pub fn partial_line_len(&self) -> usize {
        self.lock().ring.partial_line_len()
    }

    /// Append a batch from the reader side, waking any blocked consumer
    pub fn append(&self, bytes: &[u8]) -> Result<(), RingError> {
        let mut guard = self.lock();
        if guard.closed {
            return Err(RingError::Closed);
        }
        let mut result = Ok(());
        for &byte in bytes {
            if let Err(e) = guard.ring.append(byte) {
                result = Err(e);
                break;
            }
        }
        drop(guard);
        self.readable.notify_all();
        result
    }

    /// Block for one byte, up to the configured timeout. `Ok(None)` means timed out.
    pub fn drain_one(&self) -> Result<Option<u8>, RingError> {
        self.drain_one_within(self.timeout)
    }

    pub fn drain_one_within(&self, timeout: Duration) -> Result<Option<u8>, RingError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(byte) = guard.ring.pop() {
                return Ok(Some(byte));
            }
            if guard.closed {
                return Err(RingError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            guard = self
                .readable
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Non-blocking line extraction
    pub fn drain_line(&self) -> Result<Option<Vec<u8>>, RingError> {
        let mut guard = self.lock();
        match guard.ring.drain_line()? {
            Some(line) => Ok(Some(line)),
            None if guard.closed && guard.ring.is_empty() => Err(RingError::Closed),
            None => Ok(None),
        }
    }

    /// Block until a whole line is available or `timeout` elapses
    pub fn wait_line(&self, timeout: Duration) -> Result<Option<Vec<u8>>, RingError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(line) = guard.ring.drain_line()? {
                return Ok(Some(line));
            }
            if guard.closed {
                return Err(RingError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            guard = self
                .readable
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drop buffered bytes; returns how many were discarded
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let discarded = guard.ring.len();
        guard.ring.clear();
        drop(guard);
        self.readable.notify_all();
        discarded
    }

    /// Mark the ring closed and wake every waiter
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let mut ring = ByteRing::new(8);
        for b in b"abcdefg" {
            ring.append(*b).unwrap();
        }
        let drained: Vec<u8> = std::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(drained, b"abcdefg");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut ring = ByteRing::new(4);
        ring.append(1).unwrap();
        ring.append(2).unwrap();
        ring.append(3).unwrap();
        assert_eq!(ring.append(4), Err(RingError::Overflow { capacity: 4 }));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_wrap_around_refill_behaves_like_first_fill() {
        let mut ring = ByteRing::new(5);
        for round in 0..3u8 {
            for i in 0..4u8 {
                ring.append(round * 10 + i).unwrap();
            }
            assert!(ring.append(99).is_err());
            let drained: Vec<u8> = std::iter::from_fn(|| ring.pop()).collect();
            assert_eq!(drained, vec![round * 10, round * 10 + 1, round * 10 + 2, round * 10 + 3]);
        }
    }

    #[test]
    fn test_drain_line_waits_for_terminator() {
        let mut ring = ByteRing::new(64);
        for b in b"ok" {
            ring.append(*b).unwrap();
        }
        assert_eq!(ring.drain_line().unwrap(), None);
        assert_eq!(ring.partial_line_len(), 2);

        for b in b" T:20" {
            ring.append(*b).unwrap();
        }
        assert_eq!(ring.drain_line().unwrap(), None);
        assert_eq!(ring.partial_line_len(), 7);

        for b in b"\nst" {
            ring.append(*b).unwrap();
        }
        assert_eq!(ring.drain_line().unwrap(), Some(b"ok T:20\n".to_vec()));
        assert_eq!(ring.partial_line_len(), 0);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.drain_line().unwrap(), None);
    }

    #[test]
    fn test_drain_line_across_wrap() {
        let mut ring = ByteRing::new(8);
        for b in b"xxxxx" {
            ring.append(*b).unwrap();
        }
        for _ in 0..5 {
            ring.pop();
        }
        for b in b"ok\nok\n" {
            ring.append(*b).unwrap();
        }
        assert_eq!(ring.drain_line().unwrap(), Some(b"ok\n".to_vec()));
        assert_eq!(ring.drain_line().unwrap(), Some(b"ok\n".to_vec()));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_flood_guard_trips() {
        let mut ring = ByteRing::new(1024);
        for _ in 0..300 {
            ring.append(b'#').unwrap();
        }
        assert!(matches!(ring.drain_line(), Err(RingError::Flood { .. })));
    }

    #[test]
    fn test_pop_keeps_search_offset_consistent() {
        let mut ring = ByteRing::new(16);
        for b in b"abc" {
            ring.append(*b).unwrap();
        }
        assert_eq!(ring.drain_line().unwrap(), None);
        assert_eq!(ring.pop(), Some(b'a'));
        assert_eq!(ring.partial_line_len(), 2);
        ring.append(b'\n').unwrap();
        assert_eq!(ring.drain_line().unwrap(), Some(b"bc\n".to_vec()));
    }

    #[test]
    fn test_drain_one_times_out() {
        let ring = SharedRing::new(16, Duration::from_millis(20));
        let started = Instant::now();
        assert_eq!(ring.drain_one().unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_blocked_reader_wakes_on_append() {
        let ring = Arc::new(SharedRing::new(64, Duration::from_secs(5)));
        let producer = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.append(b"start\n").unwrap();
        });

        let line = ring.wait_line(Duration::from_secs(5)).unwrap();
        assert_eq!(line, Some(b"start\n".to_vec()));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_waiters() {
        let ring = Arc::new(SharedRing::new(64, Duration::from_secs(5)));
        let closer = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert_eq!(ring.drain_one(), Err(RingError::Closed));
        handle.join().unwrap();
        assert_eq!(ring.append(b"x"), Err(RingError::Closed));
    }

    #[test]
    fn test_threaded_fifo_order() {
        let ring = Arc::new(SharedRing::new(32, Duration::from_secs(2)));
        let producer = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            for chunk in (0u8..200).collect::<Vec<_>>().chunks(10) {
                loop {
                    if producer.len() + chunk.len() < 32 {
                        producer.append(chunk).unwrap();
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });

        let mut received = Vec::new();
        while received.len() < 200 {
            if let Some(byte) = ring.drain_one().unwrap() {
                received.push(byte);
            }
        }
        handle.join().unwrap();
        assert_eq!(received, (0u8..200).collect::<Vec<_>>());
    }
}
