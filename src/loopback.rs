//! In-memory serial port pair
//!
//! Each end writes into a channel the other end reads from. Used for the
//! virtual printer and for transport tests that must not touch hardware.

use crate::link::PortIo;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct LoopbackPort {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    timeout: Duration,
    resets: Arc<AtomicUsize>,
}

/// Two connected ends. Reads on either end time out after `timeout`.
pub fn pair(timeout: Duration) -> (LoopbackPort, LoopbackPort) {
    let (a_tx, a_rx) = channel::unbounded();
    let (b_tx, b_rx) = channel::unbounded();
    let resets = Arc::new(AtomicUsize::new(0));

    let host = LoopbackPort {
        tx: a_tx,
        rx: b_rx,
        pending: Vec::new(),
        timeout,
        resets: Arc::clone(&resets),
    };
    let far = LoopbackPort { tx: b_tx, rx: a_rx, pending: Vec::new(), timeout, resets };
    (host, far)
}

impl LoopbackPort {
    /// Another handle on the same end, for split reader/writer use
    pub fn try_clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            pending: Vec::new(),
            timeout: self.timeout,
            resets: Arc::clone(&self.resets),
        }
    }

    /// Falling edges seen on the control lines
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::Acquire)
    }
}

impl PortIo for LoopbackPort {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => self.pending = bytes,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "loopback read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer dropped"))
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer dropped"))
    }

    fn set_control_lines(&mut self, level: bool) -> io::Result<()> {
        if !level {
            self.resets.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}
