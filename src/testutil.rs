//! Shared fixtures for the unit tests.

use std::{
    io::{self, Write},
    sync::Arc,
};

use parking_lot::Mutex;

/// A cloneable in-memory sink whose contents can be inspected after the
/// writer half was moved into a connection.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf {
    data: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl SharedBuf {
    /// A fresh, empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Make every subsequent write fail, simulating a dead peer.
    pub fn break_pipe(&self) {
        *self.fail_writes.lock() = true;
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if *self.fail_writes.lock() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if *self.fail_writes.lock() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        Ok(())
    }
}
