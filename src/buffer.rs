//! FIFO byte buffer used while accumulating handshake data.
//!
//! Bytes are appended by reading from any `Read` source and consumed
//! through the [`Buf`] cursor interface; whatever remains after the
//! handshake is handed to the frame codec as its initial buffer.

use std::io::{Cursor, Read, Result as IoResult};

use bytes::Buf;

/// A FIFO buffer filled in fixed-size chunks from a stream.
#[derive(Debug)]
pub struct ReadBuffer<const CHUNK_SIZE: usize> {
    storage: Cursor<Vec<u8>>,
    chunk: Box<[u8; CHUNK_SIZE]>,
}

impl<const CHUNK_SIZE: usize> ReadBuffer<CHUNK_SIZE> {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::with_capacity(CHUNK_SIZE)
    }

    /// Create an empty buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Cursor::new(Vec::with_capacity(capacity)),
            chunk: Box::new([0; CHUNK_SIZE]),
        }
    }

    /// Pull the next chunk from the stream, returning how many bytes
    /// arrived.
    pub fn read_from<S: Read>(&mut self, stream: &mut S) -> IoResult<usize> {
        self.clean_up();

        let size = stream.read(&mut *self.chunk)?;
        self.storage.get_mut().extend_from_slice(&self.chunk[..size]);

        Ok(size)
    }

    /// Drop the bytes the cursor has already moved past.
    fn clean_up(&mut self) {
        let pos = self.storage.position() as usize;
        self.storage.get_mut().drain(..pos);
        self.storage.set_position(0);
    }

    /// Consume the buffer, returning the unread remainder.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.clean_up();
        self.storage.into_inner()
    }
}

impl<const CHUNK_SIZE: usize> Buf for ReadBuffer<CHUNK_SIZE> {
    fn remaining(&self) -> usize {
        self.storage.get_ref().len() - self.storage.position() as usize
    }

    fn chunk(&self) -> &[u8] {
        let pos = self.storage.position() as usize;
        &self.storage.get_ref()[pos..]
    }

    fn advance(&mut self, count: usize) {
        let capped =
            (self.storage.position() + count as u64).min(self.storage.get_ref().len() as u64);
        self.storage.set_position(capped);
    }
}

impl<const CHUNK_SIZE: usize> Default for ReadBuffer<CHUNK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}
