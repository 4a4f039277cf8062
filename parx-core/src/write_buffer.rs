//! Write buffer (C5): accumulates one block's worth of data stripes as a
//! caller streams bytes in, pads the tail stripe on close, and computes
//! parity via the redundancy provider once the block is complete.
//!
//! `WriteBufferPool` is a bounded, blocking-acquisition pool following the
//! reference's singleton-pool pattern (see `runtime.rs`): a fixed capacity
//! of buffers recycled via a condvar rather than allocated per block.

use crate::error::{EcError, EcResult};
use crate::redundancy::{RedundancyProvider, StripeSlot};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// One block's worth of stripe buffers being assembled by the stream
/// writer before it is dispatched to archives.
pub struct WriteBuffer {
    nbdata: usize,
    nbchunks: usize,
    chunksize: usize,
    stripes: Vec<Vec<u8>>,
    /// Bytes written so far into the data region (`nbdata * chunksize`).
    written: usize,
    complete: bool,
}

impl WriteBuffer {
    fn new(nbdata: usize, nbchunks: usize, chunksize: usize) -> Self {
        WriteBuffer {
            nbdata,
            nbchunks,
            chunksize,
            stripes: vec![vec![0u8; chunksize]; nbchunks],
            written: 0,
            complete: false,
        }
    }

    fn reset(&mut self) {
        for s in self.stripes.iter_mut() {
            s.iter_mut().for_each(|b| *b = 0);
        }
        self.written = 0;
        self.complete = false;
    }

    /// Appends `buf` at the buffer's current write position. Fails if it
    /// would overflow the data region.
    pub fn write(&mut self, buf: &[u8]) -> EcResult<()> {
        let datasize = self.nbdata * self.chunksize;
        if self.written + buf.len() > datasize {
            return Err(EcError::InvalidArgs("write exceeds block data size".into()));
        }
        let mut remaining = buf;
        let mut pos = self.written;
        while !remaining.is_empty() {
            let stripe = pos / self.chunksize;
            let offset = pos % self.chunksize;
            let n = remaining.len().min(self.chunksize - offset);
            self.stripes[stripe][offset..offset + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            pos += n;
        }
        self.written = pos;
        Ok(())
    }

    /// Zero-pads the remainder of the data region. Called when a block is
    /// closed short (the final, partial block of an object).
    pub fn pad(&mut self) {
        let datasize = self.nbdata * self.chunksize;
        // Buffers are already zero-initialized/reset, so padding is simply
        // advancing the write cursor; no bytes need touching.
        self.written = datasize;
    }

    /// True once every data stripe has been fully written (or padded).
    pub fn is_full(&self) -> bool {
        self.written == self.nbdata * self.chunksize
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Computes parity stripes in place via the redundancy provider.
    pub fn encode(&mut self, rp: &RedundancyProvider) -> EcResult<()> {
        let mut slots: Vec<StripeSlot> = self
            .stripes
            .iter_mut()
            .enumerate()
            .map(|(i, b)| StripeSlot {
                buffer: b,
                valid: i < self.nbdata,
            })
            .collect();
        rp.compute(&mut slots)
    }

    pub fn stripe(&self, idx: usize) -> &[u8] {
        &self.stripes[idx]
    }

    /// Real (unpadded) payload length of stripe `idx`: `min(chunksize,
    /// max(0, written - strpid*chunksize))` for a data stripe, mirrored
    /// from data stripe 0 for a parity stripe (every stripe in a block
    /// shares one payload length). Must be read before `pad()` runs, since
    /// padding advances `written` to the full data region and erases the
    /// true tail length -- mirrors `repair::stripe_write_size`'s
    /// recursive-to-stripe-0 handling of parity stripes.
    pub fn stripe_size(&self, idx: usize) -> usize {
        if idx >= self.nbdata {
            return self.stripe_size(0);
        }
        let stripe_start = idx * self.chunksize;
        if stripe_start >= self.written {
            0
        } else {
            (self.written - stripe_start).min(self.chunksize)
        }
    }

    /// CRC32 of one stripe, used when appending it to an archive.
    pub fn stripe_crc32(&self, idx: usize) -> u32 {
        crc32fast::hash(&self.stripes[idx])
    }

    pub fn nbchunks(&self) -> usize {
        self.nbchunks
    }
}

struct Inner {
    free: VecDeque<WriteBuffer>,
    outstanding: usize,
    capacity: usize,
    nbdata: usize,
    nbchunks: usize,
    chunksize: usize,
}

/// Bounded pool of `WriteBuffer`s: blocking acquisition via condvar,
/// recycle-and-reset on release rather than allocate/free per block.
pub struct WriteBufferPool {
    inner: Mutex<Inner>,
    cv: Condvar,
}

pub struct WriteBufferGuard<'a> {
    pool: &'a WriteBufferPool,
    buffer: Option<WriteBuffer>,
}

impl<'a> std::ops::Deref for WriteBufferGuard<'a> {
    type Target = WriteBuffer;
    fn deref(&self) -> &WriteBuffer {
        self.buffer.as_ref().unwrap()
    }
}

impl<'a> std::ops::DerefMut for WriteBufferGuard<'a> {
    fn deref_mut(&mut self) -> &mut WriteBuffer {
        self.buffer.as_mut().unwrap()
    }
}

impl<'a> Drop for WriteBufferGuard<'a> {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.reset();
            let mut inner = self.pool.inner.lock().unwrap();
            inner.outstanding -= 1;
            inner.free.push_back(buffer);
            self.pool.cv.notify_one();
        }
    }
}

impl WriteBufferPool {
    pub fn new(capacity: usize, nbchunks: usize, chunksize: usize) -> Self {
        // nbdata is not known at pool-construction time from nbchunks alone
        // in general, but `Runtime` always builds this pool from the same
        // `ObjectConfig` that defines nbdata; callers use `acquire_for`
        // when they need an explicit split.
        WriteBufferPool {
            inner: Mutex::new(Inner {
                free: VecDeque::new(),
                outstanding: 0,
                capacity,
                nbdata: nbchunks,
                nbchunks,
                chunksize,
            }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a buffer is available, configuring it for `nbdata` of
    /// the pool's `nbchunks` stripes holding data.
    pub fn acquire_for(&self, nbdata: usize) -> WriteBufferGuard<'_> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(mut buffer) = inner.free.pop_front() {
                inner.outstanding += 1;
                buffer.nbdata = nbdata;
                return WriteBufferGuard {
                    pool: self,
                    buffer: Some(buffer),
                };
            }
            if inner.outstanding < inner.capacity {
                inner.outstanding += 1;
                let buffer = WriteBuffer::new(nbdata, inner.nbchunks, inner.chunksize);
                return WriteBufferGuard {
                    pool: self,
                    buffer: Some(buffer),
                };
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }
}
