//! Fixed-capacity sample FIFO shared between the application thread and the
//! transfer pump's event thread.
//!
//! Writes copy samples in as-is. Reads go through a conversion: the caller
//! says how many output elements it wants, the conversion says how many
//! source samples that costs, and the samples are converted straight out of
//! the ring (in one or two spans) without an intermediate copy.

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, SfeError};

/// Largest conversion granule a read can bridge across the wrap point.
pub const MAX_GRANULE: usize = 8;

/// A "size function + conversion function" pair used by [`SampleRingBuffer::read`].
///
/// `GRANULE` is the number of source samples the conversion consumes as one
/// indivisible unit (4 for real 10-bit wire frames, 2 for complex ones).
pub trait Conversion<T> {
    type Output;
    const GRANULE: usize = 1;

    /// Source samples needed to produce `dst_len` output elements.
    fn source_len(&self, dst_len: usize) -> usize;

    /// Converts every sample in `src` into the head of `dst` and returns the
    /// number of output elements written.
    fn convert(&self, dst: &mut [Self::Output], src: &[T]) -> usize;
}

pub struct SampleRingBuffer<T> {
    buf: Box<[T]>,
    count: usize,
    rd_pos: usize,
    wr_pos: usize,
}

impl<T: Copy + Default> SampleRingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![T::default(); capacity].into_boxed_slice(),
            count: 0,
            rd_pos: 0,
            wr_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn space(&self) -> usize {
        self.buf.len() - self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.rd_pos = 0;
        self.wr_pos = 0;
    }

    /// Copies all of `data` in, or nothing at all if it does not fit.
    /// Returns the number of samples written.
    pub fn write(&mut self, data: &[T]) -> usize {
        let len = data.len();
        if len > self.space() {
            return 0;
        }

        let cap = self.buf.len();
        let sz1 = cap - self.wr_pos;
        if sz1 < len {
            self.buf[self.wr_pos..].copy_from_slice(&data[..sz1]);
            self.buf[..len - sz1].copy_from_slice(&data[sz1..]);
            self.wr_pos = len - sz1;
        } else {
            self.buf[self.wr_pos..self.wr_pos + len].copy_from_slice(data);
            self.wr_pos += len;
            if self.wr_pos == cap {
                self.wr_pos = 0;
            }
        }

        self.count += len;
        len
    }

    /// Reads enough samples to fill `dst` through `conv`.
    ///
    /// Returns the number of source samples consumed, or 0 (state untouched)
    /// when fewer than `conv.source_len(dst.len())` samples are buffered.
    pub fn read<C: Conversion<T>>(&mut self, dst: &mut [C::Output], conv: &C) -> usize {
        self.read_with(
            dst,
            C::GRANULE,
            |n| conv.source_len(n),
            |d, s| conv.convert(d, s),
        )
    }

    /// Closure form of [`read`](Self::read).
    pub fn read_with<U, L, F>(
        &mut self,
        dst: &mut [U],
        granule: usize,
        source_len: L,
        mut convert: F,
    ) -> usize
    where
        L: Fn(usize) -> usize,
        F: FnMut(&mut [U], &[T]) -> usize,
    {
        let src_len = source_len(dst.len());
        if src_len == 0 || src_len > self.count {
            return 0;
        }
        let granule = granule.clamp(1, MAX_GRANULE);

        let cap = self.buf.len();
        let sz1 = cap - self.rd_pos;
        if sz1 < src_len {
            // Whole granules before the wrap point go straight through.
            let head = sz1 - sz1 % granule;
            let mut written = 0;
            if head > 0 {
                written += convert(dst, &self.buf[self.rd_pos..self.rd_pos + head]);
            }

            // A granule straddling the wrap point is stitched together on the stack.
            let straddle = sz1 - head;
            let mut tail_start = 0;
            if straddle > 0 {
                let mut bridge = [T::default(); MAX_GRANULE];
                bridge[..straddle].copy_from_slice(&self.buf[self.rd_pos + head..]);
                bridge[straddle..granule].copy_from_slice(&self.buf[..granule - straddle]);
                written += convert(&mut dst[written..], &bridge[..granule]);
                tail_start = granule - straddle;
            }

            let rest = src_len - sz1;
            if rest > tail_start {
                convert(&mut dst[written..], &self.buf[tail_start..rest]);
            }
            self.rd_pos = rest;
        } else {
            convert(dst, &self.buf[self.rd_pos..self.rd_pos + src_len]);
            self.rd_pos += src_len;
            if self.rd_pos == cap {
                self.rd_pos = 0;
            }
        }

        self.count -= src_len;
        src_len
    }
}

struct Shared<T> {
    ring: SampleRingBuffer<T>,
    closed: bool,
}

/// [`SampleRingBuffer`] behind a mutex with a condition variable, for one
/// producer context and one consumer context.
///
/// The blocking calls are meant for the application thread; the `try_*`
/// calls never wait and are what the pump's completion handlers use.
pub struct SharedRingBuffer<T> {
    inner: Mutex<Shared<T>>,
    cond: Condvar,
}

impl<T: Copy + Default> SharedRingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Shared {
                ring: SampleRingBuffer::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().ring.capacity()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().ring.count()
    }

    pub fn space(&self) -> usize {
        self.inner.lock().ring.space()
    }

    /// Wakes every blocked caller; from now on blocking calls fail with
    /// [`SfeError::DeviceFailed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Blocks until `data` fits, then writes all of it.
    pub fn write_blocking(&self, data: &[T]) -> Result<()> {
        let mut guard = self.inner.lock();
        if data.len() > guard.ring.capacity() {
            return Err(SfeError::Contract("write larger than ring capacity"));
        }
        loop {
            if guard.closed {
                return Err(SfeError::DeviceFailed);
            }
            if guard.ring.space() >= data.len() {
                guard.ring.write(data);
                self.cond.notify_all();
                return Ok(());
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Blocks until enough samples are buffered to fill `dst`, then reads.
    pub fn read_blocking<C: Conversion<T>>(
        &self,
        dst: &mut [C::Output],
        conv: &C,
    ) -> Result<usize> {
        let needed = conv.source_len(dst.len());
        let mut guard = self.inner.lock();
        if needed > guard.ring.capacity() {
            return Err(SfeError::Contract("read larger than ring capacity"));
        }
        loop {
            if guard.closed {
                return Err(SfeError::DeviceFailed);
            }
            if guard.ring.count() >= needed {
                let n = guard.ring.read(dst, conv);
                self.cond.notify_all();
                return Ok(n);
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Non-blocking write; returns 0 when `data` does not fit.
    pub fn try_write(&self, data: &[T]) -> usize {
        let mut guard = self.inner.lock();
        let n = guard.ring.write(data);
        if n > 0 {
            self.cond.notify_all();
        }
        n
    }

    /// Non-blocking read; returns 0 when not enough samples are buffered.
    pub fn try_read<C: Conversion<T>>(&self, dst: &mut [C::Output], conv: &C) -> usize {
        let mut guard = self.inner.lock();
        let n = guard.ring.read(dst, conv);
        if n > 0 {
            self.cond.notify_all();
        }
        n
    }
}
