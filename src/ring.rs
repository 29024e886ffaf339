//! Latest-window ring buffer shared between the byte reader and the PSD worker.
//!
//! This is not a lossless queue: once full, every write overwrites the oldest
//! samples. Readers only ever ask for the most recent window.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::complex::IqSample;

#[derive(Debug)]
struct Inner {
    data: Vec<IqSample>,
    write_pos: usize,
    count: usize,
}

#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                data: vec![IqSample::default(); capacity],
                write_pos: 0,
                count: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid samples, saturating at capacity
    pub fn count(&self) -> usize {
        self.lock().count
    }

    // The state is only ever left half-written if a writer panics mid-copy,
    // and even then every slot is still a valid sample
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a batch, overwriting the oldest samples once full, and wake any waiter
    pub fn write(&self, samples: &[IqSample]) {
        if samples.is_empty() {
            return;
        }
        let cap = self.capacity;
        // Only the last `cap` samples of an oversized batch can survive
        let skipped = samples.len().saturating_sub(cap);
        let samples = &samples[skipped..];
        {
            let mut inner = self.lock();
            let start = (inner.write_pos + skipped) % cap;
            let first = samples.len().min(cap - start);
            inner.data[start..start + first].copy_from_slice(&samples[..first]);
            inner.data[..samples.len() - first].copy_from_slice(&samples[first..]);
            inner.write_pos = (start + samples.len()) % cap;
            inner.count = (inner.count + samples.len()).min(cap);
        }
        self.available.notify_all();
    }

    /// The `n` most recent samples in chronological order, or `None` if fewer
    /// than `n` are held. Never blocks on data.
    pub fn read_latest(&self, n: usize) -> Option<Vec<IqSample>> {
        let inner = self.lock();
        if n > inner.count {
            return None;
        }
        let cap = self.capacity;
        let start = (inner.write_pos + cap - n) % cap;
        let mut out = Vec::with_capacity(n);
        if start + n <= cap {
            out.extend_from_slice(&inner.data[start..start + n]);
        } else {
            out.extend_from_slice(&inner.data[start..]);
            out.extend_from_slice(&inner.data[..start + n - cap]);
        }
        Some(out)
    }

    /// Block until at least `n` samples are held or `timeout` elapses.
    /// Returns whether enough data is available.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.count < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.available.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
