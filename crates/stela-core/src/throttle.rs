//! Admission control for transfers: a FIFO slot semaphore bounding
//! concurrent files and a token-bucket limiter bounding byte rate. Every
//! transfer passes both gates; nothing else in the crate talks to the
//! network or disk without a ticket.

use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, StelaError};

/// How long a waiter sleeps between cancellation checks.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Cooperative cancellation flag shared by a scope of work.
///
/// Observed at suspension points: slot waits, bucket waits, read
/// boundaries. Cancelled work releases its gates on the way out.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StelaError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// FIFO slot semaphore
// ---------------------------------------------------------------------------

struct SlotState {
    available: usize,
    next_ticket: u64,
    now_serving: u64,
    /// Tickets whose waiter cancelled before being served; skipped over
    /// when their turn comes.
    abandoned: HashSet<u64>,
}

/// Counting semaphore with strict FIFO admission.
pub struct TransferSlots {
    state: Mutex<SlotState>,
    freed: Condvar,
}

impl TransferSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                available: capacity.max(1),
                next_ticket: 0,
                now_serving: 0,
                abandoned: HashSet::new(),
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot is free and every earlier waiter was served.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<SlotGuard<'_>> {
        let mut st = self.state.lock().unwrap();
        let my_ticket = st.next_ticket;
        st.next_ticket += 1;
        loop {
            loop {
                let now_serving = st.now_serving;
                if !st.abandoned.remove(&now_serving) {
                    break;
                }
                st.now_serving += 1;
            }
            if cancel.is_cancelled() {
                st.abandoned.insert(my_ticket);
                loop {
                    let now_serving = st.now_serving;
                    if !st.abandoned.remove(&now_serving) {
                        break;
                    }
                    st.now_serving += 1;
                }
                self.freed.notify_all();
                return Err(StelaError::Cancelled);
            }
            if st.now_serving == my_ticket && st.available > 0 {
                st.available -= 1;
                st.now_serving += 1;
                self.freed.notify_all();
                return Ok(SlotGuard { slots: self });
            }
            let (next, _timeout) = self.freed.wait_timeout(st, WAIT_SLICE).unwrap();
            st = next;
        }
    }

    fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.available += 1;
        self.freed.notify_all();
    }
}

/// RAII slot; dropping it re-admits the next waiter.
pub struct SlotGuard<'a> {
    slots: &'a TransferSlots,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.release();
    }
}

// ---------------------------------------------------------------------------
// Token-bucket byte limiter
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Byte-rate limiter with a burst allowance. Rate zero means unlimited.
pub struct TokenBucket {
    rate: u64,
    burst: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64, burst: u64) -> Self {
        let burst = burst.max(1);
        Self {
            rate: rate_bytes_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Standard sizing: one second of rate as burst.
    pub fn with_default_burst(rate_bytes_per_sec: u64) -> Self {
        Self::new(rate_bytes_per_sec, rate_bytes_per_sec.max(64 * 1024))
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Consume `n` tokens, parking until the bucket refills. Requests
    /// larger than the burst are clamped so a single oversized read cannot
    /// stall forever.
    pub fn take(&self, n: u64, cancel: &CancelToken) -> Result<()> {
        if self.rate == 0 || n == 0 {
            return Ok(());
        }
        let n = n.min(self.burst) as f64;
        loop {
            cancel.check()?;
            let wait = {
                let mut st = self.state.lock().unwrap();
                let elapsed = st.last_refill.elapsed().as_secs_f64();
                st.tokens = (st.tokens + elapsed * self.rate as f64).min(self.burst as f64);
                st.last_refill = Instant::now();
                if st.tokens >= n {
                    st.tokens -= n;
                    return Ok(());
                }
                Duration::from_secs_f64((n - st.tokens) / self.rate as f64)
            };
            std::thread::sleep(wait.min(WAIT_SLICE));
        }
    }
}

// ---------------------------------------------------------------------------
// Governor: both gates behind one handle
// ---------------------------------------------------------------------------

/// The single global admission point for transfers.
pub struct Governor {
    slots: TransferSlots,
    bucket: TokenBucket,
}

impl Governor {
    pub fn new(max_concurrent: usize, rate_bytes_per_sec: u64) -> Self {
        Self {
            slots: TransferSlots::new(max_concurrent),
            bucket: TokenBucket::with_default_burst(rate_bytes_per_sec),
        }
    }

    /// Wait for a transfer slot. Byte-rate tokens are consumed by the
    /// ticket's reader as data actually moves.
    pub fn admit(&self, cancel: &CancelToken) -> Result<Ticket<'_>> {
        let slot = self.slots.acquire(cancel)?;
        Ok(Ticket {
            _slot: slot,
            bucket: &self.bucket,
            cancel: cancel.clone(),
        })
    }
}

/// An admitted transfer. Holds the slot for its lifetime and hands out
/// rate-limited readers.
pub struct Ticket<'a> {
    _slot: SlotGuard<'a>,
    bucket: &'a TokenBucket,
    cancel: CancelToken,
}

impl<'a> Ticket<'a> {
    /// Wrap a reader so every read consumes byte-rate tokens and observes
    /// cancellation.
    pub fn wrap_reader<R: Read + Send + 'a>(&self, inner: R) -> ThrottledReader<'a, R> {
        ThrottledReader {
            inner,
            bucket: self.bucket,
            cancel: self.cancel.clone(),
        }
    }
}

/// Reader adaptor applying the governor at the read boundary.
pub struct ThrottledReader<'a, R> {
    inner: R,
    bucket: &'a TokenBucket,
    cancel: CancelToken,
}

impl<R: Read> Read for ThrottledReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.bucket
            .take(n as u64, &self.cancel)
            .map_err(|_| io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"))?;
        Ok(n)
    }
}
