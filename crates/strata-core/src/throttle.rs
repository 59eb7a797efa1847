use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Process-local byte-rate limiter shared across concurrent transfers in
/// one direction (all uploads share one, all restores another).
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    start: Instant,
    bytes_consumed: u128,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(LimiterState {
                start: Instant::now(),
                bytes_consumed: 0,
            }),
        }
    }

    /// Build a shared limiter, or `None` when the configured rate is
    /// non-positive (throttling disabled).
    pub fn from_bytes_per_sec(bytes_per_sec: i64) -> Option<Arc<Self>> {
        if bytes_per_sec <= 0 {
            None
        } else {
            Some(Arc::new(Self::new(bytes_per_sec as u64)))
        }
    }

    /// Account `bytes` against the budget, sleeping the calling thread
    /// when ahead of the allowed rate. Returns the time actually slept.
    pub fn consume(&self, bytes: usize) -> Duration {
        if bytes == 0 || self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }

        let sleep_duration = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.bytes_consumed = state.bytes_consumed.saturating_add(bytes as u128);

            let elapsed_secs = state.start.elapsed().as_secs_f64();
            let expected_secs = state.bytes_consumed as f64 / self.bytes_per_sec as f64;
            if expected_secs > elapsed_secs {
                Some(Duration::from_secs_f64(expected_secs - elapsed_secs))
            } else {
                None
            }
        }; // lock released before sleeping

        match sleep_duration {
            Some(d) => {
                std::thread::sleep(d);
                d
            }
            None => Duration::ZERO,
        }
    }
}

/// Read adaptor that throttles an inner stream through a shared limiter,
/// accumulating every blocked nanosecond into `throttle_nanos` so
/// operators can measure throttle pressure.
pub struct RateLimitedRead<R> {
    inner: R,
    limiter: Option<Arc<RateLimiter>>,
    throttle_nanos: Arc<AtomicU64>,
}

impl<R> RateLimitedRead<R> {
    pub fn new(
        inner: R,
        limiter: Option<Arc<RateLimiter>>,
        throttle_nanos: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            limiter,
            throttle_nanos,
        }
    }
}

impl<R: Read> Read for RateLimitedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(limiter) = &self.limiter {
            let slept = limiter.consume(n);
            if !slept.is_zero() {
                self.throttle_nanos
                    .fetch_add(slept.as_nanos() as u64, Ordering::Relaxed);
            }
        }
        Ok(n)
    }
}
