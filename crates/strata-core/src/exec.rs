use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use strata_types::{RepositoryError, Result};

/// One-shot completion sink for an asynchronous operation.
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub const SNAPSHOT_POOL: &str = "strata-snapshot";
pub const GENERIC_POOL: &str = "strata-generic";
const SCHEDULER_THREAD: &str = "strata-scheduler";

/// Debug-build check that blocking blob I/O runs on a designated pool
/// thread. Threads the engine does not own are the host's business and
/// always pass; engine-owned threads must be snapshot or generic (never
/// the scheduler).
pub fn assert_snapshot_or_generic_thread() {
    #[cfg(debug_assertions)]
    {
        let current = std::thread::current();
        let ok = current.name().map_or(true, |name| {
            name.contains(SNAPSHOT_POOL) || name.contains(GENERIC_POOL) || !name.starts_with("strata-")
        });
        debug_assert!(
            ok,
            "expected the snapshot or generic pool thread, was {:?}",
            current.name()
        );
    }
}

struct Pool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    fn new(name: &'static str, threads: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // A send can only fail during shutdown; the job is dropped.
            let _ = tx.send(job);
        }
    }

    fn shutdown(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// The executor bridge: a CPU-ish snapshot pool, a generic pool for
/// blocking store calls, and a scheduler for delayed retries.
///
/// All public repository operations that do I/O are dispatched here; the
/// pools drain and join on drop.
pub struct ThreadPool {
    snapshot: Mutex<Pool>,
    generic: Mutex<Pool>,
    scheduler: Scheduler,
}

impl ThreadPool {
    pub fn new(snapshot_threads: usize, generic_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(Pool::new(SNAPSHOT_POOL, snapshot_threads)),
            generic: Mutex::new(Pool::new(GENERIC_POOL, generic_threads)),
            scheduler: Scheduler::new(),
        })
    }

    pub fn spawn_snapshot(&self, job: impl FnOnce() + Send + 'static) {
        self.snapshot.lock().unwrap().execute(Box::new(job));
    }

    pub fn spawn_generic(&self, job: impl FnOnce() + Send + 'static) {
        self.generic.lock().unwrap().execute(Box::new(job));
    }

    /// Run `job` after `delay`. The job executes on the scheduler thread
    /// and must immediately hand off real work to one of the pools.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule(delay, Box::new(job));
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.snapshot.lock().unwrap().shutdown();
        self.generic.lock().unwrap().shutdown();
    }
}

struct Delayed {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerState {
    queue: BinaryHeap<Delayed>,
    next_seq: u64,
    stopped: bool,
}

struct Scheduler {
    state: Arc<(Mutex<SchedulerState>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    fn new() -> Self {
        let state = Arc::new((
            Mutex::new(SchedulerState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            Condvar::new(),
        ));
        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name(SCHEDULER_THREAD.to_string())
            .spawn(move || Self::run(thread_state))
            .expect("failed to spawn scheduler thread");
        Self {
            state,
            thread: Mutex::new(Some(thread)),
        }
    }

    fn run(state: Arc<(Mutex<SchedulerState>, Condvar)>) {
        let (lock, cv) = &*state;
        let mut guard = lock.lock().unwrap();
        loop {
            if guard.stopped {
                return;
            }
            let now = Instant::now();
            let next_at = guard.queue.peek().map(|head| head.at);
            match next_at {
                Some(at) if at <= now => {
                    let delayed = guard.queue.pop().unwrap();
                    drop(guard);
                    (delayed.job)();
                    guard = lock.lock().unwrap();
                }
                Some(at) => {
                    guard = cv.wait_timeout(guard, at - now).unwrap().0;
                }
                None => {
                    guard = cv.wait(guard).unwrap();
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, job: Job) {
        let (lock, cv) = &*self.state;
        let mut guard = lock.lock().unwrap();
        if guard.stopped {
            return;
        }
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.queue.push(Delayed {
            at: Instant::now() + delay,
            seq,
            job,
        });
        cv.notify_one();
    }

    fn stop(&self) {
        let (lock, cv) = &*self.state;
        lock.lock().unwrap().stopped = true;
        cv.notify_one();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out / fan-in primitives
// ---------------------------------------------------------------------------

struct GroupedState<T> {
    remaining: usize,
    results: Vec<T>,
    failure: Option<RepositoryError>,
    completion: Option<Completion<Vec<T>>>,
}

/// Collects `expected` completions and invokes the final sink once, with
/// either every result or the first failure (subsequent failures are
/// suppressed). Failed branches still count toward the group, so the
/// fan-in fires only after every branch has drained.
pub struct GroupedCompletion<T> {
    inner: Arc<Mutex<GroupedState<T>>>,
}

impl<T> Clone for GroupedCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> GroupedCompletion<T> {
    pub fn new(expected: usize, completion: Completion<Vec<T>>) -> Self {
        assert!(expected > 0, "grouped completion requires at least one slot");
        Self {
            inner: Arc::new(Mutex::new(GroupedState {
                remaining: expected,
                results: Vec::with_capacity(expected),
                failure: None,
                completion: Some(completion),
            })),
        }
    }

    pub fn on_response(&self, value: T) {
        self.finish(Ok(value));
    }

    pub fn on_failure(&self, err: RepositoryError) {
        self.finish(Err(err));
    }

    fn finish(&self, result: Result<T>) {
        let fire = {
            let mut state = self.inner.lock().unwrap();
            debug_assert!(state.remaining > 0, "grouped completion overflowed");
            match result {
                Ok(value) => state.results.push(value),
                Err(err) => {
                    if state.failure.is_none() {
                        state.failure = Some(err);
                    }
                }
            }
            state.remaining -= 1;
            if state.remaining == 0 {
                let completion = state.completion.take();
                let failure = state.failure.take();
                let results = std::mem::take(&mut state.results);
                completion.map(|c| (c, failure, results))
            } else {
                None
            }
        };
        if let Some((completion, failure, results)) = fire {
            match failure {
                Some(err) => completion(Err(err)),
                None => completion(Ok(results)),
            }
        }
    }
}

enum StepState<T> {
    Empty,
    Waiting(Completion<T>),
    Done(Result<T>),
    Finished,
}

/// Single-slot latch connecting one producer to one consumer, for
/// composing sequential asynchronous steps without nesting callbacks.
pub struct Step<T> {
    inner: Arc<Mutex<StepState<T>>>,
}

impl<T> Clone for Step<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Step<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StepState::Empty)),
        }
    }

    /// A completion sink that resolves this step.
    pub fn sink(&self) -> Completion<T> {
        let step = self.clone();
        Box::new(move |result| step.complete(result))
    }

    /// Resolve the step. A second resolution is ignored.
    pub fn complete(&self, result: Result<T>) {
        let waiting = {
            let mut state = self.inner.lock().unwrap();
            match std::mem::replace(&mut *state, StepState::Finished) {
                StepState::Empty => {
                    *state = StepState::Done(result);
                    return;
                }
                StepState::Waiting(completion) => Some(completion),
                done @ StepState::Done(_) => {
                    debug_assert!(false, "step completed twice");
                    *state = done;
                    None
                }
                StepState::Finished => {
                    debug_assert!(false, "step completed twice");
                    None
                }
            }
        };
        if let Some(completion) = waiting {
            completion(result);
        }
    }

    /// Register the single consumer; runs immediately if already resolved.
    pub fn when_complete(&self, completion: Completion<T>) {
        let ready = {
            let mut state = self.inner.lock().unwrap();
            match std::mem::replace(&mut *state, StepState::Finished) {
                StepState::Empty => {
                    *state = StepState::Waiting(completion);
                    return;
                }
                StepState::Done(result) => Some((completion, result)),
                other => {
                    debug_assert!(false, "step already has a consumer");
                    *state = other;
                    None
                }
            }
        };
        if let Some((completion, result)) = ready {
            completion(result);
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded exponential backoff retry
// ---------------------------------------------------------------------------

/// Exponential backoff policy bounded by a cumulative delay budget.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    initial: Duration,
    max_cumulative: Duration,
}

impl BackoffPolicy {
    pub fn exponential(initial: Duration, max_cumulative: Duration) -> Self {
        Self {
            initial,
            max_cumulative,
        }
    }

    /// The default policy for transient shard-transport failures:
    /// 50 ms doubling, at most one second of cumulative delay.
    pub fn transient_transport() -> Self {
        Self::exponential(Duration::from_millis(50), Duration::from_millis(1000))
    }

    pub fn delays(&self) -> BackoffDelays {
        BackoffDelays {
            next: self.initial,
            cumulative: Duration::ZERO,
            max_cumulative: self.max_cumulative,
        }
    }
}

pub struct BackoffDelays {
    next: Duration,
    cumulative: Duration,
    max_cumulative: Duration,
}

impl Iterator for BackoffDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next;
        if self.cumulative + delay > self.max_cumulative {
            return None;
        }
        self.cumulative += delay;
        self.next = delay.saturating_mul(2);
        Some(delay)
    }
}

struct RetryDriver<T, F> {
    pool: Arc<ThreadPool>,
    op: F,
    delays: Mutex<BackoffDelays>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

/// Run `op`, retrying transient failures on the snapshot pool after the
/// next delay from `policy`; the first non-transient failure, success, or
/// backoff exhaustion is forwarded to `completion`.
pub fn retry_with_backoff<T, F>(
    pool: Arc<ThreadPool>,
    policy: BackoffPolicy,
    op: F,
    completion: Completion<T>,
) where
    T: Send + 'static,
    F: Fn(Completion<T>) + Send + Sync + 'static,
{
    let driver = Arc::new(RetryDriver {
        pool,
        op,
        delays: Mutex::new(policy.delays()),
        _marker: std::marker::PhantomData,
    });
    attempt(driver, completion);
}

fn attempt<T, F>(driver: Arc<RetryDriver<T, F>>, completion: Completion<T>)
where
    T: Send + 'static,
    F: Fn(Completion<T>) + Send + Sync + 'static,
{
    let observer = Arc::clone(&driver);
    (driver.op)(Box::new(move |result| match result {
        Err(err) if err.is_transient() => {
            let delay = observer.delays.lock().unwrap().next();
            match delay {
                Some(delay) => {
                    tracing::debug!(?delay, error = %err, "retrying transient failure");
                    let rescheduled = Arc::clone(&observer);
                    let pool = Arc::clone(&observer.pool);
                    pool.schedule(delay, move || {
                        let spawn_pool = Arc::clone(&rescheduled.pool);
                        let next = Arc::clone(&rescheduled);
                        spawn_pool.spawn_snapshot(move || attempt(next, completion));
                    });
                }
                None => completion(Err(err)),
            }
        }
        other => completion(other),
    }));
}
