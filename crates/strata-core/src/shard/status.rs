use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use strata_types::{RepositoryError, Result};

/// Lifecycle stage of an in-flight shard snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Started,
    Finalize,
    Done,
    Failed,
    Aborted,
}

#[derive(Debug)]
struct StatusInner {
    stage: Stage,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    incremental_file_count: u64,
    total_file_count: u64,
    incremental_size: u64,
    total_size: u64,
    processed_size: u64,
    generation: Option<i64>,
    failure: Option<String>,
}

/// Point-in-time copy of the status for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub stage: Stage,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub incremental_file_count: u64,
    pub total_file_count: u64,
    pub incremental_size: u64,
    pub total_size: u64,
    pub processed_size: u64,
    pub generation: Option<i64>,
    pub failure: Option<String>,
}

/// In-memory lifecycle of one shard snapshot in progress.
///
/// Transitions run INIT -> STARTED -> FINALIZE -> DONE, with FAILED and
/// ABORTED as terminal detours. The abort flag is sticky and polled by
/// the uploader between part reads.
#[derive(Debug)]
pub struct ShardSnapshotStatus {
    inner: Mutex<StatusInner>,
    aborted: AtomicBool,
}

impl Default for ShardSnapshotStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardSnapshotStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                stage: Stage::Init,
                start_time: None,
                end_time: None,
                incremental_file_count: 0,
                total_file_count: 0,
                incremental_size: 0,
                total_size: 0,
                processed_size: 0,
                generation: None,
                failure: None,
            }),
            aborted: AtomicBool::new(false),
        }
    }

    /// Sticky cancellation signal, readable by the uploader at any time.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Request cancellation. Completed snapshots stay completed.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.stage, Stage::Done | Stage::Failed) {
            inner.stage = Stage::Aborted;
            inner.end_time = Some(Utc::now());
        }
    }

    pub fn move_to_started(
        &self,
        start_time: DateTime<Utc>,
        incremental_file_count: u64,
        total_file_count: u64,
        incremental_size: u64,
        total_size: u64,
    ) -> Result<()> {
        let mut inner = self.lock_unless_aborted()?;
        debug_assert_eq!(inner.stage, Stage::Init);
        inner.stage = Stage::Started;
        inner.start_time = Some(start_time);
        inner.incremental_file_count = incremental_file_count;
        inner.total_file_count = total_file_count;
        inner.incremental_size = incremental_size;
        inner.total_size = total_size;
        Ok(())
    }

    /// Transition to FINALIZE once every upload has drained; returns the
    /// counters the commit point is written from.
    pub fn move_to_finalize(&self) -> Result<StatusSummary> {
        let mut inner = self.lock_unless_aborted()?;
        debug_assert_eq!(inner.stage, Stage::Started);
        inner.stage = Stage::Finalize;
        Ok(Self::summarize(&inner))
    }

    pub fn move_to_done(&self, end_time: DateTime<Utc>, generation: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.stage = Stage::Done;
        inner.end_time = Some(end_time);
        inner.generation = Some(generation);
    }

    pub fn move_to_failed(&self, end_time: DateTime<Utc>, reason: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stage != Stage::Aborted {
            inner.stage = Stage::Failed;
        }
        inner.end_time = Some(end_time);
        inner.failure = Some(reason.into());
    }

    /// Account a fully uploaded file's bytes.
    pub fn add_processed_size(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.processed_size += bytes;
    }

    pub fn summary(&self) -> StatusSummary {
        Self::summarize(&self.inner.lock().unwrap())
    }

    fn lock_unless_aborted(&self) -> Result<std::sync::MutexGuard<'_, StatusInner>> {
        if self.is_aborted() {
            return Err(RepositoryError::SnapshotAborted);
        }
        Ok(self.inner.lock().unwrap())
    }

    fn summarize(inner: &StatusInner) -> StatusSummary {
        StatusSummary {
            stage: inner.stage,
            start_time: inner.start_time,
            end_time: inner.end_time,
            incremental_file_count: inner.incremental_file_count,
            total_file_count: inner.total_file_count,
            incremental_size: inner.incremental_size,
            total_size: inner.total_size,
            processed_size: inner.processed_size,
            generation: inner.generation,
            failure: inner.failure.clone(),
        }
    }
}
