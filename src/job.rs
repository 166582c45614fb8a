//! Scheduler-level job representation: priority, dependency, and
//! completion state for one submitted unit of work.
//!
//! Jobs live in an arena keyed by [`JobId`] and reference each other
//! only by id, never by pointer, so the dependency graph can never
//! form a reference cycle the allocator has to reason about.

extern crate alloc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::error::Error;

/// Arena index. Monotonically assigned; never reused within a
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Realtime = 3,
}

impl Priority {
    pub const ALL_HIGH_TO_LOW: [Priority; 4] =
        [Priority::Realtime, Priority::High, Priority::Normal, Priority::Low];

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            3 => Priority::Realtime,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobType {
    Draw = 0,
    Compute = 1,
    Dma = 2,
    Fence = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Pending = 0,
    Queued = 1,
    Running = 2,
    Completed = 3,
    Aborted = 4,
    TimedOut = 5,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Pending,
            1 => JobState::Queued,
            2 => JobState::Running,
            3 => JobState::Completed,
            4 => JobState::Aborted,
            _ => JobState::TimedOut,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Aborted | JobState::TimedOut)
    }
}

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// A unit of scheduler work. Command payload is an owned copy made
/// after validation; the scheduler never reads it before that point.
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub priority: Priority,
    state: AtomicU8,
    pub payload: Vec<u32>,
    pub queue_id: u8,
    pub fence_addr: Option<u64>,
    pub fence_value: u32,
    pub submit_ts_ms: AtomicU64,
    pub start_ts_ms: AtomicU64,
    pub end_ts_ms: AtomicU64,
    pub timeout_ms: u64,
    dep_count: AtomicU32,
    dependents: Mutex<Vec<JobId>>,
    latch_signaled: AtomicU8,
    result: AtomicU8,
}

/// Result code latched into a terminal job, distinct from [`Error`]
/// because a job can also terminate with no error at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Pending,
    Ok,
    HardwareError,
    Timeout,
    Cancelled,
}

impl JobResult {
    fn to_u8(self) -> u8 {
        match self {
            JobResult::Pending => 0,
            JobResult::Ok => 1,
            JobResult::HardwareError => 2,
            JobResult::Timeout => 3,
            JobResult::Cancelled => 4,
        }
    }
    fn from_u8(v: u8) -> Self {
        match v {
            1 => JobResult::Ok,
            2 => JobResult::HardwareError,
            3 => JobResult::Timeout,
            4 => JobResult::Cancelled,
            _ => JobResult::Pending,
        }
    }

    pub fn into_error(self) -> Option<Error> {
        match self {
            JobResult::Pending | JobResult::Ok => None,
            JobResult::HardwareError => Some(Error::HardwareError),
            JobResult::Timeout => Some(Error::Timeout),
            JobResult::Cancelled => Some(Error::Cancelled),
        }
    }
}

impl Job {
    pub fn new(
        id: JobId,
        job_type: JobType,
        priority: Priority,
        payload: Vec<u32>,
        queue_id: u8,
        fence_addr: Option<u64>,
        fence_value: u32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            job_type,
            priority,
            state: AtomicU8::new(JobState::Pending as u8),
            payload,
            queue_id,
            fence_addr,
            fence_value,
            submit_ts_ms: AtomicU64::new(0),
            start_ts_ms: AtomicU64::new(0),
            end_ts_ms: AtomicU64::new(0),
            timeout_ms,
            dep_count: AtomicU32::new(0),
            dependents: Mutex::new(Vec::new()),
            latch_signaled: AtomicU8::new(0),
            result: AtomicU8::new(JobResult::Pending.to_u8()),
        }
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == JobState::Pending && self.dep_count.load(Ordering::Acquire) == 0
    }

    pub fn dep_count(&self) -> u32 {
        self.dep_count.load(Ordering::Acquire)
    }

    pub fn add_dependency_edge(&self) {
        self.dep_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that `dependent` should be woken when this job's
    /// dependency count in `dependent` reaches zero.
    pub fn add_dependent(&self, dependent: JobId) {
        self.dependents.lock().push(dependent);
    }

    pub fn dependents_snapshot(&self) -> Vec<JobId> {
        self.dependents.lock().clone()
    }

    /// Returns the post-decrement count; `0` means the job just became
    /// ready and the caller should wake the scheduler.
    pub fn dec_dependency(&self) -> u32 {
        self.dep_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn result(&self) -> JobResult {
        JobResult::from_u8(self.result.load(Ordering::Acquire))
    }

    /// Move into a terminal state and signal the completion latch
    /// exactly once; returns `false` if the latch had already fired,
    /// which the caller should treat as a no-op rather than an error.
    pub fn complete(&self, state: JobState, result: JobResult, end_ts_ms: u64) -> bool {
        debug_assert!(state.is_terminal());
        if self.latch_signaled.swap(1, Ordering::AcqRel) == 1 {
            return false;
        }
        self.result.store(result.to_u8(), Ordering::Release);
        self.end_ts_ms.store(end_ts_ms, Ordering::Release);
        self.set_state(state);
        true
    }

    pub fn is_latched(&self) -> bool {
        self.latch_signaled.load(Ordering::Acquire) == 1
    }
}

/// Choose the queue id for a job that did not request one explicitly:
/// DMA prefers queue 2, compute prefers queue 1, everything else
/// (graphics/draw) prefers queue 0 — falling back to queue 0 whenever
/// the preferred queue does not exist on this device.
pub fn auto_select_queue(job_type: JobType, queue_count: u8) -> u8 {
    let preferred = match job_type {
        JobType::Dma => 2,
        JobType::Compute => 1,
        JobType::Draw | JobType::Fence => 0,
    };
    if preferred < queue_count {
        preferred
    } else {
        0
    }
}
