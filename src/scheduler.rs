//! Hardware-queue scheduler: one [`HwQueue`] per ring, each holding
//! four FIFO priority buckets behind its own lock and an admission
//! counter bounded by `queue_depth`.

extern crate alloc;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use spin::Mutex;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::fence::FenceEngine;
use crate::job::{
    auto_select_queue, Job, JobId, JobResult, JobState, JobType, Priority, DEFAULT_TIMEOUT_MS,
};
use crate::memory::Allocator;
use crate::regs::{status_bit, Registers};
use crate::ring::CommandRing;

pub const DEFAULT_QUEUE_DEPTH: u32 = 16;
const SUBMIT_WAIT_MS: u64 = 5;
const MAX_RETAINED_COMPLETED: usize = 256;

struct Buckets {
    by_priority: [VecDeque<JobId>; 4],
}

impl Buckets {
    fn new() -> Self {
        Self {
            by_priority: [VecDeque::new(), VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }
}

struct HwQueue {
    queue_depth: u32,
    in_flight: AtomicU32,
    current_job: Mutex<Option<JobId>>,
    buckets: Mutex<Buckets>,
}

impl HwQueue {
    fn new(queue_depth: u32) -> Self {
        Self {
            queue_depth,
            in_flight: AtomicU32::new(0),
            current_job: Mutex::new(None),
            buckets: Mutex::new(Buckets::new()),
        }
    }
}

/// Orchestrates job admission, submission, completion, timeout
/// sweeping, and cancellation across every hardware queue the device
/// advertises.
pub struct Scheduler<A: Allocator> {
    rings: Vec<CommandRing<A>>,
    queues: Vec<HwQueue>,
    jobs: Mutex<BTreeMap<JobId, Arc<Job>>>,
    completed: ArrayQueue<JobId>,
    next_id: AtomicU64,
    rr_cursor: AtomicUsize,
}

impl<A: Allocator> Scheduler<A> {
    pub fn new(rings: Vec<CommandRing<A>>, queue_depth: u32) -> Self {
        let queues = rings.iter().map(|_| HwQueue::new(queue_depth)).collect();
        Self {
            rings,
            queues,
            jobs: Mutex::new(BTreeMap::new()),
            completed: ArrayQueue::new(MAX_RETAINED_COMPLETED),
            next_id: AtomicU64::new(1),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn queue_count(&self) -> u8 {
        self.rings.len() as u8
    }

    /// Admit a new job. `deps` lists predecessors this job must wait
    /// on; a dependency on an already-terminal job is immediately
    /// satisfied and does not hold the job back.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        job_type: JobType,
        priority: Priority,
        payload: Vec<u32>,
        queue_id: Option<u8>,
        fence_addr: Option<u64>,
        fence_value: u32,
        timeout_ms: Option<u64>,
        deps: &[JobId],
        clock: &dyn Clock,
    ) -> Result<JobId> {
        let queue_id = queue_id.unwrap_or_else(|| auto_select_queue(job_type, self.queue_count()));
        if queue_id as usize >= self.queues.len() {
            return Err(Error::InvalidArgument);
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Job::new(
            id,
            job_type,
            priority,
            payload,
            queue_id,
            fence_addr,
            fence_value,
            timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        ));
        job.submit_ts_ms.store(clock.now_ms(), Ordering::Relaxed);

        {
            let jobs = self.jobs.lock();
            for &dep_id in deps {
                if dep_id == id {
                    return Err(Error::InvalidArgument);
                }
                let dep = jobs.get(&dep_id).ok_or(Error::NotFound)?;
                if !dep.state().is_terminal() {
                    job.add_dependency_edge();
                    dep.add_dependent(id);
                }
            }
        }

        self.jobs.lock().insert(id, job.clone());

        if job.is_ready() {
            self.enqueue_ready(&job);
        }
        Ok(id)
    }

    /// Add a dependency edge after the fact: `job_id` will not leave
    /// `pending` until `dep_id` reaches a terminal state. Only valid
    /// while `job_id` is still `pending`; self-dependency is rejected.
    pub fn add_dependency(&self, job_id: JobId, dep_id: JobId) -> Result<()> {
        if job_id == dep_id {
            return Err(Error::InvalidArgument);
        }
        let jobs = self.jobs.lock();
        let job = jobs.get(&job_id).ok_or(Error::NotFound)?;
        let dep = jobs.get(&dep_id).ok_or(Error::NotFound)?;
        if job.state() != JobState::Pending {
            return Err(Error::AlreadyInProgress);
        }
        if !dep.state().is_terminal() {
            job.add_dependency_edge();
            dep.add_dependent(job_id);
        }
        Ok(())
    }

    fn enqueue_ready(&self, job: &Job) {
        let queue = &self.queues[job.queue_id as usize];
        queue.buckets.lock().by_priority[job.priority as usize].push_back(job.id);
        job.set_state(JobState::Queued);
    }

    /// One scheduling step: scans queues round-robin, and within each
    /// queue scans priority buckets realtime-down-to-low, submitting
    /// at most one job. Returns whether a job was submitted.
    pub fn tick(&self, regs: &Registers, clock: &dyn Clock, fence: Option<&FenceEngine<A>>) -> Result<bool> {
        let n = self.queues.len();
        if n == 0 {
            return Ok(false);
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let qi = (start + offset) % n;
            if self.try_submit_one(qi, regs, clock, fence)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn try_submit_one(
        &self,
        qi: usize,
        regs: &Registers,
        clock: &dyn Clock,
        fence: Option<&FenceEngine<A>>,
    ) -> Result<bool> {
        let queue = &self.queues[qi];
        if queue.current_job.lock().is_some() {
            return Ok(false);
        }
        if queue.in_flight.load(Ordering::Acquire) >= queue.queue_depth {
            return Ok(false);
        }

        let job_id = {
            let mut buckets = queue.buckets.lock();
            let mut picked = None;
            for p in Priority::ALL_HIGH_TO_LOW {
                if let Some(id) = buckets.by_priority[p as usize].pop_front() {
                    picked = Some(id);
                    break;
                }
            }
            picked
        };
        let Some(job_id) = job_id else {
            return Ok(false);
        };

        let job = match self.jobs.lock().get(&job_id).cloned() {
            Some(j) => j,
            None => return Ok(false),
        };

        let ring = &self.rings[qi];
        match self.build_and_submit(&job, ring, regs, clock, fence) {
            Ok(()) => {
                job.set_state(JobState::Running);
                job.start_ts_ms.store(clock.now_ms(), Ordering::Relaxed);
                *queue.current_job.lock() = Some(job_id);
                queue.in_flight.fetch_add(1, Ordering::AcqRel);
                debug!("gpucmd: submitted job on queue {qi}");
                Ok(true)
            }
            Err(Error::Busy) | Err(Error::Timeout) => {
                queue.buckets.lock().by_priority[job.priority as usize].push_front(job_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn build_and_submit(
        &self,
        job: &Job,
        ring: &CommandRing<A>,
        regs: &Registers,
        clock: &dyn Clock,
        fence: Option<&FenceEngine<A>>,
    ) -> Result<()> {
        let mut dwords = job.payload.clone();
        if let Some(addr) = job.fence_addr {
            let fe = fence.ok_or(Error::InvalidArgument)?;
            let rec = fe.emit(addr, job.fence_value)?;
            dwords.extend_from_slice(&rec);
        }
        ring.wait_space(dwords.len(), SUBMIT_WAIT_MS, regs, clock)?;
        ring.write(&dwords, regs)?;
        ring.kick(regs)?;
        Ok(())
    }

    /// Called from the `CMD_COMPLETE`/`ERROR` deferred handler: for
    /// every queue with an outstanding job whose ring has drained,
    /// latch completion, free the queue slot, and wake any dependents
    /// that just became ready. Returns the number of jobs completed.
    pub fn poll_completions(&self, regs: &Registers, clock: &dyn Clock) -> Result<usize> {
        let status = regs.status()?;
        let mut n = 0;
        for (qi, queue) in self.queues.iter().enumerate() {
            let job_id = match *queue.current_job.lock() {
                Some(id) => id,
                None => continue,
            };
            let ring = &self.rings[qi];
            if !ring.is_empty(regs)? {
                continue;
            }
            let job = match self.jobs.lock().get(&job_id).cloned() {
                Some(j) => j,
                None => continue,
            };
            let result = if status & status_bit::ERROR != 0 {
                JobResult::HardwareError
            } else {
                JobResult::Ok
            };
            let state = if result == JobResult::Ok {
                JobState::Completed
            } else {
                JobState::Aborted
            };
            if job.complete(state, result, clock.now_ms()) {
                ring.note_completion();
                *queue.current_job.lock() = None;
                queue.in_flight.fetch_sub(1, Ordering::AcqRel);
                if result != JobResult::Ok {
                    warn!("gpucmd: job on queue {qi} completed with hardware error");
                }
                self.wake_dependents(&job);
                self.retire(job_id);
                n += 1;
            }
        }
        Ok(n)
    }

    fn wake_dependents(&self, job: &Job) {
        let jobs = self.jobs.lock();
        for dep_id in job.dependents_snapshot() {
            if let Some(dep) = jobs.get(&dep_id) {
                if dep.state() != JobState::Pending {
                    continue;
                }
                if dep.dec_dependency() == 0 {
                    let qi = dep.queue_id as usize;
                    if qi < self.queues.len() {
                        self.queues[qi].buckets.lock().by_priority[dep.priority as usize]
                            .push_back(dep_id);
                        dep.set_state(JobState::Queued);
                    }
                }
            }
        }
    }

    /// Remember `job_id` as completed, bounded by `MAX_RETAINED_COMPLETED`.
    /// Evicts the oldest retained job from the arena to make room once
    /// the ring is full, so memory for finished jobs doesn't grow
    /// without bound across a long-running device's lifetime.
    fn retire(&self, job_id: JobId) {
        if let Err(job_id) = self.completed.push(job_id) {
            if let Some(old) = self.completed.pop() {
                self.jobs.lock().remove(&old);
            }
            let _ = self.completed.push(job_id);
        }
    }

    /// Walk running jobs; any whose wall-clock runtime exceeds its
    /// per-job timeout transitions to `timed_out`. Returns the ids that
    /// just timed out so the caller can schedule a reset.
    pub fn timeout_sweep(&self, clock: &dyn Clock) -> Vec<JobId> {
        let mut timed_out = Vec::new();
        let jobs = self.jobs.lock();
        for (id, job) in jobs.iter() {
            if job.state() == JobState::Running {
                let start = job.start_ts_ms.load(Ordering::Relaxed);
                if clock.now_ms().saturating_sub(start) > job.timeout_ms {
                    if job.complete(JobState::TimedOut, JobResult::Timeout, clock.now_ms()) {
                        timed_out.push(*id);
                    }
                }
            }
        }
        timed_out
    }

    /// Abort whatever job is running on every queue and free its slot.
    /// The hardware is about to be reset out from under these jobs, so
    /// their in-flight completion can never arrive on its own; this is
    /// the only path that retires a `Running` job without a matching
    /// device completion. Returns the aborted job ids.
    pub fn abort_all_running(&self, clock: &dyn Clock) -> Vec<JobId> {
        let mut aborted = Vec::new();
        for queue in &self.queues {
            let job_id = match queue.current_job.lock().take() {
                Some(id) => id,
                None => continue,
            };
            queue.in_flight.store(0, Ordering::Release);
            let job = self.jobs.lock().get(&job_id).cloned();
            if let Some(job) = job {
                if job.complete(JobState::Aborted, JobResult::HardwareError, clock.now_ms()) {
                    self.wake_dependents(&job);
                    self.retire(job_id);
                    aborted.push(job_id);
                }
            }
        }
        aborted
    }

    /// Cancel a job that has not yet started running. Running jobs
    /// cannot be cancelled in place — the caller must go through a
    /// reset cycle instead.
    pub fn cancel(&self, job_id: JobId, clock: &dyn Clock) -> Result<()> {
        let job = self.jobs.lock().get(&job_id).cloned().ok_or(Error::NotFound)?;
        match job.state() {
            JobState::Pending => {
                if job.complete(JobState::Aborted, JobResult::Cancelled, clock.now_ms()) {
                    self.retire(job_id);
                }
                Ok(())
            }
            JobState::Queued => {
                let queue = &self.queues[job.queue_id as usize];
                let mut buckets = queue.buckets.lock();
                let bucket = &mut buckets.by_priority[job.priority as usize];
                if let Some(pos) = bucket.iter().position(|&id| id == job_id) {
                    bucket.remove(pos);
                }
                drop(buckets);
                if job.complete(JobState::Aborted, JobResult::Cancelled, clock.now_ms()) {
                    self.retire(job_id);
                }
                Ok(())
            }
            JobState::Running => Err(Error::AlreadyInProgress),
            _ => Ok(()),
        }
    }

    pub fn job_state(&self, job_id: JobId) -> Option<JobState> {
        self.jobs.lock().get(&job_id).map(|j| j.state())
    }

    pub fn job_result(&self, job_id: JobId) -> Option<JobResult> {
        self.jobs.lock().get(&job_id).map(|j| j.result())
    }

    pub fn ring(&self, queue_id: u8) -> Option<&CommandRing<A>> {
        self.rings.get(queue_id as usize)
    }

    pub fn rings(&self) -> &[CommandRing<A>] {
        &self.rings
    }

    /// Clear any queue slot whose tracked job has already reached a
    /// terminal state but was never freed by `poll_completions` (e.g.
    /// a job the timeout sweep just marked `timed_out`). Cheap to call
    /// every tick since `queues` is small and each lock is held only
    /// long enough to read one `Option<JobId>`.
    pub fn reap_stale_slots(&self) {
        let jobs = self.jobs.lock();
        for queue in &self.queues {
            let mut current = queue.current_job.lock();
            if let Some(id) = *current {
                let terminal = jobs.get(&id).map(|j| j.state().is_terminal()).unwrap_or(true);
                if terminal {
                    *current = None;
                    queue.in_flight.store(0, Ordering::Release);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::HeapAllocator;
    use crate::wire;
    extern crate std;
    use std::vec;

    struct FakeClock {
        now: core::sync::atomic::AtomicU64,
    }
    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
        fn spin_hint(&self) {
            self.now.fetch_add(1, Ordering::Relaxed);
        }
    }
    impl FakeClock {
        fn new() -> Self {
            Self { now: core::sync::atomic::AtomicU64::new(0) }
        }
        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::Relaxed);
        }
    }

    fn fake_regs() -> (std::vec::Vec<u8>, Registers) {
        let mut backing = vec![0u8; 0x3000];
        let ptr = backing.as_mut_ptr();
        (backing, unsafe { Registers::new(ptr) })
    }

    fn single_queue_scheduler(regs: &Registers, depth: u32) -> Scheduler<HeapAllocator> {
        let alloc = HeapAllocator;
        let ring = CommandRing::create(0, crate::ring::MIN_RING_SIZE, &alloc, regs).unwrap();
        Scheduler::new(vec![ring], depth)
    }

    #[test]
    fn priority_dominance_admits_realtime_before_low() {
        // Priority dominance: a realtime job admitted ahead of an
        // already-queued low-priority one on the same queue.
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);

        let low = sched
            .submit(JobType::Draw, Priority::Low, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        let high = sched
            .submit(JobType::Draw, Priority::Realtime, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();

        assert!(sched.tick(&regs, &clock, None).unwrap());
        assert_eq!(sched.job_state(high), Some(JobState::Running));
        assert_eq!(sched.job_state(low), Some(JobState::Queued));

        // Simulate completion by draining the ring head.
        regs.write32(crate::regs::QueueBank::for_queue(0).cmd_head(), sched.ring(0).unwrap().tail() as u32)
            .unwrap();
        assert_eq!(sched.poll_completions(&regs, &clock).unwrap(), 1);
        assert_eq!(sched.job_state(high), Some(JobState::Completed));

        assert!(sched.tick(&regs, &clock, None).unwrap());
        assert_eq!(sched.job_state(low), Some(JobState::Running));
    }

    #[test]
    fn dependency_chain_blocks_then_wakes() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);

        let a = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        let b = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[a], &clock)
            .unwrap();
        assert_eq!(sched.job_state(b), Some(JobState::Pending));

        assert!(sched.tick(&regs, &clock, None).unwrap());
        assert_eq!(sched.job_state(a), Some(JobState::Running));
        regs.write32(crate::regs::QueueBank::for_queue(0).cmd_head(), sched.ring(0).unwrap().tail() as u32)
            .unwrap();
        sched.poll_completions(&regs, &clock).unwrap();

        assert_eq!(sched.job_state(b), Some(JobState::Queued));
        assert!(sched.tick(&regs, &clock, None).unwrap());
        assert_eq!(sched.job_state(b), Some(JobState::Running));
    }

    #[test]
    fn timeout_sweep_marks_stalled_running_job() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);
        let job = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, Some(100), &[], &clock)
            .unwrap();
        sched.tick(&regs, &clock, None).unwrap();
        clock.advance(200);
        let timed_out = sched.timeout_sweep(&clock);
        assert_eq!(timed_out, vec![job]);
        assert_eq!(sched.job_state(job), Some(JobState::TimedOut));
    }

    #[test]
    fn cancel_removes_queued_job_without_running_it() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);
        let a = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        sched.cancel(a, &clock).unwrap();
        assert_eq!(sched.job_state(a), Some(JobState::Aborted));
        assert!(!sched.tick(&regs, &clock, None).unwrap());
    }

    #[test]
    fn cancel_refuses_running_job() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);
        let a = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        sched.tick(&regs, &clock, None).unwrap();
        assert_eq!(sched.cancel(a, &clock), Err(Error::AlreadyInProgress));
    }

    #[test]
    fn submit_rejects_dependency_on_unknown_job() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);
        let bogus = JobId(9999);
        let err = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[bogus], &clock)
            .unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn wake_dependents_skips_a_cancelled_dependent() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 2);
        let j1 = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        let j2 = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[j1], &clock)
            .unwrap();
        assert_eq!(sched.job_state(j2), Some(JobState::Pending));

        sched.cancel(j2, &clock).unwrap();
        assert_eq!(sched.job_state(j2), Some(JobState::Aborted));

        // Run j1 to completion; this must not resurrect j2 into Queued.
        assert!(sched.tick(&regs, &clock, None).unwrap());
        regs.write32(crate::regs::QueueBank::for_queue(0).cmd_head(), sched.ring(0).unwrap().tail() as u32)
            .unwrap();
        sched.poll_completions(&regs, &clock).unwrap();

        assert_eq!(sched.job_state(j2), Some(JobState::Aborted));
        // The queue slot must be free for the next job, not wedged on j2.
        assert!(sched.tick(&regs, &clock, None).unwrap());
    }

    #[test]
    fn abort_all_running_frees_every_queue_slot() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);
        let a = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        assert!(sched.tick(&regs, &clock, None).unwrap());
        assert_eq!(sched.job_state(a), Some(JobState::Running));

        let aborted = sched.abort_all_running(&clock);
        assert_eq!(aborted, vec![a]);
        assert_eq!(sched.job_state(a), Some(JobState::Aborted));

        // The slot is free immediately, before any device completion arrives.
        let b = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        assert!(sched.tick(&regs, &clock, None).unwrap());
        assert_eq!(sched.job_state(b), Some(JobState::Running));
    }

    #[test]
    fn add_dependency_rejects_self_reference() {
        let (_backing, regs) = fake_regs();
        let clock = FakeClock::new();
        let sched = single_queue_scheduler(&regs, 1);
        let a = sched
            .submit(JobType::Draw, Priority::Normal, wire::nop().to_vec(), Some(0), None, 0, None, &[], &clock)
            .unwrap();
        assert_eq!(sched.add_dependency(a, a), Err(Error::InvalidArgument));
    }
}
