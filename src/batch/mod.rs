// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Batch states and their submit/complete/recycle lifecycle.
//!
//! A *batch state* is the unit of GPU submission: command streams, a fence, the
//! semaphore lists and the per-batch resource-usage tracking sets. States are
//! pooled: `Free -> Recording -> Submitted -> Completed -> Free`, and a state is
//! only reusable once it is both submitted and completed. Completion tracking
//! never relies on list positions; it compares each state's monotonically
//! increasing submission id against the device's last-known-finished id.
//!
//! Submission runs on a background worker by default, overlapping the GPU
//! handoff of one batch with the CPU recording of the next. Work whose
//! destruction needs a kernel round-trip (semaphores, the final unref of a
//! tracked resource) is deferred onto per-batch lists and drained on the worker
//! so the recording thread never blocks on it.

mod resource;
mod usage;

pub use resource::{Program, Resource, ResourceCreateInfo, ResourceFlags, ResourceIdle};
pub use usage::BatchUsage;

use crate::{
    command_stream::{CommandStream, CsEntry, CsMode},
    device::{DeferredHandle, Device, QueueSubmission},
    sync::{Fence, SemaphoreHandle},
    DeviceSize, NonExhaustive,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

/// Size of the hash-indexed list used to deduplicate per-batch resource
/// references.
const BUFFER_HASHLIST_SIZE: usize = 512;

/// Parameters to create a new `BatchPool`.
///
/// The thresholds are workload-dependent heuristics, which is why they are
/// exposed here rather than hard-coded; the defaults are the values the pool
/// was tuned with.
#[derive(Clone, Debug)]
pub struct BatchPoolCreateInfo {
    /// Number of outstanding batch states above which completed leading states
    /// are eagerly retired at the end of each batch.
    ///
    /// The default value is `25`.
    pub defer_threshold: u32,

    /// Number of outstanding batch states above which the "flush sooner" flag
    /// is raised, making subsequent end-of-frame operations flush eagerly.
    ///
    /// The default value is `50`.
    pub eager_flush_threshold: u32,

    /// Number of outstanding batch states above which the submission worker
    /// stalls until older batches retire.
    ///
    /// The default value is `5000`.
    pub hard_throttle_threshold: u32,

    /// How far behind the current submission the hard throttle waits.
    ///
    /// The default value is `2500`.
    pub hard_throttle_margin: u64,

    /// Number of batch states created up front on first use.
    ///
    /// The default value is `3`.
    pub prewarm: u32,

    /// Number of cached views on a busy resource above which pruning is
    /// scheduled.
    ///
    /// The default value is `500`.
    pub view_prune_cap: usize,

    /// Total bytes of resources referenced by one batch above which the pool
    /// asks for an early flush and stall.
    ///
    /// The default value is 2 GiB.
    pub video_mem_clamp_b: DeviceSize,

    /// Whether submissions run on a background worker thread.
    ///
    /// The default value is `true`.
    pub threaded: bool,

    /// Initial word size of each batch state's command streams.
    ///
    /// The default value is `4096`.
    pub initial_cs_size: u32,

    pub _ne: NonExhaustive,
}

impl Default for BatchPoolCreateInfo {
    #[inline]
    fn default() -> Self {
        BatchPoolCreateInfo {
            defer_threshold: 25,
            eager_flush_threshold: 50,
            hard_throttle_threshold: 5000,
            hard_throttle_margin: 2500,
            prewarm: 3,
            view_prune_cap: 500,
            video_mem_clamp_b: 2 << 30,
            threaded: true,
            initial_cs_size: 4096,
            _ne: NonExhaustive(()),
        }
    }
}

/// The synchronization half of a batch state, shared with waiters.
pub(crate) struct BatchSync {
    batch_id: AtomicU64,
    submitted: AtomicBool,
    completed: AtomicBool,
    device_lost: AtomicBool,
    fence: Fence,
    usage: Arc<BatchUsage>,
}

impl BatchSync {
    /// A state is free for reuse only when both submitted and completed.
    fn is_free(&self) -> bool {
        self.submitted.load(Ordering::Acquire) && self.completed.load(Ordering::Acquire)
    }
}

/// One pooled submission unit.
pub struct BatchState {
    sync: Arc<BatchSync>,

    cs: CommandStream,
    barrier_cs: CommandStream,
    has_barriers: bool,

    // Resource tracking. `hashlist` maps id hashes to list indices with a
    // linear-scan fallback on collision; `last_added` short-circuits runs of
    // references to the same object.
    resources: Vec<Arc<Resource>>,
    sparse_resources: Vec<Arc<Resource>>,
    hashlist: Box<[i16; BUFFER_HASHLIST_SIZE]>,
    last_added: Option<u64>,
    resource_size: DeviceSize,

    programs: Vec<Arc<Program>>,
    program_set: foldhash::HashSet<u64>,

    // Semaphores for the next submission.
    acquires: Vec<SemaphoreHandle>,
    wait_semaphores: Vec<SemaphoreHandle>,
    signal_semaphore: Option<SemaphoreHandle>,
    present: Option<SemaphoreHandle>,

    // Deferred destruction, drained by the submission worker.
    unref_resources: Vec<Arc<Resource>>,
    unref_semaphores: Vec<SemaphoreHandle>,
    zombie_samplers: Vec<u64>,

    // Monotonic reuse counter disambiguating recycled states.
    submit_count: u32,
}

impl BatchState {
    /// How many times this state has been through the submit/recycle cycle;
    /// disambiguates reuse of the same state.
    #[inline]
    pub fn submit_count(&self) -> u32 {
        self.submit_count
    }

    fn new(shared: &PoolShared) -> Box<BatchState> {
        let device = &shared.device;

        Box::new(BatchState {
            sync: Arc::new(BatchSync {
                batch_id: AtomicU64::new(0),
                submitted: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                device_lost: AtomicBool::new(false),
                fence: Fence::from_pool(device.clone()),
                usage: Arc::new(BatchUsage::new()),
            }),
            cs: CommandStream::new(
                device.clone(),
                CsMode::Grow,
                shared.config.initial_cs_size,
                "batch",
            ),
            barrier_cs: CommandStream::new(
                device.clone(),
                CsMode::Grow,
                shared.config.initial_cs_size,
                "batch barriers",
            ),
            has_barriers: false,
            resources: Vec::new(),
            sparse_resources: Vec::new(),
            hashlist: Box::new([-1; BUFFER_HASHLIST_SIZE]),
            last_added: None,
            resource_size: 0,
            programs: Vec::new(),
            program_set: foldhash::HashSet::default(),
            acquires: Vec::new(),
            wait_semaphores: Vec::new(),
            signal_semaphore: None,
            present: None,
            unref_resources: Vec::new(),
            unref_semaphores: Vec::new(),
            zombie_samplers: Vec::new(),
            submit_count: 0,
        })
    }

    /// Adds `res` to the batch's tracking set, deduplicated. Returns whether it
    /// was newly added.
    fn track_resource(&mut self, res: &Arc<Resource>) -> bool {
        // Fast exit for consecutive references to the same object; very
        // effective with suballocators and linear uploaders.
        if self.last_added == Some(res.id()) {
            return false;
        }

        let sparse = res.flags().sparse;
        let list = if sparse {
            &mut self.sparse_resources
        } else {
            &mut self.resources
        };

        let hash = (res.id() as usize) & (BUFFER_HASHLIST_SIZE - 1);
        let idx = self.hashlist[hash];

        let mut found =
            idx >= 0 && (idx as usize) < list.len() && list[idx as usize].id() == res.id();
        if !found && idx >= 0 {
            // Hash collision: scan the list backwards, and re-seat the hash slot
            // so that runs of lookups for the same object stay collision-free.
            for i in (0..list.len()).rev() {
                if list[i].id() == res.id() {
                    self.hashlist[hash] = (i & 0x7fff) as i16;
                    found = true;
                    break;
                }
            }
        }

        if found {
            self.last_added = Some(res.id());
            return false;
        }

        let idx = list.len();
        list.push(res.clone());
        self.hashlist[hash] = (idx & 0x7fff) as i16;
        self.last_added = Some(res.id());
        if !sparse {
            self.resource_size += res.size_b();
        }

        true
    }
}

/// The recording facade over the pool's current batch state.
#[derive(Default)]
pub struct Batch {
    state: Option<Box<BatchState>>,
    has_work: bool,
    work_count: u32,
    last_batch_usage: Option<Arc<BatchUsage>>,
}

impl Batch {
    #[inline]
    pub fn new() -> Batch {
        Batch::default()
    }

    /// Whether anything was recorded since the batch was started.
    #[inline]
    pub fn has_work(&self) -> bool {
        self.has_work
    }

    /// Number of recording operations since the batch was started.
    #[inline]
    pub fn work_count(&self) -> u32 {
        self.work_count
    }

    /// The usage record of the previously flushed batch, if any.
    #[inline]
    pub fn last_batch_usage(&self) -> Option<&Arc<BatchUsage>> {
        self.last_batch_usage.as_ref()
    }

    fn state_mut(&mut self) -> &mut BatchState {
        self.state.as_mut().expect("no batch started")
    }

    /// The primary command stream of the current batch.
    pub fn cs(&mut self) -> &mut CommandStream {
        self.has_work = true;
        self.work_count += 1;
        &mut self.state_mut().cs
    }

    /// The preamble stream submitted ahead of the primary one when non-empty.
    pub fn barrier_cs(&mut self) -> &mut CommandStream {
        self.has_work = true;
        &mut self.state_mut().barrier_cs
    }

    /// The usage record of the current batch state.
    pub fn usage(&self) -> Arc<BatchUsage> {
        self.state
            .as_ref()
            .expect("no batch started")
            .sync
            .usage
            .clone()
    }

    /// Registers `res` as used by this batch for reading or writing.
    ///
    /// Each distinct resource is tracked at most once per batch; its usage
    /// record is updated to this batch on every call.
    pub fn reference_resource(&mut self, pool: &BatchPool, res: &Arc<Resource>, write: bool) {
        let state = self.state.as_mut().expect("no batch started");

        state.track_resource(res);
        res.usage_set(&state.sync.usage, write);

        self.has_work = true;
        self.work_count += 1;

        pool.check_oom_flush(state.resource_size);
    }

    /// Registers `program` as used by this batch; this is how program
    /// destruction is deferred until the GPU stops using it.
    pub fn reference_program(&mut self, program: &Arc<Program>) {
        let state = self.state.as_mut().expect("no batch started");

        if program.usage_matches(&state.sync.usage) || !state.program_set.insert(program.id()) {
            return;
        }

        state.programs.push(program.clone());
        program.usage_set(&state.sync.usage);
        self.has_work = true;
    }

    /// Adds a swapchain-acquire semaphore the submission must wait on.
    pub fn add_acquire_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.state_mut().acquires.push(semaphore);
    }

    /// Adds an external semaphore the submission must wait on.
    pub fn add_wait_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.state_mut().wait_semaphores.push(semaphore);
    }

    /// Sets the semaphore the submission signals on completion.
    pub fn set_signal_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.state_mut().signal_semaphore = Some(semaphore);
    }

    /// Sets the presentation semaphore the submission signals on completion.
    pub fn set_present_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.state_mut().present = Some(semaphore);
    }

    /// Defers destruction of a sampler until this batch has retired.
    pub fn defer_destroy_sampler(&mut self, handle: u64) {
        self.state_mut().zombie_samplers.push(handle);
    }
}

struct PoolInner {
    free: Vec<Box<BatchState>>,
    in_flight: VecDeque<Box<BatchState>>,
    last_fence: Option<Arc<BatchSync>>,
}

struct PoolShared {
    device: Arc<Device>,
    config: BatchPoolCreateInfo,
    inner: Mutex<PoolInner>,
    /// Notified whenever the worker finishes a submission.
    submit_cnd: Condvar,
    /// Outstanding states: ended but not yet retired.
    states_count: AtomicU32,
    oom_flush: AtomicBool,
    oom_stall: AtomicBool,
    prewarmed: AtomicBool,
}

enum Job {
    Submit(Box<BatchState>),
    Shutdown,
}

struct FlushWorker {
    tx: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

/// The pool of reusable batch states, owning the submission worker.
pub struct BatchPool {
    shared: Arc<PoolShared>,
    worker: Option<FlushWorker>,
}

impl BatchPool {
    pub fn new(device: Arc<Device>, create_info: BatchPoolCreateInfo) -> BatchPool {
        let threaded = create_info.threaded;
        let shared = Arc::new(PoolShared {
            device,
            config: create_info,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                in_flight: VecDeque::new(),
                last_fence: None,
            }),
            submit_cnd: Condvar::new(),
            states_count: AtomicU32::new(0),
            oom_flush: AtomicBool::new(false),
            oom_stall: AtomicBool::new(false),
            prewarmed: AtomicBool::new(false),
        });

        let worker = threaded.then(|| {
            let (tx, rx) = crossbeam_channel::unbounded();
            let worker_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name("silica-flush".into())
                .spawn(move || flush_worker(worker_shared, rx))
                .expect("failed to spawn the submission worker");

            FlushWorker {
                tx,
                handle: Some(handle),
            }
        });

        BatchPool { shared, worker }
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.shared.device
    }

    /// Whether the pool has been asked to flush eagerly due to oversubscription
    /// or memory pressure.
    #[inline]
    pub fn needs_eager_flush(&self) -> bool {
        self.shared.oom_flush.load(Ordering::Acquire)
    }

    /// Number of outstanding (ended, not yet retired) batch states.
    #[inline]
    pub fn states_count(&self) -> u32 {
        self.shared.states_count.load(Ordering::Acquire)
    }

    /// Starts recording into a fresh batch state, drawn from the free list, the
    /// provably completed head of the in-flight list, or new allocation.
    pub fn start_batch(&self, batch: &mut Batch) {
        let shared = &self.shared;
        assert!(batch.state.is_none(), "batch already started");

        // First use: create a few extra states for later.
        if !shared.prewarmed.swap(true, Ordering::AcqRel) {
            let mut inner = shared.inner.lock();
            for _ in 0..shared.config.prewarm {
                inner.free.push(BatchState::new(shared));
            }
        }

        let state = acquire_state(shared);
        state.sync.completed.store(false, Ordering::Release);
        state.sync.usage.set_unflushed();

        batch.last_batch_usage = shared
            .inner
            .lock()
            .last_fence
            .as_ref()
            .map(|sync| sync.usage.clone());

        let mut state = state;
        state.cs.begin();
        state.barrier_cs.begin();

        batch.state = Some(state);
        batch.has_work = false;
        batch.work_count = 0;
    }

    /// Ends the current batch and hands it to the submission worker.
    ///
    /// Eagerly retires completed leading states when the pool is
    /// oversubscribed, and stalls when the memory-pressure flag was raised.
    pub fn end_batch(&self, batch: &mut Batch) {
        let shared = &self.shared;
        let mut state = batch.state.take().expect("no batch started");
        batch.work_count = 0;
        batch.has_work = false;

        state.cs.end();
        state.barrier_cs.end();
        state.has_barriers = !state.barrier_cs.entries().is_empty();

        let sync = state.sync.clone();

        {
            let mut inner = shared.inner.lock();

            if shared.oom_flush.load(Ordering::Acquire)
                || shared.states_count.load(Ordering::Acquire) > shared.config.defer_threshold
            {
                // Retire every provably complete leading state. Once an
                // incomplete state is reached, no later one can be complete.
                while let Some(front) = inner.in_flight.front() {
                    let fsync = front.sync.clone();
                    let id = fsync.batch_id.load(Ordering::Acquire);
                    if !(shared.device.check_last_finished(id) || fsync.fence.is_signaled()) {
                        break;
                    }

                    fsync.completed.store(true, Ordering::Release);
                    let mut retired = inner.in_flight.pop_front().unwrap();
                    shared.states_count.fetch_sub(1, Ordering::Relaxed);
                    reset_batch_state(shared, &mut retired);
                    inner.free.push(retired);
                }

                let count = shared.states_count.load(Ordering::Acquire);
                if count > shared.config.eager_flush_threshold {
                    shared.oom_flush.store(true, Ordering::Release);
                } else if count <= shared.config.defer_threshold {
                    shared.oom_flush.store(false, Ordering::Release);
                }
            }

            inner.last_fence = Some(sync.clone());
            shared.states_count.fetch_add(1, Ordering::Relaxed);
        }

        match &self.worker {
            Some(worker) => worker
                .tx
                .send(Job::Submit(state))
                .expect("submission worker is gone"),
            None => submit_queue(shared, state),
        }

        if shared.oom_stall.swap(false, Ordering::AcqRel) {
            // Memory pressure: drain before recording anything else.
            usage_wait(shared, &sync.usage, false);
        }
    }

    /// Returns whether submission `batch_id` has completed, updating the
    /// last-finished id if the completion is newly observed.
    pub fn check_batch_completion(&self, batch_id: u64) -> bool {
        check_batch_completion(&self.shared, batch_id)
    }

    /// Blocks until submission `batch_id` has completed.
    pub fn wait_batch_id(&self, batch_id: u64) {
        wait_batch_id(&self.shared, batch_id);
    }

    /// Reports the busy state of `res` without blocking.
    pub fn resource_state(&self, res: &Resource) -> ResourceIdle {
        let flags = res.flags();
        if flags.shared || flags.no_sync {
            return ResourceIdle::Unknown;
        }

        let (reads, writes) = res.usage();
        for usage in [writes, reads].into_iter().flatten() {
            if !usage.exists() {
                continue;
            }
            if usage.is_unflushed() {
                return ResourceIdle::Busy;
            }
            if !check_batch_completion(&self.shared, usage.usage_id()) {
                return ResourceIdle::Busy;
            }
        }

        ResourceIdle::Idle
    }

    /// Blocks until every batch that referenced `res` has completed.
    ///
    /// Unflushed usage first waits for the flush notification, then for the
    /// GPU; flushed usage waits for the GPU only.
    pub fn wait_resource_idle(&self, res: &Resource) {
        let (reads, writes) = res.usage();
        for usage in [writes, reads].into_iter().flatten() {
            usage_wait(&self.shared, &usage, false);
        }
    }

    /// Like [`wait_resource_idle`](Self::wait_resource_idle), but bounds the
    /// wait for not-yet-flushed batches.
    pub fn try_wait_resource_idle(&self, res: &Resource) {
        let (reads, writes) = res.usage();
        for usage in [writes, reads].into_iter().flatten() {
            usage_wait(&self.shared, &usage, true);
        }
    }

    /// Resets every in-flight state and returns it to the free list.
    /// Only usable after a full stall.
    pub fn reset_all(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        while let Some(mut state) = inner.in_flight.pop_front() {
            state.sync.completed.store(true, Ordering::Release);
            shared.states_count.fetch_sub(1, Ordering::Relaxed);
            reset_batch_state(shared, &mut state);
            inner.free.push(state);
        }
    }

    /// The submission id of the most recently ended batch.
    pub fn last_batch_id(&self) -> u64 {
        self.shared
            .inner
            .lock()
            .last_fence
            .as_ref()
            .map_or(0, |sync| sync.batch_id.load(Ordering::Acquire))
    }

    pub(crate) fn check_oom_flush(&self, resource_size: DeviceSize) {
        // This is a vague, handwave-y estimate of memory pressure.
        if resource_size >= self.shared.config.video_mem_clamp_b {
            self.shared.oom_flush.store(true, Ordering::Release);
            self.shared.oom_stall.store(true, Ordering::Release);
        }
    }
}

impl Drop for BatchPool {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.tx.send(Job::Shutdown);
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }

        // Drain every remaining state; deferred destruction runs inline now
        // that there is no worker left to block.
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.last_fence = None;
        let mut states: Vec<_> = inner.free.drain(..).collect();
        states.extend(inner.in_flight.drain(..));
        drop(inner);

        for mut state in states {
            state.sync.completed.store(true, Ordering::Release);
            reset_batch_state(shared, &mut state);
            flush_deferred(&shared.device, &mut state);
        }
    }
}

fn flush_worker(shared: Arc<PoolShared>, rx: Receiver<Job>) {
    tracing::debug!("submission worker running");
    while let Ok(job) = rx.recv() {
        match job {
            Job::Submit(state) => submit_queue(&shared, state),
            Job::Shutdown => break,
        }
    }
    tracing::debug!("submission worker exiting");
}

/// Builds and submits one batch. Runs on the worker thread when the pool is
/// threaded.
fn submit_queue(shared: &PoolShared, mut state: Box<BatchState>) {
    let device = &shared.device;
    let sync = state.sync.clone();

    // Assign the monotonic id on the first submission of this state only.
    if sync.batch_id.load(Ordering::Acquire) == 0 {
        sync.batch_id
            .store(device.next_submission_id(), Ordering::Release);
    }
    let batch_id = sync.batch_id.load(Ordering::Acquire);
    sync.usage.set_flushed(batch_id);

    sync.fence.reset();

    let mut failed = device.is_lost();
    if !failed {
        // Swapchain acquires wait first, then the explicit waits.
        let mut waits: SmallVec<[SemaphoreHandle; 8]> = SmallVec::new();
        waits.extend_from_slice(&state.acquires);
        waits.extend_from_slice(&state.wait_semaphores);

        let mut signals: SmallVec<[SemaphoreHandle; 2]> = SmallVec::new();
        signals.extend(state.signal_semaphore);
        signals.extend(state.present);

        let mut entries: Vec<CsEntry> = Vec::new();
        if state.has_barriers {
            entries.extend_from_slice(state.barrier_cs.entries());
        }
        entries.extend_from_slice(state.cs.entries());

        let submission = QueueSubmission {
            batch_id,
            wait_semaphores: &waits,
            signal_semaphores: &signals,
            entries: &entries,
            fence: sync.fence.state(),
        };

        if let Err(err) = device.queue().submit(&submission) {
            tracing::error!(batch_id, error = %err, "queue submit failed");
            sync.device_lost.store(true, Ordering::Release);
            failed = true;
        }
    }

    if failed {
        // Nothing will execute, so completion is immediate; waiters and state
        // reclaim keep working on a lost device.
        sync.fence.state().signal();
    }

    state.submit_count = state.submit_count.wrapping_add(1);
    sync.usage.notify_flush();
    sync.submitted.store(true, Ordering::Release);

    flush_deferred(device, &mut state);

    {
        let mut inner = shared.inner.lock();
        inner.in_flight.push_back(state);
        shared.submit_cnd.notify_all();
    }

    post_submit(shared, &sync);
}

fn post_submit(shared: &PoolShared, sync: &BatchSync) {
    if sync.device_lost.load(Ordering::Acquire) {
        shared.device.report_loss();
    } else if shared.states_count.load(Ordering::Acquire) > shared.config.hard_throttle_threshold {
        // Throttle in case something crazy is happening.
        let wait_id = sync
            .batch_id
            .load(Ordering::Acquire)
            .saturating_sub(shared.config.hard_throttle_margin);
        tracing::debug!(wait_id, "hard throttle, waiting for older batches");
        wait_batch_id(shared, wait_id);
    }
}

/// Drains the deferred-destruction lists of a state. Runs on the submission
/// worker (or at shutdown) so kernel round-trips stay off the recording thread.
fn flush_deferred(device: &Device, state: &mut BatchState) {
    for res in state.unref_resources.drain(..) {
        // View pruning may have been deferred to avoid ballooning.
        res.run_scheduled_prune(device);
        // This is typically where the last reference gets dropped.
        drop(res);
    }
    for semaphore in state.unref_semaphores.drain(..) {
        device
            .queue()
            .destroy_object(DeferredHandle::Semaphore(semaphore));
    }
}

/// Resets a batch state for reuse after its completion has been observed.
fn reset_batch_state(shared: &PoolShared, state: &mut BatchState) {
    let device = &shared.device;
    let sync = state.sync.clone();

    state.cs.reset();
    state.barrier_cs.reset();
    state.has_barriers = false;

    // Unset the usage of everything this batch touched.
    let tracked: Vec<Arc<Resource>> = state
        .resources
        .drain(..)
        .chain(state.sparse_resources.drain(..))
        .collect();
    for res in tracked {
        reset_obj(shared, state, res);
    }

    for program in state.programs.drain(..) {
        program.usage_unset(&sync.usage);
    }
    state.program_set.clear();

    // Samplers are destroyed here; their destruction is cheap enough to not
    // warrant the deferred list.
    for handle in state.zombie_samplers.drain(..) {
        device.queue().destroy_object(DeferredHandle::Sampler(handle));
    }

    state.resource_size = 0;
    state.signal_semaphore = None;
    state.present = None;

    // Semaphore destruction is a kernel round-trip; defer it to the worker.
    let acquires: Vec<SemaphoreHandle> = state.acquires.drain(..).collect();
    state.unref_semaphores.extend(acquires);
    let waits: Vec<SemaphoreHandle> = state.wait_semaphores.drain(..).collect();
    state.unref_semaphores.extend(waits);

    // Only `submitted` is cleared here, so that waiters can still pick up the
    // `completed` flag before the state is reused.
    sync.submitted.store(false, Ordering::Release);
    let batch_id = sync.batch_id.swap(0, Ordering::AcqRel);
    if batch_id != 0 {
        device.update_last_finished(batch_id);
    }
    state.submit_count = state.submit_count.wrapping_add(1);
    sync.usage.clear();

    state.hashlist.fill(-1);
    state.last_added = None;
}

/// Resets the batch tracking of one resource.
fn reset_obj(shared: &PoolShared, state: &mut BatchState, res: Arc<Resource>) {
    if !res.usage_unset(&state.sync.usage) {
        // No usage remains: the resource is fully idle, so its dead views can
        // go now.
        res.prune_all_views(&shared.device);
    } else if res.view_count() > shared.config.view_prune_cap {
        // Still in use and the view cache is ballooning; prune once the
        // referencing batches have provably retired.
        res.schedule_view_prune();
    }

    // The last reference may trigger destruction, so drop it on the submit
    // thread instead of here.
    state.unref_resources.push(res);
}

/// Pops a reusable state or creates a new one.
fn acquire_state(shared: &PoolShared) -> Box<BatchState> {
    let mut reclaimed = None;

    {
        let mut inner = shared.inner.lock();

        // Try the ones that are known to be free first.
        if let Some(state) = inner.free.pop() {
            reclaimed = Some(state);
        } else if let Some(front) = inner.in_flight.front() {
            // States retire in submission order: if the oldest one is not
            // reusable, none of them are.
            let sync = front.sync.clone();
            let id = sync.batch_id.load(Ordering::Acquire);
            if shared.device.check_last_finished(id) || sync.is_free() || sync.fence.is_signaled()
            {
                reclaimed = inner.in_flight.pop_front();
                shared.states_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    match reclaimed {
        Some(mut state) => {
            let sync = state.sync.clone();
            if sync.submitted.load(Ordering::Acquire) && !sync.completed.load(Ordering::Acquire) {
                // Known finished, but the fence was never observed; make it
                // agree before the state is reused.
                let _ = sync.fence.wait(None);
                sync.completed.store(true, Ordering::Release);
            }
            reset_batch_state(shared, &mut state);
            state
        }
        None => BatchState::new(shared),
    }
}

fn find_sync(inner: &PoolInner, batch_id: u64) -> Option<Arc<BatchSync>> {
    inner
        .in_flight
        .iter()
        .find(|state| state.sync.batch_id.load(Ordering::Acquire) == batch_id)
        .map(|state| state.sync.clone())
}

fn check_batch_completion(shared: &PoolShared, batch_id: u64) -> bool {
    if shared.device.check_last_finished(batch_id) {
        return true;
    }

    let sync = {
        let inner = shared.inner.lock();
        match find_sync(&inner, batch_id) {
            Some(sync) => sync,
            // Not in flight: either queued for submission (busy) or already
            // retired (covered by the last-finished check above).
            None => return false,
        }
    };

    if !sync.submitted.load(Ordering::Acquire) {
        return false;
    }
    if sync.fence.is_signaled() {
        sync.completed.store(true, Ordering::Release);
        shared.device.update_last_finished(batch_id);
        return true;
    }

    false
}

fn wait_batch_id(shared: &PoolShared, batch_id: u64) {
    if shared.device.check_last_finished(batch_id) {
        return;
    }

    loop {
        let sync = {
            let mut inner = shared.inner.lock();
            if shared.device.check_last_finished(batch_id) {
                return;
            }

            match find_sync(&inner, batch_id) {
                Some(sync) => sync,
                None => {
                    // The batch is still queued on the worker; wait for a
                    // submission to land and look again.
                    shared.submit_cnd.wait(&mut inner);
                    continue;
                }
            }
        };

        let _ = sync.fence.wait(None);
        sync.completed.store(true, Ordering::Release);
        shared.device.update_last_finished(batch_id);
        return;
    }
}

/// Waits for one usage record: flush first if needed, then the GPU.
fn usage_wait(shared: &PoolShared, usage: &Arc<BatchUsage>, trywait: bool) {
    if !usage.exists() {
        return;
    }

    if usage.is_unflushed() {
        usage.wait_flush(trywait.then(|| Duration::from_micros(10)));
    }

    let batch_id = usage.usage_id();
    if batch_id != 0 {
        wait_batch_id(shared, batch_id);
    }
}
