// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device is the root object of the driver core.
//!
//! A [`Device`] owns every piece of state that the original driver kept in
//! process-global or screen-level storage: the hardware generation tag, the
//! monotonically increasing submission-id counter, the "last known finished"
//! submission id, the sticky device-loss flag and the GPU virtual-address
//! allocator backing command-stream BOs. All of it is reached through the
//! device object; there are no hidden singletons.
//!
//! The kernel submission interface is not reimplemented here. It is consumed
//! through the [`QueueBackend`] trait, which receives fully-built submissions
//! (indirect-buffer entries, wait/signal semaphores, a fence to signal) and is
//! free to hand them to an actual kernel driver, a replay recorder or a
//! software executor.

use crate::{
    command_stream::CsEntry,
    sync::{FenceState, SemaphoreHandle},
    DeviceSize, NonExhaustive,
};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Hardware generation tag.
///
/// Descriptor bit layouts, clamp ranges and a handful of layout rules are gated on
/// this value. The variants are ordered, and all generation dispatch in this crate
/// is an ordered `>=` cascade from newest to oldest band; callers must not rely on
/// any band being the "default".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum GfxLevel {
    Gfx8 = 80,
    Gfx9 = 90,
    Gfx10 = 100,
    Gfx10_3 = 103,
    Gfx11 = 110,
    Gfx12 = 120,
}

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// The hardware generation the device encodes for.
    ///
    /// The default value is [`GfxLevel::Gfx11`].
    pub gfx_level: GfxLevel,

    /// Whether an unrecoverable device loss should abort the process when no reset
    /// hook is installed.
    ///
    /// The default value is `false`.
    pub abort_on_loss: bool,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceCreateInfo {
            gfx_level: GfxLevel::Gfx11,
            abort_on_loss: false,
            _ne: NonExhaustive(()),
        }
    }
}

/// Why the device was lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetStatus {
    /// The loss was caused by work submitted from this device.
    Guilty,
    /// The loss happened for reasons outside this device's control.
    Innocent,
}

/// The root object of the driver core.
///
/// Cheap to share; all operations take `&self`.
pub struct Device {
    gfx_level: GfxLevel,
    queue: Arc<dyn QueueBackend>,
    abort_on_loss: bool,

    // Monotonic submission-id source. Ids start at 1; 0 means "never submitted".
    curr_batch: AtomicU64,
    // Highest submission id that is known to have finished on the GPU. Completion
    // order across queues is not submission order, so this only ever moves forward
    // via `fetch_max`.
    last_finished: AtomicU64,

    lost: AtomicBool,
    reset_hook: Mutex<Option<Box<dyn Fn(ResetStatus) + Send + Sync>>>,

    // Bump allocator for GPU virtual addresses handed to BOs. Nothing is ever
    // unmapped in this model, so a monotonic cursor is sufficient.
    next_iova: AtomicU64,

    // Source of unique ids for resources and programs; id 0 is never handed out.
    next_object_id: AtomicU64,

    // Pool of fence states for reuse, so that a fence does not have to be created
    // for every batch.
    fence_pool: SegQueue<Arc<FenceState>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("gfx_level", &self.gfx_level)
            .field("curr_batch", &self.curr_batch.load(Ordering::Relaxed))
            .field("last_finished", &self.last_finished.load(Ordering::Relaxed))
            .field("lost", &self.lost.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Creates a new `Device` on top of the given queue backend.
    pub fn new(queue: Arc<dyn QueueBackend>, create_info: DeviceCreateInfo) -> Arc<Device> {
        let DeviceCreateInfo {
            gfx_level,
            abort_on_loss,
            _ne: _,
        } = create_info;

        Arc::new(Device {
            gfx_level,
            queue,
            abort_on_loss,
            curr_batch: AtomicU64::new(0),
            last_finished: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            reset_hook: Mutex::new(None),
            // Leave the null page unmapped.
            next_iova: AtomicU64::new(0x1000),
            next_object_id: AtomicU64::new(0),
            fence_pool: SegQueue::new(),
        })
    }

    /// Returns the hardware generation the device encodes for.
    #[inline]
    pub fn gfx_level(&self) -> GfxLevel {
        self.gfx_level
    }

    /// Returns the queue backend the device submits to.
    #[inline]
    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    /// Returns whether the device has been lost.
    ///
    /// Device loss is sticky: once set, every subsequent submission short-circuits
    /// with [`QueueError::DeviceLost`] instead of attempting further GPU work.
    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Installs a hook invoked when the device is lost.
    pub fn set_reset_hook(&self, hook: Box<dyn Fn(ResetStatus) + Send + Sync>) {
        *self.reset_hook.lock() = Some(hook);
    }

    /// Marks the device lost and notifies the owner.
    ///
    /// If a reset hook is installed it is invoked; otherwise, if the device was
    /// created with `abort_on_loss`, nothing can save us and the process aborts.
    pub(crate) fn report_loss(&self) {
        self.lost.store(true, Ordering::Release);

        let hook = self.reset_hook.lock();
        if let Some(hook) = hook.as_ref() {
            hook(ResetStatus::Guilty);
        } else if self.abort_on_loss {
            tracing::error!("device lost with no reset hook installed, aborting");
            std::process::abort();
        }
    }

    /// Returns the next submission id. Ids are assigned in `end`/`submit` order and
    /// start at 1.
    #[inline]
    pub(crate) fn next_submission_id(&self) -> u64 {
        self.curr_batch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the highest submission id known to have finished.
    #[inline]
    pub fn last_finished_id(&self) -> u64 {
        self.last_finished.load(Ordering::Acquire)
    }

    /// Records that submission `id` (and, by monotonicity of ids within a queue,
    /// everything before it) has finished.
    #[inline]
    pub(crate) fn update_last_finished(&self, id: u64) {
        self.last_finished.fetch_max(id, Ordering::AcqRel);
    }

    /// Returns whether submission `id` is known to have finished without touching
    /// any synchronization primitive. `0` (never submitted) counts as finished.
    #[inline]
    pub fn check_last_finished(&self, id: u64) -> bool {
        id == 0 || id <= self.last_finished.load(Ordering::Acquire)
    }

    /// Hands out a fresh GPU virtual-address range.
    pub(crate) fn allocate_iova(&self, size: DeviceSize) -> u64 {
        let size = crate::align_up(size.max(1), 0x1000);
        self.next_iova.fetch_add(size, Ordering::Relaxed)
    }

    /// Hands out a device-unique object id. Never returns 0.
    #[inline]
    pub(crate) fn next_object_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub(crate) fn fence_pool(&self) -> &SegQueue<Arc<FenceState>> {
        &self.fence_pool
    }
}

/// A submission handed to the queue backend.
///
/// The entries reference BOs that are kept alive by the owning batch state until
/// the fence signals; the backend must not retain them past that point.
#[derive(Debug)]
pub struct QueueSubmission<'a> {
    /// The monotonically increasing id of this submission.
    pub batch_id: u64,
    /// Semaphores the GPU must wait on before executing, in wait order.
    pub wait_semaphores: &'a [SemaphoreHandle],
    /// Semaphores the GPU signals once execution finishes.
    pub signal_semaphores: &'a [SemaphoreHandle],
    /// The indirect-buffer entries to execute, in order.
    pub entries: &'a [CsEntry],
    /// Signaled by the backend once the submission has finished executing.
    pub fence: &'a Arc<FenceState>,
}

/// A GPU object whose destruction requires a kernel round-trip.
///
/// Destruction of these is deferred onto per-batch lists and flushed away from the
/// recording thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeferredHandle {
    Semaphore(SemaphoreHandle),
    View(u64),
    Sampler(u64),
}

/// Error type returned by the queue backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The device has been lost.
    DeviceLost,
    /// There is no memory available on the host.
    OutOfHostMemory,
}

impl Error for QueueError {}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceLost => write!(f, "the device was lost"),
            Self::OutOfHostMemory => write!(f, "no memory available on the host"),
        }
    }
}

/// The kernel/GPU submission boundary.
///
/// The driver core hands finished submissions to this trait and consumes nothing
/// else from the kernel. Implementations signal `submission.fence` when the work
/// completes; they may do so from any thread.
pub trait QueueBackend: Send + Sync {
    /// Executes a submission.
    fn submit(&self, submission: &QueueSubmission<'_>) -> Result<(), QueueError>;

    /// Destroys a GPU object handle. Called from the submission worker so that the
    /// recording thread never blocks on a kernel round-trip.
    fn destroy_object(&self, _object: DeferredHandle) {}
}

/// A queue backend that completes every submission immediately.
///
/// Entries are discarded and the fence is signaled before `submit` returns. Useful
/// for headless use and as the simplest possible reference backend.
#[derive(Debug, Default)]
pub struct NullQueue;

impl QueueBackend for NullQueue {
    fn submit(&self, submission: &QueueSubmission<'_>) -> Result<(), QueueError> {
        submission.fence.signal();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gfx_level_ordering() {
        assert!(GfxLevel::Gfx8 < GfxLevel::Gfx9);
        assert!(GfxLevel::Gfx10 < GfxLevel::Gfx10_3);
        assert!(GfxLevel::Gfx10_3 < GfxLevel::Gfx11);
        assert!(GfxLevel::Gfx12 >= GfxLevel::Gfx10);
    }

    #[test]
    fn submission_ids_monotonic() {
        let device = crate::tests::device();

        let a = device.next_submission_id();
        let b = device.next_submission_id();
        assert!(b > a);
        assert!(a >= 1);
    }

    #[test]
    fn last_finished_only_moves_forward() {
        let device = crate::tests::device();

        device.update_last_finished(5);
        device.update_last_finished(3);
        assert_eq!(device.last_finished_id(), 5);
        assert!(device.check_last_finished(4));
        assert!(!device.check_last_finished(6));
        // Id 0 means "never submitted" and is always finished.
        assert!(device.check_last_finished(0));
    }

    #[test]
    fn iova_ranges_do_not_overlap() {
        let device = crate::tests::device();

        let a = device.allocate_iova(0x2345);
        let b = device.allocate_iova(16);
        assert!(b >= a + 0x3000);
        assert_eq!(a % 0x1000, 0);
        assert_eq!(b % 0x1000, 0);
    }
}
