// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::usage::BatchUsage;
use crate::{
    device::{DeferredHandle, Device},
    DeviceSize, NonExhaustive,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Flags affecting how a resource participates in batch tracking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceFlags {
    /// The resource is shared across contexts; its busy state cannot be known
    /// locally.
    pub shared: bool,
    /// The application promised not to synchronize against this resource.
    pub no_sync: bool,
    /// Sparsely bound; tracked separately and excluded from the video-memory
    /// pressure estimate.
    pub sparse: bool,
}

/// Parameters to create a new `Resource`.
#[derive(Clone, Debug)]
pub struct ResourceCreateInfo {
    /// Byte size of the resource's backing allocation.
    ///
    /// The default value is 0.
    pub size_b: DeviceSize,

    /// The default value is empty.
    pub flags: ResourceFlags,

    pub _ne: NonExhaustive,
}

impl Default for ResourceCreateInfo {
    #[inline]
    fn default() -> Self {
        ResourceCreateInfo {
            size_b: 0,
            flags: ResourceFlags::default(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Busy state of a resource as far as batch tracking can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceIdle {
    /// No batch holds an outstanding usage record.
    Idle,
    /// At least one referencing batch has not completed.
    Busy,
    /// The resource is shared or no-sync; its state cannot be determined here.
    Unknown,
}

#[derive(Default)]
struct ResourceTrack {
    reads: Option<Arc<BatchUsage>>,
    writes: Option<Arc<BatchUsage>>,
}

struct ViewCache {
    handles: Vec<u64>,
    /// Number of leading handles scheduled for pruning.
    prune_count: usize,
    /// Submission id after which the scheduled prune is safe to run.
    prune_timeline: u64,
}

/// A GPU resource participating in per-batch usage tracking.
///
/// The resource itself is owned by the frontend; batches keep it alive while
/// referenced and record *usage* (which batch last read/wrote it) so that
/// busy/idle queries and destructive operations can be ordered against the GPU.
pub struct Resource {
    id: u64,
    size_b: DeviceSize,
    flags: ResourceFlags,
    track: Mutex<ResourceTrack>,
    views: Mutex<ViewCache>,
}

impl Resource {
    pub fn new(device: &Device, create_info: &ResourceCreateInfo) -> Arc<Resource> {
        let ResourceCreateInfo {
            size_b,
            flags,
            _ne: _,
        } = *create_info;

        Arc::new(Resource {
            id: device.next_object_id(),
            size_b,
            flags,
            track: Mutex::new(ResourceTrack::default()),
            views: Mutex::new(ViewCache {
                handles: Vec::new(),
                prune_count: 0,
                prune_timeline: 0,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn size_b(&self) -> DeviceSize {
        self.size_b
    }

    #[inline]
    pub fn flags(&self) -> ResourceFlags {
        self.flags
    }

    /// Caches a view object created against this resource. The handle is
    /// destroyed once the resource goes idle (or the cache balloons).
    pub fn add_view(&self, handle: u64) {
        self.views.lock().handles.push(handle);
    }

    #[inline]
    pub fn view_count(&self) -> usize {
        self.views.lock().handles.len()
    }

    /// The usage records of the batches that last read and wrote the resource.
    pub fn usage(&self) -> (Option<Arc<BatchUsage>>, Option<Arc<BatchUsage>>) {
        let track = self.track.lock();
        (track.reads.clone(), track.writes.clone())
    }

    /// Records `usage` as the last reader or writer.
    pub(crate) fn usage_set(&self, usage: &Arc<BatchUsage>, write: bool) {
        let mut track = self.track.lock();
        if write {
            track.writes = Some(usage.clone());
        } else {
            track.reads = Some(usage.clone());
        }
    }

    /// Drops `usage` from the tracking slots it occupies. Returns whether any
    /// usage remains afterwards; `false` means the resource is now fully idle.
    pub(crate) fn usage_unset(&self, usage: &Arc<BatchUsage>) -> bool {
        let mut track = self.track.lock();

        if let Some(reads) = &track.reads {
            if Arc::ptr_eq(reads, usage) {
                track.reads = None;
            }
        }
        if let Some(writes) = &track.writes {
            if Arc::ptr_eq(writes, usage) {
                track.writes = None;
            }
        }

        track.reads.as_ref().is_some_and(|u| u.exists())
            || track.writes.as_ref().is_some_and(|u| u.exists())
    }

    /// Whether `usage` is already recorded for the matching access kind.
    pub(crate) fn usage_matches(&self, usage: &Arc<BatchUsage>, write: bool) -> bool {
        let track = self.track.lock();
        let slot = if write { &track.writes } else { &track.reads };
        slot.as_ref().is_some_and(|u| Arc::ptr_eq(u, usage))
    }

    /// Destroys every cached view. Called once the resource is known idle.
    pub(crate) fn prune_all_views(&self, device: &Device) {
        let mut views = self.views.lock();
        for handle in views.handles.drain(..) {
            device.queue().destroy_object(DeferredHandle::View(handle));
        }
        views.prune_count = 0;
        views.prune_timeline = 0;
    }

    /// Schedules pruning of the currently cached views for the point where the
    /// batches referencing them have provably retired. Used to keep the cache
    /// from ballooning on resources that never go idle.
    pub(crate) fn schedule_view_prune(&self) {
        let (reads, writes) = self.usage();
        let timeline = u64::max(
            reads.map_or(0, |u| u.usage_id()),
            writes.map_or(0, |u| u.usage_id()),
        );

        let mut views = self.views.lock();
        // Double check under the lock in case a prune just finished.
        if views.prune_timeline == 0 {
            views.prune_count = views.handles.len();
            views.prune_timeline = timeline;
        }
    }

    /// Runs a scheduled prune if its timeline has retired. Called from the
    /// submission worker so the kernel round-trips stay off the recording
    /// thread.
    pub(crate) fn run_scheduled_prune(&self, device: &Device) {
        let mut views = self.views.lock();
        if views.prune_timeline != 0 && device.check_last_finished(views.prune_timeline) {
            let count = views.prune_count.min(views.handles.len());
            for handle in views.handles.drain(..count) {
                device.queue().destroy_object(DeferredHandle::View(handle));
            }
            views.prune_count = 0;
            views.prune_timeline = 0;
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("size_b", &self.size_b)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A shader program participating in batch tracking, so that program
/// destruction can be deferred until the last batch using it retires.
#[derive(Debug)]
pub struct Program {
    id: u64,
    batch_uses: Mutex<Option<Arc<BatchUsage>>>,
}

impl Program {
    pub fn new(device: &Device) -> Arc<Program> {
        Arc::new(Program {
            id: device.next_object_id(),
            batch_uses: Mutex::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The usage record of the batch that last used the program.
    pub fn batch_uses(&self) -> Option<Arc<BatchUsage>> {
        self.batch_uses.lock().clone()
    }

    pub(crate) fn usage_set(&self, usage: &Arc<BatchUsage>) {
        *self.batch_uses.lock() = Some(usage.clone());
    }

    pub(crate) fn usage_matches(&self, usage: &Arc<BatchUsage>) -> bool {
        self.batch_uses
            .lock()
            .as_ref()
            .is_some_and(|u| Arc::ptr_eq(u, usage))
    }

    pub(crate) fn usage_unset(&self, usage: &Arc<BatchUsage>) {
        let mut uses = self.batch_uses.lock();
        if uses.as_ref().is_some_and(|u| Arc::ptr_eq(u, usage)) {
            *uses = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_set_and_unset() {
        let device = crate::tests::device();
        let res = Resource::new(&device, &ResourceCreateInfo::default());

        let a = Arc::new(BatchUsage::new());
        let b = Arc::new(BatchUsage::new());
        a.set_unflushed();
        b.set_unflushed();

        res.usage_set(&a, true);
        res.usage_set(&b, false);

        // Dropping the writer still leaves the reader outstanding.
        assert!(res.usage_unset(&a));
        // Dropping the reader leaves nothing.
        assert!(!res.usage_unset(&b));

        let (reads, writes) = res.usage();
        assert!(reads.is_none() && writes.is_none());
    }

    #[test]
    fn usage_unset_ignores_foreign_usage() {
        let device = crate::tests::device();
        let res = Resource::new(&device, &ResourceCreateInfo::default());

        let a = Arc::new(BatchUsage::new());
        let b = Arc::new(BatchUsage::new());
        a.set_unflushed();

        res.usage_set(&a, true);
        assert!(res.usage_unset(&b));
        assert!(res.usage_matches(&a, true));
    }

    #[test]
    fn scheduled_prune_waits_for_timeline() {
        let device = crate::tests::device();
        let res = Resource::new(&device, &ResourceCreateInfo::default());

        let usage = Arc::new(BatchUsage::new());
        usage.set_flushed(10);
        res.usage_set(&usage, true);

        res.add_view(1);
        res.add_view(2);
        res.schedule_view_prune();

        // Batch 10 has not retired: nothing is pruned.
        res.run_scheduled_prune(&device);
        assert_eq!(res.view_count(), 2);

        device.update_last_finished(10);
        res.run_scheduled_prune(&device);
        assert_eq!(res.view_count(), 0);
    }

    #[test]
    fn object_ids_are_unique() {
        let device = crate::tests::device();
        let a = Resource::new(&device, &ResourceCreateInfo::default());
        let b = Resource::new(&device, &ResourceCreateInfo::default());
        let p = Program::new(&device);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), p.id());
        assert!(a.id() != 0);
    }
}
