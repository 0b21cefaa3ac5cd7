// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Shared helpers for unit tests: a deterministic software queue backend and
//! device constructors around it.

use crate::{
    device::{
        DeferredHandle, Device, DeviceCreateInfo, GfxLevel, QueueBackend, QueueError,
        QueueSubmission,
    },
    sync::FenceState,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// What the software queue remembers about one submission.
pub(crate) struct SubmissionRecord {
    pub batch_id: u64,
    pub entry_count: usize,
    pub wait_semaphores: usize,
    pub signal_semaphores: usize,
    pub fence: Arc<FenceState>,
}

/// A queue backend that records submissions and either signals fences immediately
/// (`auto`) or when the test decides the "GPU" is done (`manual`).
pub(crate) struct SoftwareQueue {
    auto_signal: bool,
    fail_next: AtomicBool,
    pub submissions: Mutex<Vec<SubmissionRecord>>,
    pub destroyed: Mutex<Vec<DeferredHandle>>,
}

impl SoftwareQueue {
    pub fn auto() -> Arc<SoftwareQueue> {
        Arc::new(SoftwareQueue {
            auto_signal: true,
            fail_next: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        })
    }

    pub fn manual() -> Arc<SoftwareQueue> {
        Arc::new(SoftwareQueue {
            auto_signal: false,
            fail_next: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        })
    }

    /// Makes the next `submit` call fail, as a lost device would.
    pub fn fail_next_submit(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    /// Signals the fences of every submission received so far.
    pub fn complete_all(&self) {
        for record in self.submissions.lock().iter() {
            record.fence.signal();
        }
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

impl QueueBackend for SoftwareQueue {
    fn submit(&self, submission: &QueueSubmission<'_>) -> Result<(), QueueError> {
        let fail = self.fail_next.swap(false, Ordering::Relaxed);

        self.submissions.lock().push(SubmissionRecord {
            batch_id: submission.batch_id,
            entry_count: submission.entries.len(),
            wait_semaphores: submission.wait_semaphores.len(),
            signal_semaphores: submission.signal_semaphores.len(),
            fence: submission.fence.clone(),
        });

        if fail {
            return Err(QueueError::DeviceLost);
        }

        if self.auto_signal {
            submission.fence.signal();
        }

        Ok(())
    }

    fn destroy_object(&self, object: DeferredHandle) {
        self.destroyed.lock().push(object);
    }
}

/// A device over an auto-completing software queue, at the default generation.
pub(crate) fn device() -> Arc<Device> {
    device_with_queue(GfxLevel::Gfx11, true).0
}

pub(crate) fn device_with_queue(
    gfx_level: GfxLevel,
    auto_signal: bool,
) -> (Arc<Device>, Arc<SoftwareQueue>) {
    let queue = if auto_signal {
        SoftwareQueue::auto()
    } else {
        SoftwareQueue::manual()
    };

    let device = Device::new(
        queue.clone(),
        DeviceCreateInfo {
            gfx_level,
            ..Default::default()
        },
    );

    (device, queue)
}
