// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use parking_lot::{Condvar, Mutex};
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

/// When and how a batch accessed a resource.
///
/// Each batch state owns one `BatchUsage` for its whole lifetime; resources
/// referenced by the batch hold a reference to it. The pair
/// `(usage id, unflushed)` distinguishes the three states a waiter cares about:
///
/// - `usage == 0 && !unflushed`: the batch never touched anything since the
///   last recycle; nothing to wait for.
/// - `unflushed`: the batch is still recording. Waiting means first waiting for
///   the flush (announced on the condvar), then for the GPU.
/// - `usage != 0 && !unflushed`: the batch was submitted with that id; waiting
///   means waiting for the GPU only.
#[derive(Debug)]
pub struct BatchUsage {
    usage: AtomicU64,
    unflushed: AtomicBool,
    mutex: Mutex<()>,
    flush: Condvar,
}

impl BatchUsage {
    pub(crate) fn new() -> BatchUsage {
        BatchUsage {
            usage: AtomicU64::new(0),
            unflushed: AtomicBool::new(false),
            mutex: Mutex::new(()),
            flush: Condvar::new(),
        }
    }

    /// The submission id of the batch this usage belongs to; 0 before the first
    /// submission after a recycle.
    #[inline]
    pub fn usage_id(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    /// Whether the owning batch is still recording.
    #[inline]
    pub fn is_unflushed(&self) -> bool {
        self.unflushed.load(Ordering::Acquire)
    }

    /// Whether there is anything to wait for at all.
    #[inline]
    pub fn exists(&self) -> bool {
        self.usage_id() != 0 || self.is_unflushed()
    }

    /// Marks the owning batch as recording.
    pub(crate) fn set_unflushed(&self) {
        self.unflushed.store(true, Ordering::Release);
    }

    /// Marks the owning batch as submitted under `id`.
    pub(crate) fn set_flushed(&self, id: u64) {
        self.usage.store(id, Ordering::Release);
        self.unflushed.store(false, Ordering::Release);
    }

    /// Clears the usage on recycle.
    pub(crate) fn clear(&self) {
        self.usage.store(0, Ordering::Release);
    }

    /// Wakes everything blocked in [`wait_flush`](Self::wait_flush).
    pub(crate) fn notify_flush(&self) {
        let _guard = self.mutex.lock();
        self.flush.notify_all();
    }

    /// Blocks until the owning batch has been flushed, or until `timeout`
    /// elapses. A bounded wait may return with the batch still unflushed.
    pub(crate) fn wait_flush(&self, timeout: Option<Duration>) {
        if !self.is_unflushed() {
            return;
        }

        let mut guard = self.mutex.lock();
        while self.is_unflushed() {
            match timeout {
                Some(timeout) => {
                    if self.flush.wait_for(&mut guard, timeout).timed_out() {
                        return;
                    }
                }
                None => self.flush.wait(&mut guard),
            }
        }
    }
}
