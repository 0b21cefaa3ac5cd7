// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::device::Device;
use parking_lot::{Condvar, Mutex};
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// The shared state of a fence.
///
/// This is the part of a fence that crosses the queue boundary: the batch manager
/// hands an `Arc<FenceState>` to the queue backend inside a submission, and the
/// backend signals it when the GPU finishes.
#[derive(Debug)]
pub struct FenceState {
    // If true, we know that the fence is signaled. The mutex/condvar pair only
    // exists for blocking waiters; the fast path never touches it.
    signaled: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl FenceState {
    pub(crate) fn new(signaled: bool) -> Arc<FenceState> {
        Arc::new(FenceState {
            signaled: AtomicBool::new(signaled),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// Returns true if the fence is signaled.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Signals the fence and wakes all waiters. Called by the queue backend.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }

    /// Returns the fence to the unsignaled state.
    pub(crate) fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Waits until the fence is signaled, or at least until the timeout duration
    /// has elapsed.
    ///
    /// Returns `Ok` if the fence is now signaled. Returns `Err` if the timeout was
    /// reached instead. If you pass a duration of 0, the function returns without
    /// blocking.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), FenceError> {
        if self.is_signaled() {
            return Ok(());
        }

        let mut guard = self.mutex.lock();
        while !self.is_signaled() {
            match timeout {
                Some(timeout) => {
                    if self.cond.wait_for(&mut guard, timeout).timed_out() {
                        return if self.is_signaled() {
                            Ok(())
                        } else {
                            Err(FenceError::Timeout)
                        };
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }

        Ok(())
    }
}

/// A fence is used to know when a submission has finished its execution.
///
/// When a batch accesses a resource, the CPU must not access the same resource
/// simultaneously (except for concurrent reads). The fence attached to the batch
/// is how the CPU learns that the resource can be touched again.
#[derive(Debug)]
pub struct Fence {
    state: Arc<FenceState>,
    device: Arc<Device>,

    // Indicates whether this fence was taken from the device's fence pool.
    // If true, it will be put back into the pool on drop.
    must_put_in_pool: bool,
}

impl Fence {
    /// Creates a new unsignaled `Fence`.
    #[inline]
    pub fn new(device: Arc<Device>) -> Fence {
        Fence {
            state: FenceState::new(false),
            device,
            must_put_in_pool: false,
        }
    }

    /// Takes a fence from the device's fence pool.
    /// If the pool is empty, a new fence will be created.
    /// Upon `drop`, the fence is put back into the pool.
    ///
    /// For most purposes, using the fence pool should be preferred, in order to
    /// avoid creating a new fence for every batch.
    pub fn from_pool(device: Arc<Device>) -> Fence {
        let state = match device.fence_pool().pop() {
            Some(state) => {
                // Make sure the fence isn't signaled.
                state.reset();
                state
            }
            None => FenceState::new(false),
        };

        Fence {
            state,
            device,
            must_put_in_pool: true,
        }
    }

    /// Returns the shared state handed to the queue backend.
    #[inline]
    pub fn state(&self) -> &Arc<FenceState> {
        &self.state
    }

    /// Returns true if the fence is signaled.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.state.is_signaled()
    }

    /// See [`FenceState::wait`].
    #[inline]
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), FenceError> {
        self.state.wait(timeout)
    }

    /// Returns the fence to the unsignaled state.
    #[inline]
    pub fn reset(&self) {
        self.state.reset();
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.must_put_in_pool {
            self.device.fence_pool().push(self.state.clone());
        }
    }
}

/// Error that can happen when waiting on a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceError {
    /// The timeout has been reached.
    Timeout,
}

impl Error for FenceError {}

impl fmt::Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "the timeout has been reached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn fence_create() {
        let device = crate::tests::device();

        let fence = Fence::new(device);
        assert!(!fence.is_signaled());
    }

    #[test]
    fn fence_signaled_wait() {
        let device = crate::tests::device();

        let fence = Fence::new(device);
        fence.state().signal();
        fence.wait(Some(Duration::new(0, 10))).unwrap();
    }

    #[test]
    fn fence_wait_timeout() {
        let device = crate::tests::device();

        let fence = Fence::new(device);
        assert_eq!(
            fence.wait(Some(Duration::from_millis(1))),
            Err(FenceError::Timeout)
        );
    }

    #[test]
    fn fence_reset() {
        let device = crate::tests::device();

        let fence = Fence::new(device);
        fence.state().signal();
        assert!(fence.is_signaled());
        fence.reset();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn fence_cross_thread_signal() {
        let device = crate::tests::device();

        let fence = Fence::new(device);
        let state = fence.state().clone();
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            state.signal();
        });
        fence.wait(None).unwrap();
        signaler.join().unwrap();
    }

    #[test]
    fn fence_pool() {
        let device = crate::tests::device();

        assert_eq!(device.fence_pool().len(), 0);
        let state_ptr = {
            let fence = Fence::from_pool(device.clone());
            assert_eq!(device.fence_pool().len(), 0);
            Arc::as_ptr(fence.state())
        };

        assert_eq!(device.fence_pool().len(), 1);
        let fence2 = Fence::from_pool(device.clone());
        assert_eq!(device.fence_pool().len(), 0);
        assert_eq!(Arc::as_ptr(fence2.state()), state_ptr);
    }
}
