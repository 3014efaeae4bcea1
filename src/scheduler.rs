//! The interface to the task scheduler of the surrounding runtime.
//!
//! The heap itself does not know anything about tasks. It only needs a way to
//! make each of its operations appear atomic to other tasks, which is provided
//! by a [`Scheduler`]: every operation of the [`Heap`](crate::Heap) suspends
//! the scheduler before touching its state and resumes it afterwards.

/// The scheduler primitives consumed by the heap.
///
/// Implementations typically forward to the runtime, e.g. to the functions
/// suspending and resuming all tasks of an RTOS. Suspension must nest: the
/// heap never suspends twice itself, but the caller might have suspended the
/// scheduler already.
pub trait Scheduler {
    /// Prevent other tasks from running until [`resume()`](Self::resume) is
    /// called.
    fn suspend(&self);

    /// Undo a previous [`suspend()`](Self::suspend).
    fn resume(&self);

    /// Called after an allocation of `size` bytes failed.
    ///
    /// The scheduler is already resumed when this is invoked, so the hook may
    /// block, log or even allocate. The default implementation does nothing.
    fn allocation_failed(&self, size: usize) {
        let _ = size;
    }
}

/// A scheduler, that does nothing.
///
/// This is the right choice without a task scheduler, e.g. on hosted targets
/// or in bare-metal applications with a single thread of execution. The heap
/// is still protected by its spin lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoScheduler;
impl Scheduler for NoScheduler {
    fn suspend(&self) {}

    fn resume(&self) {}
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    fn suspend(&self) {
        (**self).suspend();
    }

    fn resume(&self) {
        (**self).resume();
    }

    fn allocation_failed(&self, size: usize) {
        (**self).allocation_failed(size);
    }
}

/// A guard keeping the scheduler suspended while it is alive.
pub(crate) struct CriticalSection<'scheduler, S: Scheduler> {
    scheduler: &'scheduler S,
}
impl<'scheduler, S: Scheduler> CriticalSection<'scheduler, S> {
    /// Suspend the scheduler until the returned guard is dropped.
    pub(crate) fn enter(scheduler: &'scheduler S) -> Self {
        scheduler.suspend();
        Self { scheduler }
    }
}
impl<S: Scheduler> Drop for CriticalSection<'_, S> {
    fn drop(&mut self) {
        self.scheduler.resume();
    }
}
