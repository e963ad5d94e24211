//! FIFO-queue-based implementation
use super::{LockCallback, MutexCore, UnlockCallback};
use crate::{
    error::{ReleaseError, TryLockError},
    utils::queue::WaiterQueue,
};

#[cfg(test)]
mod tests;

/// The ownership state of [`QueueMutexCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held,
}

/// An implementation of [`MutexCore`] that grants the lock in strict arrival
/// order.
///
/// # Invariants
///
///  - `waiters` is empty whenever `status` is [`LockStatus::Free`].
///  - Each `InProgress` is handed to [`UnlockCallback::complete`] at most once.
#[derive(Debug)]
pub struct QueueMutexCore<InProgress> {
    status: LockStatus,
    waiters: WaiterQueue<InProgress>,
}

impl<InProgress> QueueMutexCore<InProgress> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            status: LockStatus::Free,
            waiters: WaiterQueue::new(),
        }
    }
}

impl<InProgress> Default for QueueMutexCore<InProgress> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<InProgress> MutexCore for QueueMutexCore<InProgress> {
    type InProgress = InProgress;

    fn lock<Callback: LockCallback<Self::InProgress>>(
        &mut self,
        callback: Callback,
    ) -> Callback::Output {
        match self.status {
            LockStatus::Free => {
                self.status = LockStatus::Held;
                callback.complete()
            }
            LockStatus::Held => {
                let (output, in_progress) = callback.in_progress();
                self.waiters.enqueue(in_progress);
                output
            }
        }
    }

    fn try_lock(&mut self) -> Result<(), TryLockError> {
        match self.status {
            LockStatus::Free => {
                self.status = LockStatus::Held;
                Ok(())
            }
            LockStatus::Held => Err(TryLockError::WouldBlock),
        }
    }

    fn unlock<Callback: UnlockCallback<Self::InProgress>>(
        &mut self,
        mut callback: Callback,
    ) -> Result<(), ReleaseError> {
        if self.status == LockStatus::Free {
            return Err(ReleaseError::NotHeld);
        }

        // Hand the lock over without passing through `Free` so that nobody
        // can barge in ahead of the queue
        while let Some(in_progress) = self.waiters.dequeue() {
            if callback.complete(in_progress) {
                return Ok(());
            }
            log::trace!("skipping an abandoned waiter");
        }

        debug_assert!(self.waiters.is_empty());
        self.status = LockStatus::Free;
        Ok(())
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.status == LockStatus::Held
    }

    #[inline]
    fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
