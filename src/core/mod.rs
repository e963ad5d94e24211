//! The core algorithm implementation to manage lock ownership and ensure
//! mutual exclusion.
use crate::error::{ReleaseError, TryLockError};

pub mod queue;

/// A non-reentrant mutual-exclusion lock that hands ownership over to pending
/// lock operations.
///
/// The implementor only tracks ownership. It never runs a waiter's code;
/// instead, a pending lock operation is represented by an opaque
/// `InProgress` value created by [`LockCallback::in_progress`], and completing
/// it is delegated to [`UnlockCallback::complete`].
///
/// # Panics
///
/// Panicking in user-provided callbacks may leave the implementor in an
/// indeterminate state.
pub trait MutexCore {
    /// Created by a `LockCallback` implementation when a lock operation is
    /// blocked. It will later be passed to [`UnlockCallback::complete`] when
    /// the lock is handed over.
    type InProgress;

    /// Acquire the lock.
    ///
    /// If the lock is free, it's taken immediately and
    /// [`LockCallback::complete`] is called. Otherwise,
    /// [`LockCallback::in_progress`] is called and its `InProgress` is
    /// appended to the wait queue.
    fn lock<Callback: LockCallback<Self::InProgress>>(
        &mut self,
        callback: Callback,
    ) -> Callback::Output;

    /// Attempt to acquire the lock. (Non-blocking)
    fn try_lock(&mut self) -> Result<(), TryLockError>;

    /// Release the lock, handing it over to the oldest pending lock operation
    /// that still accepts it.
    fn unlock<Callback: UnlockCallback<Self::InProgress>>(
        &mut self,
        callback: Callback,
    ) -> Result<(), ReleaseError>;

    /// Get a flag indicating whether the lock is currently held.
    fn is_locked(&self) -> bool;

    /// Get the number of pending lock operations.
    fn waiter_count(&self) -> usize;
}

pub trait LockCallback<InProgress> {
    type Output;

    /// Called if the lock operation did not complete because the lock is held.
    /// The returned `InProgress` will be used to notify the caller by
    /// [`UnlockCallback::complete`].
    fn in_progress(self) -> (Self::Output, InProgress);

    /// Indicates the lock operation's completion.
    fn complete(self) -> Self::Output;
}

pub trait UnlockCallback<InProgress> {
    /// An in-progress lock operation was granted the lock because of this
    /// unlock operation.
    ///
    /// Returns `false` if the operation has been abandoned and can't accept
    /// ownership, in which case the lock is offered to the next one.
    fn complete(&mut self, in_progress: InProgress) -> bool;
}

impl LockCallback<()> for () {
    type Output = ();
    fn in_progress(self) -> (Self::Output, ()) {
        ((), ())
    }
    fn complete(self) -> Self::Output {}
}

impl UnlockCallback<()> for () {
    fn complete(&mut self, _in_progress: ()) -> bool {
        true
    }
}
