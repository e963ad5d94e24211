//! The thread-safe, `Future`-oriented implementation.
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use futures::{channel::oneshot, future::FusedFuture, ready};
use lock_api::{Mutex, RawMutex as RawMutexTrait};

use crate::{
    core::{queue::QueueMutexCore, LockCallback, MutexCore, UnlockCallback},
    error::{ReleaseError, TryLockError},
    utils::panicking::polled_after_completion,
};

/// Wraps [`QueueMutexCore`] to provide a thread-safe, `Future`-oriented,
/// non-reentrant mutual-exclusion lock with a raw interface. `RawMutex: `
/// [`lock_api::RawMutex`] is used to protect the core from concurrent
/// accesses; it's only held for the duration of a state transition, never
/// across a suspension point.
///
/// A pending acquisition is represented by a [`oneshot`] channel. Releasing
/// the lock resolves the oldest channel, which wakes up the waiting task
/// through whatever executor is polling it. The lock itself never runs a
/// waiter's code.
pub struct AsyncRawLock<RawMutex> {
    core: Mutex<RawMutex, QueueMutexCore<InProgress>>,
}

/// The completion handle of a pending acquisition.
type InProgress = oneshot::Sender<()>;

impl<RawMutex: RawMutexTrait> fmt::Debug for AsyncRawLock<RawMutex> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.core.fmt(f)
    }
}

impl<RawMutex: RawMutexTrait> Default for AsyncRawLock<RawMutex> {
    #[inline]
    fn default() -> Self {
        Self::INIT
    }
}

#[cold]
fn unbalanced_release(e: ReleaseError) -> ! {
    panic!("unbalanced release: {:?}", e);
}

impl<RawMutex: RawMutexTrait> AsyncRawLock<RawMutex> {
    /// The initializer.
    pub const INIT: Self = Self {
        core: Mutex::const_new(RawMutex::INIT, QueueMutexCore::new()),
    };

    #[inline]
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Start acquiring the lock.
    ///
    /// If the lock is free, it's taken right away and the returned future is
    /// already complete (see [`Acquire::is_complete`]). Otherwise, the caller
    /// is appended to the wait queue. Either way, this method doesn't block.
    ///
    /// The caller becomes the holder when the returned future resolves, and is
    /// then responsible for calling [`Self::release`] exactly once. Dropping
    /// the future before that cancels the acquisition.
    pub fn acquire(&self) -> Acquire<'_, RawMutex> {
        Acquire {
            lock: self,
            ticket: self.ticket(),
        }
    }

    /// Take a place in the wait queue without borrowing the lock.
    pub(crate) fn ticket(&self) -> Ticket {
        let state = self.core.lock().lock(LockCallbackImpl {});
        match &state {
            AcquireState::Granted => log::trace!("{:p}: acquired immediately", self),
            _ => log::trace!("{:p}: enqueued a waiter", self),
        }
        Ticket { state }
    }

    /// Attempt to acquire the lock. (Non-blocking)
    ///
    /// This never overtakes a pending acquisition.
    pub fn try_acquire(&self) -> Result<(), TryLockError> {
        self.core.lock().try_lock()
    }

    /// Release the lock, handing it over to the oldest pending acquisition if
    /// there is one.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held.
    pub fn release(&self) {
        if let Err(e) = self.try_release() {
            unbalanced_release(e);
        }
    }

    /// The non-panicking variant of [`Self::release`].
    pub fn try_release(&self) -> Result<(), ReleaseError> {
        let mut core = self.core.lock();
        core.unlock(UnlockCallbackImpl {})?;
        if core.is_locked() {
            log::trace!("{:p}: handed over to the next waiter", self);
        } else {
            log::trace!("{:p}: released", self);
        }
        Ok(())
    }

    /// Acquire the lock, returning a guard that releases it on drop.
    ///
    /// Like [`Self::acquire`], this takes a place in the wait queue right
    /// away.
    pub fn lock(&self) -> LockFuture<'_, RawMutex> {
        LockFuture {
            acquire: self.acquire(),
        }
    }

    /// Attempt to acquire the lock, returning a guard that releases it on drop.
    /// (Non-blocking)
    pub fn try_lock(&self) -> Result<LockGuard<'_, RawMutex>, TryLockError> {
        self.try_acquire()?;
        Ok(LockGuard { lock: self })
    }

    /// Get a flag indicating whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.core.lock().is_locked()
    }

    /// Get the number of pending acquisitions. This may include cancelled
    /// acquisitions that haven't been skipped yet.
    #[inline]
    pub fn waiter_count(&self) -> usize {
        self.core.lock().waiter_count()
    }
}

struct LockCallbackImpl {}

struct UnlockCallbackImpl {}

impl LockCallback<InProgress> for LockCallbackImpl {
    type Output = AcquireState;

    #[inline]
    fn in_progress(self) -> (Self::Output, InProgress) {
        let (sender, receiver) = oneshot::channel();
        (AcquireState::Waiting(receiver), sender)
    }

    #[inline]
    fn complete(self) -> Self::Output {
        AcquireState::Granted
    }
}

impl UnlockCallback<InProgress> for UnlockCallbackImpl {
    #[inline]
    fn complete(&mut self, in_progress: InProgress) -> bool {
        // Fails if the receiving `Acquire` has been dropped
        in_progress.send(()).is_ok()
    }
}

// Acquisition future
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum AcquireState {
    /// The lock was granted, but the future hasn't reported it yet.
    Granted,
    /// Waiting in the queue.
    Waiting(oneshot::Receiver<()>),
    /// Ownership has been passed to the caller.
    Done,
}

#[cold]
fn completion_handle_dropped() -> ! {
    panic!("a pending acquisition was dropped without being resolved");
}

/// A place in the wait queue of [`AsyncRawLock`] that doesn't borrow the
/// lock.
///
/// Unlike [`Acquire`], this doesn't cancel itself on drop. The owner must call
/// [`Ticket::abandon`] if it gives up before the ticket resolves, or else a
/// grant made to it is never released.
#[derive(Debug)]
pub(crate) struct Ticket {
    state: AcquireState,
}

impl Ticket {
    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.state, AcquireState::Granted)
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.state, AcquireState::Done)
    }

    /// Withdraw from the queue of `lock`, releasing it if it has already been
    /// handed over to this ticket.
    pub(crate) fn abandon<RawMutex: RawMutexTrait>(&mut self, lock: &AsyncRawLock<RawMutex>) {
        let granted = match &mut self.state {
            AcquireState::Granted => true,
            AcquireState::Waiting(receiver) => {
                // After `close`, `UnlockCallbackImpl` can't hand the lock to us
                // anymore. Check if it did so before that.
                receiver.close();
                matches!(receiver.try_recv(), Ok(Some(())))
            }
            AcquireState::Done => false,
        };
        self.state = AcquireState::Done;

        if granted {
            log::debug!("{:p}: acquisition cancelled after grant", lock);
            lock.release();
        }
    }
}

impl Future for Ticket {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        match &mut this.state {
            AcquireState::Granted => {}
            AcquireState::Waiting(receiver) => {
                if ready!(Pin::new(receiver).poll(cx)).is_err() {
                    completion_handle_dropped();
                }
                log::trace!("acquired after waiting");
            }
            AcquireState::Done => polled_after_completion(),
        }
        this.state = AcquireState::Done;
        Poll::Ready(())
    }
}

/// A future representing a pending acquisition of [`AsyncRawLock`], which
/// will resolve when the lock has been granted.
///
/// # Cancellation
///
/// Dropping this future before it resolves cancels the acquisition. A
/// cancelled acquisition is never granted the lock; if the lock was handed
/// over concurrently with the cancellation, it's released on the spot.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Acquire<'a, RawMutex: RawMutexTrait> {
    lock: &'a AsyncRawLock<RawMutex>,
    ticket: Ticket,
}

impl<RawMutex: RawMutexTrait> Acquire<'_, RawMutex> {
    /// Get a flag indicating whether the lock was granted without waiting,
    /// i.e., the future is already complete and will resolve on the first
    /// poll.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.ticket.is_complete()
    }
}

impl<RawMutex: RawMutexTrait> fmt::Debug for Acquire<'_, RawMutex> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Acquire")
            .field("lock", &(self.lock as *const _))
            .field("ticket", &self.ticket)
            .finish()
    }
}

impl<RawMutex: RawMutexTrait> Future for Acquire<'_, RawMutex> {
    type Output = ();

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut Pin::into_inner(self).ticket).poll(cx)
    }
}

impl<RawMutex: RawMutexTrait> FusedFuture for Acquire<'_, RawMutex> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.ticket.is_terminated()
    }
}

impl<RawMutex: RawMutexTrait> Drop for Acquire<'_, RawMutex> {
    #[inline]
    fn drop(&mut self) {
        self.ticket.abandon(self.lock);
    }
}

/// A future representing a pending acquisition of [`AsyncRawLock`], which
/// will resolve to a [`LockGuard`] when the lock has been granted.
///
/// Dropping it before it resolves cancels the acquisition in the same way as
/// [`Acquire`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug)]
pub struct LockFuture<'a, RawMutex: RawMutexTrait> {
    acquire: Acquire<'a, RawMutex>,
}

impl<'a, RawMutex: RawMutexTrait> Future for LockFuture<'a, RawMutex> {
    type Output = LockGuard<'a, RawMutex>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        ready!(Pin::new(&mut this.acquire).poll(cx));
        Poll::Ready(LockGuard {
            lock: this.acquire.lock,
        })
    }
}

impl<RawMutex: RawMutexTrait> FusedFuture for LockFuture<'_, RawMutex> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.acquire.is_terminated()
    }
}

// Lock guard
// ----------------------------------------------------------------------------

/// An RAII guard holding [`AsyncRawLock`]. Dropping it releases the lock.
#[must_use = "if unused the lock will immediately unlock"]
pub struct LockGuard<'a, RawMutex: RawMutexTrait> {
    lock: &'a AsyncRawLock<RawMutex>,
}

impl<RawMutex: RawMutexTrait> fmt::Debug for LockGuard<'_, RawMutex> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("LockGuard")
            .field(&(self.lock as *const _))
            .finish()
    }
}

impl<RawMutex: RawMutexTrait> Drop for LockGuard<'_, RawMutex> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}
