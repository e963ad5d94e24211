//! Provides an asynchronous lock with scoped critical sections and recursion
//! deferral.
use alloc::{collections::VecDeque, sync::Arc};
use core::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll},
};
use futures::{
    channel::oneshot,
    future::{BoxFuture, FusedFuture, FutureExt},
    ready,
    task::{Spawn, SpawnError, SpawnExt},
};
use lock_api::{Mutex, RawMutex as RawMutexTrait};

use crate::{
    chain::{Chain, LockId},
    error::{ReleaseError, TryLockError},
    raw::{Acquire, AsyncRawLock, LockFuture, LockGuard, Ticket},
    utils::panicking::polled_after_completion,
};


/// An asynchronous, non-reentrant mutual-exclusion lock.
///
/// Waiting for the lock never occupies a thread: contended callers are
/// suspended and resumed in FIFO order. In addition to the raw
/// [`acquire`](Self::acquire)/[`release`](Self::release) pair, this type
/// offers scoped critical sections:
///
///  - [`protect`](Self::protect) runs a body with the lock held and releases
///    it on every exit path.
///
///  - [`protect_or_queue_on_recursion`](Self::protect_or_queue_on_recursion)
///    does the same but recognizes a call made from inside its own critical
///    section (as tracked by a [`Chain`]) and schedules the body to run after
///    the lock is released instead of deadlocking.
///
/// `AsyncLock` is a handle. Cloning it produces another handle to the same
/// lock.
pub struct AsyncLock<RawMutex> {
    inner: Arc<Inner<RawMutex>>,
}

struct Inner<RawMutex> {
    id: LockId,
    raw: AsyncRawLock<RawMutex>,
}

impl<RawMutex> Clone for AsyncLock<RawMutex> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<RawMutex: RawMutexTrait> fmt::Debug for AsyncLock<RawMutex> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncLock")
            .field("id", &self.inner.id)
            .field("raw", &self.inner.raw)
            .finish()
    }
}

impl<RawMutex: RawMutexTrait> Default for AsyncLock<RawMutex> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<RawMutex: RawMutexTrait> AsyncLock<RawMutex> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: LockId::next(),
                raw: AsyncRawLock::new(),
            }),
        }
    }

    /// Get the identity of this lock as seen by [`Chain`].
    #[inline]
    pub fn id(&self) -> LockId {
        self.inner.id
    }

    /// Get the underlying raw lock.
    #[inline]
    pub fn raw(&self) -> &AsyncRawLock<RawMutex> {
        &self.inner.raw
    }

    /// Start acquiring the lock. See [`AsyncRawLock::acquire`].
    #[inline]
    pub fn acquire(&self) -> Acquire<'_, RawMutex> {
        self.raw().acquire()
    }

    /// Attempt to acquire the lock. (Non-blocking)
    #[inline]
    pub fn try_acquire(&self) -> Result<(), TryLockError> {
        self.raw().try_acquire()
    }

    /// Release the lock. See [`AsyncRawLock::release`].
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held.
    #[inline]
    pub fn release(&self) {
        self.raw().release()
    }

    /// The non-panicking variant of [`Self::release`].
    #[inline]
    pub fn try_release(&self) -> Result<(), ReleaseError> {
        self.raw().try_release()
    }

    /// Acquire the lock, returning a guard that releases it on drop.
    #[inline]
    pub fn lock(&self) -> LockFuture<'_, RawMutex> {
        self.raw().lock()
    }

    /// Attempt to acquire the lock, returning a guard that releases it on
    /// drop. (Non-blocking)
    #[inline]
    pub fn try_lock(&self) -> Result<LockGuard<'_, RawMutex>, TryLockError> {
        self.raw().try_lock()
    }

    /// Get a flag indicating whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw().is_locked()
    }

    /// Get the number of pending acquisitions.
    #[inline]
    pub fn waiter_count(&self) -> usize {
        self.raw().waiter_count()
    }

    /// Acquire the lock, run `body` to completion, and release the lock.
    ///
    /// The lock is released before `body`'s output is returned, and also when
    /// `body` panics or the returned future is dropped midway.
    ///
    /// Calling this from inside a critical section of the same lock waits
    /// forever. Use [`Self::protect_or_queue_on_recursion`] in code that may
    /// be reached that way.
    ///
    /// # Example
    ///
    /// ```rust
    /// use deferlock::hl::lock::AsyncLock;
    /// use parking_lot::RawMutex;
    ///
    /// let lock = AsyncLock::<RawMutex>::new();
    /// let x = futures::executor::block_on(lock.protect(|| async { 42 }));
    /// assert_eq!(x, 42);
    /// assert!(!lock.is_locked());
    /// ```
    pub async fn protect<F, Fut>(&self, body: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _guard = self.raw().lock().await;
        body().await
    }

    /// Run `body` with the lock held, deferring it if `chain` is already
    /// inside a critical section of this lock.
    ///
    /// The decision is made when this method is called:
    ///
    ///  - If the lock is free, or held on behalf of another chain, this
    ///    behaves like [`Self::protect`]. The returned future acquires the lock
    ///    and runs `body` when it's polled.
    ///
    ///  - If the lock is held and `chain` has it marked as active, the caller
    ///    is (transitively) running inside `body` of an earlier call. Waiting
    ///    for the lock here would deadlock, so instead `body` takes a place in
    ///    the wait queue right away and is spawned on `spawner`, where it runs
    ///    as soon as the current holder releases the lock. The returned future
    ///    merely reports the output; `body` runs whether or not it's polled or
    ///    kept. [`ProtectOrQueue::is_deferred`] returns `true` in this case.
    ///    The future must not be awaited inside the current critical section.
    ///    Pass it out of the section (e.g., return it from `body`) or chain
    ///    further work with [`ProtectOrQueue::then_in_order`].
    ///
    /// Either way, `body` receives a copy of `chain` with this lock marked as
    /// active. Nested calls made through it are recognized as recursion.
    ///
    /// Returns `Err` if a deferred body couldn't be spawned. It's withdrawn
    /// from the queue in that case.
    ///
    /// # Example
    ///
    /// ```rust
    /// use deferlock::{chain::Chain, hl::lock::AsyncLock};
    /// use futures::executor::{block_on, ThreadPool};
    /// use parking_lot::RawMutex;
    ///
    /// let pool = ThreadPool::new().unwrap();
    /// let lock = AsyncLock::<RawMutex>::new();
    ///
    /// let nested = block_on(
    ///     lock.protect_or_queue_on_recursion(&pool, &Chain::new(), {
    ///         let (lock, pool) = (lock.clone(), pool.clone());
    ///         move |chain| async move {
    ///             // Awaiting this here would deadlock
    ///             lock.protect_or_queue_on_recursion(&pool, &chain, |_| async { 2 })
    ///                 .unwrap()
    ///         }
    ///     })
    ///     .unwrap(),
    /// );
    ///
    /// assert!(nested.is_deferred());
    /// assert_eq!(block_on(nested), 2);
    /// ```
    pub fn protect_or_queue_on_recursion<S, F, Fut>(
        &self,
        spawner: &S,
        chain: &Chain,
        body: F,
    ) -> Result<ProtectOrQueue<RawMutex, Fut::Output>, SpawnError>
    where
        RawMutex: Send + Sync + 'static,
        S: Spawn + ?Sized,
        F: FnOnce(Chain) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let id = self.id();
        let deferred = chain.is_active(id) && self.is_locked();

        let (sender, output) = oneshot::channel();
        let mut chain = chain.clone();
        let stage = async move {
            let body = chain.with_pushed(id, |chain| body(chain.clone()));
            // Fails if nobody is interested in the output anymore
            let _ = sender.send(body.await);
        };

        let stages = Arc::new(Mutex::new(Stages {
            queue: VecDeque::from([stage.boxed()]),
            finished: false,
        }));
        let mut tenure = Tenure {
            lock: self.clone(),
            state: TenureState::Idle,
            stages: Arc::clone(&stages),
            running: None,
        };

        let tenure = if deferred {
            log::debug!("{:?}: recursion detected, deferring", id);
            // Take a place in the queue now, so that the body runs right after
            // the current holder
            tenure.state = TenureState::Queued(self.raw().ticket());
            spawner.spawn(tenure)?;
            None
        } else {
            Some(tenure)
        };

        Ok(ProtectOrQueue {
            deferred,
            tenure,
            stages,
            late: None,
            output,
            terminated: false,
        })
    }

    /// Hide this lock from `chain`'s recursion check while running `body`.
    ///
    /// A call to [`Self::protect_or_queue_on_recursion`] made inside `body`
    /// with the passed chain is not deferred even if the lock is held by an
    /// enclosing critical section. This doesn't release the lock. `chain` is
    /// restored when `body` returns or unwinds.
    #[inline]
    pub fn with_lock_hidden_from_recursion_check<R>(
        &self,
        chain: &mut Chain,
        body: impl FnOnce(&mut Chain) -> R,
    ) -> R {
        chain.with_suppressed(self.id(), body)
    }
}

// Tenure
// ----------------------------------------------------------------------------

/// The work to be done under a single tenure of the lock, in order.
struct Stages {
    queue: VecDeque<BoxFuture<'static, ()>>,
    /// The tenure has ended. Nothing more runs under it.
    finished: bool,
}

type SharedStages<RawMutex> = Arc<Mutex<RawMutex, Stages>>;

enum TenureState {
    /// Not in the queue yet.
    Idle,
    Queued(Ticket),
    Held,
    Done,
}

/// One tenure of the lock: waits for the grant, runs the queued stages one at
/// a time, and releases the lock.
///
/// It's either spawned on an executor (deferred calls) or driven by the
/// [`ProtectOrQueue`] that owns it.
struct Tenure<RawMutex: RawMutexTrait> {
    lock: AsyncLock<RawMutex>,
    state: TenureState,
    stages: SharedStages<RawMutex>,
    running: Option<BoxFuture<'static, ()>>,
}

impl<RawMutex: RawMutexTrait> Future for Tenure<RawMutex> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        loop {
            match &mut this.state {
                TenureState::Idle => {
                    this.state = TenureState::Queued(this.lock.raw().ticket());
                }
                TenureState::Queued(ticket) => {
                    ready!(Pin::new(ticket).poll(cx));
                    this.state = TenureState::Held;
                }
                TenureState::Held => break,
                TenureState::Done => polled_after_completion(),
            }
        }

        loop {
            if let Some(running) = &mut this.running {
                ready!(running.poll_unpin(cx));
                this.running = None;
            }

            let mut stages = this.stages.lock();
            match stages.queue.pop_front() {
                Some(stage) => this.running = Some(stage),
                None => {
                    stages.finished = true;
                    break;
                }
            }
        }

        this.state = TenureState::Done;
        this.lock.release();
        Poll::Ready(())
    }
}

impl<RawMutex: RawMutexTrait> Drop for Tenure<RawMutex> {
    fn drop(&mut self) {
        let state = mem::replace(&mut self.state, TenureState::Done);
        if let TenureState::Done = state {
            return;
        }

        // The remaining stages never run. Dropping them drops their output
        // senders, which wakes up whoever is waiting for them.
        self.running = None;
        let unfinished = {
            let mut stages = self.stages.lock();
            stages.finished = true;
            mem::take(&mut stages.queue)
        };
        drop(unfinished);

        match state {
            TenureState::Queued(mut ticket) => ticket.abandon(self.lock.raw()),
            TenureState::Held => {
                log::debug!("{:?}: tenure ended prematurely", self.lock.id());
                self.lock.release();
            }
            TenureState::Idle | TenureState::Done => {}
        }
    }
}

// Handle
// ----------------------------------------------------------------------------

#[cold]
fn body_dropped() -> ! {
    panic!("the protected body was dropped before it could complete");
}

#[cold]
fn chained_after_completion() -> ! {
    panic!("continuation attached to a completed future");
}

/// The future returned by [`AsyncLock::protect_or_queue_on_recursion`].
///
/// Resolves to the output of the body (or of the last continuation attached by
/// [`Self::then_in_order`]) after it has run with the lock held.
///
/// A deferred body runs on the executor it was spawned on. Dropping this
/// future doesn't cancel it. A body that wasn't deferred runs only while this
/// future is polled, and dropping this future cancels the pending acquisition
/// or releases the lock if the body is already running.
///
/// # Panics
///
/// Polling panics if the body was dropped without completing, e.g., because it
/// panicked or the executor was shut down.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct ProtectOrQueue<RawMutex: RawMutexTrait, T> {
    deferred: bool,
    /// The tenure, unless it's been handed to an executor.
    tenure: Option<Tenure<RawMutex>>,
    stages: SharedStages<RawMutex>,
    /// Continuations attached after the tenure ended.
    late: Option<BoxFuture<'static, ()>>,
    output: oneshot::Receiver<T>,
    terminated: bool,
}

impl<RawMutex: RawMutexTrait, T> ProtectOrQueue<RawMutex, T> {
    /// Get a flag indicating whether the body was deferred because of a
    /// recursive call.
    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }
}

impl<RawMutex, T> ProtectOrQueue<RawMutex, T>
where
    RawMutex: RawMutexTrait,
    T: Send + 'static,
{
    /// Chain a continuation that runs under the same tenure of the lock.
    ///
    /// `f` receives the output of the body (or of the previous continuation)
    /// and runs before the lock is released, so it's finished before the next
    /// holder, including any other deferred body, starts. Continuations
    /// attached with ordinary combinators such as [`FutureExt::then`] run
    /// after the release and offer no such guarantee.
    ///
    /// If the tenure has already ended by the time this is called, `f` runs
    /// without the lock when the returned future is polled.
    ///
    /// # Panics
    ///
    /// Panics if `self` has already completed.
    pub fn then_in_order<G, GFut>(self, f: G) -> ProtectOrQueue<RawMutex, GFut::Output>
    where
        G: FnOnce(T) -> GFut + Send + 'static,
        GFut: Future + Send + 'static,
        GFut::Output: Send + 'static,
    {
        let Self {
            deferred,
            tenure,
            stages,
            late,
            output: previous,
            terminated,
        } = self;
        if terminated {
            chained_after_completion();
        }

        let (sender, output) = oneshot::channel();
        // Stages run one at a time, so `previous` is resolved by the time this
        // one starts
        let stage = async move {
            if let Ok(x) = previous.await {
                let _ = sender.send(f(x).await);
            }
        }
        .boxed();

        let mut queued = stages.lock();
        let late = if queued.finished {
            drop(queued);
            log::trace!("tenure already ended; the continuation runs without the lock");
            Some(match late {
                Some(late) => async move {
                    late.await;
                    stage.await;
                }
                .boxed(),
                None => stage,
            })
        } else {
            queued.queue.push_back(stage);
            drop(queued);
            late
        };

        ProtectOrQueue {
            deferred,
            tenure,
            stages,
            late,
            output,
            terminated: false,
        }
    }
}

impl<RawMutex: RawMutexTrait, T> fmt::Debug for ProtectOrQueue<RawMutex, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProtectOrQueue")
            .field("deferred", &self.deferred)
            .field("inline", &self.tenure.is_some())
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl<RawMutex: RawMutexTrait, T> Future for ProtectOrQueue<RawMutex, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        if this.terminated {
            polled_after_completion();
        }

        if let Some(tenure) = &mut this.tenure {
            ready!(tenure.poll_unpin(cx));
            this.tenure = None;
        }

        if let Some(late) = &mut this.late {
            ready!(late.poll_unpin(cx));
            this.late = None;
        }

        match ready!(this.output.poll_unpin(cx)) {
            Ok(output) => {
                this.terminated = true;
                Poll::Ready(output)
            }
            Err(oneshot::Canceled) => body_dropped(),
        }
    }
}

impl<RawMutex: RawMutexTrait, T> FusedFuture for ProtectOrQueue<RawMutex, T> {
    #[inline]
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
