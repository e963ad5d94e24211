//! Raw synchronization primitives.
//!
//!  - [`AsyncRawLock`] provides the bare acquire/release interface, similar
//!    to `lock_api::RawMutex` but `Future`-based. Acquisition never blocks a
//!    thread: a contended caller receives a pending [`Acquire`] future and is
//!    woken up when the lock is handed over to it.
//!
//! # Notes
//!
//!  - The lock is not reentrant. Acquiring it again from the code that holds
//!    it waits forever. See [`AsyncLock::protect_or_queue_on_recursion`] for
//!    a way to detect and defer such calls.
//!
//!  - Releasing a lock that is not held is a programmer error and panics.
//!    The lock can't tell apart the holder from other callers, so a release by
//!    a non-holder while the lock is held goes undetected.
//!
pub mod future;

pub use self::future::{Acquire, AsyncRawLock, LockFuture, LockGuard};
pub(crate) use self::future::Ticket;
