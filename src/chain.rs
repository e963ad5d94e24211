//! Call-chain-scoped recursion tracking.
//!
//! A [`Chain`] represents one logical call chain: a sequence of nested calls
//! that may span any number of suspension points and resume on any thread.
//! It records which locks the chain is currently inside of, so that
//! [`AsyncLock::protect_or_queue_on_recursion`] can tell a genuine recursion
//! (which would deadlock a non-reentrant lock) from ordinary contention.
//!
//! The chain is an explicit value rather than thread-local state. It's handed
//! down to every body run by [`AsyncLock::protect_or_queue_on_recursion`], and
//! a body that wants nested calls to be recognized as recursion must pass it
//! along.
//!
//! [`AsyncLock::protect_or_queue_on_recursion`]: crate::hl::lock::AsyncLock::protect_or_queue_on_recursion
use alloc::vec::Vec;
use core::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::utils::scope::Restore;

/// Identifies a lock instance for the duration of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(NonZeroUsize);

impl LockId {
    /// Allocate a never-before-used identity.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Self::allocate(&NEXT)
    }

    /// Take the next identity from `counter`. The counter saturates instead of
    /// wrapping around, so an identity is never handed out twice.
    fn allocate(counter: &AtomicUsize) -> Self {
        let id = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1));
        match id.ok().and_then(NonZeroUsize::new) {
            Some(id) => Self(id),
            None => lock_ids_exhausted(),
        }
    }
}

#[cold]
fn lock_ids_exhausted() -> ! {
    panic!("ran out of lock identities");
}

/// The set of locks a logical call chain is currently inside of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    /// Innermost last. A lock may appear more than once if a body re-enters
    /// after a suppressed recursion check.
    active: Vec<LockId>,
}

impl Chain {
    /// Construct an empty `Chain`, representing the start of a logical call
    /// chain.
    #[inline]
    pub const fn new() -> Self {
        Self { active: Vec::new() }
    }

    /// Get a flag indicating whether this chain is inside a recursion-aware
    /// protected section of the lock `id`.
    #[inline]
    pub fn is_active(&self, id: LockId) -> bool {
        self.active.contains(&id)
    }

    /// Get a flag indicating whether this chain is inside no protected
    /// sections at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Mark `id` as active for the duration of `f`.
    ///
    /// The membership is reverted when `f` returns or unwinds.
    pub fn with_pushed<R>(&mut self, id: LockId, f: impl FnOnce(&mut Self) -> R) -> R {
        let mut scope = Restore::new(self);
        scope.active.push(id);
        f(&mut *scope)
    }

    /// Hide `id` from [`Self::is_active`] for the duration of `f`.
    ///
    /// The membership is reverted when `f` returns or unwinds. This is a no-op
    /// wrapper around `f` if `id` isn't active.
    pub fn with_suppressed<R>(&mut self, id: LockId, f: impl FnOnce(&mut Self) -> R) -> R {
        if !self.is_active(id) {
            return f(self);
        }
        let mut scope = Restore::new(self);
        scope.active.retain(|&active| active != id);
        f(&mut *scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn ids_are_unique() {
        let ids: Vec<_> = (0..64).map(|_| LockId::next()).collect();
        for (i, x) in ids.iter().enumerate() {
            for y in &ids[i + 1..] {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    fn exhausted_ids_are_never_reused() {
        let counter = AtomicUsize::new(usize::MAX - 1);
        assert_eq!(
            LockId::allocate(&counter),
            LockId(NonZeroUsize::new(usize::MAX - 1).unwrap())
        );

        for _ in 0..2 {
            let result = panic::catch_unwind(|| LockId::allocate(&counter));
            assert!(result.is_err());
            assert_eq!(counter.load(Ordering::Relaxed), usize::MAX);
        }
    }

    #[test]
    fn push_is_scoped() {
        let (a, b) = (LockId::next(), LockId::next());
        let mut chain = Chain::new();
        assert!(chain.is_empty());

        chain.with_pushed(a, |chain| {
            assert!(chain.is_active(a));
            assert!(!chain.is_active(b));

            chain.with_pushed(b, |chain| {
                assert!(chain.is_active(a));
                assert!(chain.is_active(b));
            });

            assert!(chain.is_active(a));
            assert!(!chain.is_active(b));
        });

        assert!(chain.is_empty());
    }

    #[test]
    fn push_is_reverted_on_unwind() {
        let a = LockId::next();
        let mut chain = Chain::new();

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            chain.with_pushed(a, |_| panic!("body failed"));
        }));

        assert!(result.is_err());
        assert!(!chain.is_active(a));
    }

    #[test]
    fn suppression_round_trips() {
        let (a, b) = (LockId::next(), LockId::next());
        let mut chain = Chain::new();

        chain.with_pushed(a, |chain| {
            chain.with_pushed(b, |chain| {
                let before = chain.clone();

                chain.with_suppressed(a, |chain| {
                    assert!(!chain.is_active(a));
                    assert!(chain.is_active(b));

                    // Re-entering while suppressed is tracked as usual
                    chain.with_pushed(a, |chain| assert!(chain.is_active(a)));
                    assert!(!chain.is_active(a));
                });

                assert_eq!(*chain, before);
            });
        });
    }

    #[test]
    fn suppression_is_reverted_on_unwind() {
        let a = LockId::next();
        let mut chain = Chain::new();

        chain.with_pushed(a, |chain| {
            let before = chain.clone();
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                chain.with_suppressed(a, |_| panic!("body failed"));
            }));
            assert!(result.is_err());
            assert_eq!(*chain, before);
        });
    }

    #[test]
    fn suppressing_an_inactive_lock_is_a_no_op() {
        let (a, b) = (LockId::next(), LockId::next());
        let mut chain = Chain::new();

        chain.with_pushed(b, |chain| {
            let before = chain.clone();
            let ret = chain.with_suppressed(a, |chain| {
                assert_eq!(*chain, before);
                42
            });
            assert_eq!(ret, 42);
        });
    }
}
