use super::*;
use quickcheck_macros::quickcheck;

use std::{collections::HashSet, vec::Vec};

type Id = u32;

// Reference Implementation
// --------------------------------------------------------------------------

mod refr {
    use super::Id;
    use std::collections::{HashSet, VecDeque};

    /// A lock that tracks the holder's identity explicitly.
    #[derive(Default)]
    pub struct NotSoMutexCore {
        pub holder: Option<Id>,
        pub queue: VecDeque<Id>,
        pub abandoned: HashSet<Id>,
    }

    impl NotSoMutexCore {
        /// Returns whether the lock was taken immediately.
        pub fn lock(&mut self, id: Id) -> bool {
            if self.holder.is_none() {
                self.holder = Some(id);
                true
            } else {
                self.queue.push_back(id);
                false
            }
        }

        /// Returns the new holder.
        pub fn unlock(&mut self) -> Option<Id> {
            assert!(self.holder.is_some());
            self.holder = None;
            while let Some(id) = self.queue.pop_front() {
                if !self.abandoned.contains(&id) {
                    self.holder = Some(id);
                    break;
                }
            }
            self.holder
        }
    }
}

// Callbacks
// --------------------------------------------------------------------------

struct LockCallbackImpl(Id);

impl LockCallback<Id> for LockCallbackImpl {
    type Output = bool;

    fn in_progress(self) -> (Self::Output, Id) {
        (false, self.0)
    }

    fn complete(self) -> Self::Output {
        true
    }
}

struct UnlockCallbackImpl<'a> {
    abandoned: &'a HashSet<Id>,
    granted: &'a mut Vec<Id>,
}

impl UnlockCallback<Id> for UnlockCallbackImpl<'_> {
    fn complete(&mut self, in_progress: Id) -> bool {
        if self.abandoned.contains(&in_progress) {
            false
        } else {
            self.granted.push(in_progress);
            true
        }
    }
}

// Tests
// --------------------------------------------------------------------------

#[test]
fn fresh_lock_is_granted_immediately() {
    let mut core = QueueMutexCore::<Id>::new();
    assert_eq!(core.status, LockStatus::Free);
    assert!(core.lock(LockCallbackImpl(0)));
    assert_eq!(core.status, LockStatus::Held);
    assert_eq!(core.waiter_count(), 0);
}

#[test]
fn unbalanced_unlock() {
    let mut core = QueueMutexCore::<()>::new();
    assert_eq!(core.unlock(()), Err(ReleaseError::NotHeld));

    core.lock(());
    assert_eq!(core.unlock(()), Ok(()));
    assert_eq!(core.unlock(()), Err(ReleaseError::NotHeld));
    assert!(!core.is_locked());
}

#[test]
fn try_lock_never_enqueues() {
    let mut core = QueueMutexCore::<()>::new();
    assert_eq!(core.try_lock(), Ok(()));
    assert_eq!(core.try_lock(), Err(TryLockError::WouldBlock));
    assert_eq!(core.waiter_count(), 0);
    core.unlock(()).unwrap();
    assert_eq!(core.try_lock(), Ok(()));
}

#[test]
fn hands_over_without_freeing() {
    let mut core = QueueMutexCore::<Id>::new();
    let abandoned = HashSet::new();
    let mut granted = Vec::new();

    assert!(core.lock(LockCallbackImpl(0)));
    assert!(!core.lock(LockCallbackImpl(1)));
    assert!(!core.lock(LockCallbackImpl(2)));
    assert_eq!(core.waiter_count(), 2);

    core.unlock(UnlockCallbackImpl {
        abandoned: &abandoned,
        granted: &mut granted,
    })
    .unwrap();
    assert_eq!(granted, [1]);
    assert!(core.is_locked());

    // A newcomer can't overtake the waiter that's still queued
    assert_eq!(core.try_lock(), Err(TryLockError::WouldBlock));

    core.unlock(UnlockCallbackImpl {
        abandoned: &abandoned,
        granted: &mut granted,
    })
    .unwrap();
    core.unlock(UnlockCallbackImpl {
        abandoned: &abandoned,
        granted: &mut granted,
    })
    .unwrap();
    assert_eq!(granted, [1, 2]);
    assert!(!core.is_locked());
}

#[test]
fn skips_abandoned_waiters() {
    let mut core = QueueMutexCore::<Id>::new();
    let mut abandoned = HashSet::new();
    let mut granted = Vec::new();

    core.lock(LockCallbackImpl(0));
    for id in 1..=4 {
        core.lock(LockCallbackImpl(id));
    }
    abandoned.insert(1);
    abandoned.insert(2);
    abandoned.insert(4);

    core.unlock(UnlockCallbackImpl {
        abandoned: &abandoned,
        granted: &mut granted,
    })
    .unwrap();
    assert_eq!(granted, [3]);
    assert_eq!(core.waiter_count(), 1);

    // The only remaining waiter is gone, so the lock becomes free
    core.unlock(UnlockCallbackImpl {
        abandoned: &abandoned,
        granted: &mut granted,
    })
    .unwrap();
    assert_eq!(granted, [3]);
    assert_eq!(core.status, LockStatus::Free);
    assert_eq!(core.waiter_count(), 0);
}

/// Compare `QueueMutexCore` against the reference implementation by running a
/// random sequence of operations on both.
///
/// Each byte of `cmds` encodes one of: lock, unlock, or abandon the n-th
/// pending waiter.
#[quickcheck]
fn qc_matches_reference(cmds: Vec<u8>) {
    let mut subject = QueueMutexCore::<Id>::new();
    let mut reference = refr::NotSoMutexCore::default();
    let mut holder = None;
    let mut next_id: Id = 0;
    let mut last_grant = None;

    for cmd in cmds {
        match cmd % 3 {
            0 => {
                let id = next_id;
                next_id += 1;
                log::trace!("lock {}", id);

                let immediate = subject.lock(LockCallbackImpl(id));
                assert_eq!(immediate, reference.lock(id));
                if immediate {
                    assert_eq!(holder, None, "granted while held");
                    holder = Some(id);
                    last_grant = Some(id);
                }
            }
            1 => {
                if holder.is_none() {
                    assert_eq!(
                        subject.unlock(UnlockCallbackImpl {
                            abandoned: &reference.abandoned,
                            granted: &mut Vec::new(),
                        }),
                        Err(ReleaseError::NotHeld)
                    );
                    continue;
                }
                log::trace!("unlock {:?}", holder);

                let mut granted = Vec::new();
                subject
                    .unlock(UnlockCallbackImpl {
                        abandoned: &reference.abandoned,
                        granted: &mut granted,
                    })
                    .unwrap();
                assert!(granted.len() <= 1, "granted to more than one waiter");

                holder = granted.first().copied();
                assert_eq!(holder, reference.unlock());

                // FIFO: waiter IDs are assigned in arrival order
                if let Some(id) = holder {
                    assert!(last_grant < Some(id), "waiter overtaken");
                    last_grant = Some(id);
                }
            }
            _ => {
                let pending: Vec<Id> = reference
                    .queue
                    .iter()
                    .copied()
                    .filter(|id| !reference.abandoned.contains(id))
                    .collect();
                if !pending.is_empty() {
                    let id = pending[(cmd as usize / 3) % pending.len()];
                    log::trace!("abandon {}", id);
                    reference.abandoned.insert(id);
                }
            }
        }

        assert_eq!(subject.is_locked(), reference.holder.is_some());
        assert_eq!(subject.waiter_count(), reference.queue.len());
    }
}
