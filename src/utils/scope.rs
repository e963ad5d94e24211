//! Dynamically-scoped mutation
use core::ops;

/// Snapshots `*target` on creation and writes the snapshot back on drop.
///
/// The restoration happens on every exit path, including unwinding, so a
/// value mutated through the guard is back to its original state as soon as
/// the guard goes out of scope.
pub struct Restore<'a, T> {
    target: &'a mut T,
    saved: Option<T>,
}

impl<'a, T: Clone> Restore<'a, T> {
    #[inline]
    pub fn new(target: &'a mut T) -> Self {
        Self {
            saved: Some(target.clone()),
            target,
        }
    }
}

impl<T> ops::Deref for Restore<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.target
    }
}

impl<T> ops::DerefMut for Restore<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.target
    }
}

impl<T> Drop for Restore<'_, T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.target = saved;
        }
    }
}
