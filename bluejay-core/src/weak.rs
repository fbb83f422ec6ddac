//! The weak reference primitive
//!
//! Nearly every deferred closure in this host captures a [`WeakRef`] to the object that scheduled
//! it. When the closure finally runs on the dispatcher the owner may be long gone, so the closure
//! re-checks liveness through the handle and does nothing when the referent no longer exists.
//!
//! An [`Owner`] is the single owning wrapper around a value. Dropping the `Owner` invalidates
//! every outstanding [`WeakRef`] at once; the invalidation is O(1) because all handles share one
//! control block. Handles are copyable and cheap to compare.
//!
//! Access through a handle is scoped: [`WeakRef::with`] borrows the referent for the duration of
//! a closure and returns `None` when the referent is gone. [`WeakRef::expect`] is for call sites
//! where the referent being gone is a bug, it panics on a dead handle.
//!
//! Everything here is single threaded; the types deliberately do not implement `Send`.

use alloc::rc::{Rc, Weak};
use core::cell::RefCell;

/// The owning side of a weak reference
///
/// `Owner` is the one strong reference to the wrapped value. It cannot be cloned; when it drops,
/// the value drops with it and every [`WeakRef`] created from it becomes dead.
pub struct Owner<T> {
    shared: Rc<RefCell<T>>,
}

impl<T> Owner<T> {
    /// Create a new `Owner` wrapping `value`
    pub fn new(value: T) -> Self {
        Owner {
            shared: Rc::new(RefCell::new(value)),
        }
    }

    /// Create a `WeakRef` to the wrapped value
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef {
            weak: Rc::downgrade(&self.shared),
        }
    }

    /// Borrow the wrapped value for the duration of `f`
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.borrow())
    }

    /// Mutably borrow the wrapped value for the duration of `f`
    ///
    /// # Panic
    /// This panics if the value is already borrowed, which can only happen when `f` is invoked
    /// from within another scoped access to the same value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.shared.borrow_mut())
    }
}

impl<T> core::fmt::Debug for Owner<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Owner({:p})", Rc::as_ptr(&self.shared))
    }
}

/// A handle to a value owned elsewhere
///
/// See the [module](self) documentation.
pub struct WeakRef<T> {
    weak: Weak<RefCell<T>>,
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        WeakRef {
            weak: self.weak.clone(),
        }
    }
}

impl<T> WeakRef<T> {
    /// Create a `WeakRef` that was never alive
    ///
    /// This is a placeholder for fields initialized before their referent exists.
    pub fn new_dead() -> Self {
        WeakRef { weak: Weak::new() }
    }

    /// Check if the referent still exists
    pub fn is_alive(&self) -> bool {
        self.weak.strong_count() != 0
    }

    /// Borrow the referent for the duration of `f`
    ///
    /// Returns `None` without invoking `f` when the referent no longer exists.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.weak.upgrade().map(|shared| f(&shared.borrow()))
    }

    /// Mutably borrow the referent for the duration of `f`
    ///
    /// Returns `None` without invoking `f` when the referent no longer exists.
    ///
    /// # Panic
    /// This panics if the value is already borrowed (re-entrant access through the same or
    /// another handle).
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.weak.upgrade().map(|shared| f(&mut shared.borrow_mut()))
    }

    /// Mutably borrow the referent, panicking when it no longer exists
    ///
    /// # Panic
    /// Dereferencing a dead handle through `expect` is a programming error and aborts.
    pub fn expect<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let shared = self
            .weak
            .upgrade()
            .expect("dereferenced a weak handle whose owner was destroyed");

        let result = f(&mut shared.borrow_mut());

        result
    }

    /// Check if two handles refer to the same owner
    pub fn ptr_eq(&self, other: &WeakRef<T>) -> bool {
        self.weak.ptr_eq(&other.weak)
    }
}

impl<T> core::fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "WeakRef({})",
            if self.is_alive() { "alive" } else { "dead" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_goes_dead_with_owner() {
        let owner = Owner::new(7usize);
        let handle = owner.downgrade();
        let copy = handle.clone();

        assert!(handle.is_alive());
        assert_eq!(Some(7), handle.with(|v| *v));

        drop(owner);

        assert!(!handle.is_alive());
        assert!(!copy.is_alive());
        assert_eq!(None, handle.with(|v| *v));
        assert_eq!(None, copy.with_mut(|v| *v));
    }

    #[test]
    fn handle_captured_by_closure_no_ops_after_drop() {
        let owner = Owner::new(0usize);
        let handle = owner.downgrade();

        let deferred = move || handle.with_mut(|v| *v += 1);

        drop(owner);

        assert_eq!(None, deferred());
    }

    #[test]
    #[should_panic]
    fn expect_on_dead_handle_panics() {
        let owner = Owner::new(());
        let handle = owner.downgrade();

        drop(owner);

        handle.expect(|_| ());
    }

    #[test]
    fn never_alive_placeholder() {
        assert!(!WeakRef::<u32>::new_dead().is_alive());
    }
}
