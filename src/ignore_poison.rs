//! Extension trait to ignore mutex poisoning.
//!
//! Every `Mutex` in this crate stores a simple value where poison is irrelevant
//! (a lock held during a panic elsewhere never leaves these structures in an
//! inconsistent state a caller could observe). This trait replaces the
//! `.lock().unwrap_or_else(|e| e.into_inner())` boilerplate, matching the
//! teacher's repo-wide idiom, with a readable `.lock_ignore_poison()` call.

use std::sync::{Mutex, MutexGuard};

pub trait IgnorePoison<T> {
    /// Locks the mutex, ignoring poison. Use this for simple value stores where
    /// a panic in another thread doesn't invalidate the data.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}
