//! Unit-of-work locking.
//!
//! The embedded store allows one writer at a time, so every unit of work on
//! an embedded case holds a process-wide reader/writer lock for its whole
//! duration: read units shared, transactions exclusive. The lock is fair, so
//! a waiting writer is not starved by a stream of readers. Server cases run
//! unlocked.
//!
//! Locks are not re-entrant. A thread that already holds a unit of work on a
//! case and asks for another one gets [`Error::InvalidState`] instead of
//! deadlocking on itself.

use crate::error::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::RefCell;
use std::collections::HashSet;

/// Process-local lock guarding one case.
#[derive(Debug)]
pub struct StoreLock {
    inner: Option<RwLock<()>>,
}

impl StoreLock {
    /// Lock for an embedded case.
    pub const fn embedded() -> Self {
        Self {
            inner: Some(RwLock::new(())),
        }
    }

    /// No-op lock for a server case.
    pub const fn unlocked() -> Self {
        Self { inner: None }
    }

    /// Takes the lock for a read unit.
    pub fn shared(&self) -> UnitGuard<'_> {
        match &self.inner {
            Some(lock) => UnitGuard::Shared(Some(lock.read())),
            None => UnitGuard::Unlocked,
        }
    }

    /// Takes the lock for a transaction.
    pub fn exclusive(&self) -> UnitGuard<'_> {
        match &self.inner {
            Some(lock) => UnitGuard::Exclusive(Some(lock.write())),
            None => UnitGuard::Unlocked,
        }
    }

    /// Returns true when a unit of work currently holds the lock exclusively.
    pub fn is_write_locked(&self) -> bool {
        self.inner.as_ref().is_some_and(RwLock::is_locked_exclusive)
    }
}

/// Held lock for the lifetime of a unit of work.
///
/// Released fairly on drop, handing the lock straight to the next waiter.
#[derive(Debug)]
pub enum UnitGuard<'a> {
    /// Shared hold by a read unit.
    Shared(Option<RwLockReadGuard<'a, ()>>),
    /// Exclusive hold by a transaction.
    Exclusive(Option<RwLockWriteGuard<'a, ()>>),
    /// Server backend; nothing held.
    Unlocked,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        match self {
            Self::Shared(guard) => {
                if let Some(guard) = guard.take() {
                    RwLockReadGuard::unlock_fair(guard);
                }
            }
            Self::Exclusive(guard) => {
                if let Some(guard) = guard.take() {
                    RwLockWriteGuard::unlock_fair(guard);
                }
            }
            Self::Unlocked => {}
        }
    }
}

thread_local! {
    static ACTIVE_UNITS: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// Marks a case as having an active unit of work on this thread.
#[derive(Debug)]
pub struct UnitMarker {
    case: u64,
}

impl UnitMarker {
    /// Registers a unit of work on `case`, rejecting a nested one.
    pub fn enter(case: u64) -> Result<Self> {
        let inserted = ACTIVE_UNITS.with(|units| units.borrow_mut().insert(case));
        if inserted {
            Ok(Self { case })
        } else {
            Err(Error::InvalidState {
                message: "a unit of work is already open on this case in the current thread"
                    .to_string(),
            })
        }
    }
}

impl Drop for UnitMarker {
    fn drop(&mut self) {
        ACTIVE_UNITS.with(|units| {
            units.borrow_mut().remove(&self.case);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let lock = StoreLock::embedded();
        let _a = lock.shared();
        let _b = lock.shared();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(StoreLock::embedded());
        let writer = lock.exclusive();
        assert!(lock.is_write_locked());

        let entered = Arc::new(AtomicBool::new(false));
        let reader = {
            let lock = Arc::clone(&lock);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let _guard = lock.shared();
                entered.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(writer);
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unlocked_never_blocks() {
        let lock = StoreLock::unlocked();
        let _a = lock.exclusive();
        let _b = lock.exclusive();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_nested_unit_rejected() {
        let first = UnitMarker::enter(7).unwrap();
        let err = UnitMarker::enter(7).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        // Other cases are independent.
        let _other = UnitMarker::enter(8).unwrap();
        drop(first);
        assert!(UnitMarker::enter(7).is_ok());
    }
}
