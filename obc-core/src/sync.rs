//! Mutex that remembers which task holds it.
//!
//! The holder record is what lets FDIR find and restart the owner of a
//! wedged lock. Dropping the guard (including by dropping the holder's whole
//! future on restart) releases the lock and clears the record.

use core::cell::Cell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, with_timeout};
use portable_atomic::AtomicU32;

use crate::ids::TaskId;

/// Raw mutex used for every shared structure in the core.
pub type ObcMutex = CriticalSectionRawMutex;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Not acquired in time; carries whoever held it at that moment.
    Timeout { holder: Option<TaskId> },
    WouldBlock { holder: Option<TaskId> },
    /// Recovery was attempted while the guard is still alive.
    StillHeld { holder: Option<TaskId> },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout { holder } => write!(f, "lock timed out, held by {holder:?}"),
            LockError::WouldBlock { holder } => write!(f, "lock busy, held by {holder:?}"),
            LockError::StillHeld { holder } => write!(f, "lock still held by {holder:?}"),
        }
    }
}

pub struct TrackedMutex<T> {
    inner: Mutex<ObcMutex, T>,
    holder: blocking_mutex::Mutex<ObcMutex, Cell<Option<TaskId>>>,
    recoveries: AtomicU32,
}

impl<T> TrackedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            holder: blocking_mutex::Mutex::new(Cell::new(None)),
            recoveries: AtomicU32::new(0),
        }
    }

    fn set_holder(&self, task: Option<TaskId>) {
        self.holder.lock(|h| h.set(task));
    }

    pub fn holder(&self) -> Option<TaskId> {
        self.holder.lock(|h| h.get())
    }

    fn guard<'a>(
        &'a self,
        guard: MutexGuard<'a, ObcMutex, T>,
        task: TaskId,
    ) -> TrackedGuard<'a, T> {
        self.set_holder(Some(task));
        TrackedGuard { guard, lock: self, task }
    }

    /// Wait without bound. Only for tasks whose policy tolerates it; FDIR
    /// always uses [`TrackedMutex::lock_timeout`].
    pub async fn lock(&self, task: TaskId) -> TrackedGuard<'_, T> {
        let guard = self.inner.lock().await;
        self.guard(guard, task)
    }

    pub async fn lock_timeout(
        &self,
        task: TaskId,
        timeout: Duration,
    ) -> Result<TrackedGuard<'_, T>, LockError> {
        match with_timeout(timeout, self.inner.lock()).await {
            Ok(guard) => Ok(self.guard(guard, task)),
            Err(_) => Err(LockError::Timeout { holder: self.holder() }),
        }
    }

    pub fn try_lock(&self, task: TaskId) -> Result<TrackedGuard<'_, T>, LockError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(self.guard(guard, task)),
            Err(_) => Err(LockError::WouldBlock { holder: self.holder() }),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Confirm a lock is free again after its holder was restarted and drop
    /// any stale holder record.
    pub fn recover(&self) -> Result<(), LockError> {
        match self.inner.try_lock() {
            Ok(_) => {
                self.set_holder(None);
                self.recoveries.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(LockError::StillHeld { holder: self.holder() }),
        }
    }

    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::Relaxed)
    }
}

pub struct TrackedGuard<'a, T> {
    guard: MutexGuard<'a, ObcMutex, T>,
    lock: &'a TrackedMutex<T>,
    task: TaskId,
}

impl<'a, T> TrackedGuard<'a, T> {
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The mutex this guard belongs to, for an explicit later reacquire.
    pub fn mutex(&self) -> &'a TrackedMutex<T> {
        self.lock
    }
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.set_holder(None);
    }
}

impl<T> Deref for TrackedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TrackedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn holder_is_tracked_and_cleared() {
        let lock = TrackedMutex::new(0u32);
        {
            let mut guard = lock.try_lock(TaskId::Eps).unwrap();
            *guard += 1;
            assert_eq!(lock.holder(), Some(TaskId::Eps));
            let busy = LockError::WouldBlock { holder: Some(TaskId::Eps) };
            assert_eq!(lock.try_lock(TaskId::Coms).err(), Some(busy));
        }
        assert_eq!(lock.holder(), None);
        assert!(!lock.is_locked());
    }

    #[test]
    fn timeout_names_the_holder() {
        let lock = TrackedMutex::new(());
        let _held = lock.try_lock(TaskId::Payload).unwrap();
        let res = block_on(lock.lock_timeout(TaskId::Fdir, Duration::from_millis(5)));
        assert_eq!(res.err(), Some(LockError::Timeout { holder: Some(TaskId::Payload) }));
    }

    #[test]
    fn recovery_needs_the_guard_gone() {
        let lock = TrackedMutex::new(());
        let held = lock.try_lock(TaskId::Memory).unwrap();
        assert_eq!(lock.recover(), Err(LockError::StillHeld { holder: Some(TaskId::Memory) }));
        drop(held);
        assert_eq!(lock.recover(), Ok(()));
        assert_eq!(lock.recoveries(), 1);
    }
}
