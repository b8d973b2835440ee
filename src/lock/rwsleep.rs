//! The long-term chain lock.

use core::cell::UnsafeCell;
use core::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

struct LockState {
    shared: u32,
    excl: bool,
}

/// Shared/exclusive lock that sleeps instead of busy waiting, with
/// try-acquire and opportunistic upgrade.
///
/// Acquisition is reader-preferring: a pending exclusive request does not
/// block new shared requests. This is what makes the explicit LOCKAGAIN
/// pattern (re-acquiring a shared lock the same thread already holds)
/// safe from deadlock; the cost is that writers rely on readers draining.
pub struct RwSleep<T> {
    state: Mutex<LockState>,
    waiters: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by the shared/exclusive protocol
// below, exactly as in a standard reader-writer lock.
unsafe impl<T: Send> Send for RwSleep<T> {}
unsafe impl<T: Send + Sync> Sync for RwSleep<T> {}

pub struct RwSleepReadGuard<'s, T> {
    lock: &'s RwSleep<T>,
}

pub struct RwSleepWriteGuard<'s, T> {
    lock: &'s RwSleep<T>,
}

impl<T> RwSleep<T> {
    pub fn new(data: T) -> RwSleep<T> {
        RwSleep {
            state: Mutex::new(LockState {
                shared: 0,
                excl: false,
            }),
            waiters: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires a shared lock, sleeping while an exclusive holder exists.
    pub fn read(&self) -> RwSleepReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.excl {
            state = self
                .waiters
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.shared += 1;
        RwSleepReadGuard { lock: self }
    }

    /// Acquires the exclusive lock, sleeping while any holder exists.
    pub fn write(&self) -> RwSleepWriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.excl || state.shared > 0 {
            state = self
                .waiters
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.excl = true;
        RwSleepWriteGuard { lock: self }
    }

    /// Non-blocking shared acquire.
    pub fn try_read(&self) -> Option<RwSleepReadGuard<'_, T>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.excl {
            return None;
        }
        state.shared += 1;
        Some(RwSleepReadGuard { lock: self })
    }

    /// Non-blocking exclusive acquire.
    pub fn try_write(&self) -> Option<RwSleepWriteGuard<'_, T>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.excl || state.shared > 0 {
            return None;
        }
        state.excl = true;
        Some(RwSleepWriteGuard { lock: self })
    }

    /// Returns a mutable reference without locking. Usable only before the
    /// lock is shared.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` proves exclusive access.
        unsafe { &mut *self.data.get() }
    }
}

impl<'s, T> RwSleepReadGuard<'s, T> {
    /// Opportunistic upgrade. Succeeds only when this is the sole holder;
    /// on failure the shared lock is handed back and the caller must
    /// release, re-lock exclusively, and re-check its invariants.
    pub fn try_upgrade(self) -> Result<RwSleepWriteGuard<'s, T>, RwSleepReadGuard<'s, T>> {
        let lock = self.lock;
        {
            let mut state = lock.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.shared == 1 && !state.excl {
                state.shared = 0;
                state.excl = true;
            } else {
                drop(state);
                return Err(self);
            }
        }
        core::mem::forget(self);
        Ok(RwSleepWriteGuard { lock })
    }
}

impl<'s, T> RwSleepWriteGuard<'s, T> {
    /// Downgrades to shared without a release window.
    pub fn downgrade(self) -> RwSleepReadGuard<'s, T> {
        let lock = self.lock;
        {
            let mut state = lock.state.lock().unwrap_or_else(|e| e.into_inner());
            state.excl = false;
            state.shared = 1;
        }
        lock.waiters.notify_all();
        core::mem::forget(self);
        RwSleepReadGuard { lock }
    }
}

impl<T> Deref for RwSleepReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared holders exclude the exclusive holder.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for RwSleepWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the exclusive holder excludes everyone else.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwSleepWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive holder excludes everyone else.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwSleepReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shared -= 1;
        let none_left = state.shared == 0;
        drop(state);
        if none_left {
            self.lock.waiters.notify_all();
        }
    }
}

impl<T> Drop for RwSleepWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap_or_else(|e| e.into_inner());
        state.excl = false;
        drop(state);
        self.lock.waiters.notify_all();
    }
}

impl<T: fmt::Debug> fmt::Debug for RwSleepReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Debug> fmt::Debug for RwSleepWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_excludes_exclusive() {
        let lock = RwSleep::new(0u32);
        let r1 = lock.read();
        let r2 = lock.read();
        assert!(lock.try_write().is_none());
        drop(r1);
        assert!(lock.try_write().is_none());
        drop(r2);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn upgrade_succeeds_alone_fails_shared() {
        let lock = RwSleep::new(0u32);
        let r = lock.read();
        let mut w = r.try_upgrade().expect("sole holder upgrades");
        *w = 7;
        drop(w);

        let r1 = lock.read();
        let _r2 = lock.read();
        let r1 = match r1.try_upgrade() {
            Ok(_) => panic!("upgrade with a second holder must fail"),
            Err(guard) => guard,
        };
        assert_eq!(*r1, 7);
    }

    #[test]
    fn downgrade_keeps_hold() {
        let lock = RwSleep::new(1u32);
        let w = lock.write();
        let r = w.downgrade();
        assert!(lock.try_read().is_some());
        assert!(lock.try_write().is_none());
        assert_eq!(*r, 1);
    }

    #[test]
    fn contended_writer_eventually_acquires() {
        let lock = Arc::new(RwSleep::new(0u32));
        let r = lock.read();
        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                *lock.write() = 9;
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(r);
        writer.join().unwrap();
        assert_eq!(*lock.read(), 9);
    }
}
