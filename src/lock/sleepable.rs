//! Sleepable locks.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A mutex paired with a wait channel. The guard can atomically release
/// the lock, sleep until another holder calls `wakeup`, and re-acquire.
/// Every sleep is interlocked: the caller re-checks its condition after
/// waking.
pub struct Sleepablelock<T> {
    data: Mutex<T>,
    waiters: Condvar,
}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    guard: Option<MutexGuard<'s, T>>,
}

impl<T> Sleepablelock<T> {
    pub fn new(data: T) -> Sleepablelock<T> {
        Sleepablelock {
            data: Mutex::new(data),
            waiters: Condvar::new(),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        SleepablelockGuard {
            lock: self,
            guard: Some(self.data.lock().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Wakes sleepers without taking the lock. Safe because every sleeper
    /// re-checks its condition under the mutex after waking.
    pub fn wakeup_all(&self) {
        self.waiters.notify_all();
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Releases the lock, sleeps until a wakeup, re-acquires.
    pub fn sleep(&mut self) {
        let guard = self.guard.take().unwrap();
        let guard = self
            .lock
            .waiters
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner());
        self.guard = Some(guard);
    }

    /// Like `sleep` but bounded. Returns true if the wait timed out.
    pub fn sleep_timeout(&mut self, timeout: Duration) -> bool {
        let guard = self.guard.take().unwrap();
        let (guard, result) = self
            .lock
            .waiters
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|e| e.into_inner());
        self.guard = Some(guard);
        result.timed_out()
    }

    pub fn wakeup(&self) {
        self.lock.waiters.notify_all();
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sleep_wakes_on_notify() {
        let lock = Arc::new(Sleepablelock::new(false));
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.lock();
                while !*guard {
                    guard.sleep();
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        *lock.lock() = true;
        lock.wakeup_all();
        waiter.join().unwrap();
    }

    #[test]
    fn sleep_timeout_expires() {
        let lock = Sleepablelock::new(0u32);
        let mut guard = lock.lock();
        assert!(guard.sleep_timeout(Duration::from_millis(10)));
    }
}
