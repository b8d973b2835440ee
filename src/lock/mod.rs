//! Lock types.
//!
//! Three disciplines, by wait behavior:
//! * [`Spinlock`] busy-waits and must never be held across an operation
//!   that may sleep. Protects the DIO table and each chain's children tree.
//! * [`Sleepablelock`] is a mutex whose guard can block on an interlocked
//!   condition (`sleep`) and be woken (`wakeup`). Used by transaction
//!   admission, DIO in-progress waits, and the sync thread's idle path.
//! * [`RwSleep`] is the long-term chain lock: shared/exclusive with
//!   try-acquire and opportunistic upgrade.

mod rwsleep;
mod sleepable;

pub use rwsleep::{RwSleep, RwSleepReadGuard, RwSleepWriteGuard};
pub use sleepable::{Sleepablelock, SleepablelockGuard};

/// Mutual exclusion lock that busy waits (spins).
pub type Spinlock<T> = spin::Mutex<T>;
