//! stratafs: a copy-on-write, clustered block-graph storage engine.
//!
//! The engine is layered leaf-first:
//! * Device I/O cache ([`dio`]): refcounted, frame-aligned buffer handles.
//! * Volume headers ([`volume`], [`ondisk`]): four rotating copies with
//!   independent CRCs; recovery adopts the highest `mirror_tid`.
//! * Chains ([`chain`]): the in-memory topology of blockrefs with
//!   locking, copy-on-write modification, and flush flags.
//! * Freemap ([`freemap`]): hierarchical 2-bit allocator with two-phase
//!   free and reserved-zone rotation for its own blocks.
//! * Transactions and flush ([`trans`], [`flush`]): admission classes,
//!   bottom-up settling, and header rotation.
//! * Cluster and sync ([`cluster`], [`sync`]): replica quorum and the
//!   per-slot convergence thread.
//!
//! Mutators open a transaction, reach a chain via lookup, COW it against
//! a fresh freemap allocation, and mark it dirty; a flush walks the dirty
//! subtree bottom-up, settles check codes, emits blocks, and rotates a
//! new volume header. Live data is never overwritten.

#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub mod chain;
pub mod check;
pub mod cluster;
pub mod device;
pub mod dio;
pub mod error;
pub mod flush;
pub mod freemap;
pub mod lock;
pub mod mount;
pub mod ondisk;
pub mod param;
pub mod sync;
pub mod trans;
pub mod volume;

pub use chain::{Chain, ChainFlags, CreateArgs, DeleteFlags, LookupFlags, ModifyFlags};
pub use cluster::{Cluster, ClusterSlot, ClusterStatus, SlotRole};
pub use device::{Device, FileDevice, MemDevice};
pub use error::{Error, ErrorSet};
pub use mount::{Dev, MountOptions, Pfs};
pub use sync::SyncThread;
pub use trans::{TransGuard, TransKind};
