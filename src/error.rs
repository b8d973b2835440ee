//! Error accumulation.
//!
//! Internally every fallible path works with [`ErrorSet`], a bitset, so that
//! independent failure conditions can accumulate on a chain without losing
//! one another. Chain-level errors are sticky: once recorded they surface
//! through every caller that locks the chain. Only at the public API boundary
//! is the set collapsed into an [`Error`] with conventional POSIX meaning.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Accumulated failure conditions. `IO` is sticky for the lifetime of
    /// the handle that produced it.
    pub struct ErrorSet: u32 {
        /// Device read/write failure.
        const EIO         = 0x0000_0001;
        /// Check-code mismatch against `bref.check`.
        const CHECK       = 0x0000_0002;
        /// Cluster quorum unavailable.
        const INCOMPLETE  = 0x0000_0004;
        /// Recursion limit reached; resolved internally by the flush driver.
        const DEPTH       = 0x0000_0008;
        /// Invariant violation while decoding a blockref.
        const BADBREF     = 0x0000_0010;
        /// Allocation failure.
        const ENOSPC      = 0x0000_0020;
        /// Entry not found.
        const ENOENT      = 0x0000_0040;
        /// Directory not empty.
        const ENOTEMPTY   = 0x0000_0080;
        /// Retry after relocking; transient.
        const EAGAIN      = 0x0000_0100;
        /// Not a directory.
        const ENOTDIR     = 0x0000_0200;
        /// Is a directory.
        const EISDIR      = 0x0000_0400;
        /// Operation already running; transient during bulk drives.
        const EINPROGRESS = 0x0000_0800;
        /// Operation aborted.
        const ABORTED     = 0x0000_1000;
        /// End of iteration.
        const EOF         = 0x0000_2000;
        /// Catch-all.
        const EINVAL      = 0x0000_4000;
        /// Entry exists.
        const EEXIST      = 0x0000_8000;
        /// Lock-order reversal detected.
        const EDEADLK     = 0x0001_0000;
        /// No such thread or object.
        const ESRCH       = 0x0002_0000;
        /// Bounded wait expired.
        const ETIMEDOUT   = 0x0004_0000;
        /// Mount has degraded to read-only.
        const EROFS       = 0x0008_0000;
    }
}

/// Internal result carrying the accumulated bitset.
pub type Result<T> = core::result::Result<T, ErrorSet>;

impl ErrorSet {
    /// True if the set only contains conditions a bulk scan may skip over
    /// (iteration end, transient retry).
    pub fn is_transient(self) -> bool {
        !self.is_empty()
            && (self - (ErrorSet::EAGAIN | ErrorSet::EINPROGRESS | ErrorSet::EOF)).is_empty()
    }

    /// Collapses the set into the most severe user-visible error.
    ///
    /// Severity follows the propagation policy: media damage first, then
    /// consistency, then resource, then flow-control conditions.
    pub fn to_error(self) -> Error {
        if self.intersects(ErrorSet::EIO | ErrorSet::BADBREF) {
            Error::Io
        } else if self.contains(ErrorSet::CHECK) {
            Error::Check
        } else if self.contains(ErrorSet::EROFS) {
            Error::ReadOnly
        } else if self.contains(ErrorSet::INCOMPLETE) {
            Error::Incomplete
        } else if self.contains(ErrorSet::ENOSPC) {
            Error::NoSpace
        } else if self.contains(ErrorSet::ABORTED) {
            Error::Interrupted
        } else if self.contains(ErrorSet::EDEADLK) {
            Error::Deadlock
        } else if self.contains(ErrorSet::ENOTEMPTY) {
            Error::NotEmpty
        } else if self.contains(ErrorSet::ENOTDIR) {
            Error::NotDir
        } else if self.contains(ErrorSet::EISDIR) {
            Error::IsDir
        } else if self.contains(ErrorSet::EEXIST) {
            Error::Exists
        } else if self.contains(ErrorSet::ENOENT) {
            Error::NotFound
        } else if self.contains(ErrorSet::ESRCH) {
            Error::NoObject
        } else if self.contains(ErrorSet::ETIMEDOUT) {
            Error::TimedOut
        } else if self.contains(ErrorSet::EAGAIN) {
            Error::Again
        } else if self.contains(ErrorSet::EINPROGRESS) {
            Error::InProgress
        } else if self.contains(ErrorSet::EOF) {
            Error::Eof
        } else {
            Error::Invalid
        }
    }
}

impl From<ErrorSet> for Error {
    fn from(set: ErrorSet) -> Error {
        set.to_error()
    }
}

/// User-visible error, mapped from the accumulated [`ErrorSet`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("i/o error")]
    Io,
    #[error("check code mismatch")]
    Check,
    #[error("cluster incomplete")]
    Incomplete,
    #[error("no space left on volume")]
    NoSpace,
    #[error("not found")]
    NotFound,
    #[error("directory not empty")]
    NotEmpty,
    #[error("resource temporarily unavailable")]
    Again,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("operation in progress")]
    InProgress,
    #[error("interrupted")]
    Interrupted,
    #[error("end of iteration")]
    Eof,
    #[error("invalid argument")]
    Invalid,
    #[error("exists")]
    Exists,
    #[error("deadlock avoided")]
    Deadlock,
    #[error("no such object")]
    NoObject,
    #[error("timed out")]
    TimedOut,
    #[error("read-only mount")]
    ReadOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_keeps_independent_bits() {
        let mut e = ErrorSet::empty();
        e |= ErrorSet::CHECK;
        e |= ErrorSet::ENOENT;
        assert!(e.contains(ErrorSet::CHECK));
        assert!(e.contains(ErrorSet::ENOENT));
        assert_eq!(e.to_error(), Error::Check);
    }

    #[test]
    fn media_errors_outrank_flow_control() {
        let e = ErrorSet::EAGAIN | ErrorSet::EIO;
        assert_eq!(e.to_error(), Error::Io);
        let e = ErrorSet::BADBREF | ErrorSet::EOF;
        assert_eq!(e.to_error(), Error::Io);
    }

    #[test]
    fn transient_sets() {
        assert!((ErrorSet::EAGAIN | ErrorSet::EOF).is_transient());
        assert!(!(ErrorSet::EAGAIN | ErrorSet::CHECK).is_transient());
        assert!(!ErrorSet::empty().is_transient());
    }
}
