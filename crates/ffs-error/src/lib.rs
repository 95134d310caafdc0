#![forbid(unsafe_code)]
//! Error types for the block-group allocator.
//!
//! # Error Taxonomy
//!
//! Two layers, mirroring where a failure is detected:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | Persisted item violates its encoding |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Everything callers of the allocator see |
//!
//! `ffs-error` does not depend on `ffs-types`; the allocator converts a
//! `ParseError` into `FfsError::Corruption` at the point where it knows which
//! region the bad item belongs to.
//!
//! ## Propagation classes
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Transient | `Busy`, `SwapActive`, `NoSpace` | Retry on another group, or allocate a chunk |
//! | Fail-closed | `CachingFailed` | The group's free space is treated as unusable |
//! | Fatal | `Corruption`, `AccountingUnderflow`, `TransactionAborted` | Abort the transaction; filesystem goes read-only |
//! | Logic | `NotFound`, `Exists`, `InvalidTransition` | Caller bug or stale handle |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`FfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EUCLEAN` |
//! | `CachingFailed` | `EIO` |
//! | `AccountingUnderflow` | `EUCLEAN` |
//! | `Format` / `Parse` | `EINVAL` |
//! | `InvalidConfig` | `EINVAL` |
//! | `InvalidTransition` | `EINVAL` |
//! | `Busy` | `EAGAIN` |
//! | `SwapActive` | `ETXTBSY` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `Cancelled` | `EINTR` |
//! | `ReadOnly` | `EROFS` |
//! | `TransactionAborted` | `EROFS` |

use thiserror::Error;

/// Unified error type for all allocator operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted block-group metadata disagrees with the chunk map, or an
    /// item failed to decode. `start` identifies the offending region.
    #[error("corrupt block group metadata at {start}: {detail}")]
    Corruption { start: u64, detail: String },

    /// Population of a group's free-space index failed; the group is in
    /// the ERROR caching state.
    #[error("free space caching failed for block group {start}: {detail}")]
    CachingFailed { start: u64, detail: String },

    /// An aggregate or per-group counter would have gone negative.
    #[error("accounting underflow on {counter}: {current} - {delta}")]
    AccountingUnderflow {
        counter: &'static str,
        current: u64,
        delta: u64,
    },

    /// Invalid persisted format outside of a specific region.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced with its diagnostic text.
    #[error("parse error: {0}")]
    Parse(String),

    /// Allocator configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A lifecycle or caching state machine refused a transition.
    #[error("invalid state transition for block group {start}: {from} -> {to}")]
    InvalidTransition {
        start: u64,
        from: &'static str,
        to: &'static str,
    },

    /// Transient: the group changed under the caller (went read-only,
    /// range already taken, size class mismatch). Try another group.
    #[error("block group busy: {0}")]
    Busy(String),

    /// The group backs an active swap file and cannot go read-only.
    #[error("block group {0} has active swap extents")]
    SwapActive(u64),

    /// Not enough unreserved capacity.
    #[error("no space left on device")]
    NoSpace,

    /// No block group covers the address, or a persisted item is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registry insertion or persisted item.
    #[error("already exists: {0}")]
    Exists(String),

    /// The filesystem is closing; background work stopped early.
    #[error("operation cancelled")]
    Cancelled,

    /// The filesystem has been forced read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The enclosing transaction was aborted.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::AccountingUnderflow { .. } => libc::EUCLEAN,
            Self::CachingFailed { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidConfig(_)
            | Self::InvalidTransition { .. } => libc::EINVAL,
            Self::Busy(_) => libc::EAGAIN,
            Self::SwapActive(_) => libc::ETXTBSY,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::Cancelled => libc::EINTR,
            Self::ReadOnly | Self::TransactionAborted(_) => libc::EROFS,
        }
    }

    /// Conditions a caller recovers from locally by trying another group
    /// or allocating a new chunk.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::SwapActive(_) | Self::NoSpace)
    }

    /// Conditions that must abort the enclosing transaction.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. } | Self::AccountingUnderflow { .. } | Self::TransactionAborted(_)
        )
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FfsError::Corruption {
                    start: 0,
                    detail: "test".into(),
                },
                libc::EUCLEAN,
            ),
            (
                FfsError::CachingFailed {
                    start: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (
                FfsError::AccountingUnderflow {
                    counter: "bytes_used",
                    current: 1,
                    delta: 2,
                },
                libc::EUCLEAN,
            ),
            (FfsError::Format("test".into()), libc::EINVAL),
            (FfsError::Parse("test".into()), libc::EINVAL),
            (FfsError::InvalidConfig("test".into()), libc::EINVAL),
            (
                FfsError::InvalidTransition {
                    start: 0,
                    from: "active",
                    to: "removed",
                },
                libc::EINVAL,
            ),
            (FfsError::Busy("test".into()), libc::EAGAIN),
            (FfsError::SwapActive(0), libc::ETXTBSY),
            (FfsError::NoSpace, libc::ENOSPC),
            (FfsError::NotFound("test".into()), libc::ENOENT),
            (FfsError::Exists("test".into()), libc::EEXIST),
            (FfsError::Cancelled, libc::EINTR),
            (FfsError::ReadOnly, libc::EROFS),
            (FfsError::TransactionAborted("test".into()), libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = FfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FfsError::Corruption {
            start: 1_048_576,
            detail: "chunk length mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt block group metadata at 1048576: chunk length mismatch"
        );

        let under = FfsError::AccountingUnderflow {
            counter: "bytes_reserved",
            current: 4096,
            delta: 8192,
        };
        assert_eq!(under.to_string(), "accounting underflow on bytes_reserved: 4096 - 8192");

        assert_eq!(FfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            FfsError::SwapActive(42).to_string(),
            "block group 42 has active swap extents"
        );
    }

    #[test]
    fn propagation_classes_are_disjoint() {
        let transient = [
            FfsError::Busy("ro".into()),
            FfsError::SwapActive(1),
            FfsError::NoSpace,
        ];
        for err in &transient {
            assert!(err.is_transient(), "{err:?}");
            assert!(!err.is_fatal(), "{err:?}");
        }

        let fatal = [
            FfsError::Corruption {
                start: 0,
                detail: String::new(),
            },
            FfsError::AccountingUnderflow {
                counter: "pinned",
                current: 0,
                delta: 1,
            },
            FfsError::TransactionAborted("write failed".into()),
        ];
        for err in &fatal {
            assert!(err.is_fatal(), "{err:?}");
            assert!(!err.is_transient(), "{err:?}");
        }

        let caching = FfsError::CachingFailed {
            start: 0,
            detail: String::new(),
        };
        assert!(!caching.is_fatal());
        assert!(!caching.is_transient());
    }
}
