//! POSIX-flavored error codes returned by the mapping engine.
//!
//! The engine never touches a process-wide `errno` variable: every public
//! operation returns `Result<T, Errno>` the way the rest of this crate does.
//! Callers that need classic mmap/munmap integer-return-plus-errno semantics
//! wrap these results at the syscall-marshaling layer, which is outside this
//! crate's scope.

use std::io;

use thiserror::Error;

/// The subset of POSIX error numbers this crate can produce, plus the
/// host-backend failures it must translate into one of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Errno {
    /// Argument invalid: bad alignment, bad flag combination, zero length,
    /// `MAP_FIXED` address unobtainable, `msync` range spans a hole.
    #[error("Invalid argument")]
    EINVAL,
    /// Bookkeeping allocation failed, or a host-backend call failed for a
    /// reason with no closer POSIX analogue.
    #[error("Out of memory")]
    ENOMEM,
    /// `offset` lies beyond end-of-file and `MAP_AUTOGROW` was not given.
    #[error("No such device or address")]
    ENXIO,
    /// The requested backend has no mapping support (e.g. an unsupported
    /// special file).
    #[error("No such device")]
    ENODEV,
    /// The descriptor is not open, or not opened with the access the
    /// operation requires.
    #[error("Bad file descriptor")]
    EBADF,
    /// Permission denied by the host (e.g. protection change rejected).
    #[error("Permission denied")]
    EACCES,
    /// Resource temporarily unavailable; used by `mlock`'s retry loop when
    /// the host's working-set quota is exhausted and growth fails.
    #[error("Resource temporarily unavailable")]
    EAGAIN,
    /// An errno this crate does not otherwise model.
    #[error("Unknown error")]
    UnknownErrno,
}

impl Errno {
    /// Returns `Ok(value)` unless `value` is the sentinel failure value,
    /// in which case `err` describes the failure.
    #[inline]
    pub fn result<S: ErrnoSentinel + PartialEq<S>>(
        value: S,
        err: Errno,
    ) -> Result<S, Errno> {
        if value == S::sentinel() {
            Err(err)
        } else {
            Ok(value)
        }
    }
}

/// The sentinel value a host call returns on failure.
pub trait ErrnoSentinel: Sized {
    fn sentinel() -> Self;
}

impl ErrnoSentinel for isize {
    fn sentinel() -> Self {
        -1
    }
}

impl ErrnoSentinel for i32 {
    fn sentinel() -> Self {
        -1
    }
}

impl ErrnoSentinel for usize {
    fn sentinel() -> Self {
        usize::MAX
    }
}

impl From<Errno> for io::Error {
    fn from(err: Errno) -> Self {
        let raw = match err {
            Errno::EINVAL => libc::EINVAL,
            Errno::ENOMEM => libc::ENOMEM,
            Errno::ENXIO => libc::ENXIO,
            Errno::ENODEV => libc::ENODEV,
            Errno::EBADF => libc::EBADF,
            Errno::EACCES => libc::EACCES,
            Errno::EAGAIN => libc::EAGAIN,
            Errno::UnknownErrno => 0,
        };
        io::Error::from_raw_os_error(raw)
    }
}
