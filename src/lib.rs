//! POSIX `mmap`/`munmap`/`msync`/`mprotect`/`mlock`/`munlock` compatibility
//! over a host that exposes sections, views, and reserve/commit address
//! space instead of native POSIX mappings.
//!
//! [`mman`] is the whole public surface; everything else is bookkeeping
//! reached only through it. An embedding runtime supplies a file-descriptor
//! table ([`mman::FdTable`]), a host-capability oracle ([`mman::HostCaps`]),
//! and a host adapter ([`mman::HostAdapter`]) at [`mman::init`].

pub mod errno;
pub mod mman;
pub mod page;

pub use errno::Errno;
pub use mman::{MapFlags, MsFlags, ProtFlags};

/// Crate-wide result alias, used throughout for terseness.
pub type Result<T> = std::result::Result<T, Errno>;
