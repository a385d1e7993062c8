//! POSIX `mmap`/`munmap`/`msync`/`mprotect`/`mlock`/`munlock` compatibility
//! layer over a host that only understands sections, views, and
//! reserve/commit address space.
//!
//! The public functions here are the entire surface an embedder calls;
//! everything else in this module tree is internal bookkeeping reached only
//! through [`Registry`](registry::Registry).

pub mod backend;
pub mod collab;
pub mod engine;
pub mod fork;
pub mod host;
pub mod list;
pub mod record;
pub mod registry;

use bitflags::bitflags;

use crate::errno::Errno;

bitflags! {
    /// `PROT_*` from `<sys/mman.h>`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtFlags: libc::c_int {
        const PROT_NONE = libc::PROT_NONE;
        const PROT_READ = libc::PROT_READ;
        const PROT_WRITE = libc::PROT_WRITE;
        const PROT_EXEC = libc::PROT_EXEC;
    }
}

bitflags! {
    /// `MAP_*` from `<sys/mman.h>`. Only the subset this crate arbitrates is
    /// exposed; flags with no host-side equivalent (e.g. `MAP_32BIT`) are
    /// deliberately absent rather than silently ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: libc::c_int {
        const MAP_SHARED = libc::MAP_SHARED;
        const MAP_PRIVATE = libc::MAP_PRIVATE;
        const MAP_FIXED = libc::MAP_FIXED;
        const MAP_ANONYMOUS = libc::MAP_ANONYMOUS;
        const MAP_NORESERVE = libc::MAP_NORESERVE;
        /// Accept writes beyond the file's current end-of-file, growing the
        /// backing object as needed. Not a libc constant: this host's
        /// section-based backing objects need an explicit opt-in to grow a
        /// file underneath a mapping, so the bit is this crate's own.
        const MAP_AUTOGROW = 0x1000_0000;
    }
}

bitflags! {
    /// `MS_*` from `<sys/mman.h>`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsFlags: libc::c_int {
        const MS_ASYNC = libc::MS_ASYNC;
        const MS_SYNC = libc::MS_SYNC;
        const MS_INVALIDATE = libc::MS_INVALIDATE;
    }
}

pub use collab::{FdAccess, FdTable, HostCaps};
pub use host::{default_host, host_for_caps, HostAdapter};
pub use registry::Registry;

/// Installs the process-wide registry. Must be called exactly once before
/// any of the functions below; calling it twice without an intervening
/// [`teardown`] returns `Err(Errno::EINVAL)`.
pub fn init(
    fd_table: std::sync::Arc<dyn FdTable>,
    host_caps: std::sync::Arc<dyn HostCaps>,
    host: std::sync::Arc<dyn HostAdapter>,
) -> Result<(), Errno> {
    registry::install(fd_table, host_caps, host)
}

/// Tears down the process-wide registry. Intended for test isolation and for
/// embedders that reinitialize after a configuration change; ordinary
/// processes never call this.
pub fn teardown() {
    registry::uninstall()
}

pub fn mmap(
    addr: Option<usize>,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
    fd: i32,
    offset: u64,
) -> Result<usize, Errno> {
    engine::mmap(addr, len, prot, flags, fd, offset)
}

pub fn munmap(addr: usize, len: usize) -> Result<(), Errno> {
    engine::munmap(addr, len)
}

pub fn mprotect(addr: usize, len: usize, prot: ProtFlags) -> Result<(), Errno> {
    engine::mprotect(addr, len, prot)
}

pub fn msync(addr: usize, len: usize, flags: MsFlags) -> Result<(), Errno> {
    engine::msync(addr, len, flags)
}

pub fn mlock(addr: usize, len: usize) -> Result<(), Errno> {
    engine::mlock(addr, len)
}

pub fn munlock(addr: usize, len: usize) -> Result<(), Errno> {
    engine::munlock(addr, len)
}

/// Reconstructs this process's mappings in a just-forked child, per
/// `spec.md` §4.7. Called once, in the child, before it runs any other code
/// that might touch mapped memory. `parent` is the just-forked-from
/// process, used to recopy private-mapping contents.
pub fn fixup_after_fork(parent: host::RemoteProcess) -> Result<(), Errno> {
    fork::fixup_after_fork(parent)
}
