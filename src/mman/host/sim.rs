//! A pure-userspace stand-in for a section/view host, used by this crate's
//! own test suite (and available to embedders without a Windows host) so
//! the invariants in `spec.md` §8 can be exercised end to end without a
//! live Windows target. It implements the exact same [`HostAdapter`]
//! contract as the real backend; nothing in the engine knows the
//! difference.
//!
//! Simplifications versus a real Windows host, all confined to this file:
//! - There is only one address space, so `protect_remote`/`read_remote`
//!   operate directly on this process's memory rather than a child's.
//! - Copy-on-write is collapsed into plain read-write: `HostProtect::WriteCopy`
//!   is mapped to `PROT_READ | PROT_WRITE`, since faithfully reproducing
//!   host copy-on-write needs a real section object this simulation doesn't
//!   have.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::errno::Errno;
use crate::mman::record::HostHandle;
use crate::mman::{MapFlags, ProtFlags};

use super::{HostAdapter, HostProtect, RegionInfo, RegionState, RemoteProcess};

struct SectionMeta {
    fd: Option<RawFd>,
    len: u64,
}

#[derive(Clone, Copy)]
struct LiveRegion {
    base: usize,
    len: usize,
    committed: bool,
    protect: ProtFlags,
}

#[derive(Default)]
pub struct SimHost {
    next_handle: AtomicUsize,
    sections: Mutex<HashMap<usize, SectionMeta>>,
    regions: Mutex<Vec<LiveRegion>>,
}

impl SimHost {
    pub fn new() -> Self {
        SimHost::default()
    }

    fn record_region(&self, base: usize, len: usize, committed: bool, protect: ProtFlags) {
        let mut regions = self.regions.lock();
        regions.retain(|r| r.base + r.len <= base || r.base >= base + len);
        regions.push(LiveRegion {
            base,
            len,
            committed,
            protect,
        });
    }

    fn forget_region(&self, base: usize, len: usize) {
        let mut regions = self.regions.lock();
        regions.retain(|r| r.base + r.len <= base || r.base >= base + len);
    }

    fn host_prot_bits(prot: HostProtect) -> libc::c_int {
        match prot {
            HostProtect::NoAccess => libc::PROT_NONE,
            HostProtect::ReadOnly => libc::PROT_READ,
            HostProtect::ReadWrite | HostProtect::WriteCopy => libc::PROT_READ | libc::PROT_WRITE,
            HostProtect::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
            HostProtect::ExecuteReadWrite | HostProtect::ExecuteWriteCopy => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
        }
    }

    fn posix_prot_flags(prot: HostProtect) -> ProtFlags {
        let mut f = ProtFlags::empty();
        let bits = Self::host_prot_bits(prot);
        if bits & libc::PROT_READ != 0 {
            f |= ProtFlags::PROT_READ;
        }
        if bits & libc::PROT_WRITE != 0 {
            f |= ProtFlags::PROT_WRITE;
        }
        if bits & libc::PROT_EXEC != 0 {
            f |= ProtFlags::PROT_EXEC;
        }
        f
    }
}

impl HostAdapter for SimHost {
    fn create_mapping(
        &self,
        fd_handle: Option<usize>,
        len: u64,
        _offset: u64,
        _prot: ProtFlags,
        _flags: MapFlags,
        _name_hash: Option<u64>,
        _creating_private_file_section: bool,
    ) -> Result<HostHandle, Errno> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.sections.lock().insert(
            id,
            SectionMeta {
                fd: fd_handle.map(|h| h as RawFd),
                len,
            },
        );
        Ok(HostHandle::Section(id))
    }

    fn close_mapping(&self, handle: HostHandle) -> Result<(), Errno> {
        if let HostHandle::Section(id) = handle {
            self.sections.lock().remove(&id);
        }
        Ok(())
    }

    fn map_view(
        &self,
        handle: HostHandle,
        preferred_addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> Result<usize, Errno> {
        let fd = match handle {
            HostHandle::Section(id) => self
                .sections
                .lock()
                .get(&id)
                .and_then(|s| s.fd)
                .unwrap_or(-1),
            HostHandle::Reserved => -1,
        };

        let mut native_flags = libc::MAP_SHARED;
        if fd < 0 {
            native_flags |= libc::MAP_ANONYMOUS;
        }
        if preferred_addr.is_some() && flags.contains(MapFlags::MAP_FIXED) {
            native_flags |= libc::MAP_FIXED;
        }

        let mut native_prot = 0;
        if prot.contains(ProtFlags::PROT_READ) {
            native_prot |= libc::PROT_READ;
        }
        if prot.contains(ProtFlags::PROT_WRITE) {
            native_prot |= libc::PROT_WRITE;
        }
        if prot.contains(ProtFlags::PROT_EXEC) {
            native_prot |= libc::PROT_EXEC;
        }

        let hint = preferred_addr.unwrap_or(0) as *mut libc::c_void;
        let mut ret = unsafe {
            libc::mmap(
                hint,
                len,
                native_prot,
                native_flags,
                fd,
                offset as libc::off_t,
            )
        };

        if ret == libc::MAP_FAILED && preferred_addr.is_some() && !flags.contains(MapFlags::MAP_FIXED) {
            ret = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    native_prot,
                    native_flags,
                    fd,
                    offset as libc::off_t,
                )
            };
        }

        if ret == libc::MAP_FAILED {
            return Err(Errno::ENOMEM);
        }
        let base = ret as usize;
        self.record_region(base, len, true, prot);
        Ok(base)
    }

    fn unmap_view(&self, base: usize, len: usize) -> Result<(), Errno> {
        let ret = unsafe { libc::munmap(base as *mut libc::c_void, len) };
        self.forget_region(base, len);
        Errno::result(ret, Errno::ENOMEM).map(drop)
    }

    fn protect_range(&self, addr: usize, len: usize, new_prot: HostProtect) -> Result<(), Errno> {
        let bits = Self::host_prot_bits(new_prot);
        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, bits) };
        self.record_region(addr, len, true, Self::posix_prot_flags(new_prot));
        Errno::result(ret, Errno::EACCES).map(drop)
    }

    fn protect_remote(
        &self,
        _process: RemoteProcess,
        addr: usize,
        len: usize,
        new_prot: HostProtect,
    ) -> Result<(), Errno> {
        self.protect_range(addr, len, new_prot)
    }

    fn reserve_anon(&self, preferred_addr: Option<usize>, len: usize) -> Result<usize, Errno> {
        let hint = preferred_addr.unwrap_or(0) as *mut libc::c_void;
        let mut native_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        if preferred_addr.is_some() {
            native_flags |= libc::MAP_FIXED;
        }
        let ret = unsafe {
            libc::mmap(hint, len, libc::PROT_NONE, native_flags, -1, 0)
        };
        if ret == libc::MAP_FAILED {
            return Err(Errno::ENOMEM);
        }
        let base = ret as usize;
        self.record_region(base, len, false, ProtFlags::PROT_NONE);
        Ok(base)
    }

    fn commit_anon(&self, addr: usize, len: usize, prot: HostProtect) -> Result<(), Errno> {
        let bits = Self::host_prot_bits(prot);
        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, bits) };
        self.record_region(addr, len, true, Self::posix_prot_flags(prot));
        Errno::result(ret, Errno::ENOMEM).map(drop)
    }

    fn decommit_anon(&self, addr: usize, len: usize) -> Result<(), Errno> {
        unsafe {
            libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE);
            libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
        }
        self.record_region(addr, len, false, ProtFlags::PROT_NONE);
        Ok(())
    }

    fn release_anon(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        self.forget_region(addr, len);
        Errno::result(ret, Errno::ENOMEM).map(drop)
    }

    fn lock(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ret = unsafe { libc::mlock(addr as *const libc::c_void, len) };
        Errno::result(ret, Errno::EAGAIN).map(drop)
    }

    fn unlock(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ret = unsafe { libc::munlock(addr as *const libc::c_void, len) };
        Errno::result(ret, Errno::ENOMEM).map(drop)
    }

    fn query_region(&self, addr: usize) -> Result<RegionInfo, Errno> {
        let regions = self.regions.lock();
        for r in regions.iter() {
            if addr >= r.base && addr < r.base + r.len {
                return Ok(RegionInfo {
                    base: r.base,
                    len: r.len,
                    state: if r.committed {
                        RegionState::Committed
                    } else {
                        RegionState::Reserved
                    },
                    protect: r.protect,
                });
            }
        }
        Ok(RegionInfo {
            base: addr,
            len: crate::page::PAGE_SIZE,
            state: RegionState::Free,
            protect: ProtFlags::empty(),
        })
    }

    fn read_remote(&self, _process: RemoteProcess, addr: usize, buf: &mut [u8]) -> Result<(), Errno> {
        // Single address space: "remote" reads are local reads.
        let src = unsafe { std::slice::from_raw_parts(addr as *const u8, buf.len()) };
        buf.copy_from_slice(src);
        Ok(())
    }

    fn flush_view(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ret = unsafe {
            libc::msync(addr as *mut libc::c_void, len, libc::MS_SYNC)
        };
        Errno::result(ret, Errno::ENOMEM).map(drop)
    }
}
