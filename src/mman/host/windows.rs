//! The real host adapter, backed by section objects, views, and the
//! reserve/commit address-space split exposed through `VirtualAlloc`.
//! Grounded on the file-mapping and `VirtualAlloc` paths used by
//! mmap-rs's and vm-memory's Windows backends; this module talks to the
//! same Win32 entry points they do, generalized to the section-recycling
//! and reserve/commit semantics the engine needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualAllocEx, VirtualFree, VirtualFreeEx, VirtualLock, VirtualProtect,
    VirtualProtectEx, VirtualQuery, VirtualUnlock, CreateFileMappingW, FlushViewOfFile,
    MapViewOfFileEx, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS, FILE_MAP_EXECUTE,
    FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_DECOMMIT, MEM_FREE,
    MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};

use crate::errno::Errno;
use crate::mman::record::HostHandle;
use crate::mman::{MapFlags, ProtFlags};

use super::{HostAdapter, HostProtect, RegionInfo, RegionState, RemoteProcess};

fn win_protect(prot: HostProtect) -> PAGE_PROTECTION_FLAGS {
    match prot {
        HostProtect::NoAccess => PAGE_NOACCESS,
        HostProtect::ReadOnly => PAGE_READONLY,
        HostProtect::ReadWrite => PAGE_READWRITE,
        HostProtect::WriteCopy => PAGE_WRITECOPY,
        HostProtect::ExecuteRead => PAGE_EXECUTE_READ,
        HostProtect::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        HostProtect::ExecuteWriteCopy => PAGE_EXECUTE_WRITECOPY,
    }
}

fn protect_to_posix(flags: PAGE_PROTECTION_FLAGS) -> ProtFlags {
    match flags {
        PAGE_NOACCESS => ProtFlags::empty(),
        PAGE_READONLY => ProtFlags::PROT_READ,
        PAGE_READWRITE | PAGE_WRITECOPY => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        PAGE_EXECUTE_READ => ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
        }
        _ => ProtFlags::empty(),
    }
}

fn file_map_access(prot: ProtFlags, flags: MapFlags) -> u32 {
    let mut access = FILE_MAP_READ.0;
    if prot.contains(ProtFlags::PROT_WRITE) {
        access |= if flags.contains(MapFlags::MAP_PRIVATE) {
            FILE_MAP_WRITE.0 | 0x00000001 /* FILE_MAP_COPY */
        } else {
            FILE_MAP_WRITE.0
        };
    }
    if prot.contains(ProtFlags::PROT_EXEC) {
        access |= FILE_MAP_EXECUTE.0;
    }
    access
}

/// Low end of the legacy backend's high-half region (`spec.md` §4.1 rule 3):
/// `ProtectRange`/`ProtectRemote` silently succeed for addresses in
/// `[HIGH_HALF_LOW, HIGH_HALF_HIGH)` rather than touching the host, a quirk
/// of the pre-NT6 host this crate stands in for.
const HIGH_HALF_LOW: usize = 0x8000_0000;
const HIGH_HALF_HIGH: usize = 0xC000_0000;

/// One of the two selectable backends (`spec.md` §4.1, §9), chosen once at
/// construction from [`crate::mman::collab::HostCaps::is_modern`] and never
/// branched on again per call. The modern backend assumes working
/// `VirtualProtectEx`/`VirtualQueryEx`-family calls across process
/// boundaries and a sane allocation granularity. The legacy backend adds
/// two quirks: shared sections are opened by a name derived from the
/// backing file's identity before being created, and protection calls in
/// the high-half region silently succeed without reaching the host.
pub struct WindowsHost {
    legacy: bool,
    next_id: AtomicUsize,
    sections: Mutex<HashMap<usize, HANDLE>>,
}

impl Default for WindowsHost {
    fn default() -> Self {
        WindowsHost::new(false)
    }
}

impl WindowsHost {
    pub fn new(legacy: bool) -> Self {
        WindowsHost {
            legacy,
            next_id: AtomicUsize::new(0),
            sections: Mutex::new(HashMap::new()),
        }
    }

    /// The legacy backend names shared sections by the backing file's
    /// content hash rather than its (unavailable, at this layer) path, since
    /// only the hash is threaded down through [`HostAdapter::create_mapping`].
    fn legacy_section_name(hash: u64) -> Vec<u16> {
        format!("pmmap-shared-{hash:016x}")
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect()
    }

    fn in_legacy_high_half(&self, addr: usize) -> bool {
        self.legacy && addr >= HIGH_HALF_LOW && addr < HIGH_HALF_HIGH
    }
}

unsafe impl Send for WindowsHost {}
unsafe impl Sync for WindowsHost {}

impl HostAdapter for WindowsHost {
    fn create_mapping(
        &self,
        fd_handle: Option<usize>,
        len: u64,
        _offset: u64,
        prot: ProtFlags,
        flags: MapFlags,
        name_hash: Option<u64>,
        creating_private_file_section: bool,
    ) -> Result<HostHandle, Errno> {
        let file_handle = fd_handle
            .map(|h| HANDLE(h as isize))
            .unwrap_or(HANDLE(0));
        let host_prot = win_protect(super::posix_to_host_protect(
            prot,
            flags,
            creating_private_file_section,
            true,
        ));
        let hi = (len >> 32) as u32;
        let lo = (len & 0xffff_ffff) as u32;

        let legacy_name = if self.legacy && flags.contains(MapFlags::MAP_SHARED) {
            name_hash.map(Self::legacy_section_name)
        } else {
            None
        };

        if let Some(wide_name) = &legacy_name {
            let name = PCWSTR(wide_name.as_ptr());
            if let Ok(existing) = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, BOOL(0), name) }
            {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                self.sections.lock().insert(id, existing);
                return Ok(HostHandle::Section(id));
            }
        }

        let name_arg = legacy_name.as_ref().map(|w| PCWSTR(w.as_ptr()));
        let mapping = unsafe { CreateFileMappingW(file_handle, None, host_prot, hi, lo, name_arg) }
            .map_err(|_| Errno::ENOMEM)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sections.lock().insert(id, mapping);
        Ok(HostHandle::Section(id))
    }

    fn close_mapping(&self, handle: HostHandle) -> Result<(), Errno> {
        if let HostHandle::Section(id) = handle {
            if let Some(mapping) = self.sections.lock().remove(&id) {
                unsafe { CloseHandle(mapping) };
            }
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
        let mapping = match handle {
            HostHandle::Section(id) => *self.sections.lock().get(&id).ok_or(Errno::EINVAL)?,
            HostHandle::Reserved => return Err(Errno::EINVAL),
        };
        let access = file_map_access(prot, flags);
        let hi = (offset >> 32) as u32;
        let lo = (offset & 0xffff_ffff) as u32;

        let base = unsafe {
            MapViewOfFileEx(
                mapping,
                windows::Win32::System::Memory::FILE_MAP_ACCESS_RIGHTS(access),
                hi,
                lo,
                len,
                preferred_addr.map(|a| a as *const std::ffi::c_void),
            )
        };

        if base.Value.is_null() {
            if preferred_addr.is_some() && !flags.contains(MapFlags::MAP_FIXED) {
                let base = unsafe {
                    MapViewOfFileEx(
                        mapping,
                        windows::Win32::System::Memory::FILE_MAP_ACCESS_RIGHTS(access),
                        hi,
                        lo,
                        len,
                        None,
                    )
                };
                if base.Value.is_null() {
                    return Err(Errno::ENOMEM);
                }
                return Ok(base.Value as usize);
            }
            return Err(Errno::ENOMEM);
        }
        Ok(base.Value as usize)
    }

    fn unmap_view(&self, base: usize, _len: usize) -> Result<(), Errno> {
        let ok = unsafe { UnmapViewOfFile(windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS { Value: base as *mut std::ffi::c_void }) };
        ok.map_err(|_| Errno::ENOMEM)
    }

    fn protect_range(&self, addr: usize, len: usize, new_prot: HostProtect) -> Result<(), Errno> {
        if self.in_legacy_high_half(addr) {
            return Ok(());
        }
        let mut old = PAGE_PROTECTION_FLAGS::default();
        let ok = unsafe {
            VirtualProtect(addr as *const std::ffi::c_void, len, win_protect(new_prot), &mut old)
        };
        ok.map_err(|_| Errno::EACCES)
    }

    fn protect_remote(
        &self,
        process: RemoteProcess,
        addr: usize,
        len: usize,
        new_prot: HostProtect,
    ) -> Result<(), Errno> {
        if self.in_legacy_high_half(addr) {
            return Ok(());
        }
        let mut old = PAGE_PROTECTION_FLAGS::default();
        let ok = unsafe {
            VirtualProtectEx(
                HANDLE(process.0 as isize),
                addr as *const std::ffi::c_void,
                len,
                win_protect(new_prot),
                &mut old,
            )
        };
        ok.map_err(|_| Errno::EACCES)
    }

    fn reserve_anon(&self, preferred_addr: Option<usize>, len: usize) -> Result<usize, Errno> {
        let base = unsafe {
            VirtualAlloc(
                preferred_addr.map(|a| a as *const std::ffi::c_void),
                len,
                MEM_RESERVE,
                PAGE_NOACCESS,
            )
        };
        if base.is_null() {
            return Err(Errno::ENOMEM);
        }
        Ok(base as usize)
    }

    fn commit_anon(&self, addr: usize, len: usize, prot: HostProtect) -> Result<(), Errno> {
        let base = unsafe {
            VirtualAlloc(Some(addr as *const std::ffi::c_void), len, MEM_COMMIT, win_protect(prot))
        };
        if base.is_null() {
            return Err(Errno::ENOMEM);
        }
        Ok(())
    }

    fn decommit_anon(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ok = unsafe { VirtualFree(addr as *mut std::ffi::c_void, len, MEM_DECOMMIT) };
        ok.map_err(|_| Errno::ENOMEM)
    }

    fn release_anon(&self, addr: usize, _len: usize) -> Result<(), Errno> {
        let ok = unsafe { VirtualFree(addr as *mut std::ffi::c_void, 0, MEM_RELEASE) };
        ok.map_err(|_| Errno::ENOMEM)
    }

    fn lock(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ok = unsafe { VirtualLock(addr as *const std::ffi::c_void, len) };
        ok.map_err(|_| Errno::EAGAIN)
    }

    fn unlock(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ok = unsafe { VirtualUnlock(addr as *const std::ffi::c_void, len) };
        ok.map_err(|_| Errno::ENOMEM)
    }

    fn query_region(&self, addr: usize) -> Result<RegionInfo, Errno> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(addr as *const std::ffi::c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(Errno::ENOMEM);
        }
        let state = if info.State == MEM_FREE {
            RegionState::Free
        } else if info.State == MEM_RESERVE {
            RegionState::Reserved
        } else {
            RegionState::Committed
        };
        Ok(RegionInfo {
            base: info.BaseAddress as usize,
            len: info.RegionSize,
            state,
            protect: protect_to_posix(info.Protect),
        })
    }

    fn read_remote(&self, process: RemoteProcess, addr: usize, buf: &mut [u8]) -> Result<(), Errno> {
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                HANDLE(process.0 as isize),
                addr as *const std::ffi::c_void,
                buf.as_mut_ptr() as *mut std::ffi::c_void,
                buf.len(),
                Some(&mut read),
            )
        };
        ok.map_err(|_| Errno::EACCES)?;
        if read != buf.len() {
            return Err(Errno::EACCES);
        }
        Ok(())
    }

    fn flush_view(&self, addr: usize, len: usize) -> Result<(), Errno> {
        let ok = unsafe { FlushViewOfFile(addr as *const std::ffi::c_void, len) };
        ok.map_err(|_| Errno::ENOMEM)
    }
}

// Silences "unused" for the remote alloc/free entry points: exercised only
// by embedders that map into a child before it runs, which this crate's own
// test suite does not (it uses `SimHost` for that instead).
#[allow(dead_code)]
fn _reserve_remote(process: RemoteProcess, len: usize) -> windows::core::Result<*mut std::ffi::c_void> {
    unsafe {
        Ok(VirtualAllocEx(
            HANDLE(process.0 as isize),
            None,
            len,
            MEM_RESERVE,
            PAGE_NOACCESS,
        ))
    }
}

#[allow(dead_code)]
fn _release_remote(process: RemoteProcess, addr: usize) -> windows::core::Result<()> {
    unsafe { VirtualFreeEx(HANDLE(process.0 as isize), addr as *mut std::ffi::c_void, 0, MEM_RELEASE) }
}
