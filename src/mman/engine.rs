//! Argument validation, registry lookup/insert, and page-range arithmetic
//! for the six public operations (`spec.md` §4.3-4.8).

use crate::errno::Errno;
use crate::mman::backend;
use crate::mman::host::{posix_to_host_protect, HostAdapter, HostProtect, RegionState};
use crate::mman::list::ListKey;
use crate::mman::record::{BackingKind, FdIdentity, MmapRecord};
use crate::mman::registry;
use crate::mman::{MapFlags, MsFlags, ProtFlags};
use crate::page::{is_aligned, page_count, round_up, ALLOC_GRANULARITY, PAGE_SIZE};

fn recommit_or_protect(
    host: &dyn HostAdapter,
    private_anon_noreserve: bool,
    base: usize,
    len: usize,
    host_prot: HostProtect,
) -> Result<(), Errno> {
    if private_anon_noreserve {
        host.commit_anon(base, len, host_prot)
    } else {
        host.protect_range(base, len, host_prot)
    }
}

pub fn mmap(
    addr: Option<usize>,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
    fd: i32,
    offset: u64,
) -> Result<usize, Errno> {
    if offset % PAGE_SIZE as u64 != 0 {
        return Err(Errno::EINVAL);
    }
    if ProtFlags::from_bits(prot.bits()).is_none() {
        return Err(Errno::EINVAL);
    }
    let shared = flags.contains(MapFlags::MAP_SHARED);
    let private = flags.contains(MapFlags::MAP_PRIVATE);
    if shared == private {
        return Err(Errno::EINVAL);
    }
    if len == 0 {
        return Err(Errno::EINVAL);
    }

    registry::with_registry(|reg| {
        if let Some(a) = addr {
            if flags.contains(MapFlags::MAP_FIXED) {
                let granularity = if reg.host_caps.has_alloc_granularity_bug() {
                    PAGE_SIZE
                } else {
                    ALLOC_GRANULARITY
                };
                if !is_aligned(a, granularity) {
                    return Err(Errno::EINVAL);
                }
            }
        }

        let anonymous = flags.contains(MapFlags::MAP_ANONYMOUS)
            || fd < 0
            || (reg.fd_table.is_open(fd) && reg.fd_table.device(fd) == Some(BackingKind::Zero));

        let mut local_flags = flags;
        let (device, len, offset, fd_identity) = if anonymous {
            (
                BackingKind::Zero,
                round_up(len, PAGE_SIZE),
                0u64,
                FdIdentity::Anonymous,
            )
        } else {
            if !reg.fd_table.is_open(fd) {
                return Err(Errno::EBADF);
            }
            let device = reg.fd_table.device(fd).ok_or(Errno::ENODEV)?;
            let size = reg.fd_table.file_size(fd).unwrap_or(0);
            let autogrow = local_flags.contains(MapFlags::MAP_AUTOGROW);
            if offset >= size && !autogrow {
                return Err(Errno::ENXIO);
            }
            let mut clamped_len = len;
            if !autogrow {
                clamped_len = clamped_len.min((size - offset) as usize);
            } else if offset + len as u64 <= size {
                local_flags.remove(MapFlags::MAP_AUTOGROW);
            }
            if local_flags.contains(MapFlags::MAP_AUTOGROW) && !reg.fd_table.access(fd).writable {
                return Err(Errno::EINVAL);
            }
            let name_hash = reg.fd_table.name_hash(fd).unwrap_or(0);
            (device, clamped_len, offset, FdIdentity::File { fd, name_hash })
        };
        if len == 0 {
            return Err(Errno::EINVAL);
        }

        let key = ListKey::from(fd_identity);
        let exec_ok = reg.host_caps.exec_on_shared_pages_supported();

        // Registry recycle: anonymous maps only (spec.md §4.3).
        if anonymous && !local_flags.contains(MapFlags::MAP_FIXED) && offset == 0 {
            if let Some(list_idx) = reg.map.list_index(key) {
                let want_pages = page_count(len);
                let record_count = reg.map.list(list_idx).records().len();
                for ridx in 0..record_count {
                    let (compatible, run) = {
                        let rec = reg.map.list(list_idx).get(ridx).unwrap();
                        (rec.compatible_flags(local_flags), rec.page_map.find_clear_run(want_pages))
                    };
                    if !compatible {
                        continue;
                    }
                    if let Some(run_start) = run {
                        let (rec_base, noreserve) = {
                            let rec = reg.map.list(list_idx).get(ridx).unwrap();
                            (rec.base, rec.is_private_anon_noreserve())
                        };
                        let base = rec_base + run_start * PAGE_SIZE;
                        let host_prot = posix_to_host_protect(prot, local_flags, false, exec_ok);
                        recommit_or_protect(reg.host.as_ref(), noreserve, base, len, host_prot)?;
                        let rec = reg.map.list_mut(list_idx).get_mut(ridx).unwrap();
                        rec.page_map.set_range(run_start, want_pages);
                        rec.prot = prot;
                        return Ok(base);
                    }
                }
            }
        } else if anonymous && local_flags.contains(MapFlags::MAP_FIXED) {
            if let (Some(a), Some(list_idx)) = (addr, reg.map.list_index(key)) {
                let want_pages = page_count(len);
                let record_count = reg.map.list(list_idx).records().len();
                for ridx in 0..record_count {
                    let rec = reg.map.list(list_idx).get(ridx).unwrap().clone();
                    let overlap = rec.clip(a, len);
                    let fully_covers = rec.base <= a && a + len <= rec.end();

                    if fully_covers {
                        let page_idx = (a - rec.base) / PAGE_SIZE;
                        if !rec.compatible_flags(local_flags) || !rec.page_map.all_clear(page_idx, want_pages) {
                            return Err(Errno::EINVAL);
                        }
                        let host_prot = posix_to_host_protect(prot, local_flags, false, exec_ok);
                        recommit_or_protect(
                            reg.host.as_ref(),
                            rec.is_private_anon_noreserve(),
                            a,
                            len,
                            host_prot,
                        )?;
                        let rec = reg.map.list_mut(list_idx).get_mut(ridx).unwrap();
                        rec.page_map.set_range(page_idx, want_pages);
                        rec.prot = prot;
                        return Ok(a);
                    }
                    if overlap.is_some() {
                        // Partial overlap with an existing record: ambiguous,
                        // reject rather than silently split the record.
                        return Err(Errno::EINVAL);
                    }
                }
                // No record touches [a, a+len) at all: fall through and
                // create a fresh one there.
            }
        }

        // Fresh mapping: no reusable record.
        let (host_handle, base) = backend::map(
            device,
            reg.host.as_ref(),
            reg.host_caps.as_ref(),
            reg.fd_table.as_ref(),
            fd_identity,
            addr,
            len,
            prot,
            local_flags,
            offset,
        )?;

        if local_flags.contains(MapFlags::MAP_FIXED) {
            if let Some(a) = addr {
                if a != base {
                    let record = MmapRecord::new(fd_identity, host_handle, prot, local_flags, offset, len, base, device);
                    let _ = backend::unmap(&record, reg.host.as_ref());
                    return Err(Errno::EINVAL);
                }
            }
        }

        let record = MmapRecord::new(fd_identity, host_handle, prot, local_flags, offset, len, base, device);
        let list_idx = reg.map.list_or_create(key);
        reg.map.list_mut(list_idx).append(record);
        tracing::debug!(base, len, "mmap created record");
        Ok(base)
    })
}

pub fn munmap(addr: usize, len: usize) -> Result<(), Errno> {
    if addr == 0 || len == 0 {
        return Err(Errno::EINVAL);
    }
    registry::with_registry(|reg| {
        let granularity = if reg.host_caps.has_alloc_granularity_bug() {
            PAGE_SIZE
        } else {
            ALLOC_GRANULARITY
        };
        if !is_aligned(addr, granularity) {
            return Err(Errno::EINVAL);
        }

        let list_count = reg.map.list_count();
        for list_idx in (0..list_count).rev() {
            let mut cursor: Option<usize> = None;
            loop {
                let hit = reg.map.list(list_idx).search_by_address(addr, len, cursor);
                let Some((ridx, low, clipped_len)) = hit else {
                    break;
                };
                let rec_snapshot = reg.map.list(list_idx).get(ridx).unwrap().clone();
                let page_idx = (low - rec_snapshot.base) / PAGE_SIZE;
                let page_cnt = clipped_len.div_ceil(PAGE_SIZE);

                if rec_snapshot.is_private_anon_noreserve() {
                    reg.host.decommit_anon(low, clipped_len)?;
                } else {
                    reg.host.protect_range(low, clipped_len, HostProtect::NoAccess)?;
                }

                let rec = reg.map.list_mut(list_idx).get_mut(ridx).unwrap();
                rec.page_map.clear_range(page_idx, page_cnt);
                let fully_clear = rec.page_map.is_fully_clear();

                if fully_clear {
                    let removed = reg.map.list_mut(list_idx).delete(ridx);
                    backend::unmap(&removed, reg.host.as_ref())?;
                    cursor = ridx.checked_sub(1);
                } else {
                    cursor = Some(ridx);
                }
            }
            reg.map.drop_if_empty(list_idx);
        }
        Ok(())
    })
}

pub fn msync(addr: usize, len: usize, flags: MsFlags) -> Result<(), Errno> {
    if MsFlags::from_bits(flags.bits()).is_none() {
        return Err(Errno::EINVAL);
    }
    if flags.contains(MsFlags::MS_ASYNC) && flags.contains(MsFlags::MS_SYNC) {
        return Err(Errno::EINVAL);
    }

    registry::with_registry(|reg| {
        for list_idx in 0..reg.map.list_count() {
            let list = reg.map.list(list_idx);
            for ridx in 0..list.records().len() {
                let rec = list.get(ridx).unwrap();
                if rec.base <= addr && addr < rec.end() {
                    if addr + len > rec.end() {
                        return Err(Errno::ENOMEM);
                    }
                    let page_idx = (addr - rec.base) / PAGE_SIZE;
                    let page_cnt = len.div_ceil(PAGE_SIZE);
                    if !rec.page_map.all_set(page_idx, page_cnt) {
                        return Err(Errno::ENOMEM);
                    }
                    return backend::sync(rec, reg.host.as_ref());
                }
            }
        }
        Err(Errno::ENOMEM)
    })
}

pub fn mprotect(addr: usize, len: usize, prot: ProtFlags) -> Result<(), Errno> {
    if ProtFlags::from_bits(prot.bits()).is_none() {
        return Err(Errno::EINVAL);
    }

    registry::with_registry(|reg| {
        let exec_ok = reg.host_caps.exec_on_shared_pages_supported();
        let mut touched_any = false;

        for list_idx in 0..reg.map.list_count() {
            let mut cursor: Option<usize> = None;
            loop {
                let hit = reg.map.list(list_idx).search_by_address(addr, len, cursor);
                let Some((ridx, low, clipped_len)) = hit else {
                    break;
                };
                touched_any = true;

                let rec_snapshot = reg.map.list(list_idx).get(ridx).unwrap().clone();
                let host_prot = posix_to_host_protect(prot, rec_snapshot.flags, false, exec_ok);
                let page_idx = (low - rec_snapshot.base) / PAGE_SIZE;
                let page_cnt = clipped_len.div_ceil(PAGE_SIZE);

                if rec_snapshot.is_private_anon_noreserve() {
                    if prot.is_empty() {
                        reg.host.decommit_anon(low, clipped_len)?;
                        reg.map.list_mut(list_idx).get_mut(ridx).unwrap().page_map.clear_range(page_idx, page_cnt);
                    } else {
                        reg.host.commit_anon(low, clipped_len, host_prot)?;
                        reg.map.list_mut(list_idx).get_mut(ridx).unwrap().page_map.set_range(page_idx, page_cnt);
                    }
                } else {
                    reg.host.protect_range(low, clipped_len, host_prot)?;
                }

                reg.map.list_mut(list_idx).get_mut(ridx).unwrap().prot = prot;
                cursor = Some(ridx);
            }
        }

        if touched_any {
            return Ok(());
        }

        // Unmanaged memory: best-effort per spec.md §4.6.
        let region = reg.host.query_region(addr)?;
        let host_prot = posix_to_host_protect(prot, MapFlags::empty(), false, exec_ok);
        match region.state {
            RegionState::Free => Err(Errno::ENOMEM),
            RegionState::Reserved => reg.host.commit_anon(addr, len, host_prot),
            RegionState::Committed => reg.host.protect_range(addr, len, host_prot),
        }
    })
}

pub fn mlock(addr: usize, len: usize) -> Result<(), Errno> {
    let (host, caps) = registry::host_and_caps()?;
    if !caps.has_working_virtual_lock() {
        return Ok(());
    }
    let mut attempts = 0;
    loop {
        match host.lock(addr, len) {
            Ok(()) => return Ok(()),
            Err(Errno::EAGAIN) if attempts < 4 => {
                attempts += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn munlock(addr: usize, len: usize) -> Result<(), Errno> {
    let (host, _caps) = registry::host_and_caps()?;
    host.unlock(addr, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mman::collab::test_doubles::{FakeFdTable, FakeHostCaps};
    use crate::mman::host::sim::SimHost;
    use std::sync::Arc;

    fn setup() {
        registry::uninstall();
        registry::install(
            Arc::new(FakeFdTable::new()),
            Arc::new(FakeHostCaps::default()),
            Arc::new(SimHost::new()),
        )
        .unwrap();
    }

    #[test]
    fn rejects_bad_flag_combination() {
        setup();
        let result = mmap(None, 4096, ProtFlags::PROT_READ, MapFlags::empty(), -1, 0);
        assert_eq!(result, Err(Errno::EINVAL));
        registry::uninstall();
    }

    #[test]
    fn rejects_misaligned_offset() {
        setup();
        let result = mmap(
            None,
            4096,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            17,
        );
        assert_eq!(result, Err(Errno::EINVAL));
        registry::uninstall();
    }

    #[test]
    fn round_trip_leaves_no_residue() {
        setup();
        let base = mmap(
            None,
            4096,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
        .unwrap();
        munmap(base, 4096).unwrap();
        registry::uninstall();
    }

    #[test]
    fn msync_over_unmapped_hole_fails() {
        setup();
        let base = mmap(
            None,
            8192,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
        .unwrap();
        munmap(base, PAGE_SIZE).unwrap();
        let result = msync(base, 8192, MsFlags::MS_SYNC);
        assert_eq!(result, Err(Errno::ENOMEM));
        munmap(base + PAGE_SIZE, PAGE_SIZE).unwrap();
        registry::uninstall();
    }
}
