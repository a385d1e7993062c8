//! Polymorphic per-descriptor `map`/`unmap`/`sync`/`fixup_after_fork`,
//! dispatched on [`BackingKind`] rather than through a trait object
//! (`spec.md` §4.2, §9 "model as a tagged variant").

use crate::errno::Errno;
use crate::mman::collab::FdTable;
use crate::mman::host::{posix_to_host_protect, HostAdapter, HostCaps, HostProtect, RemoteProcess};
use crate::mman::record::{BackingKind, FdIdentity, HostHandle, MmapRecord};
use crate::mman::{MapFlags, ProtFlags};

/// Produces a fresh host mapping for a descriptor that could not be
/// recycled from the registry. Returns the host handle and the base address
/// the view landed at.
pub fn map(
    device: BackingKind,
    host: &dyn HostAdapter,
    host_caps: &dyn HostCaps,
    fd_table: &dyn FdTable,
    fd_identity: FdIdentity,
    preferred_addr: Option<usize>,
    len: usize,
    prot: ProtFlags,
    flags: MapFlags,
    offset: u64,
) -> Result<(HostHandle, usize), Errno> {
    match device {
        BackingKind::Zero if flags.contains(MapFlags::MAP_PRIVATE) => {
            // Reserve/commit path: no section object at all.
            let base = host.reserve_anon(preferred_addr, len)?;
            let host_prot = posix_to_host_protect(prot, flags, false, host_caps.exec_on_shared_pages_supported());
            if let Err(e) = host.commit_anon(base, len, host_prot) {
                let _ = host.release_anon(base, len);
                return Err(e);
            }
            Ok((HostHandle::Reserved, base))
        }
        BackingKind::Zero => {
            // SHARED anonymous: a section with the anonymous backing object.
            let handle = host.create_mapping(None, len as u64, 0, prot, flags, None, false)?;
            match host.map_view(handle, preferred_addr, len, prot, flags, 0) {
                Ok(base) => Ok((handle, base)),
                Err(e) => {
                    let _ = host.close_mapping(handle);
                    Err(e)
                }
            }
        }
        BackingKind::RegularFile => {
            let fd = match fd_identity {
                FdIdentity::File { fd, .. } => fd,
                FdIdentity::Anonymous => return Err(Errno::ENODEV),
            };
            let fd_handle = fd_table.handle(fd).ok_or(Errno::EBADF)?;
            let name_hash = fd_table.name_hash(fd);
            let autogrow = flags.contains(MapFlags::MAP_AUTOGROW);

            let section_len = if autogrow {
                offset + len as u64
            } else {
                0
            };
            let section_prot = if autogrow {
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
            } else {
                prot
            };
            // A file-backed PRIVATE section must be created WriteCopy
            // regardless of the caller's requested prot (`spec.md` §4.1):
            // the host rejects a later mprotect promotion otherwise.
            let creating_private_file_section =
                flags.contains(MapFlags::MAP_PRIVATE) && !flags.contains(MapFlags::MAP_ANONYMOUS);

            let handle = host.create_mapping(
                Some(fd_handle),
                section_len,
                offset,
                section_prot,
                flags,
                name_hash,
                creating_private_file_section,
            )?;

            let handle = if autogrow && section_prot != prot {
                // The section had to be opened read-write to grow the file;
                // recreate it at the caller's actual protection now that the
                // growth has happened.
                let _ = host.close_mapping(handle);
                host.create_mapping(
                    Some(fd_handle),
                    section_len,
                    offset,
                    prot,
                    flags,
                    name_hash,
                    creating_private_file_section,
                )?
            } else {
                handle
            };

            match host.map_view(handle, preferred_addr, len, prot, flags, offset) {
                Ok(base) => Ok((handle, base)),
                Err(e) => {
                    let _ = host.close_mapping(handle);
                    Err(e)
                }
            }
        }
        BackingKind::PhysicalMemory => {
            let fd = match fd_identity {
                FdIdentity::File { fd, .. } => fd,
                FdIdentity::Anonymous => return Err(Errno::ENODEV),
            };
            let fd_handle = fd_table.handle(fd).ok_or(Errno::EBADF)?;
            let mem_size = fd_table.file_size(fd).ok_or(Errno::EBADF)?;
            if offset + len as u64 > mem_size {
                return Err(Errno::EINVAL);
            }
            let name_hash = fd_table.name_hash(fd);
            let handle =
                host.create_mapping(Some(fd_handle), 0, offset, prot, flags, name_hash, false)?;
            match host.map_view(handle, preferred_addr, len, prot, flags, offset) {
                Ok(base) => Ok((handle, base)),
                Err(e) => {
                    let _ = host.close_mapping(handle);
                    Err(e)
                }
            }
        }
    }
}

/// Tears down a record's host-side state entirely (all pages gone).
pub fn unmap(record: &MmapRecord, host: &dyn HostAdapter) -> Result<(), Errno> {
    host.unmap_view(record.base, record.len)?;
    if let HostHandle::Section(_) = record.host_handle {
        host.close_mapping(record.host_handle)?;
    }
    Ok(())
}

/// Flushes dirty pages to the backing object. `ZeroDevice` and
/// `PhysicalMemory` have nothing to flush.
pub fn sync(record: &MmapRecord, host: &dyn HostAdapter) -> Result<(), Errno> {
    match record.device_tag {
        BackingKind::Zero | BackingKind::PhysicalMemory => Ok(()),
        BackingKind::RegularFile => host.flush_view(record.base, record.len),
    }
}

/// Reconstructs a record's view in a just-forked child, at the same base
/// address it held in the parent.
pub fn fixup_after_fork(
    record: &MmapRecord,
    host: &dyn HostAdapter,
    _parent: RemoteProcess,
) -> Result<(), Errno> {
    match record.device_tag {
        BackingKind::Zero if record.flags.contains(MapFlags::MAP_PRIVATE) => {
            host.reserve_anon(Some(record.base), record.len)?;
            Ok(())
        }
        BackingKind::Zero | BackingKind::RegularFile | BackingKind::PhysicalMemory => {
            host.map_view(
                record.host_handle,
                Some(record.base),
                record.len,
                record.prot,
                record.flags,
                record.offset,
            )?;
            Ok(())
        }
    }
}
