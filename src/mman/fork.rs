//! Reconstructs mapping state in a freshly forked child (`spec.md` §4.7).
//! Runs single-threaded in the child before any other code touches mapped
//! memory, so it does not take the registry lock the way the other public
//! operations do (`spec.md` §5).

use crate::errno::Errno;
use crate::mman::backend;
use crate::mman::host::{posix_to_host_protect, HostProtect, RegionState, RemoteProcess};
use crate::mman::registry;
use crate::mman::MapFlags;

/// `parent` identifies the process this one was just forked from.
pub fn fixup_after_fork(parent: RemoteProcess) -> Result<(), Errno> {
    registry::with_registry(|reg| {
        for list_idx in 0..reg.map.list_count() {
            let record_count = reg.map.list(list_idx).records().len();
            for ridx in 0..record_count {
                let rec = reg.map.list(list_idx).get(ridx).unwrap().clone();

                backend::fixup_after_fork(&rec, reg.host.as_ref(), parent)?;

                let mut done = 0usize;
                while done < rec.len {
                    let addr = rec.base + done;
                    let region = reg.host.query_region(addr)?;
                    let span = region.len.min(rec.len - done).max(1);

                    if region.state == RegionState::Reserved {
                        reg.host.decommit_anon(addr, span)?;
                        done += span;
                        continue;
                    }

                    if rec.flags.contains(MapFlags::MAP_PRIVATE) {
                        if rec.is_private_anon_noreserve() {
                            reg.host.commit_anon(addr, span, HostProtect::ReadWrite)?;
                        } else {
                            reg.host.protect_range(addr, span, HostProtect::ReadWrite)?;
                        }

                        let parent_was_noaccess = region.protect.is_empty();
                        if parent_was_noaccess {
                            reg.host.protect_remote(parent, addr, span, HostProtect::ReadOnly)?;
                        }

                        let mut buf = vec![0u8; span];
                        reg.host.read_remote(parent, addr, &mut buf)?;
                        unsafe {
                            std::ptr::copy_nonoverlapping(buf.as_ptr(), addr as *mut u8, span);
                        }

                        if parent_was_noaccess {
                            reg.host.protect_remote(parent, addr, span, HostProtect::NoAccess)?;
                        }
                    }

                    let host_prot = posix_to_host_protect(
                        rec.prot,
                        rec.flags,
                        false,
                        reg.host_caps.exec_on_shared_pages_supported(),
                    );
                    reg.host.protect_range(addr, span, host_prot)?;

                    done += span;
                }
            }
        }
        Ok(())
    })
    .map_err(|e| {
        tracing::error!(?e, "fork fixup aborted");
        e
    })
}
