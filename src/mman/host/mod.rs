//! Abstraction over the host's section/view primitives. Two concrete
//! backends ([`sim`] and, on Windows, `windows`) implement [`HostAdapter`];
//! the one in use is chosen once at [`crate::mman::init`] and never
//! branched on again by the engine.

pub mod sim;

#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use cfg_if::cfg_if;

use crate::errno::Errno;
use crate::mman::collab::HostCaps;
use crate::mman::record::HostHandle;
use crate::mman::{MapFlags, ProtFlags};

cfg_if! {
    if #[cfg(windows)] {
        /// The adapter an embedder gets from [`default_host`] on this target.
        pub type DefaultHost = self::windows::WindowsHost;
    } else {
        /// No native section/view host exists off Windows; embedders on
        /// other targets supply [`sim::SimHost`] (or their own adapter)
        /// directly to [`crate::mman::init`].
        pub type DefaultHost = sim::SimHost;
    }
}

/// Constructs the adapter appropriate for this target, for embedders that
/// don't need to override it. Defaults to the modern backend; embedders
/// that need the legacy quirks should use [`host_for_caps`] instead.
pub fn default_host() -> Arc<dyn HostAdapter> {
    Arc::new(DefaultHost::default())
}

/// Constructs the adapter for this target, selecting the legacy or modern
/// backend once from `caps.is_modern()` (`spec.md` §9: "choose once at
/// init... the engine never branches on host version"). Off Windows,
/// [`sim::SimHost`] has no legacy/modern distinction and `caps` is unused.
pub fn host_for_caps(caps: &dyn HostCaps) -> Arc<dyn HostAdapter> {
    cfg_if! {
        if #[cfg(windows)] {
            Arc::new(self::windows::WindowsHost::new(!caps.is_modern()))
        } else {
            let _ = caps;
            Arc::new(sim::SimHost::default())
        }
    }
}

/// Opaque reference to another process, used only by [`HostAdapter::protect_remote`]
/// and [`HostAdapter::read_remote`] during fork fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteProcess(pub usize);

/// Host-reported state of a region queried by [`HostAdapter::query_region`],
/// the Rust analogue of a `MEMORY_BASIC_INFORMATION` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Free,
    /// Address space is reserved but has no physical backing.
    Reserved,
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: usize,
    pub len: usize,
    pub state: RegionState,
    pub protect: ProtFlags,
}

/// The host-level protection a mapping should carry, distinguishing the
/// copy-on-write case from plain read-write since the two differ subtly
/// between host backends (see `spec.md` §4.1 and the glossary entry for
/// copy-on-write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostProtect {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    ExecuteRead,
    ExecuteReadWrite,
    ExecuteWriteCopy,
}

/// Maps POSIX `(prot, flags)` to the host protection to request.
///
/// `creating_private_file_section`: true when this call is sizing the
/// *section* that will back a file-backed `MAP_PRIVATE` mapping — such a
/// section must be created `WriteCopy` even if the caller only asked for
/// `PROT_READ`, because the host rejects a later transition to `WriteCopy`
/// via `protect_range` unless the section started out that way.
pub fn posix_to_host_protect(
    prot: ProtFlags,
    flags: MapFlags,
    creating_private_file_section: bool,
    exec_on_shared_supported: bool,
) -> HostProtect {
    let writecopy_candidate =
        creating_private_file_section || (flags.contains(MapFlags::MAP_PRIVATE) && !flags.contains(MapFlags::MAP_ANONYMOUS));

    let base = if creating_private_file_section {
        // The host rejects a later transition to WriteCopy via protect_range
        // unless the section started out that way, so force it here
        // regardless of what the caller's prot bits say.
        HostProtect::WriteCopy
    } else if prot.contains(ProtFlags::PROT_WRITE) {
        if writecopy_candidate {
            HostProtect::WriteCopy
        } else {
            HostProtect::ReadWrite
        }
    } else if prot.contains(ProtFlags::PROT_READ) {
        if writecopy_candidate {
            HostProtect::WriteCopy
        } else {
            HostProtect::ReadOnly
        }
    } else {
        HostProtect::NoAccess
    };

    if !prot.contains(ProtFlags::PROT_EXEC) {
        return base;
    }
    let can_exec = flags.contains(MapFlags::MAP_PRIVATE) || exec_on_shared_supported;
    if !can_exec {
        return base;
    }
    match base {
        HostProtect::NoAccess => HostProtect::NoAccess,
        HostProtect::ReadOnly => HostProtect::ExecuteRead,
        HostProtect::ReadWrite => HostProtect::ExecuteReadWrite,
        HostProtect::WriteCopy => HostProtect::ExecuteWriteCopy,
        other @ (HostProtect::ExecuteRead
        | HostProtect::ExecuteReadWrite
        | HostProtect::ExecuteWriteCopy) => other,
    }
}

/// One-call-per-operation abstraction over host primitives (`spec.md` §4.1).
///
/// Every method is a single host round trip; none suspend. Implementors
/// translate host-specific failures to the nearest [`Errno`] at this
/// boundary — no host error type crosses it.
pub trait HostAdapter: Send + Sync {
    /// Creates a section sized and protected per `spec.md` §4.1 rule 1.
    /// `fd_handle` is `None` for the anonymous backing object.
    /// `creating_private_file_section` is true exactly when this call is
    /// sizing the section behind a file-backed `MAP_PRIVATE` mapping — see
    /// [`posix_to_host_protect`].
    fn create_mapping(
        &self,
        fd_handle: Option<usize>,
        len: u64,
        offset: u64,
        prot: ProtFlags,
        flags: MapFlags,
        name_hash: Option<u64>,
        creating_private_file_section: bool,
    ) -> Result<HostHandle, Errno>;

    fn close_mapping(&self, handle: HostHandle) -> Result<(), Errno>;

    /// Maps a view of `handle`. Tries `preferred_addr` first; if that fails,
    /// `FIXED` is not set, and `preferred_addr` was `Some`, retries with
    /// `None` (host picks the address).
    fn map_view(
        &self,
        handle: HostHandle,
        preferred_addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> Result<usize, Errno>;

    fn unmap_view(&self, base: usize, len: usize) -> Result<(), Errno>;

    fn protect_range(&self, addr: usize, len: usize, new_prot: HostProtect) -> Result<(), Errno>;

    fn protect_remote(
        &self,
        process: RemoteProcess,
        addr: usize,
        len: usize,
        new_prot: HostProtect,
    ) -> Result<(), Errno>;

    fn reserve_anon(&self, preferred_addr: Option<usize>, len: usize) -> Result<usize, Errno>;

    fn commit_anon(&self, addr: usize, len: usize, prot: HostProtect) -> Result<(), Errno>;

    fn decommit_anon(&self, addr: usize, len: usize) -> Result<(), Errno>;

    fn release_anon(&self, addr: usize, len: usize) -> Result<(), Errno>;

    fn lock(&self, addr: usize, len: usize) -> Result<(), Errno>;

    fn unlock(&self, addr: usize, len: usize) -> Result<(), Errno>;

    fn query_region(&self, addr: usize) -> Result<RegionInfo, Errno>;

    fn read_remote(&self, process: RemoteProcess, addr: usize, buf: &mut [u8]) -> Result<(), Errno>;

    fn flush_view(&self, addr: usize, len: usize) -> Result<(), Errno>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_on_private_file_requests_writecopy() {
        let hp = posix_to_host_protect(ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE, true, true);
        assert_eq!(hp, HostProtect::WriteCopy);
    }

    #[test]
    fn shared_write_is_plain_readwrite() {
        let hp = posix_to_host_protect(
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            false,
            true,
        );
        assert_eq!(hp, HostProtect::ReadWrite);
    }

    #[test]
    fn exec_dropped_when_unsupported_on_shared() {
        let hp = posix_to_host_protect(
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            MapFlags::MAP_SHARED,
            false,
            false,
        );
        assert_eq!(hp, HostProtect::ReadOnly);
    }

    #[test]
    fn prot_none_is_noaccess() {
        let hp = posix_to_host_protect(ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE, false, true);
        assert_eq!(hp, HostProtect::NoAccess);
    }
}
