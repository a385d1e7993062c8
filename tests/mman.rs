//! End-to-end scenarios against the real `SimHost` backend: actual memory
//! is mapped, written, and unmapped, the same way the unit suite under
//! `src/mman/engine.rs` exercises the registry logic in isolation.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock};

use pmmap::mman::collab::test_doubles::{FakeFdTable, FakeFile, FakeHostCaps};
use pmmap::mman::host::sim::SimHost;
use pmmap::mman::host::RemoteProcess;
use pmmap::mman::record::BackingKind;
use pmmap::mman::{self, FdAccess, MapFlags, MsFlags, ProtFlags};
use pmmap::Errno;

/// The registry is process-wide global state; serialize the tests that
/// touch it rather than give each its own process.
fn lock() -> std::sync::MutexGuard<'static, ()> {
    static M: OnceLock<Mutex<()>> = OnceLock::new();
    M.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn start(caps: FakeHostCaps, fd_table: FakeFdTable) {
    let _ = tracing_subscriber::fmt::try_init();
    mman::teardown();
    mman::init(Arc::new(fd_table), Arc::new(caps), Arc::new(SimHost::new())).unwrap();
}

const PAGE: usize = 4096;

unsafe fn poke(addr: usize, off: usize, value: u8) {
    *((addr + off) as *mut u8) = value;
}

unsafe fn peek(addr: usize, off: usize) -> u8 {
    *((addr + off) as *const u8)
}

/// S1: partial munmap makes a later msync over the whole original range
/// fail with ENOMEM, but the surviving half stays syncable and unmappable.
#[test]
fn s1_partial_unmap_then_msync_fails() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let a = mman::mmap(
        None,
        2 * PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        -1,
        0,
    )
    .unwrap();

    unsafe {
        poke(a, 0, 0xAA);
        poke(a, PAGE, 0xAA);
    }

    mman::msync(a, 2 * PAGE, MsFlags::MS_SYNC).unwrap();
    mman::munmap(a, PAGE).unwrap();

    let result = mman::msync(a, 2 * PAGE, MsFlags::MS_SYNC);
    assert_eq!(result, Err(Errno::ENOMEM));

    mman::munmap(a + PAGE, PAGE).unwrap();
    mman::teardown();
}

/// S2: a freed hole in an anonymous list is recycled by a same-shaped mmap.
#[test]
fn s2_hole_is_recycled() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let a = mman::mmap(
        None,
        3 * PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        -1,
        0,
    )
    .unwrap();

    mman::munmap(a + PAGE, PAGE).unwrap();

    let b = mman::mmap(
        None,
        PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        -1,
        0,
    )
    .unwrap();

    assert_eq!(b, a + PAGE);

    mman::munmap(a, PAGE).unwrap();
    mman::munmap(a + PAGE, PAGE).unwrap();
    mman::munmap(a + 2 * PAGE, PAGE).unwrap();
    mman::teardown();
}

/// S3: a read-only shared map over an 8 KiB file clamps a too-large
/// request; the same file opened non-writable rejects AUTOGROW.
#[test]
fn s3_file_backed_clamp_and_autogrow_rejection() {
    let _g = lock();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 8192]).unwrap();
    file.flush().unwrap();
    let raw_fd = file.as_file().as_raw_fd();

    let mut fd_table = FakeFdTable::new();
    fd_table.insert(
        10,
        FakeFile {
            device: BackingKind::RegularFile,
            handle: raw_fd as usize,
            access: FdAccess {
                readable: true,
                writable: false,
            },
            name_hash: 0xF17E,
            name: "scenario.bin".into(),
            size: 8192,
        },
    );
    start(FakeHostCaps::default(), fd_table);

    let base = mman::mmap(
        None,
        16384,
        ProtFlags::PROT_READ,
        MapFlags::MAP_SHARED,
        10,
        0,
    )
    .unwrap();
    assert_ne!(base, 0);
    mman::munmap(base, 8192).unwrap();

    let result = mman::mmap(
        None,
        16384,
        ProtFlags::PROT_READ,
        MapFlags::MAP_SHARED | MapFlags::MAP_AUTOGROW,
        10,
        0,
    );
    assert_eq!(result, Err(Errno::EINVAL));

    mman::teardown();
}

/// S4: PROT_NONE on a PRIVATE|ANON|NORESERVE mapping decommits it; a later
/// PROT_READ|PROT_WRITE recommits it and the page reads back as zero.
#[test]
fn s4_decommit_then_recommit_reads_zero() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let a = mman::mmap(
        None,
        PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
        -1,
        0,
    )
    .unwrap();

    unsafe { poke(a, 0, 0x42) };

    mman::mprotect(a, PAGE, ProtFlags::PROT_NONE).unwrap();
    mman::mprotect(a, PAGE, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE).unwrap();

    assert_eq!(unsafe { peek(a, 0) }, 0);

    mman::munmap(a, PAGE).unwrap();
    mman::teardown();
}

/// S5: fork fixup runs to completion over a SHARED anonymous record. This
/// is a smoke test, not a true cross-process check: without an actual
/// `fork()` there is only one address space to observe.
#[test]
fn s5_fork_fixup_completes_over_shared_anon() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let a = mman::mmap(
        None,
        PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
        -1,
        0,
    )
    .unwrap();
    unsafe { poke(a, 0, 0x5A) };

    mman::fixup_after_fork(RemoteProcess(0)).unwrap();

    mman::munmap(a, PAGE).unwrap();
    mman::teardown();
}

/// S6: a misaligned `MAP_FIXED` address is rejected before any host call,
/// on a capability set without the legacy alignment bug.
#[test]
fn s6_fixed_misaligned_address_rejected() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let result = mman::mmap(
        Some(0x1000),
        PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
        -1,
        0,
    );
    assert_eq!(result, Err(Errno::EINVAL));
    mman::teardown();
}

#[test]
fn rejects_shared_and_private_together() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let result = mman::mmap(
        None,
        PAGE,
        ProtFlags::PROT_READ,
        MapFlags::MAP_SHARED | MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        -1,
        0,
    );
    assert_eq!(result, Err(Errno::EINVAL));
    mman::teardown();
}

#[test]
fn rejects_offset_beyond_eof_without_autogrow() {
    let _g = lock();

    let file = tempfile::NamedTempFile::new().unwrap();
    let raw_fd = file.as_file().as_raw_fd();

    let mut fd_table = FakeFdTable::new();
    fd_table.insert(
        11,
        FakeFile {
            device: BackingKind::RegularFile,
            handle: raw_fd as usize,
            access: FdAccess {
                readable: true,
                writable: true,
            },
            name_hash: 1,
            name: "empty.bin".into(),
            size: 0,
        },
    );
    start(FakeHostCaps::default(), fd_table);

    let result = mman::mmap(None, PAGE, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, 11, 0);
    assert_eq!(result, Err(Errno::ENXIO));
    mman::teardown();
}

/// Round-trip invariant (spec.md §8, invariant 4): mapping and then
/// unmapping the same range returns the registry to its pre-call shape.
#[test]
fn round_trip_is_a_no_op_on_registry_shape() {
    let _g = lock();
    start(FakeHostCaps::default(), FakeFdTable::new());

    let a = mman::mmap(
        None,
        PAGE,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        -1,
        0,
    )
    .unwrap();
    assert_eq!(mman::munmap(a, PAGE), Ok(()));
    mman::teardown();
}
