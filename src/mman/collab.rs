//! Interfaces to collaborators this crate does not own: the file-descriptor
//! table and the host-capability oracle. Both are supplied by the embedding
//! runtime at [`crate::mman::init`]; this module also ships the test doubles
//! used by the crate's own test suite.

/// What the fd table can tell the engine about a descriptor. Path resolution,
/// actual I/O, and descriptor-slot reuse live entirely in the embedding
/// runtime; this crate only ever asks these seven questions.
pub trait FdTable: Send + Sync {
    fn device(&self, fd: i32) -> Option<crate::mman::record::BackingKind>;
    /// Opaque host handle the fd was opened with (e.g. a `HANDLE` value).
    fn handle(&self, fd: i32) -> Option<usize>;
    fn access(&self, fd: i32) -> FdAccess;
    fn name_hash(&self, fd: i32) -> Option<u64>;
    fn name(&self, fd: i32) -> Option<String>;
    fn is_open(&self, fd: i32) -> bool;
    fn file_size(&self, fd: i32) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdAccess {
    pub readable: bool,
    pub writable: bool,
}

/// Host-capability oracle: which of the two [`crate::mman::host::HostAdapter`]
/// backends applies, and which individual quirks it has.
pub trait HostCaps: Send + Sync {
    fn is_modern(&self) -> bool;
    fn has_alloc_granularity_bug(&self) -> bool;
    fn has_working_virtual_lock(&self) -> bool;
    fn exec_on_shared_pages_supported(&self) -> bool;
}

#[cfg(any(test, feature = "test-doubles"))]
pub mod test_doubles {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    #[derive(Debug, Clone)]
    pub struct FakeFile {
        pub device: crate::mman::record::BackingKind,
        pub handle: usize,
        pub access: FdAccess,
        pub name_hash: u64,
        pub name: String,
        pub size: u64,
    }

    #[derive(Default)]
    pub struct FakeFdTable {
        files: RwLock<HashMap<i32, FakeFile>>,
    }

    impl FakeFdTable {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, fd: i32, file: FakeFile) {
            self.files.write().unwrap().insert(fd, file);
        }

        pub fn close(&self, fd: i32) {
            self.files.write().unwrap().remove(&fd);
        }
    }

    impl FdTable for FakeFdTable {
        fn device(&self, fd: i32) -> Option<crate::mman::record::BackingKind> {
            self.files.read().unwrap().get(&fd).map(|f| f.device)
        }

        fn handle(&self, fd: i32) -> Option<usize> {
            self.files.read().unwrap().get(&fd).map(|f| f.handle)
        }

        fn access(&self, fd: i32) -> FdAccess {
            self.files
                .read()
                .unwrap()
                .get(&fd)
                .map(|f| f.access)
                .unwrap_or(FdAccess {
                    readable: false,
                    writable: false,
                })
        }

        fn name_hash(&self, fd: i32) -> Option<u64> {
            self.files.read().unwrap().get(&fd).map(|f| f.name_hash)
        }

        fn name(&self, fd: i32) -> Option<String> {
            self.files.read().unwrap().get(&fd).map(|f| f.name.clone())
        }

        fn is_open(&self, fd: i32) -> bool {
            self.files.read().unwrap().contains_key(&fd)
        }

        fn file_size(&self, fd: i32) -> Option<u64> {
            self.files.read().unwrap().get(&fd).map(|f| f.size)
        }
    }

    pub struct FakeHostCaps {
        pub modern: bool,
        pub alloc_granularity_bug: bool,
        pub working_virtual_lock: bool,
        pub exec_on_shared: bool,
    }

    impl Default for FakeHostCaps {
        fn default() -> Self {
            FakeHostCaps {
                modern: true,
                alloc_granularity_bug: false,
                working_virtual_lock: true,
                exec_on_shared: true,
            }
        }
    }

    impl HostCaps for FakeHostCaps {
        fn is_modern(&self) -> bool {
            self.modern
        }

        fn has_alloc_granularity_bug(&self) -> bool {
            self.alloc_granularity_bug
        }

        fn has_working_virtual_lock(&self) -> bool {
            self.working_virtual_lock
        }

        fn exec_on_shared_pages_supported(&self) -> bool {
            self.exec_on_shared
        }
    }
}
