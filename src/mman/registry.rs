//! The process-wide registry: the single [`RegistryMap`] instance plus the
//! collaborators supplied at [`crate::mman::init`], all behind one resource
//! lock (`spec.md` §5, §9 "Global singleton").

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::errno::Errno;
use crate::mman::collab::{FdTable, HostCaps};
use crate::mman::host::HostAdapter;
use crate::mman::list::{DescriptorList, ListKey};

/// Ordered set of [`DescriptorList`]s keyed by backing-object identity.
/// Single process-wide instance, owned by [`Registry`].
#[derive(Default)]
pub struct RegistryMap {
    lists: Vec<DescriptorList>,
}

impl RegistryMap {
    fn new() -> Self {
        RegistryMap { lists: Vec::new() }
    }

    pub fn lists(&self) -> &[DescriptorList] {
        &self.lists
    }

    pub fn list_index(&self, key: ListKey) -> Option<usize> {
        self.lists.iter().position(|l| l.key == Some(key))
    }

    pub fn list(&self, idx: usize) -> &DescriptorList {
        &self.lists[idx]
    }

    pub fn list_mut(&mut self, idx: usize) -> &mut DescriptorList {
        &mut self.lists[idx]
    }

    pub fn list_or_create(&mut self, key: ListKey) -> usize {
        if let Some(i) = self.list_index(key) {
            return i;
        }
        self.lists.push(DescriptorList::new(key));
        self.lists.len() - 1
    }

    /// Deletes the list at `idx` if it has no records left.
    pub fn drop_if_empty(&mut self, idx: usize) {
        if self.lists[idx].is_empty() {
            self.lists.swap_remove(idx);
        }
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    pub fn total_record_count(&self) -> usize {
        self.lists.iter().map(|l| l.records().len()).sum()
    }
}

/// Everything a running engine operation needs: the map plus the three
/// collaborators fixed at init.
pub struct Registry {
    pub map: RegistryMap,
    pub fd_table: Arc<dyn FdTable>,
    pub host_caps: Arc<dyn HostCaps>,
    pub host: Arc<dyn HostAdapter>,
}

static REGISTRY: OnceLock<RwLock<Option<Registry>>> = OnceLock::new();

fn cell() -> &'static RwLock<Option<Registry>> {
    REGISTRY.get_or_init(|| RwLock::new(None))
}

/// Installs the registry. See [`crate::mman::init`].
pub fn install(
    fd_table: Arc<dyn FdTable>,
    host_caps: Arc<dyn HostCaps>,
    host: Arc<dyn HostAdapter>,
) -> Result<(), Errno> {
    let mut slot = cell().write();
    if slot.is_some() {
        return Err(Errno::EINVAL);
    }
    *slot = Some(Registry {
        map: RegistryMap::new(),
        fd_table,
        host_caps,
        host,
    });
    tracing::info!("mmap registry initialized");
    Ok(())
}

/// Tears down the registry. See [`crate::mman::teardown`].
pub fn uninstall() {
    let mut slot = cell().write();
    if slot.take().is_some() {
        tracing::info!("mmap registry torn down");
    }
}

/// Runs `f` with exclusive access to the registry, holding the single
/// process-wide resource lock for `f`'s entire duration (`spec.md` §5).
pub fn with_registry<R>(f: impl FnOnce(&mut Registry) -> Result<R, Errno>) -> Result<R, Errno> {
    let mut slot = cell().write();
    let registry = slot.as_mut().ok_or(Errno::EINVAL)?;
    f(registry)
}

/// Read-only access, used by collaborators (e.g. `mlock`/`munlock`) that
/// need the host adapter or capability oracle but must not take the
/// registry lock (`spec.md` §5: "`mlock`/`munlock` do not take the registry
/// lock").
pub fn host_and_caps() -> Result<(Arc<dyn HostAdapter>, Arc<dyn HostCaps>), Errno> {
    let slot = cell().read();
    let registry = slot.as_ref().ok_or(Errno::EINVAL)?;
    Ok((registry.host.clone(), registry.host_caps.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mman::collab::test_doubles::{FakeFdTable, FakeHostCaps};
    use crate::mman::host::sim::SimHost;

    fn doubles() -> (Arc<dyn FdTable>, Arc<dyn HostCaps>, Arc<dyn HostAdapter>) {
        (
            Arc::new(FakeFdTable::new()),
            Arc::new(FakeHostCaps::default()),
            Arc::new(SimHost::new()),
        )
    }

    #[test]
    fn double_install_rejected() {
        uninstall();
        let (a, b, c) = doubles();
        assert!(install(a, b, c).is_ok());
        let (a, b, c) = doubles();
        assert_eq!(install(a, b, c), Err(Errno::EINVAL));
        uninstall();
    }

    #[test]
    fn operations_fail_before_init() {
        uninstall();
        let result = with_registry(|_| Ok(()));
        assert_eq!(result, Err(Errno::EINVAL));
    }
}
