//! Grouping of [`MmapRecord`]s that share the same backing object.

use crate::mman::record::{FdIdentity, MmapRecord};

/// Key identifying a [`DescriptorList`]: either the anonymous sentinel or a
/// (current fd, path name-hash) pair, mirroring [`FdIdentity`] but without
/// carrying a record's own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKey {
    Anonymous,
    File { name_hash: u64 },
}

impl From<FdIdentity> for ListKey {
    fn from(id: FdIdentity) -> Self {
        match id {
            FdIdentity::Anonymous => ListKey::Anonymous,
            FdIdentity::File { name_hash, .. } => ListKey::File { name_hash },
        }
    }
}

/// All records backed by the same object. Deleted (by the registry) when
/// its last record is deleted.
#[derive(Debug, Default)]
pub struct DescriptorList {
    pub key: Option<ListKey>,
    records: Vec<MmapRecord>,
}

impl DescriptorList {
    pub fn new(key: ListKey) -> Self {
        DescriptorList {
            key: Some(key),
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MmapRecord] {
        &self.records
    }

    pub fn append(&mut self, record: MmapRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&MmapRecord> {
        self.records.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut MmapRecord> {
        self.records.get_mut(idx)
    }

    /// Removes the record at `idx`. Uses `swap_remove`, so callers iterating
    /// by index must re-inspect the same index after a deletion rather than
    /// advancing.
    pub fn delete(&mut self, idx: usize) -> MmapRecord {
        self.records.swap_remove(idx)
    }

    /// Finds a record whose offset range contains `[off, off + len)`, used
    /// by the regular-file `AUTOGROW` re-open path.
    pub fn search_by_offset(&self, off: u64, len: usize) -> Option<usize> {
        self.records.iter().position(|r| {
            r.offset <= off && off + len as u64 <= r.offset + r.len as u64
        })
    }

    /// Iterates records whose address range intersects `[addr, addr+len)`,
    /// starting the scan just after `start`. Tolerates callers deleting the
    /// record the previous call returned: pass the same `start` again.
    pub fn search_by_address(
        &self,
        addr: usize,
        len: usize,
        start: Option<usize>,
    ) -> Option<(usize, usize, usize)> {
        let begin = start.map_or(0, |s| s + 1);
        for (i, rec) in self.records.iter().enumerate().skip(begin) {
            let low = addr.max(rec.base);
            let high = (addr + len).min(rec.end());
            if low < high {
                return Some((i, low, high - low));
            }
        }
        None
    }
}
