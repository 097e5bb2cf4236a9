use crate::{index::Record, version::Version};
use std::sync::Arc;

/// A value-owning record of one key access.
///
/// Read-set snapshots pin the version observed at read time; write-set
/// snapshots buffer the bytes to be installed and capture the slot's
/// pre-lock version during precommit.
pub(crate) struct Snapshot {
    pub key: Box<[u8]>,
    pub value: Option<Box<[u8]>>,
    pub version: Version,
    /// For write-set snapshots: the slot version observed when the write was
    /// buffered. A differing version at lock time proves the intervening
    /// writer overlapped this transaction.
    pub observed_version: Version,
    pub is_read_modify_write: bool,
    pub record: Option<Arc<Record>>,
}

impl Snapshot {
    pub fn pinned(
        key: &[u8],
        value: Option<Box<[u8]>>,
        version: Version,
        record: Arc<Record>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            observed_version: version,
            is_read_modify_write: false,
            record: Some(record),
        }
    }

    pub fn buffered(
        key: &[u8],
        value: &[u8],
        is_read_modify_write: bool,
        observed_version: Version,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            version: Version::ZERO,
            observed_version,
            is_read_modify_write,
            record: None,
        }
    }

    /// Replaces the buffered bytes in place, preserving the snapshot's
    /// position in its set and its flags.
    pub fn reset(&mut self, value: &[u8]) {
        self.value = Some(value.into());
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// The versions observed per key, in first-read order. At most one entry per
/// key.
#[derive(Default)]
pub(crate) struct ReadSet {
    entries: Vec<Snapshot>,
}

impl ReadSet {
    pub fn find(&self, key: &[u8]) -> Option<&Snapshot> {
        self.entries.iter().find(|snapshot| *snapshot.key == *key)
    }

    pub fn position(&self, key: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|snapshot| *snapshot.key == *key)
    }

    pub fn get(&self, index: usize) -> &Snapshot {
        &self.entries[index]
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut Snapshot> {
        self.entries
            .iter_mut()
            .find(|snapshot| *snapshot.key == *key)
    }

    pub fn push(&mut self, snapshot: Snapshot) -> &Snapshot {
        debug_assert!(self.find(&snapshot.key).is_none());
        self.entries.push(snapshot);
        self.entries.last().unwrap()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Snapshot> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The values to be installed per key, in first-write order. At most one
/// entry per key: later writes reset the snapshot's bytes in place.
#[derive(Default)]
pub(crate) struct WriteSet {
    entries: Vec<Snapshot>,
}

impl WriteSet {
    pub fn find(&self, key: &[u8]) -> Option<&Snapshot> {
        self.entries.iter().find(|snapshot| *snapshot.key == *key)
    }

    pub fn position(&self, key: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|snapshot| *snapshot.key == *key)
    }

    pub fn get(&self, index: usize) -> &Snapshot {
        &self.entries[index]
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut Snapshot> {
        self.entries
            .iter_mut()
            .find(|snapshot| *snapshot.key == *key)
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        debug_assert!(self.find(&snapshot.key).is_none());
        self.entries.push(snapshot);
    }

    /// Sorts the entries by slot identity. This is the total order in which
    /// precommit acquires locks.
    ///
    /// All entries must have their slots resolved.
    pub fn sort_by_slot(&mut self) {
        // The sort is stable in effect: slots are unique within a write set.
        self.entries.sort_unstable_by_key(|snapshot| {
            Arc::as_ptr(snapshot.record.as_ref().expect("slot must be resolved")) as usize
        });
    }

    pub fn contains_record(&self, record: &Arc<Record>) -> bool {
        self.entries.iter().any(|snapshot| {
            snapshot
                .record
                .as_ref()
                .is_some_and(|resolved| Arc::ptr_eq(resolved, record))
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Snapshot> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Snapshot> {
        self.entries.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Snapshot, WriteSet};

    #[test]
    fn reset_preserves_position_and_flags() {
        use crate::version::Version;

        let mut write_set = WriteSet::default();
        write_set.push(Snapshot::buffered(b"alice", b"1", true, Version::ZERO));
        write_set.push(Snapshot::buffered(b"bob", b"2", false, Version::ZERO));

        let snapshot = write_set.find_mut(b"alice").unwrap();
        snapshot.reset(b"3");

        let keys: Vec<_> = write_set.iter().map(|s| s.key.clone()).collect();
        let expected: [Box<[u8]>; 2] = [b"alice".as_slice().into(), b"bob".as_slice().into()];
        assert_eq!(keys, expected);
        let snapshot = write_set.find(b"alice").unwrap();
        assert_eq!(snapshot.value(), Some(b"3".as_slice()));
        assert!(snapshot.is_read_modify_write);
    }
}
