use crate::version::Version;
use crossbeam_utils::Backoff;
use scc::{hash_index::Entry, HashIndex};
use std::sync::{
    atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering::SeqCst},
    Arc,
};

/// A concurrent mapping from keys to record slots.
///
/// Slots are created lazily on first access and never removed while the
/// database is live; an absent value is represented by a null payload.
#[derive(Default)]
pub(crate) struct PointIndex {
    map: HashIndex<Box<[u8]>, Arc<Record>>,
}

impl PointIndex {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the slot for `key` if one exists, without creating it.
    pub fn peek(&self, key: &[u8]) -> Option<Arc<Record>> {
        self.map.peek_with(key, |_, record| record.clone())
    }

    /// Returns the slot for `key`, creating it if absent.
    ///
    /// Concurrent creators for the same key converge on one slot.
    pub fn get_or_create(&self, key: &[u8]) -> Arc<Record> {
        if let Some(record) = self.map.peek_with(key, |_, record| record.clone()) {
            return record;
        }
        match self.map.entry(key.into()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let record = Arc::new(Record::default());
                entry.insert_entry(record.clone());
                record
            }
        }
    }
}

/// A record slot: payload bytes, a version word with an embedded lock bit,
/// and the read marker consulted by blind-write elision.
///
/// The payload is only replaced, never mutated in place, and only while the
/// lock bit is held. Retiring replaced buffers is the caller's business: the
/// buffer returned by [`install`] must stay allocated until every reader that
/// may have observed it has left its epoch.
///
/// [`install`]: #method.install
pub(crate) struct Record {
    buf: AtomicPtr<u8>,
    len: AtomicUsize,
    version: AtomicU64,
    read_marker: AtomicU64,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            buf: AtomicPtr::new(std::ptr::null_mut()),
            len: 0.into(),
            version: Version::ZERO.0.into(),
            read_marker: Version::ZERO.0.into(),
        }
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        let ptr = *self.buf.get_mut();
        if !ptr.is_null() {
            let len = *self.len.get_mut();
            let _ = unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) };
        }
    }
}

/// A consistent copy of a slot's payload and version.
pub(crate) struct RecordRead {
    pub value: Option<Box<[u8]>>,
    pub version: Version,
}

impl Record {
    /// Optimistically copies the payload, retrying until the version word is
    /// unlocked and unchanged across the observation.
    pub fn read(&self) -> RecordRead {
        let backoff = Backoff::new();
        loop {
            let before = Version(self.version.load(SeqCst));
            if before.is_locked() {
                backoff.snooze();
                continue;
            }

            let ptr = self.buf.load(SeqCst);
            let len = self.len.load(SeqCst);

            let after = Version(self.version.load(SeqCst));
            if before != after {
                backoff.spin();
                continue;
            }

            // The version was stable and unlocked across both loads, so ptr
            // and len belong to the same install. The pointee cannot be freed
            // while this worker's local epoch is pinned.
            let value = (!ptr.is_null())
                .then(|| unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec().into());
            return RecordRead {
                value,
                version: before,
            };
        }
    }

    pub fn peek_version(&self) -> Version {
        Version(self.version.load(SeqCst))
    }

    /// Acquires the lock bit, spinning with back-off.
    ///
    /// Returns the version word before the lock was taken.
    pub fn lock(&self) -> Version {
        let backoff = Backoff::new();
        loop {
            let current = Version(self.version.load(SeqCst));
            if current.is_locked() {
                backoff.snooze();
                continue;
            }
            let result = self.version.compare_exchange_weak(
                current.0,
                current.with_locked().0,
                SeqCst,
                SeqCst,
            );
            if result.is_ok() {
                return current;
            }
            backoff.spin();
        }
    }

    /// Releases the lock, restoring `version` as the published version word.
    pub fn unlock(&self, version: Version) {
        debug_assert!(self.peek_version().is_locked());
        debug_assert!(!version.is_locked());
        self.version.store(version.0, SeqCst);
    }

    /// Replaces the payload and publishes `version`, releasing the lock.
    ///
    /// The caller must hold the lock. Returns the replaced buffer, which the
    /// caller must retire through epoch-deferred reclamation.
    pub fn install(&self, value: &[u8], version: Version) -> Option<Box<[u8]>> {
        debug_assert!(self.peek_version().is_locked());
        debug_assert!(!version.is_locked());

        let boxed: Box<[u8]> = value.into();
        let new_len = boxed.len();
        let new_ptr = Box::into_raw(boxed).cast::<u8>();

        let prev_ptr = self.buf.swap(new_ptr, SeqCst);
        let prev_len = self.len.swap(new_len, SeqCst);

        // Publish the new version and unlock. Readers that raced the swaps
        // saw the lock bit and retried.
        self.version.store(version.0, SeqCst);

        (!prev_ptr.is_null())
            .then(|| unsafe { Box::from_raw(std::slice::from_raw_parts_mut(prev_ptr, prev_len)) })
    }

    /// The largest commit version any validated reader of this slot has
    /// published.
    pub fn read_marker(&self) -> Version {
        Version(self.read_marker.load(SeqCst))
    }

    pub fn mark_read(&self, version: Version) {
        debug_assert!(!version.is_locked());
        self.read_marker.fetch_max(version.0, SeqCst);
    }
}
