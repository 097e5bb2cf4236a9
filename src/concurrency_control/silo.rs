use crate::{
    epoch::{Epoch, EpochParticipant},
    index::{PointIndex, RecordRead},
    log::{LogEntry, LogWriter, ReservedCapacity},
    snapshot::{ReadSet, Snapshot, WriteSet},
    version::{Version, VersionGenerator},
    TxStatus,
};
use crossbeam_utils::Backoff;
use std::collections::VecDeque;

/// Optimistic concurrency control with per-record version validation.
///
/// This is an implementation of [Silo](https://doi.org/10.1145/2517349.2522713).
pub(crate) struct SiloExecutor<'a> {
    // Global state
    pub(super) index: &'a PointIndex,

    // Per-worker state
    pub(super) epoch: EpochParticipant<'a>,
    pub(super) generator: VersionGenerator,
    pub(super) garbage: VecDeque<(Epoch, Box<[u8]>)>,

    // Per-transaction state
    pub(super) read_set: ReadSet,
    pub(super) write_set: WriteSet,
}

impl<'a> SiloExecutor<'a> {
    pub fn new(index: &'a PointIndex, epoch: EpochParticipant<'a>, worker_id: u8) -> Self {
        Self {
            index,
            epoch,
            generator: VersionGenerator::new(worker_id),
            garbage: Default::default(),
            read_set: Default::default(),
            write_set: Default::default(),
        }
    }

    pub fn begin_transaction(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
        self.epoch.refresh();
    }

    pub fn end_transaction(&mut self) {
        self.epoch.release();
        self.reclaim_garbage();
    }

    pub fn read(&mut self, key: &[u8]) -> Option<&[u8]> {
        // Ensures read-your-writes.
        if let Some(i) = self.write_set.position(key) {
            return self.write_set.get(i).value();
        }

        // Ensures repeatable reads.
        if let Some(i) = self.read_set.position(key) {
            return self.read_set.get(i).value();
        }

        let record = self.index.get_or_create(key);
        let RecordRead { value, version } = record.read();
        self.read_set
            .push(Snapshot::pinned(key, value, version, record))
            .value()
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) {
        // A write of a previously read key turns the read into a
        // read-modify-write; the protocol must not treat it as blind.
        let mut is_read_modify_write = false;
        if let Some(snapshot) = self.read_set.find_mut(key) {
            snapshot.is_read_modify_write = true;
            is_read_modify_write = true;
        }

        if let Some(snapshot) = self.write_set.find_mut(key) {
            snapshot.reset(value);
            if is_read_modify_write {
                snapshot.is_read_modify_write = true;
            }
            return;
        }

        // Intent is only buffered here; the index is not mutated until
        // precommit. The slot version is sampled so that a later install of
        // the same key is known to come from an overlapping transaction.
        let observed_version = self
            .index
            .peek(key)
            .map(|record| record.peek_version().without_locked())
            .unwrap_or(Version::ZERO);
        self.write_set.push(Snapshot::buffered(
            key,
            value,
            is_read_modify_write,
            observed_version,
        ));
    }

    pub fn precommit(&mut self, log_writer: Option<&LogWriter<'_>>) -> bool {
        let reserved = self.reserve_log_capacity(log_writer);

        // Phase 1: lock the write set in slot order.
        self.lock_write_set();

        // Serialization point.
        let commit_epoch = self.epoch.refresh();

        // Phase 2: validate the read set.
        if !self.validate_read_set() {
            return false;
        }

        let mut commit_version = self.generator.begin_transaction();
        for snapshot in self.read_set.iter() {
            commit_version.observe(snapshot.version);
        }
        for snapshot in self.write_set.iter() {
            commit_version.observe(snapshot.version);
        }
        let new_version = commit_version.finish(commit_epoch);

        // Install phase: publish the new payloads and versions, releasing
        // the locks.
        let mut entry = reserved.map(|reserved| reserved.begin_entry(new_version));
        self.install_write_set(new_version, entry.as_mut());
        true
    }

    pub fn post_processing(&mut self, status: TxStatus) {
        if status == TxStatus::Aborted {
            self.release_write_locks();
        }
        self.read_set.clear();
        self.write_set.clear();
    }

    /// Reserves log capacity for the write set.
    ///
    /// The reservation pins the channel's append lock until the log entry is
    /// complete, so the commit epoch chosen at the serialization point can
    /// never fall behind the channel's durable epoch.
    pub(super) fn reserve_log_capacity<'w>(
        &self,
        log_writer: Option<&'w LogWriter<'w>>,
    ) -> Option<ReservedCapacity<'w>> {
        if self.write_set.is_empty() {
            return None;
        }
        log_writer.map(|writer| {
            let mut reserver = writer.reserve();
            for snapshot in self.write_set.iter() {
                reserver.add_write(&snapshot.key, snapshot.value().unwrap());
            }
            reserver.finish()
        })
    }

    /// Resolves the write set's slots and acquires their locks.
    ///
    /// Every transaction locks in the slot-address order established by
    /// [`WriteSet::sort_by_slot`], so no lock cycle is possible.
    ///
    /// [`WriteSet::sort_by_slot`]: crate::snapshot::WriteSet::sort_by_slot
    pub(super) fn lock_write_set(&mut self) {
        for snapshot in self.write_set.iter_mut() {
            snapshot.record = Some(self.index.get_or_create(&snapshot.key));
        }
        self.write_set.sort_by_slot();
        for snapshot in self.write_set.iter_mut() {
            snapshot.version = snapshot.record.as_ref().unwrap().lock();
        }
    }

    /// Checks that every read-set entry still carries its pinned version and
    /// is not locked by another transaction.
    pub(super) fn validate_read_set(&self) -> bool {
        for snapshot in self.read_set.iter() {
            let record = snapshot.record.as_ref().unwrap();
            let expected = if self.write_set.contains_record(record) {
                // Locked by this transaction in Phase 1.
                snapshot.version.with_locked()
            } else {
                snapshot.version
            };
            if record.peek_version() != expected {
                return false;
            }
        }
        true
    }

    fn install_write_set(&mut self, new_version: Version, mut entry: Option<&mut LogEntry<'_>>) {
        let retire_epoch = self.epoch.global_epoch();
        for snapshot in self.write_set.iter() {
            let value = snapshot.value().unwrap();
            if let Some(entry) = entry.as_mut() {
                entry.push_write(&snapshot.key, value);
            }
            let record = snapshot.record.as_ref().unwrap();
            if let Some(buf) = record.install(value, new_version) {
                self.garbage.push_back((retire_epoch, buf));
            }
        }
    }

    /// Restores the pre-lock version words of the write set.
    ///
    /// A write-set entry whose slot is resolved is locked: resolution and
    /// locking both happen in Phase 1, and an abort can only occur after the
    /// phase has completed.
    pub(super) fn release_write_locks(&mut self) {
        for snapshot in self.write_set.iter() {
            if let Some(record) = &snapshot.record {
                record.unlock(snapshot.version);
            }
        }
    }

    fn reclaim_garbage(&mut self) {
        let reclamation_epoch = self.epoch.reclamation_epoch();
        while let Some((epoch, _)) = self.garbage.front() {
            if *epoch > reclamation_epoch {
                break;
            }
            self.garbage.pop_front();
        }
    }
}

impl Drop for SiloExecutor<'_> {
    fn drop(&mut self) {
        // Retired buffers may still be observed by readers in earlier
        // epochs; wait for the reclamation epoch to pass them.
        let backoff = Backoff::new();
        while let Some((epoch, _)) = self.garbage.front() {
            if *epoch <= self.epoch.reclamation_epoch() {
                self.garbage.pop_front();
            } else {
                backoff.snooze();
            }
        }
    }
}
