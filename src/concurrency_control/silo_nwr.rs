use super::silo::SiloExecutor;
use crate::{epoch::EpochParticipant, index::PointIndex, log::LogWriter, TxStatus};

/// Silo extended with non-visible write reduction.
///
/// A blind write whose effect can never be observed is elided: this
/// transaction is serialized immediately before the overlapping writer that
/// produced the slot's current version, so its value is overwritten before
/// any validated reader can pin it. The version word is left untouched and
/// only the lock is released.
///
/// The elision test relies on commit versions dominating the dependency
/// order. Write-read and write-write edges do so by Silo's construction; for
/// read-write edges, every committed reader publishes its commit version into
/// the read marker of each slot it read, and writers fold the markers of
/// their write slots into their own version. A chain that orders the current
/// writer of a slot before this transaction therefore forces this
/// transaction's version above the slot's current one, and the test fails.
pub(crate) struct SiloNwrExecutor<'a> {
    base: SiloExecutor<'a>,
}

impl<'a> SiloNwrExecutor<'a> {
    pub fn new(index: &'a PointIndex, epoch: EpochParticipant<'a>, worker_id: u8) -> Self {
        Self {
            base: SiloExecutor::new(index, epoch, worker_id),
        }
    }

    pub fn begin_transaction(&mut self) {
        self.base.begin_transaction();
    }

    pub fn end_transaction(&mut self) {
        self.base.end_transaction();
    }

    pub fn read(&mut self, key: &[u8]) -> Option<&[u8]> {
        self.base.read(key)
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) {
        self.base.write(key, value);
    }

    pub fn precommit(&mut self, log_writer: Option<&LogWriter<'_>>) -> bool {
        let base = &mut self.base;
        let reserved = base.reserve_log_capacity(log_writer);

        // Phases 1 and 2 are Silo's.
        base.lock_write_set();
        let commit_epoch = base.epoch.refresh();
        if !base.validate_read_set() {
            return false;
        }

        let mut commit_version = base.generator.begin_transaction();
        for snapshot in base.read_set.iter() {
            commit_version.observe(snapshot.version);
        }

        // A write can only be non-visible if
        // - it is blind,
        // - the slot's current version was committed in this epoch
        //   (serialization within an epoch is flexible, epoch order is not),
        // - and that version appeared after the write was buffered, proving
        //   the writer overlapped this transaction; real-time order between
        //   non-overlapping transactions is never inverted.
        // At most one entry per transaction is considered, so the
        // transaction keeps a single serialization point even when it
        // installs other writes.
        let mut candidate = None;
        for (i, snapshot) in base.write_set.iter().enumerate() {
            let record = snapshot.record.as_ref().unwrap();
            commit_version.observe(record.read_marker());
            if candidate.is_none()
                && !snapshot.is_read_modify_write
                && snapshot.version.epoch() == commit_epoch
                && snapshot.version != snapshot.observed_version
            {
                candidate = Some(i);
            } else {
                commit_version.observe(snapshot.version);
            }
        }

        let mut elided = None;
        let new_version = match candidate {
            Some(i) => {
                let current = base.write_set.get(i).version;
                if commit_version.preview(commit_epoch) < current {
                    // Nothing orders the current writer before us; serialize
                    // immediately before it and skip the install.
                    elided = Some(i);
                } else {
                    commit_version.observe(current);
                }
                commit_version.finish(commit_epoch)
            }
            None => commit_version.finish(commit_epoch),
        };

        // Publish this transaction's reads, then re-validate them. A writer
        // that locked one of the read slots in between aborts us here; any
        // writer that locks later observes the markers.
        for snapshot in base.read_set.iter() {
            snapshot.record.as_ref().unwrap().mark_read(new_version);
        }
        if !base.validate_read_set() {
            return false;
        }

        // Install phase. Elided writes are still logged: their version is
        // below the current one, so replay keeps the overwrite.
        let mut entry = reserved.map(|reserved| reserved.begin_entry(new_version));
        let retire_epoch = base.epoch.global_epoch();
        for (i, snapshot) in base.write_set.iter().enumerate() {
            let value = snapshot.value().unwrap();
            if let Some(entry) = entry.as_mut() {
                entry.push_write(&snapshot.key, value);
            }
            let record = snapshot.record.as_ref().unwrap();
            if elided == Some(i) {
                record.unlock(snapshot.version);
            } else if let Some(buf) = record.install(value, new_version) {
                base.garbage.push_back((retire_epoch, buf));
            }
        }
        true
    }

    pub fn post_processing(&mut self, status: TxStatus) {
        self.base.post_processing(status);
    }
}

#[cfg(test)]
mod tests {
    use super::SiloNwrExecutor;
    use crate::{
        epoch::{Epoch, EpochFramework},
        index::PointIndex,
        version::Version,
        TxStatus,
    };
    use std::time::Duration;

    fn commit(executor: &mut SiloNwrExecutor<'_>) -> bool {
        let committed = executor.precommit(None);
        executor.post_processing(if committed {
            TxStatus::Committed
        } else {
            TxStatus::Aborted
        });
        executor.end_transaction();
        committed
    }

    #[test]
    fn blind_write_elision() {
        // An epoch long enough that the whole test runs within one epoch.
        let epoch_fw = EpochFramework::new(Epoch::ZERO, Duration::from_secs(3600), 2);
        let index = PointIndex::new();

        let mut first = SiloNwrExecutor::new(&index, epoch_fw.participant(0), 0);
        let mut second = SiloNwrExecutor::new(&index, epoch_fw.participant(1), 1);

        first.begin_transaction();
        first.write(b"alice", b"1");
        assert!(commit(&mut first));

        // The second transaction buffers its blind write, then an
        // overlapping transaction installs a newer version.
        second.begin_transaction();
        second.write(b"alice", b"3");
        first.begin_transaction();
        first.write(b"alice", b"2");
        assert!(commit(&mut first));
        let installed = index.get_or_create(b"alice").peek_version();
        assert_ne!(installed, Version::ZERO);

        // The blind write is non-visible: it serializes before the
        // overlapping writer, leaving version and value untouched.
        assert!(commit(&mut second));
        let record = index.get_or_create(b"alice");
        assert_eq!(record.peek_version(), installed);
        assert_eq!(record.read().value.as_deref(), Some(b"2".as_slice()));
    }

    #[test]
    fn sequential_blind_write_installs() {
        let epoch_fw = EpochFramework::new(Epoch::ZERO, Duration::from_secs(3600), 2);
        let index = PointIndex::new();

        let mut first = SiloNwrExecutor::new(&index, epoch_fw.participant(0), 0);
        let mut second = SiloNwrExecutor::new(&index, epoch_fw.participant(1), 1);

        first.begin_transaction();
        first.write(b"alice", b"1");
        assert!(commit(&mut first));

        // The earlier writer finished before this transaction buffered its
        // write, so the write must stay visible even within the same epoch.
        second.begin_transaction();
        second.write(b"alice", b"2");
        assert!(commit(&mut second));
        let record = index.get_or_create(b"alice");
        assert_eq!(record.read().value.as_deref(), Some(b"2".as_slice()));
    }

    #[test]
    fn read_modify_write_is_never_elided() {
        let epoch_fw = EpochFramework::new(Epoch::ZERO, Duration::from_secs(3600), 2);
        let index = PointIndex::new();

        let mut first = SiloNwrExecutor::new(&index, epoch_fw.participant(0), 0);
        let mut second = SiloNwrExecutor::new(&index, epoch_fw.participant(1), 1);

        first.begin_transaction();
        first.write(b"counter", b"1");
        assert!(commit(&mut first));
        let installed = index.get_or_create(b"counter").peek_version();

        second.begin_transaction();
        assert_eq!(second.read(b"counter"), Some(b"1".as_slice()));
        second.write(b"counter", b"2");
        assert!(commit(&mut second));

        let record = index.get_or_create(b"counter");
        assert!(record.peek_version() > installed);
        assert_eq!(record.read().value.as_deref(), Some(b"2".as_slice()));
    }

    #[test]
    fn marked_read_blocks_elision() {
        let epoch_fw = EpochFramework::new(Epoch::ZERO, Duration::from_secs(3600), 3);
        let index = PointIndex::new();

        let mut writer = SiloNwrExecutor::new(&index, epoch_fw.participant(0), 0);
        let mut reader = SiloNwrExecutor::new(&index, epoch_fw.participant(1), 1);
        let mut late = SiloNwrExecutor::new(&index, epoch_fw.participant(2), 2);

        writer.begin_transaction();
        writer.write(b"alice", b"0");
        assert!(commit(&mut writer));

        // Same shape as blind_write_elision up to here: the blind write is
        // buffered before an overlapping writer installs a newer version.
        late.begin_transaction();
        late.write(b"alice", b"2");
        writer.begin_transaction();
        writer.write(b"alice", b"1");
        assert!(commit(&mut writer));
        let installed = index.get_or_create(b"alice").peek_version();

        // But a committed reader of the installed version has published its
        // marker, which lifts the blind writer's version above the slot's
        // current one: the write installs instead of vanishing.
        reader.begin_transaction();
        assert_eq!(reader.read(b"alice"), Some(b"1".as_slice()));
        assert!(commit(&mut reader));

        assert!(commit(&mut late));
        let record = index.get_or_create(b"alice");
        assert!(record.peek_version() > installed);
        assert_eq!(record.read().value.as_deref(), Some(b"2".as_slice()));
    }
}
