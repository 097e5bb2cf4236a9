use crate::Epoch;

// Version word layout:
// bits[63:32] - epoch
// bits[31:9]  - sequence (distinguishes commits within the same epoch)
// bits[8:1]   - id of the worker that produced the version
// bit [0]     - lock
//
// The sequence sits above the worker id so that a version generated from the
// largest observed sequence is numerically greater than every same-epoch
// version produced by any worker. Plain u64 comparison of unlocked words is
// then a total order on (epoch, sequence, worker).

const EPOCH_SHIFT: u32 = 32;
const SEQUENCE_SHIFT: u32 = 9;
const WORKER_SHIFT: u32 = 1;
const SEQUENCE_MASK: u32 = (1 << (EPOCH_SHIFT - SEQUENCE_SHIFT)) - 1;
const LOCK: u64 = 0x1;

/// A record version and its lock bit, packed into one atomic word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Version(pub u64);

impl Version {
    /// The version of a slot that has never been installed.
    pub const ZERO: Self = Self(0);

    pub const fn epoch(self) -> Epoch {
        Epoch((self.0 >> EPOCH_SHIFT) as u32)
    }

    pub const fn sequence(self) -> u32 {
        ((self.0 >> SEQUENCE_SHIFT) as u32) & SEQUENCE_MASK
    }

    pub const fn worker(self) -> u8 {
        (self.0 >> WORKER_SHIFT) as u8
    }

    pub const fn is_locked(self) -> bool {
        self.0 & LOCK != 0
    }

    pub const fn with_locked(self) -> Self {
        Self(self.0 | LOCK)
    }

    pub const fn without_locked(self) -> Self {
        Self(self.0 & !LOCK)
    }

    const fn from_parts(epoch: Epoch, sequence: u32, worker: u8) -> Self {
        Self(
            ((epoch.0 as u64) << EPOCH_SHIFT)
                | ((sequence as u64) << SEQUENCE_SHIFT)
                | ((worker as u64) << WORKER_SHIFT),
        )
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("raw", &self.0)
            .field("epoch", &self.epoch())
            .field("sequence", &self.sequence())
            .field("worker", &self.worker())
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Per-worker generator of commit versions.
pub(crate) struct VersionGenerator {
    worker_id: u8,
    last: Version,
}

impl VersionGenerator {
    pub fn new(worker_id: u8) -> Self {
        Self {
            worker_id,
            last: Version::ZERO,
        }
    }

    /// Starts the commit version computation for one transaction.
    pub fn begin_transaction(&mut self) -> CommitVersion<'_> {
        // The commit version must be:
        // (b) greater than this worker's most recently produced version
        let floor = self.last;
        CommitVersion {
            generator: self,
            max_observed: floor,
        }
    }
}

/// Accumulates the versions a transaction has observed and produces a commit
/// version dominating all of them.
pub(crate) struct CommitVersion<'a> {
    generator: &'a mut VersionGenerator,
    max_observed: Version,
}

impl CommitVersion<'_> {
    /// Folds in a version the transaction has read, overwritten, or must
    /// otherwise be ordered after.
    ///
    /// The commit version must be:
    /// (a) greater than the version of any record in the footprint
    pub fn observe(&mut self, version: Version) {
        self.max_observed = self.max_observed.max(version.without_locked());
    }

    /// The version [`finish`] would currently produce, without committing to
    /// it.
    ///
    /// [`finish`]: #method.finish
    pub fn preview(&self, epoch: Epoch) -> Version {
        let observed_epoch = self.max_observed.epoch();
        assert!(observed_epoch <= epoch);

        // The commit version must be:
        // (c) in the epoch observed at the serialization point
        let sequence = if observed_epoch == epoch {
            let sequence = self.max_observed.sequence() + 1;
            assert!(sequence <= SEQUENCE_MASK);
            sequence
        } else {
            1
        };
        Version::from_parts(epoch, sequence, self.generator.worker_id)
    }

    pub fn finish(self, epoch: Epoch) -> Version {
        let version = self.preview(epoch);
        assert!(!version.is_locked());
        assert!(version > self.max_observed);
        self.generator.last = version;
        version
    }
}
