// Epoch framework is described in:
// Tu et al. 2013. Speedy transactions in multicore in-memory databases. https://doi.org/10.1145/2517349.2522713
// Chandramouli et al. 2018. FASTER: A Concurrent Key-Value Store with In-Place Updates. https://doi.org/10.1145/3183713.3196898

use crossbeam_utils::{Backoff, CachePadded};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

// All online local epochs are either global_epoch or global_epoch - 1.
// Thus global_epoch - 2 is the reclamation epoch.
const RECLAMATION_EPOCH_OFFSET: u32 = 2;

const OFFLINE_EPOCH: u32 = u32::MAX;

/// A unit of logical time for concurrency control and durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u32);

impl Epoch {
    pub const ZERO: Self = Self(0);

    pub const fn increment(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn decrement(self) -> Self {
        Self(self.0 - 1)
    }
}

/// A global epoch counter plus one local epoch per worker.
///
/// The global epoch is advanced in the background no faster than the
/// configured cadence. A worker publishes the global epoch it has observed
/// into its local epoch; the advance waits for stragglers, so online local
/// epochs are never more than one behind.
pub(crate) struct EpochFramework {
    shared: Arc<SharedState>,
    bumper: Option<JoinHandle<()>>,
}

struct SharedState {
    global_epoch: AtomicU32,
    local_epochs: Box<[CachePadded<AtomicU32>]>,
    epoch_duration: Duration,
    is_running: AtomicBool,
}

impl EpochFramework {
    pub fn new(initial_epoch: Epoch, epoch_duration: Duration, num_workers: usize) -> Self {
        // Ensure that reclamation_epoch > 0.
        let initial_epoch = initial_epoch.max(Epoch(RECLAMATION_EPOCH_OFFSET + 1));

        let local_epochs = (0..num_workers)
            .map(|_| CachePadded::new(AtomicU32::new(OFFLINE_EPOCH)))
            .collect();
        let shared = Arc::new(SharedState {
            global_epoch: initial_epoch.0.into(),
            local_epochs,
            epoch_duration,
            is_running: true.into(),
        });

        let bumper = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("epoch_bumper".into())
                .spawn(move || {
                    while shared.is_running.load(SeqCst) {
                        shared.wait_for_stragglers();
                        shared.global_epoch.fetch_add(1, SeqCst);
                        std::thread::sleep(shared.epoch_duration);
                    }
                })
                .unwrap()
        };

        Self {
            shared,
            bumper: Some(bumper),
        }
    }

    pub fn global_epoch(&self) -> Epoch {
        Epoch(self.shared.global_epoch.load(SeqCst))
    }

    pub fn epoch_duration(&self) -> Duration {
        self.shared.epoch_duration
    }

    /// Waits until every online worker has observed the current global epoch.
    pub fn sync(&self) {
        self.shared.wait_for_stragglers();
    }

    /// Blocks until the global epoch has advanced past `epoch`.
    ///
    /// Transactions beginning afterwards are stamped with strictly greater
    /// epochs than everything that committed up to `epoch`.
    pub fn wait_global_past(&self, epoch: Epoch) {
        while self.global_epoch() <= epoch {
            std::thread::sleep(self.shared.epoch_duration.min(Duration::from_millis(1)));
        }
    }

    /// Returns the handle through which worker `worker_id` participates in
    /// the framework.
    pub fn participant(&self, worker_id: usize) -> EpochParticipant<'_> {
        EpochParticipant {
            global_epoch: &self.shared.global_epoch,
            local_epoch: &self.shared.local_epochs[worker_id],
        }
    }
}

impl SharedState {
    fn wait_for_stragglers(&self) {
        let global_epoch = self.global_epoch.load(SeqCst);
        for local_epoch in self.local_epochs.iter() {
            let backoff = Backoff::new();
            while local_epoch.load(SeqCst) < global_epoch {
                backoff.snooze();
            }
        }
    }
}

impl Drop for EpochFramework {
    fn drop(&mut self) {
        self.shared.is_running.store(false, SeqCst);
        let _ = self.bumper.take().unwrap().join();
    }
}

/// A worker's view of the epoch framework.
pub(crate) struct EpochParticipant<'a> {
    global_epoch: &'a AtomicU32,
    local_epoch: &'a CachePadded<AtomicU32>,
}

impl EpochParticipant<'_> {
    /// Publishes the current global epoch as this worker's local epoch.
    ///
    /// Returns the observed global epoch.
    pub fn refresh(&self) -> Epoch {
        let epoch = self.global_epoch.load(SeqCst);
        self.local_epoch.store(epoch, SeqCst);
        Epoch(epoch)
    }

    /// Marks this worker as not participating until the next [`refresh`].
    ///
    /// [`refresh`]: #method.refresh
    pub fn release(&self) {
        self.local_epoch.store(OFFLINE_EPOCH, SeqCst);
    }

    pub fn global_epoch(&self) -> Epoch {
        Epoch(self.global_epoch.load(SeqCst))
    }

    /// The largest epoch no participant can still be in.
    ///
    /// A payload buffer retired at epoch E may be freed once the reclamation
    /// epoch reaches E: every reader that could hold a pointer into it has
    /// refreshed past E by then.
    pub fn reclamation_epoch(&self) -> Epoch {
        Epoch(self.global_epoch.load(SeqCst) - RECLAMATION_EPOCH_OFFSET)
    }
}

impl Drop for EpochParticipant<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
