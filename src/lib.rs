//! An embedded, in-memory, transactional key-value store.
//!
//! Transactions are procedures submitted with a completion callback. The
//! database schedules each procedure on a worker thread, runs it against a
//! serializable optimistic concurrency control protocol, and invokes the
//! callback with the final status.
//!
//! ```
//! use lineair::{Config, Database, TxStatus};
//! use std::sync::mpsc;
//!
//! let config = Config {
//!     enable_logging: false,
//!     enable_recovery: false,
//!     ..Default::default()
//! };
//! let db = Database::open(config).unwrap();
//!
//! let (status_tx, status_rx) = mpsc::channel();
//! db.execute_transaction(
//!     |tx| {
//!         assert!(tx.read(b"alice").is_none());
//!         tx.write(b"alice", b"foo");
//!     },
//!     move |status| status_tx.send(status).unwrap(),
//! );
//! assert_eq!(status_rx.recv().unwrap(), TxStatus::Committed);
//!
//! db.fence();
//! ```

mod concurrency_control;
mod config;
mod dir_lock;
mod epoch;
mod index;
mod log;
mod recovery;
mod snapshot;
mod transaction;
mod version;
mod worker;

pub use config::{Config, ConcurrencyControlProtocol};
pub use transaction::Transaction;

pub(crate) use epoch::Epoch;

use dir_lock::DirectoryLock;
use epoch::EpochFramework;
use index::PointIndex;
use log::{LogSystem, PersistentEpoch};
use std::sync::Arc;
use worker::WorkerPool;

/// The number of worker threads a version word can distinguish.
const MAX_WORKERS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The log directory is locked by another database instance.
    #[error("database is already open")]
    DatabaseAlreadyOpen,

    /// The files in the log directory are not a valid database.
    #[error("database is corrupted")]
    DatabaseCorrupted,

    /// `worker_threads` exceeds the supported maximum.
    #[error("configuration allows at most {MAX_WORKERS} worker threads")]
    TooManyWorkers,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The final status a transaction's callback observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Committed,
    Aborted,
}

/// An embedded transactional key-value database.
pub struct Database {
    // Declared before `inner` so that workers are joined while the epoch
    // framework is still advancing: executors drain their retired buffers
    // on drop.
    pool: WorkerPool,
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    config: Config,
    index: PointIndex,
    log: Option<LogSystem>,
    epoch_fw: Arc<EpochFramework>,
    _lock: Option<DirectoryLock>,
}

impl Database {
    /// Opens a database with the given configuration.
    ///
    /// When recovery is enabled, the redo log under
    /// [`Config::log_directory`] is replayed before any transaction runs.
    /// When recovery is disabled, previous log contents are discarded.
    pub fn open(config: Config) -> Result<Self> {
        let num_workers = config.worker_threads.get();
        if num_workers > MAX_WORKERS {
            return Err(Error::TooManyWorkers);
        }

        let index = PointIndex::new();
        let mut initial_epoch = Epoch::ZERO;
        let mut lock = None;
        let mut persistent_epoch = None;
        if config.uses_log_directory() {
            let dir = &config.log_directory;
            std::fs::create_dir_all(dir)?;
            lock = Some(DirectoryLock::acquire(dir)?);

            if !config.enable_recovery {
                log::clear_log_files(dir)?;
            }

            let persistent = PersistentEpoch::new(dir)?;
            if config.enable_recovery {
                let durable_epoch = persistent.get();
                let recovered = recovery::recover(dir, &index, durable_epoch)?;
                initial_epoch = recovered.increment();
                tracing::info!(
                    durable_epoch = durable_epoch.0,
                    "replayed redo log"
                );
            }
            persistent_epoch = Some(persistent);
        }

        let epoch_fw = Arc::new(EpochFramework::new(
            initial_epoch,
            config.epoch_duration(),
            num_workers,
        ));

        let log = if config.enable_logging {
            Some(LogSystem::new(
                &config.log_directory,
                epoch_fw.clone(),
                persistent_epoch.take().unwrap(),
                num_workers,
            )?)
        } else {
            None
        };

        let inner = Arc::new(DatabaseInner {
            config,
            index,
            log,
            epoch_fw,
            _lock: lock,
        });
        let pool = WorkerPool::new(&inner);
        Ok(Self { pool, inner })
    }

    /// Schedules `procedure` as a transaction.
    ///
    /// The procedure runs on a worker thread; when it returns, the
    /// transaction is validated and `callback` is invoked with
    /// [`TxStatus::Committed`] or [`TxStatus::Aborted`], on a worker thread
    /// and in no particular order relative to other transactions. A
    /// procedure that panics is treated as a user abort.
    pub fn execute_transaction<P, C>(&self, procedure: P, callback: C)
    where
        P: FnOnce(&mut Transaction<'_, '_>) + Send + 'static,
        C: FnOnce(TxStatus) + Send + 'static,
    {
        self.pool.execute(Box::new(procedure), Box::new(callback));
    }

    /// Blocks until every transaction submitted before the call has reached
    /// its final status and, when logging is enabled, its writes are
    /// durable.
    ///
    /// The fence also waits out the current epoch, so transactions submitted
    /// afterwards are ordered strictly after everything it covered.
    pub fn fence(&self) {
        self.pool.wait_idle();
        let epoch = self.inner.epoch_fw.global_epoch();
        self.inner.epoch_fw.wait_global_past(epoch);
        if let Some(log) = &self.inner.log {
            log.wait_durable(epoch);
        }
    }

    /// Returns the configuration the database was opened with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}
