use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

/// The concurrency control protocol used to order transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyControlProtocol {
    /// Optimistic concurrency control with per-record version validation.
    ///
    /// This is an implementation of [Silo](https://doi.org/10.1145/2517349.2522713).
    Silo,

    /// Silo extended with non-visible write reduction: a blind write whose
    /// effect can never be observed is elided instead of installed.
    #[default]
    SiloNwr,
}

/// Configuration of a [`Database`].
///
/// [`Database`]: crate::Database
#[derive(Debug, Clone)]
pub struct Config {
    /// The protocol used to validate and order transactions.
    ///
    /// Defaults to [`ConcurrencyControlProtocol::SiloNwr`].
    pub concurrency_control_protocol: ConcurrencyControlProtocol,

    /// Cadence of the background epoch advance, in milliseconds.
    ///
    /// Commit durability and [`fence`] latency scale with this value.
    /// Defaults to 40.
    ///
    /// [`fence`]: crate::Database::fence
    pub epoch_duration_ms: u64,

    /// Number of worker threads executing transactions. At most 256.
    ///
    /// Defaults to the available parallelism of the machine.
    pub worker_threads: NonZeroUsize,

    /// Whether committed write sets are appended to the redo log.
    ///
    /// Defaults to `true`.
    pub enable_logging: bool,

    /// Whether the redo log is replayed on open.
    ///
    /// Defaults to `true`.
    pub enable_recovery: bool,

    /// Directory holding the redo log and the durable epoch marker.
    ///
    /// Only accessed when logging or recovery is enabled.
    /// Defaults to `lineairdb_logs`.
    pub log_directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_control_protocol: Default::default(),
            epoch_duration_ms: 40,
            worker_threads: std::thread::available_parallelism()
                .unwrap_or(NonZeroUsize::new(4).unwrap()),
            enable_logging: true,
            enable_recovery: true,
            log_directory: "lineairdb_logs".into(),
        }
    }
}

impl Config {
    pub(crate) fn epoch_duration(&self) -> Duration {
        Duration::from_millis(self.epoch_duration_ms)
    }

    pub(crate) fn uses_log_directory(&self) -> bool {
        self.enable_logging || self.enable_recovery
    }
}
