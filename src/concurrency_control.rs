mod silo;
mod silo_nwr;

use crate::{
    config::ConcurrencyControlProtocol, epoch::EpochParticipant, index::PointIndex,
    log::LogWriter, TxStatus,
};
use silo::SiloExecutor;
use silo_nwr::SiloNwrExecutor;

/// The concurrency control executor bound to one worker.
///
/// A single executor is reused across all the transactions its worker runs,
/// so the read-set, write-set, and garbage buffers are allocated once per
/// worker rather than once per transaction. The variant is fixed by the
/// database configuration.
pub(crate) enum ProtocolExecutor<'a> {
    Silo(SiloExecutor<'a>),
    SiloNwr(SiloNwrExecutor<'a>),
}

impl<'a> ProtocolExecutor<'a> {
    pub fn new(
        protocol: ConcurrencyControlProtocol,
        index: &'a PointIndex,
        epoch: EpochParticipant<'a>,
        worker_id: u8,
    ) -> Self {
        match protocol {
            ConcurrencyControlProtocol::Silo => {
                Self::Silo(SiloExecutor::new(index, epoch, worker_id))
            }
            ConcurrencyControlProtocol::SiloNwr => {
                Self::SiloNwr(SiloNwrExecutor::new(index, epoch, worker_id))
            }
        }
    }

    pub fn begin_transaction(&mut self) {
        match self {
            Self::Silo(executor) => executor.begin_transaction(),
            Self::SiloNwr(executor) => executor.begin_transaction(),
        }
    }

    pub fn end_transaction(&mut self) {
        match self {
            Self::Silo(executor) => executor.end_transaction(),
            Self::SiloNwr(executor) => executor.end_transaction(),
        }
    }

    pub fn read(&mut self, key: &[u8]) -> Option<&[u8]> {
        match self {
            Self::Silo(executor) => executor.read(key),
            Self::SiloNwr(executor) => executor.read(key),
        }
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) {
        match self {
            Self::Silo(executor) => executor.write(key, value),
            Self::SiloNwr(executor) => executor.write(key, value),
        }
    }

    /// Validates the transaction and installs its writes.
    ///
    /// Returns `true` if the transaction committed.
    pub fn precommit(&mut self, log_writer: Option<&LogWriter<'_>>) -> bool {
        match self {
            Self::Silo(executor) => executor.precommit(log_writer),
            Self::SiloNwr(executor) => executor.precommit(log_writer),
        }
    }

    /// Finishes the transaction with its final status, releasing any locks
    /// still held and dropping the buffered sets.
    pub fn post_processing(&mut self, status: TxStatus) {
        match self {
            Self::Silo(executor) => executor.post_processing(status),
            Self::SiloNwr(executor) => executor.post_processing(status),
        }
    }
}
