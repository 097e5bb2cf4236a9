use crate::{concurrency_control::ProtocolExecutor, log::LogWriter, TxStatus};

/// A transaction handle passed to user procedures.
///
/// All operations go through the worker's protocol executor; the handle only
/// enforces terminality of [`abort`].
///
/// [`abort`]: #method.abort
pub struct Transaction<'db, 'worker> {
    executor: &'worker mut ProtocolExecutor<'db>,
    user_aborted: bool,
}

impl<'db, 'worker> Transaction<'db, 'worker> {
    pub(crate) fn new(executor: &'worker mut ProtocolExecutor<'db>) -> Self {
        executor.begin_transaction();
        Self {
            executor,
            user_aborted: false,
        }
    }

    /// Returns the value corresponding to the key, or `None` if the key does
    /// not exist.
    ///
    /// A read of a key this transaction has written returns the written
    /// bytes; repeated reads of the same key return the same bytes. After
    /// [`abort`], reads return `None`.
    ///
    /// [`abort`]: #method.abort
    pub fn read(&mut self, key: &[u8]) -> Option<&[u8]> {
        if self.user_aborted {
            return None;
        }
        self.executor.read(key)
    }

    /// Buffers a write of `value` under `key`.
    ///
    /// Nothing becomes visible to other transactions unless the transaction
    /// commits. After [`abort`], writes are ignored.
    ///
    /// [`abort`]: #method.abort
    pub fn write(&mut self, key: &[u8], value: &[u8]) {
        if self.user_aborted {
            return;
        }
        self.executor.write(key, value);
    }

    /// Marks the transaction as aborted.
    ///
    /// This is terminal: subsequent reads and writes are no-ops, and the
    /// transaction finishes with [`TxStatus::Aborted`]. No locks are held
    /// between user calls, so there is nothing to release here.
    pub fn abort(&mut self) {
        self.user_aborted = true;
    }

    pub(crate) fn precommit(self, log_writer: Option<&LogWriter<'_>>) -> TxStatus {
        let status = if self.user_aborted {
            TxStatus::Aborted
        } else if self.executor.precommit(log_writer) {
            TxStatus::Committed
        } else {
            TxStatus::Aborted
        };
        self.executor.post_processing(status);
        self.executor.end_transaction();
        status
    }
}
