use crate::{
    concurrency_control::ProtocolExecutor, transaction::Transaction, DatabaseInner, TxStatus,
};
use parking_lot::{Condvar, Mutex};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
};

pub(crate) type Procedure = Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send>;
pub(crate) type Callback = Box<dyn FnOnce(TxStatus) + Send>;

struct Job {
    procedure: Procedure,
    callback: Callback,
}

/// The fixed pool of worker threads transactions are scheduled on.
///
/// Each worker owns one protocol executor, one epoch participant, and one
/// log channel for its whole lifetime; a transaction runs on a single worker
/// from procedure to callback.
pub(crate) struct WorkerPool {
    job_tx: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    pub fn new(inner: &Arc<DatabaseInner>) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let in_flight = Arc::new(InFlight::default());

        let num_workers = inner.config.worker_threads.get();
        let workers = (0..num_workers)
            .map(|worker_id| {
                let inner = inner.clone();
                let job_rx = job_rx.clone();
                let in_flight = in_flight.clone();
                std::thread::Builder::new()
                    .name(format!("worker_{worker_id}"))
                    .spawn(move || run_worker(&inner, worker_id, &job_rx, &in_flight))
                    .unwrap()
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            workers,
            in_flight,
        }
    }

    pub fn execute(&self, procedure: Procedure, callback: Callback) {
        self.in_flight.submit();
        self.job_tx
            .as_ref()
            .unwrap()
            .send(Job {
                procedure,
                callback,
            })
            .unwrap();
    }

    /// Blocks until every submitted transaction has reached its final status
    /// and its callback has returned.
    pub fn wait_idle(&self) {
        self.in_flight.wait_idle();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.job_tx.take().unwrap();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    inner: &Arc<DatabaseInner>,
    worker_id: usize,
    job_rx: &crossbeam_channel::Receiver<Job>,
    in_flight: &InFlight,
) {
    let mut executor = ProtocolExecutor::new(
        inner.config.concurrency_control_protocol,
        &inner.index,
        inner.epoch_fw.participant(worker_id),
        worker_id as u8,
    );
    let log_writer = inner.log.as_ref().map(|log| log.writer(worker_id));

    while let Ok(job) = job_rx.recv() {
        let mut txn = Transaction::new(&mut executor);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| (job.procedure)(&mut txn)));
        if result.is_err() {
            tracing::warn!(worker_id, "transaction procedure panicked; aborting");
            txn.abort();
        }
        let status = txn.precommit(log_writer.as_ref());

        if std::panic::catch_unwind(AssertUnwindSafe(|| (job.callback)(status))).is_err() {
            tracing::warn!(worker_id, "transaction callback panicked");
        }
        in_flight.finish();
    }
}

/// Counts submitted-but-unfinished transactions. The counter itself is
/// lock-free; the mutex only serializes fence waiters against the final
/// wakeup.
#[derive(Default)]
struct InFlight {
    pending: AtomicUsize,
    idle_mutex: Mutex<()>,
    idle_condvar: Condvar,
}

impl InFlight {
    fn submit(&self) {
        self.pending.fetch_add(1, SeqCst);
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, SeqCst) == 1 {
            let _guard = self.idle_mutex.lock();
            self.idle_condvar.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.idle_mutex.lock();
        while self.pending.load(SeqCst) > 0 {
            self.idle_condvar.wait(&mut guard);
        }
    }
}
