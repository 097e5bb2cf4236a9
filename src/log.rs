//! Redo logging.
//!
//! Each worker owns a log channel. Committing transactions append their write
//! sets to the channel's current buffer; full buffers move to a flush queue
//! drained by a pool of flusher threads. A channel whose flushed entries all
//! carry epochs <= E makes E its durable epoch, and the global durable epoch
//! (persisted to `durable_epoch` in the log directory) is the minimum over
//! all channels.
//!
//! Architecture (single channel):
//!
//! ```text
//!                               +---- flush request ----+
//!                               |                       |
//!                               |                       v
//!             append          queue                   flush
//! LogWriter ---------> current_buf ----> flush_queue ------> file
//!                           ^                  |         |
//!                           |                  |         v
//!                           +--- free_bufs <---+   durable_epoch
//! ```

use crate::{
    epoch::{Epoch, EpochFramework},
    version::Version,
    Error, Result,
};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
};

pub(crate) const LOG_FILE_PREFIX: &str = "log_";
const DURABLE_EPOCH_FILE: &str = "durable_epoch";
const TMP_DURABLE_EPOCH_FILE: &str = "durable_epoch.tmp";

/// Removes all log state under `dir`. Used when a database is opened with
/// recovery disabled.
pub(crate) fn clear_log_files(dir: &Path) -> Result<()> {
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let is_log_state = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.starts_with(LOG_FILE_PREFIX)
                    || name == DURABLE_EPOCH_FILE
                    || name == TMP_DURABLE_EPOCH_FILE
            });
        if is_log_state {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

const NUM_FLUSHERS: usize = 4;
const BUF_CAPACITY: usize = 1024 * 1024;
const BUFS_PER_CHANNEL: usize = 8;

pub(crate) struct LogSystem {
    inner: Arc<LogInner>,
    flush_req_tx: Option<crossbeam_channel::Sender<usize>>,
    flushers: Vec<JoinHandle<()>>,
    daemon: Option<JoinHandle<()>>,
}

struct LogInner {
    channels: Vec<LogChannel>,
    persistent_epoch: PersistentEpoch,
    epoch_fw: Arc<EpochFramework>,
    is_running: AtomicBool,
}

impl LogSystem {
    pub fn new(
        dir: &Path,
        epoch_fw: Arc<EpochFramework>,
        persistent_epoch: PersistentEpoch,
        num_channels: usize,
    ) -> Result<Self> {
        let channels = (0..num_channels)
            .map(|index| LogChannel::new(dir, index, &epoch_fw))
            .collect::<Result<Vec<_>>>()?;
        let inner = Arc::new(LogInner {
            channels,
            persistent_epoch,
            epoch_fw,
            is_running: true.into(),
        });

        let (flush_req_tx, flush_req_rx) = crossbeam_channel::unbounded::<usize>();
        let flushers = (0..NUM_FLUSHERS)
            .map(|_| {
                let inner = inner.clone();
                let flush_req_rx = flush_req_rx.clone();
                std::thread::Builder::new()
                    .name("log_flusher".into())
                    .spawn(move || {
                        while let Ok(index) = flush_req_rx.recv() {
                            let channel = &inner.channels[index];
                            if channel.flush_queue.is_empty() {
                                // Already flushed while handling a previous
                                // request, or being flushed by another
                                // flusher.
                                continue;
                            }
                            let mut state = channel.flush_state.lock();
                            if let Err(e) = channel.flush(&mut state) {
                                tracing::error!("failed to flush the log: {e}");
                            }
                        }
                    })
                    .unwrap()
            })
            .collect();

        let daemon = {
            let inner = inner.clone();
            let flush_req_tx = flush_req_tx.clone();
            std::thread::Builder::new()
                .name("log_daemon".into())
                .spawn(move || run_daemon(&inner, &flush_req_tx))
                .unwrap()
        };

        Ok(Self {
            inner,
            flush_req_tx: Some(flush_req_tx),
            flushers,
            daemon: Some(daemon),
        })
    }

    pub fn writer(&self, worker_id: usize) -> LogWriter<'_> {
        LogWriter {
            channel: &self.inner.channels[worker_id],
            flush_req_tx: self.flush_req_tx.clone().unwrap(),
        }
    }

    /// Blocks until the global durable epoch reaches `epoch`.
    ///
    /// The daemon keeps bumping idle channels, so this completes within a few
    /// epoch durations even without further commits.
    pub fn wait_durable(&self, epoch: Epoch) {
        self.inner.persistent_epoch.wait_for(epoch);
    }

    /// Flushes all channels and republishes the global durable epoch.
    pub fn flush(&self) -> Result<Epoch> {
        self.inner.epoch_fw.sync();
        for channel in &self.inner.channels {
            // The append lock is held across the bump below: a writer that
            // reserves capacity afterwards observes its commit epoch after
            // this read of the global epoch, so its entries stay above the
            // bumped durable epoch.
            let mut write_state = channel.write_state.lock();
            if let Some(buf) = write_state.take_queueable_buf() {
                channel.queue(buf);
            }
            let mut flush_state = channel.flush_state.lock();
            channel.flush(&mut flush_state)?;

            let global_epoch = self.inner.epoch_fw.global_epoch();
            channel
                .durable_epoch
                .fetch_max(global_epoch.decrement().0, SeqCst);
        }
        self.inner.persistent_epoch.update(&self.inner.channels)
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.inner.is_running.store(false, SeqCst);
        self.flush_req_tx.take().unwrap();
        let _ = self.daemon.take().unwrap().join();
        for flusher in self.flushers.drain(..) {
            let _ = flusher.join();
        }
        if let Err(e) = self.flush() {
            tracing::error!("failed to flush the log on shutdown: {e}");
        }
    }
}

// The daemon serves the following purposes:
// 1. It periodically queues buffers that workers have stopped appending to,
//    so that a quiet channel still reaches the disk.
// 2. It bumps the durable epoch of channels with no activity, so that they
//    don't hold back the global durable epoch.
// 3. It republishes the global durable epoch.
fn run_daemon(inner: &LogInner, flush_req_tx: &crossbeam_channel::Sender<usize>) {
    while inner.is_running.load(SeqCst) {
        for channel in &inner.channels {
            // Failure of this lock means a writer is appending. The writer
            // queues the buffer by itself when it grows full.
            let Some(mut write_state) = channel.write_state.try_lock() else {
                continue;
            };
            if let Some(buf) = write_state.take_queueable_buf() {
                channel.queue(buf);
                let _ = flush_req_tx.send(channel.index);
                continue;
            }

            let Some(_flush_state) = channel.flush_state.try_lock() else {
                continue;
            };
            if channel.flush_queue.is_empty() {
                let global_epoch = inner.epoch_fw.global_epoch();
                channel
                    .durable_epoch
                    .fetch_max(global_epoch.decrement().0, SeqCst);
            }
        }
        if let Err(e) = inner.persistent_epoch.update(&inner.channels) {
            tracing::error!("failed to update the durable epoch: {e}");
        }
        std::thread::sleep(inner.epoch_fw.epoch_duration());
    }
}

/// The global durable epoch, persisted in the log directory.
pub(crate) struct PersistentEpoch {
    path: PathBuf,
    tmp_path: PathBuf,

    /// Also guards the file at `path`.
    durable_epoch: Mutex<Epoch>,

    update_condvar: Condvar,
}

impl PersistentEpoch {
    pub fn new(dir: &Path) -> Result<Self> {
        const FILE_SIZE: u64 = std::mem::size_of::<u32>() as u64;

        let path = dir.join(DURABLE_EPOCH_FILE);
        let epoch = match File::open(&path) {
            Ok(file) if file.metadata()?.len() != FILE_SIZE => {
                return Err(Error::DatabaseCorrupted)
            }
            Ok(mut file) => {
                let mut bytes = [0; FILE_SIZE as usize];
                file.read_exact(&mut bytes)?;
                u32::from_le_bytes(bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            tmp_path: dir.join(TMP_DURABLE_EPOCH_FILE),
            durable_epoch: Epoch(epoch).into(),
            update_condvar: Default::default(),
        })
    }

    pub fn get(&self) -> Epoch {
        *self.durable_epoch.lock()
    }

    fn wait_for(&self, epoch: Epoch) {
        let mut durable_epoch = self.durable_epoch.lock();
        self.update_condvar
            .wait_while(&mut durable_epoch, |durable_epoch| *durable_epoch < epoch);
    }

    /// Publishes the minimum durable epoch of all channels, persisting it
    /// with an atomic file replace.
    fn update(&self, channels: &[LogChannel]) -> Result<Epoch> {
        let mut guard = self.durable_epoch.lock();

        let new_epoch = channels
            .iter()
            .map(|channel| Epoch(channel.durable_epoch.load(SeqCst)))
            .min();
        let prev_epoch = *guard;
        let Some(new_epoch) = new_epoch else {
            return Ok(prev_epoch);
        };

        // Channel durable epochs never decrease, and a fresh channel starts
        // at global_epoch - 1 >= the previously persisted epoch.
        assert!(prev_epoch <= new_epoch);
        if new_epoch == prev_epoch {
            return Ok(new_epoch);
        }

        {
            let mut file = File::create(&self.tmp_path)?;
            file.write_all(&new_epoch.0.to_le_bytes())?;
            file.sync_data()?;
        }
        std::fs::rename(&self.tmp_path, &self.path)?;

        *guard = new_epoch;
        drop(guard);

        self.update_condvar.notify_all();
        Ok(new_epoch)
    }
}

/// A worker's handle for appending committed write sets to its channel.
pub(crate) struct LogWriter<'a> {
    channel: &'a LogChannel,
    flush_req_tx: crossbeam_channel::Sender<usize>,
}

impl LogWriter<'_> {
    pub fn reserve(&self) -> CapacityReserver<'_> {
        CapacityReserver {
            writer: self,
            num_bytes: std::mem::size_of::<u64>() * 2, // version and record count
        }
    }

    fn queue_and_request_flush(&self, buf: LogBuf) {
        self.channel.queue(buf);
        let _ = self.flush_req_tx.send(self.channel.index);
    }
}

/// Sizes an upcoming log entry so that buffer space is reserved in one step.
pub(crate) struct CapacityReserver<'a> {
    writer: &'a LogWriter<'a>,
    num_bytes: usize,
}

impl<'a> CapacityReserver<'a> {
    pub fn add_write(&mut self, key: &[u8], value: &[u8]) {
        self.num_bytes += key.len() + value.len() + std::mem::size_of::<u64>() * 2;
    }

    /// Takes the channel's append lock and makes room for the entry.
    ///
    /// The lock is held until the [`LogEntry`] is dropped, which keeps the
    /// daemon from declaring the channel idle while the owning transaction
    /// is between its serialization point and its append.
    pub fn finish(self) -> ReservedCapacity<'a> {
        let mut state = self.writer.channel.write_state.lock();
        let should_queue = state
            .current_buf
            .as_ref()
            .is_some_and(|buf| {
                !buf.bytes.is_empty() && buf.bytes.len() + self.num_bytes > BUF_CAPACITY
            });
        if should_queue {
            self.writer
                .queue_and_request_flush(state.current_buf.take().unwrap());
        }

        if state.current_buf.is_none() {
            let bytes = state.free_bufs_rx.recv().unwrap();
            assert!(bytes.is_empty());
            state.current_buf = Some(LogBuf::new(bytes));
        }

        // The buffer may exceed its preallocated capacity if a single
        // transaction is large enough.
        state
            .current_buf
            .as_mut()
            .unwrap()
            .bytes
            .reserve(self.num_bytes);

        ReservedCapacity {
            writer: self.writer,
            buf: MutexGuard::map(state, |state| &mut state.current_buf),
        }
    }
}

pub(crate) struct ReservedCapacity<'a> {
    writer: &'a LogWriter<'a>,
    buf: MappedMutexGuard<'a, Option<LogBuf>>,
}

impl<'a> ReservedCapacity<'a> {
    pub fn begin_entry(mut self, version: Version) -> LogEntry<'a> {
        let buf = self.buf.as_mut().unwrap();

        let epoch = version.epoch();
        let min_epoch = *buf.min_epoch.get_or_insert(epoch);
        assert!(min_epoch <= epoch);

        buf.bytes.extend_from_slice(&version.0.to_le_bytes());

        let num_records_offset = buf.bytes.len();
        buf.bytes.extend_from_slice(&u64::MAX.to_le_bytes()); // placeholder

        LogEntry {
            writer: self.writer,
            buf: self.buf,
            num_records_offset,
            num_records: 0,
        }
    }
}

/// An in-progress log entry for one committed transaction.
pub(crate) struct LogEntry<'a> {
    writer: &'a LogWriter<'a>,
    buf: MappedMutexGuard<'a, Option<LogBuf>>,
    num_records_offset: usize,
    num_records: u64,
}

impl LogEntry<'_> {
    pub fn push_write(&mut self, key: &[u8], value: &[u8]) {
        let bytes = &mut self.buf.as_mut().unwrap().bytes;
        bytes.extend_from_slice(&(key.len() as u64).to_le_bytes());
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(&(value.len() as u64).to_le_bytes());
        bytes.extend_from_slice(value);
        self.num_records += 1;
    }
}

impl Drop for LogEntry<'_> {
    fn drop(&mut self) {
        let buf = self.buf.as_mut().unwrap();
        buf.bytes[self.num_records_offset..][..std::mem::size_of::<u64>()]
            .copy_from_slice(&self.num_records.to_le_bytes());
        if buf.bytes.len() >= BUF_CAPACITY {
            self.writer
                .queue_and_request_flush(self.buf.take().unwrap());
        }
    }
}

struct WriteState {
    current_buf: Option<LogBuf>,
    free_bufs_rx: crossbeam_channel::Receiver<Vec<u8>>,
}

impl WriteState {
    fn take_queueable_buf(&mut self) -> Option<LogBuf> {
        if let Some(buf) = &self.current_buf {
            if !buf.bytes.is_empty() {
                assert!(buf.min_epoch.is_some());
                return self.current_buf.take();
            }
        }
        None
    }
}

struct FlushState {
    file: File,
    free_bufs_tx: crossbeam_channel::Sender<Vec<u8>>,
}

struct LogChannel {
    index: usize,
    flush_queue: ArrayQueue<LogBuf>,
    durable_epoch: AtomicU32,

    /// Also guards push to `flush_queue`.
    write_state: Mutex<WriteState>,

    /// Also guards pop from `flush_queue` and update of `durable_epoch`.
    flush_state: Mutex<FlushState>,
}

impl LogChannel {
    fn new(dir: &Path, index: usize, epoch_fw: &EpochFramework) -> Result<Self> {
        let path = dir.join(format!("{LOG_FILE_PREFIX}{index}"));
        let file = File::options().append(true).create(true).open(path)?;

        let (free_bufs_tx, free_bufs_rx) = crossbeam_channel::bounded(BUFS_PER_CHANNEL);
        for _ in 0..BUFS_PER_CHANNEL {
            free_bufs_tx.try_send(Vec::with_capacity(BUF_CAPACITY)).unwrap();
        }

        // The first buffer queued to this channel carries an epoch
        // >= the current global epoch.
        let durable_epoch = epoch_fw.global_epoch().decrement();

        Ok(Self {
            index,
            flush_queue: ArrayQueue::new(BUFS_PER_CHANNEL),
            durable_epoch: durable_epoch.0.into(),
            write_state: Mutex::new(WriteState {
                current_buf: Default::default(),
                free_bufs_rx,
            }),
            flush_state: Mutex::new(FlushState { file, free_bufs_tx }),
        })
    }

    fn queue(&self, buf: LogBuf) {
        assert!(!buf.bytes.is_empty());
        assert!(buf.min_epoch.is_some());
        self.flush_queue.push(buf).unwrap();
    }

    fn flush(&self, state: &mut FlushState) -> Result<()> {
        if self.flush_queue.is_empty() {
            return Ok(());
        }

        let mut min_epoch = None;
        let mut bufs_to_flush = Vec::with_capacity(BUFS_PER_CHANNEL);
        while let Some(buf) = self.flush_queue.pop() {
            // Epochs are queued in non-decreasing order, so the first buffer
            // carries the smallest epoch.
            let buf_min_epoch = buf.min_epoch.unwrap();
            assert!(min_epoch.map_or(true, |min| min <= buf_min_epoch));
            min_epoch.get_or_insert(buf_min_epoch);
            bufs_to_flush.push(buf.bytes);
        }

        // Epochs <= min_epoch - 1 can never be queued to this channel again,
        // so min_epoch - 1 is durable once the write below completes.
        let next_durable_epoch = min_epoch.unwrap().decrement();

        for bytes in &bufs_to_flush {
            state.file.write_all(bytes)?;
        }
        state.file.sync_data()?;

        for mut bytes in bufs_to_flush {
            bytes.clear();
            state.free_bufs_tx.try_send(bytes).unwrap();
        }

        self.durable_epoch.fetch_max(next_durable_epoch.0, SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct LogBuf {
    bytes: Vec<u8>,
    min_epoch: Option<Epoch>,
}

impl LogBuf {
    fn new(bytes: Vec<u8>) -> Self {
        assert!(bytes.is_empty());
        Self {
            bytes,
            min_epoch: None,
        }
    }
}
