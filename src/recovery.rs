//! Log replay on open.
//!
//! Every log file in the directory is scanned in one pass. Entries with
//! epochs up to the persisted durable epoch are applied, keeping the highest
//! version per key. The first entry beyond the durable epoch (or a torn
//! entry from an interrupted flush) truncates the file at its offset, so a
//! later open never resurrects a commit this open has already disowned.

use crate::{
    epoch::Epoch,
    index::PointIndex,
    log::LOG_FILE_PREFIX,
    version::Version,
    Result,
};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

/// Replays all log files under `dir` into `index`.
///
/// Returns the largest epoch applied, which the epoch framework must resume
/// above.
pub(crate) fn recover(dir: &Path, index: &PointIndex, durable_epoch: Epoch) -> Result<Epoch> {
    let mut max_epoch = durable_epoch;
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let is_log_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log_file {
            continue;
        }
        let applied = replay_file(&path, index, durable_epoch)?;
        max_epoch = max_epoch.max(applied);
    }
    Ok(max_epoch)
}

fn replay_file(path: &Path, index: &PointIndex, durable_epoch: Epoch) -> Result<Epoch> {
    let file = File::options().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut max_epoch = Epoch::ZERO;
    let mut num_entries = 0u64;
    let mut offset = 0u64;
    loop {
        match read_entry(&mut reader, index, durable_epoch) {
            Ok(Some((end_offset, epoch))) => {
                offset += end_offset;
                max_epoch = max_epoch.max(epoch);
                num_entries += 1;
            }
            Ok(None) => break,
            Err(ReplayError::Io(e)) => return Err(e.into()),
            Err(ReplayError::Torn) => {
                // A flush was interrupted mid-entry, or the entry was never
                // durable. Cut the tail so it cannot reappear later.
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    "truncating log tail beyond the durable epoch"
                );
                reader.get_ref().set_len(offset)?;
                break;
            }
        }
        if offset >= len {
            break;
        }
    }

    tracing::debug!(path = %path.display(), num_entries, "replayed log file");
    Ok(max_epoch)
}

enum ReplayError {
    Io(std::io::Error),
    Torn,
}

impl From<std::io::Error> for ReplayError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::Torn,
            _ => Self::Io(e),
        }
    }
}

/// Reads and applies one log entry.
///
/// Returns the number of bytes consumed and the entry's epoch, or `None` at
/// a clean end of file.
fn read_entry<R: Read>(
    reader: &mut R,
    index: &PointIndex,
    durable_epoch: Epoch,
) -> std::result::Result<Option<(u64, Epoch)>, ReplayError> {
    let mut word = [0; std::mem::size_of::<u64>()];
    match reader.read_exact(&mut word) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let version = Version(u64::from_le_bytes(word));
    let epoch = version.epoch();
    if version.is_locked() || epoch > durable_epoch {
        // Lock bits are never logged; treat garbage the same way as an
        // entry that was not durable at the crash.
        return Err(ReplayError::Torn);
    }

    reader.read_exact(&mut word)?;
    let num_records = u64::from_le_bytes(word);

    // Parse the whole entry before applying anything, so a torn tail never
    // leaves a half-applied transaction behind.
    let mut consumed = (std::mem::size_of::<u64>() * 2) as u64;
    let mut writes = Vec::with_capacity(num_records.min(1024) as usize);
    for _ in 0..num_records {
        let key = read_bytes(reader)?;
        let value = read_bytes(reader)?;
        consumed += (std::mem::size_of::<u64>() * 2 + key.len() + value.len()) as u64;
        writes.push((key, value));
    }

    for (key, value) in writes {
        let record = index.get_or_create(&key);
        if record.peek_version() < version {
            record.lock();
            record.install(&value, version);
        }
    }
    Ok(Some((consumed, epoch)))
}

fn read_bytes<R: Read>(reader: &mut R) -> std::result::Result<Vec<u8>, ReplayError> {
    let mut word = [0; std::mem::size_of::<u64>()];
    reader.read_exact(&mut word)?;
    let len = u64::from_le_bytes(word);
    if len > u32::MAX as u64 {
        // No payload this large is ever written; the entry is garbage.
        return Err(ReplayError::Torn);
    }
    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}
