//! Operation log: the ordering authority for coordinator operations
//!
//! Every node operation dispatched by the coordinator is stamped with an
//! [`OperationId`] drawn from an [`OperationLog`]. Ids are strictly
//! increasing and never reused, also under concurrent callers.
//!
//! File record format: [MAGIC][ID][TIMESTAMP_MS][CRC32]

use crate::common::{crc32, timestamp_now_millis, Error, Result, SyncPolicy};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const OPLOG_MAGIC: [u8; 4] = [0x4F, 0x50, 0x4C, 0x31]; // "OPL1"
const RECORD_LEN: usize = 4 + 8 + 8 + 4;

/// Identifier of one dispatched node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Source of operation ids.
pub trait OperationLog: Send + Sync {
    /// Assign the next id. Strictly greater than every id returned before.
    fn next_id(&self) -> Result<OperationId>;

    /// Last id handed out, if any.
    fn last_id(&self) -> Option<OperationId>;
}

/// Volatile operation log backed by an atomic counter.
#[derive(Debug, Default)]
pub struct MemOperationLog {
    next: AtomicU64,
}

impl MemOperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume numbering at `next`
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next),
        }
    }
}

impl OperationLog for MemOperationLog {
    fn next_id(&self) -> Result<OperationId> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map(OperationId)
            .map_err(Error::LogExhausted)
    }

    fn last_id(&self) -> Option<OperationId> {
        self.next.load(Ordering::SeqCst).checked_sub(1).map(OperationId)
    }
}

/// One durable entry of a [`FileOperationLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub id: OperationId,
    pub timestamp_ms: u64,
}

struct FileLogInner {
    file: File,
    /// Length of the prefix made of complete records
    valid_len: u64,
    next: u64,
    last: Option<OperationId>,
    sync_policy: SyncPolicy,
    /// Set when a failed append could not be rolled back
    failed: bool,
}

/// Append-only, crash-durable operation log.
pub struct FileOperationLog {
    path: PathBuf,
    inner: Mutex<FileLogInner>,
}

impl FileOperationLog {
    /// Open or create the log, resuming after the last valid record.
    /// A torn or corrupted tail is cut off so new records stay readable.
    pub fn open(path: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (last, valid_len) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "Truncating corrupted operation log tail"
            );
            file.set_len(valid_len)?;
        }

        let next = match last {
            Some(id) => id
                .value()
                .checked_add(1)
                .ok_or(Error::LogExhausted(id.value()))?,
            None => 0,
        };

        Ok(Self {
            path,
            inner: Mutex::new(FileLogInner {
                file,
                valid_len,
                next,
                last,
                sync_policy,
                failed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find the last valid record and the byte length of the valid prefix.
    fn scan(path: &Path) -> Result<(Option<OperationId>, u64)> {
        let mut last = None;
        let mut valid_len = 0u64;
        Self::replay(path, |record| {
            last = Some(record.id);
            valid_len += RECORD_LEN as u64;
            Ok(())
        })?;
        Ok((last, valid_len))
    }

    /// Replay log records in append order.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(LogRecord) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut previous: Option<OperationId> = None;

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(record)) => {
                    if previous.is_some_and(|p| record.id <= p) {
                        tracing::warn!(
                            id = %record.id,
                            "Operation log replay stopped at out-of-order record"
                        );
                        break;
                    }
                    previous = Some(record.id);
                    callback(record)?;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Operation log replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<LogRecord>> {
        let mut buf = [0u8; RECORD_LEN];
        match reader.read_exact(&mut buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if buf[..4] != OPLOG_MAGIC {
            return Err(Error::LogCorrupted("invalid record magic".into()));
        }

        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&buf[4..12]);
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&buf[12..20]);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&buf[20..24]);

        if crc32(&buf[4..20]) != u32::from_le_bytes(crc_bytes) {
            return Err(Error::LogCorrupted("checksum mismatch".into()));
        }

        Ok(Some(LogRecord {
            id: OperationId(u64::from_le_bytes(id_bytes)),
            timestamp_ms: u64::from_le_bytes(ts_bytes),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, FileLogInner> {
        // Appends either complete or leave `next` untouched, so a poisoned
        // guard still holds a consistent counter.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fsync regardless of the sync policy
    pub fn sync(&self) -> Result<()> {
        self.lock().file.sync_all()?;
        Ok(())
    }
}

impl FileLogInner {
    /// Write one record, or leave the file exactly as it was.
    fn append(&mut self, id: u64) -> Result<()> {
        if self.failed {
            return Err(Error::LogCorrupted(
                "operation log holds a partial append, reopen it".into(),
            ));
        }

        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&OPLOG_MAGIC);
        record[4..12].copy_from_slice(&id.to_le_bytes());
        record[12..20].copy_from_slice(&timestamp_now_millis().to_le_bytes());
        let checksum = crc32(&record[4..20]);
        record[20..24].copy_from_slice(&checksum.to_le_bytes());

        if let Err(e) = self.write_record(&record) {
            // A record that reached the file but failed to sync still has
            // to go, or a retry would log the same id twice.
            if let Err(rollback) = self.file.set_len(self.valid_len) {
                tracing::error!(
                    valid_len = self.valid_len,
                    error = %rollback,
                    "Failed to roll back operation log append"
                );
                self.failed = true;
            }
            return Err(e);
        }

        self.valid_len += RECORD_LEN as u64;
        Ok(())
    }

    fn write_record(&mut self, record: &[u8; RECORD_LEN]) -> Result<()> {
        self.file.write_all(record)?;
        if self.sync_policy == SyncPolicy::Always {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

impl OperationLog for FileOperationLog {
    fn next_id(&self) -> Result<OperationId> {
        let mut inner = self.lock();
        let id = inner.next;
        let next = id.checked_add(1).ok_or(Error::LogExhausted(id))?;

        inner.append(id)?;
        inner.next = next;
        inner.last = Some(OperationId(id));

        Ok(OperationId(id))
    }

    fn last_id(&self) -> Option<OperationId> {
        self.lock().last
    }
}

impl Drop for FileOperationLog {
    fn drop(&mut self) {
        let inner = self.lock();
        if inner.sync_policy == SyncPolicy::Interval && !inner.failed {
            if let Err(e) = inner.file.sync_all() {
                tracing::warn!("Failed to sync operation log on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_mem_log_sequence() {
        let log = MemOperationLog::new();
        assert_eq!(log.last_id(), None);

        assert_eq!(log.next_id().unwrap(), OperationId::new(0));
        assert_eq!(log.next_id().unwrap(), OperationId::new(1));
        assert_eq!(log.last_id(), Some(OperationId::new(1)));
    }

    #[test]
    fn test_mem_log_exhausted() {
        let log = MemOperationLog::starting_at(u64::MAX);
        assert!(matches!(log.next_id(), Err(Error::LogExhausted(_))));
        assert_eq!(log.last_id(), Some(OperationId::new(u64::MAX - 1)));
    }

    #[test]
    fn test_mem_log_concurrent_ids_are_distinct() {
        let log = Arc::new(MemOperationLog::new());
        let threads = 8;
        let per_thread = 1_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    let ids: Vec<OperationId> =
                        (0..per_thread).map(|_| log.next_id().unwrap()).collect();
                    // Monotonic as observed by a single caller
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(all.len(), threads * per_thread);
        assert_eq!(
            log.last_id(),
            Some(OperationId::new((threads * per_thread - 1) as u64))
        );
    }

    #[test]
    fn test_file_log_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops.log");

        {
            let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
            assert_eq!(log.last_id(), None);
            assert_eq!(log.next_id().unwrap(), OperationId::new(0));
            assert_eq!(log.next_id().unwrap(), OperationId::new(1));
        }

        {
            let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
            assert_eq!(log.last_id(), Some(OperationId::new(1)));
            assert_eq!(log.next_id().unwrap(), OperationId::new(2));
        }

        let mut ids = Vec::new();
        FileOperationLog::replay(&path, |record| {
            ids.push(record.id.value());
            Ok(())
        })
        .unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_file_log_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.log");

        {
            let log = FileOperationLog::open(&path, SyncPolicy::Never).unwrap();
            log.next_id().unwrap();
            log.next_id().unwrap();
            log.sync().unwrap();
        }

        // Half a record, as left behind by a crash mid-append
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&OPLOG_MAGIC).unwrap();
            file.write_all(&[0xAB; 5]).unwrap();
        }

        let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(log.last_id(), Some(OperationId::new(1)));
        assert_eq!(log.next_id().unwrap(), OperationId::new(2));
        drop(log);

        let mut count = 0;
        FileOperationLog::replay(&path, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            3 * RECORD_LEN as u64
        );
    }

    #[test]
    fn test_file_log_corrupted_checksum() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crc.log");

        {
            let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
            log.next_id().unwrap();
            log.next_id().unwrap();
        }

        // Flip one bit inside the second record's id
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[RECORD_LEN + 4] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(log.last_id(), Some(OperationId::new(0)));
        assert_eq!(log.next_id().unwrap(), OperationId::new(1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_file_log_failed_append_consumes_nothing() {
        let path = Path::new("/dev/full");
        if !path.exists() {
            return;
        }

        let log = FileOperationLog::open(path, SyncPolicy::Always).unwrap();
        assert!(log.next_id().is_err());
        assert!(log.next_id().is_err());

        assert_eq!(log.last_id(), None);
        let inner = log.lock();
        assert_eq!(inner.next, 0);
        assert_eq!(inner.valid_len, 0);
    }

    #[test]
    fn test_file_log_refuses_appends_after_failed_rollback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops.log");
        let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(log.next_id().unwrap(), OperationId::new(0));

        log.lock().failed = true;
        assert!(matches!(log.next_id(), Err(Error::LogCorrupted(_))));
        assert_eq!(log.last_id(), Some(OperationId::new(0)));
        drop(log);

        let log = FileOperationLog::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(log.next_id().unwrap(), OperationId::new(1));
    }

    #[test]
    fn test_replay_missing_file() {
        let dir = tempdir().unwrap();
        let mut called = false;
        FileOperationLog::replay(dir.path().join("absent.log"), |_| {
            called = true;
            Ok(())
        })
        .unwrap();
        assert!(!called);
    }
}
