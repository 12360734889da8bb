//! Durable ordered record log with checksums and checkpoint markers.
//!
//! Grounded on `stratadb-labs-strata-core/crates/durability`'s segment/
//! record framing idiom (checksum-then-truncate recovery, `tracing` call
//! sites at open/append/recover boundaries) — oxigraph itself has no WAL of
//! its own (it defers durability to RocksDB), so this module is not adapted
//! from the primary teacher.

mod record;

pub use record::{LogRecord, Op, RECORD_LEN, VALID_TO_FOREVER};

use crate::error::{MercuryError, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Checkpoint triggers.
#[derive(Debug, Clone, Copy)]
pub struct WalConfig {
    pub size_threshold: u64,
    pub time_threshold: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            size_threshold: 64 * 1024 * 1024,
            time_threshold: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WalStats {
    pub record_count: u64,
    pub bytes: u64,
    pub last_checkpoint_tx: u64,
}

struct Inner {
    file: File,
    records: Vec<LogRecord>,
    next_tx_id: u64,
    last_checkpoint_tx: u64,
    active_batches: HashMap<u64, Vec<LogRecord>>,
    last_checkpoint_at: Instant,
}

/// A single-writer, append-only log of [`LogRecord`]s.
pub struct WriteAheadLog {
    path: PathBuf,
    config: WalConfig,
    inner: Mutex<Inner>,
}

impl WriteAheadLog {
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let (records, last_checkpoint_tx, truncated_at) = Self::recover(&mut file)?;
        if let Some(valid_len) = truncated_at {
            warn!(path = %path.display(), valid_len, "truncated torn WAL tail on open");
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;
        let next_tx_id = records.iter().map(|r| r.tx_id).max().map_or(1, |m| m + 1);
        info!(
            path = %path.display(),
            records = records.len(),
            last_checkpoint_tx,
            "opened write-ahead log"
        );
        Ok(Self {
            path,
            config,
            inner: Mutex::new(Inner {
                file,
                records,
                next_tx_id,
                last_checkpoint_tx,
                active_batches: HashMap::new(),
                last_checkpoint_at: Instant::now(),
            }),
        })
    }

    /// Scans forward validating checksums; returns the records accepted, the
    /// recovered `last_checkpoint_tx`, and — if a torn/invalid record was
    /// found — the byte length the file should be truncated to.
    fn recover(file: &mut File) -> Result<(Vec<LogRecord>, u64, Option<u64>)> {
        file.seek(SeekFrom::Start(0))?;
        let mut records = Vec::new();
        let mut last_checkpoint_tx = 0u64;
        let mut pos = 0u64;
        let mut buf = [0u8; RECORD_LEN];
        loop {
            match file.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok((records, last_checkpoint_tx, None));
                }
                Err(e) => return Err(e.into()),
            }
            match LogRecord::from_bytes(&buf) {
                Some(record) => {
                    if record.op == Op::Checkpoint {
                        last_checkpoint_tx = record.tx_id;
                    }
                    records.push(record);
                    pos += RECORD_LEN as u64;
                }
                None => return Ok((records, last_checkpoint_tx, Some(pos))),
            }
        }
    }

    /// Appends a single, immediately-committed record. Not part of a batch.
    pub fn append(&self, mut record: LogRecord) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let tx_id = inner.next_tx_id;
        inner.next_tx_id += 1;
        record.tx_id = tx_id;
        inner.file.write_all(&record.to_bytes())?;
        inner.file.sync_data()?;
        inner.records.push(record);
        debug!(tx_id, op = ?record.op, "appended WAL record");
        Ok(tx_id)
    }

    /// Starts a batch and returns its tx_id. Records appended via
    /// `append_batch` are buffered in memory and only reach disk on
    /// `commit_batch`, which keeps a crashed/rolled-back batch from ever
    /// appearing in the log.
    pub fn begin_batch(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let tx_id = inner.next_tx_id;
        inner.next_tx_id += 1;
        inner.active_batches.insert(tx_id, Vec::new());
        tx_id
    }

    pub fn append_batch(&self, mut record: LogRecord, tx_id: u64) -> Result<()> {
        record.tx_id = tx_id;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .active_batches
            .get_mut(&tx_id)
            .ok_or_else(|| {
                MercuryError::InvalidOperation(format!("no active batch with tx_id {tx_id}"))
            })?
            .push(record);
        Ok(())
    }

    /// Writes every buffered record for `tx_id` and fsyncs once.
    pub fn commit_batch(&self, tx_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let batch = inner.active_batches.remove(&tx_id).ok_or_else(|| {
            MercuryError::InvalidOperation(format!("no active batch with tx_id {tx_id}"))
        })?;
        for record in &batch {
            inner.file.write_all(&record.to_bytes())?;
        }
        inner.file.sync_data()?;
        let count = batch.len();
        inner.records.extend(batch);
        debug!(tx_id, records = count, "committed WAL batch");
        Ok(())
    }

    pub fn rollback_batch(&self, tx_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.active_batches.remove(&tx_id).ok_or_else(|| {
            MercuryError::InvalidOperation(format!("no active batch with tx_id {tx_id}"))
        })?;
        Ok(())
    }

    /// Writes a CHECKPOINT record whose tx_id equals the highest committed
    /// tx_id, and updates `last_checkpoint_tx`.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let highest_committed = inner
            .records
            .iter()
            .map(|r| r.tx_id)
            .max()
            .unwrap_or(0)
            .max(inner.last_checkpoint_tx);
        let record = LogRecord::checkpoint(highest_committed);
        inner.file.write_all(&record.to_bytes())?;
        inner.file.sync_data()?;
        inner.records.push(record);
        inner.last_checkpoint_tx = highest_committed;
        inner.last_checkpoint_at = Instant::now();
        info!(tx_id = highest_committed, "wrote checkpoint");
        Ok(highest_committed)
    }

    pub fn last_checkpoint_tx(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).last_checkpoint_tx
    }

    /// Records with `tx_id > last_checkpoint_tx`, excluding CHECKPOINT
    /// markers themselves.
    pub fn uncommitted_records(&self) -> Vec<LogRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .records
            .iter()
            .filter(|r| r.tx_id > inner.last_checkpoint_tx && r.op != Op::Checkpoint)
            .copied()
            .collect()
    }

    pub fn should_checkpoint(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let log_size = inner.records.len() as u64 * RECORD_LEN as u64;
        log_size >= self.config.size_threshold
            || inner.last_checkpoint_at.elapsed() >= self.config.time_threshold
    }

    pub fn stats(&self) -> WalStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        WalStats {
            record_count: inner.records.len() as u64,
            bytes: inner.records.len() as u64 * RECORD_LEN as u64,
            last_checkpoint_tx: inner.last_checkpoint_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_record(tx_id: u64) -> LogRecord {
        LogRecord {
            tx_id,
            op: Op::Add,
            subject_id: 1,
            predicate_id: 2,
            object_id: 3,
            graph_id: 0,
            valid_from_ticks: 0,
            valid_to_ticks: VALID_TO_FOREVER,
        }
    }

    #[test]
    fn append_assigns_increasing_tx_ids() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.log"), WalConfig::default()).unwrap();
        let t1 = wal.append(add_record(0)).unwrap();
        let t2 = wal.append(add_record(0)).unwrap();
        assert!(t2 > t1);
    }

    #[test]
    fn batch_is_invisible_until_committed() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.log"), WalConfig::default()).unwrap();
        let tx = wal.begin_batch();
        wal.append_batch(add_record(0), tx).unwrap();
        assert!(wal.uncommitted_records().is_empty());
        wal.commit_batch(tx).unwrap();
        assert_eq!(wal.uncommitted_records().len(), 1);
    }

    #[test]
    fn rolled_back_batch_never_appears_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = WriteAheadLog::open(&path, WalConfig::default()).unwrap();
            let tx = wal.begin_batch();
            wal.append_batch(add_record(0), tx).unwrap();
            wal.rollback_batch(tx).unwrap();
        }
        let wal = WriteAheadLog::open(&path, WalConfig::default()).unwrap();
        assert!(wal.uncommitted_records().is_empty());
    }

    #[test]
    fn recovery_truncates_torn_tail_and_keeps_valid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = WriteAheadLog::open(&path, WalConfig::default()).unwrap();
            wal.append(add_record(0)).unwrap();
            wal.append(add_record(0)).unwrap();
        }
        // Simulate a torn write: append a half-written record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xAB; 40]).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(&path, WalConfig::default()).unwrap();
        assert_eq!(wal.uncommitted_records().len(), 2);
    }

    #[test]
    fn checkpoint_records_highest_committed_tx() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("wal.log"), WalConfig::default()).unwrap();
        wal.append(add_record(0)).unwrap();
        let t2 = wal.append(add_record(0)).unwrap();
        let checkpointed = wal.checkpoint().unwrap();
        assert_eq!(checkpointed, t2);
        assert_eq!(wal.last_checkpoint_tx(), t2);
        assert!(wal.uncommitted_records().is_empty());
    }

    #[test]
    fn current_tx_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let last_tx = {
            let wal = WriteAheadLog::open(&path, WalConfig::default()).unwrap();
            wal.append(add_record(0)).unwrap();
            wal.append(add_record(0)).unwrap()
        };
        let wal = WriteAheadLog::open(&path, WalConfig::default()).unwrap();
        let next_tx = wal.append(add_record(0)).unwrap();
        assert_eq!(next_tx, last_tx + 1);
    }
}
