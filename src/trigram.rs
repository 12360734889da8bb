//! Trigram-accelerated substring search over interned literal text.
//!
//! No teacher file covers this (oxigraph has no `text:match`); the on-disk
//! shape (length-prefixed postings behind a dictionary of offsets) follows
//! `AtomStore`'s own data-file/index-file split for consistency within this
//! crate rather than any external source.

use crate::atom::AtomId;
use crate::error::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// A 3-byte window over lowercased text, used as the postings-list key.
pub type Trigram = [u8; 3];

fn trigrams_of(text: &str) -> impl Iterator<Item = Trigram> + '_ {
    let lower: Vec<u8> = text.bytes().map(|b| b.to_ascii_lowercase()).collect();
    (0..lower.len().saturating_sub(2)).map(move |i| [lower[i], lower[i + 1], lower[i + 2]])
}

struct Postings {
    by_trigram: FxHashMap<Trigram, BTreeSet<AtomId>>,
}

/// Maps 3-byte lowercased windows to the set of atom ids whose literal text
/// contains them. `candidates()` narrows a query to atoms worth a full
/// substring check; it never returns false negatives.
pub struct TrigramIndex {
    dir: PathBuf,
    postings: RwLock<Postings>,
}

const DICT_FILE: &str = "trigram.dict";
const IDX_FILE: &str = "trigram.idx";

impl TrigramIndex {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let postings = Self::load(&dir)?;
        Ok(Self {
            dir,
            postings: RwLock::new(postings),
        })
    }

    fn load(dir: &Path) -> Result<Postings> {
        let dict_path = dir.join(DICT_FILE);
        let idx_path = dir.join(IDX_FILE);
        let mut by_trigram = FxHashMap::default();
        if dict_path.exists() && idx_path.exists() {
            let dict = fs::read(&dict_path)?;
            let mut idx = File::open(&idx_path)?;
            let mut buf = Vec::new();
            idx.read_to_end(&mut buf)?;
            let mut pos = 0usize;
            while pos + 3 + 4 <= buf.len() {
                let trigram: Trigram = [buf[pos], buf[pos + 1], buf[pos + 2]];
                let count = u32::from_le_bytes(buf[pos + 3..pos + 7].try_into().unwrap()) as usize;
                pos += 7;
                let mut ids = BTreeSet::new();
                for _ in 0..count {
                    let dict_off = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                    pos += 4;
                    let id = u64::from_le_bytes(dict[dict_off..dict_off + 8].try_into().unwrap());
                    ids.insert(id);
                }
                by_trigram.insert(trigram, ids);
            }
        }
        Ok(Postings { by_trigram })
    }

    /// Indexes `text` under `atom_id`, so later `candidates()` calls
    /// containing any of its trigrams will include it.
    pub fn index(&self, atom_id: AtomId, text: &str) {
        let mut postings = self.postings.write().unwrap_or_else(|e| e.into_inner());
        for trigram in trigrams_of(text) {
            postings
                .by_trigram
                .entry(trigram)
                .or_default()
                .insert(atom_id);
        }
    }

    pub fn remove(&self, atom_id: AtomId, text: &str) {
        let mut postings = self.postings.write().unwrap_or_else(|e| e.into_inner());
        for trigram in trigrams_of(text) {
            if let Some(ids) = postings.by_trigram.get_mut(&trigram) {
                ids.remove(&atom_id);
            }
        }
    }

    /// Atoms whose text contains every trigram of `needle`. Callers must
    /// still confirm the substring match themselves: this is a superset.
    pub fn candidates(&self, needle: &str) -> BTreeSet<AtomId> {
        let postings = self.postings.read().unwrap_or_else(|e| e.into_inner());
        let mut wanted = trigrams_of(needle);
        let Some(first) = wanted.next() else {
            return BTreeSet::new();
        };
        let mut result = postings
            .by_trigram
            .get(&first)
            .cloned()
            .unwrap_or_default();
        for trigram in wanted {
            let Some(ids) = postings.by_trigram.get(&trigram) else {
                return BTreeSet::new();
            };
            result.retain(|id| ids.contains(id));
            if result.is_empty() {
                break;
            }
        }
        result
    }

    /// Snapshots the full postings map to `trigram.dict`/`trigram.idx`.
    pub fn persist(&self) -> Result<()> {
        let postings = self.postings.read().unwrap_or_else(|e| e.into_inner());
        let mut dict = Vec::new();
        let mut dict_offsets: FxHashMap<AtomId, u32> = FxHashMap::default();
        let mut all_ids: BTreeSet<AtomId> = BTreeSet::new();
        for ids in postings.by_trigram.values() {
            all_ids.extend(ids.iter().copied());
        }
        for id in &all_ids {
            dict_offsets.insert(*id, dict.len() as u32);
            dict.extend_from_slice(&id.to_le_bytes());
        }

        let idx_path = self.dir.join(IDX_FILE);
        let mut idx = BufWriter::new(File::create(&idx_path)?);
        for (trigram, ids) in &postings.by_trigram {
            idx.write_all(trigram)?;
            idx.write_all(&(ids.len() as u32).to_le_bytes())?;
            for id in ids {
                idx.write_all(&dict_offsets[id].to_le_bytes())?;
            }
        }
        idx.flush()?;

        fs::write(self.dir.join(DICT_FILE), &dict)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_finds_atom_containing_all_query_trigrams() {
        let dir = tempfile::tempdir().unwrap();
        let index = TrigramIndex::open(dir.path()).unwrap();
        index.index(1, "the quick brown fox");
        index.index(2, "lazy dog sleeps");
        let hits = index.candidates("quick");
        assert!(hits.contains(&1));
        assert!(!hits.contains(&2));
    }

    #[test]
    fn candidates_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let index = TrigramIndex::open(dir.path()).unwrap();
        index.index(1, "Quick Brown Fox");
        assert!(index.candidates("quick").contains(&1));
        assert!(index.candidates("QUICK").contains(&1));
    }

    #[test]
    fn remove_drops_atom_from_postings() {
        let dir = tempfile::tempdir().unwrap();
        let index = TrigramIndex::open(dir.path()).unwrap();
        index.index(1, "quick brown fox");
        index.remove(1, "quick brown fox");
        assert!(index.candidates("quick").is_empty());
    }

    #[test]
    fn persist_and_reopen_round_trips_postings() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = TrigramIndex::open(dir.path()).unwrap();
            index.index(1, "quick brown fox");
            index.index(2, "brown bear");
            index.persist().unwrap();
        }
        let reopened = TrigramIndex::open(dir.path()).unwrap();
        let hits = reopened.candidates("brown");
        assert!(hits.contains(&1));
        assert!(hits.contains(&2));
    }

    #[test]
    fn short_needle_without_full_trigram_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = TrigramIndex::open(dir.path()).unwrap();
        index.index(1, "ab");
        assert!(index.candidates("ab").is_empty());
    }
}
