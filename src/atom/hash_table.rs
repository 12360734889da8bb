//! Open-addressing, quadratic-probing hash table backing `AtomStore`,
//! stored in one `memmap2`-mapped file.
//!
//! Layout: an 8-byte capacity header followed by `capacity` 16-byte slots of
//! `(hash: u64 LE, id: u64 LE)`. `id == 0` marks an empty slot, which is safe
//! because atom id `0` is reserved for "absent" and never allocated.

use crate::atom::AtomId;
use crate::error::Result;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

const HEADER_LEN: u64 = 8;
const SLOT_LEN: u64 = 16;
const MAX_LOAD_FACTOR: f64 = 0.75;

pub struct HashTable {
    mmap: MmapMut,
    file: File,
    path: std::path::PathBuf,
    capacity: u64,
    count: u64,
}

impl HashTable {
    pub fn create(path: &Path, min_capacity: u64) -> Result<Self> {
        let capacity = min_capacity.max(16).next_power_of_two();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(HEADER_LEN + capacity * SLOT_LEN)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[0..8].copy_from_slice(&capacity.to_le_bytes());
        mmap.flush()?;
        Ok(Self {
            mmap,
            file,
            path: path.to_path_buf(),
            capacity,
            count: 0,
        })
    }

    pub fn open(path: &Path, expected_count: u64) -> Result<Self> {
        if !path.exists() {
            return Self::create(path, expected_count * 2);
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < HEADER_LEN as usize {
            drop(mmap);
            drop(file);
            return Self::create(path, expected_count * 2);
        }
        let capacity = u64::from_le_bytes(mmap[0..8].try_into().unwrap());
        if HEADER_LEN + capacity * SLOT_LEN != mmap.len() as u64 {
            drop(mmap);
            drop(file);
            return Self::create(path, expected_count * 2);
        }
        let count = (0..capacity)
            .filter(|&i| {
                let off = (HEADER_LEN + i * SLOT_LEN) as usize;
                u64::from_le_bytes(mmap[off + 8..off + 16].try_into().unwrap()) != 0
            })
            .count() as u64;
        Ok(Self {
            mmap,
            file,
            path: path.to_path_buf(),
            capacity,
            count,
        })
    }

    fn slot_offset(&self, index: u64) -> usize {
        (HEADER_LEN + index * SLOT_LEN) as usize
    }

    fn read_slot(&self, index: u64) -> (u64, AtomId) {
        let off = self.slot_offset(index);
        let hash = u64::from_le_bytes(self.mmap[off..off + 8].try_into().unwrap());
        let id = u64::from_le_bytes(self.mmap[off + 8..off + 16].try_into().unwrap());
        (hash, id)
    }

    fn write_slot(&mut self, index: u64, hash: u64, id: AtomId) {
        let off = self.slot_offset(index);
        self.mmap[off..off + 8].copy_from_slice(&hash.to_le_bytes());
        self.mmap[off + 8..off + 16].copy_from_slice(&id.to_le_bytes());
    }

    /// Number of occupied slots.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Probes for `hash`, calling `matches(id)` on every id sharing that
    /// hash until one returns `true` or an empty slot is reached.
    pub fn find(
        &self,
        hash: u64,
        mut matches: impl FnMut(AtomId) -> Result<bool>,
    ) -> Result<Option<AtomId>> {
        let mut i: u64 = 0;
        loop {
            let index = (hash.wrapping_add(i * (i + 1) / 2)) % self.capacity;
            let (slot_hash, slot_id) = self.read_slot(index);
            if slot_id == 0 {
                return Ok(None);
            }
            if slot_hash == hash && matches(slot_id)? {
                return Ok(Some(slot_id));
            }
            i += 1;
            if i > self.capacity {
                return Ok(None);
            }
        }
    }

    pub fn insert(&mut self, hash: u64, id: AtomId) -> Result<()> {
        if (self.len() + 1) as f64 > self.capacity as f64 * MAX_LOAD_FACTOR {
            self.resize(self.capacity * 2)?;
        }
        let mut i: u64 = 0;
        loop {
            let index = (hash.wrapping_add(i * (i + 1) / 2)) % self.capacity;
            let (_, slot_id) = self.read_slot(index);
            if slot_id == 0 {
                self.write_slot(index, hash, id);
                self.count += 1;
                self.mmap.flush()?;
                return Ok(());
            }
            i += 1;
        }
    }

    fn resize(&mut self, new_capacity: u64) -> Result<()> {
        let entries: Vec<(u64, AtomId)> = (0..self.capacity)
            .map(|i| self.read_slot(i))
            .filter(|(_, id)| *id != 0)
            .collect();
        let tmp_path = self.path.with_extension("hash.resize");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;
        file.set_len(HEADER_LEN + new_capacity * SLOT_LEN)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[0..8].copy_from_slice(&new_capacity.to_le_bytes());
        self.mmap = mmap;
        self.capacity = new_capacity;
        for (hash, id) in entries {
            let mut i: u64 = 0;
            loop {
                let index = (hash.wrapping_add(i * (i + 1) / 2)) % self.capacity;
                let (_, slot_id) = self.read_slot(index);
                if slot_id == 0 {
                    self.write_slot(index, hash, id);
                    break;
                }
                i += 1;
            }
        }
        self.mmap.flush()?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoms.hash");
        let mut table = HashTable::create(&path, 16).unwrap();
        table.insert(42, 1).unwrap();
        table.insert(42, 2).unwrap();
        let found = table.find(42, |id| Ok(id == 2)).unwrap();
        assert_eq!(found, Some(2));
    }

    #[test]
    fn find_returns_none_for_absent_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoms.hash");
        let table = HashTable::create(&path, 16).unwrap();
        assert_eq!(table.find(7, |_| Ok(true)).unwrap(), None);
    }

    #[test]
    fn resizes_when_load_factor_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoms.hash");
        let mut table = HashTable::create(&path, 16).unwrap();
        for i in 1..40 {
            table.insert(i * 7, i).unwrap();
        }
        assert!(table.capacity >= 40);
        for i in 1..40 {
            assert_eq!(table.find(i * 7, |id| Ok(id == i)).unwrap(), Some(i));
        }
    }
}
