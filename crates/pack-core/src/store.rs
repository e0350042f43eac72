//! Persistence for committed pack records.
//!
//! Stores only ever see complete [`Pack`] values; readers never observe a
//! half-written record.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PackError, PackResult};
use crate::pack::Pack;

pub trait PackStore: Send + Sync {
    fn get(&self, id: &str) -> PackResult<Option<Pack>>;
    fn list(&self) -> PackResult<Vec<Pack>>;
    /// Insert or replace the record for `pack.id` as a single unit.
    fn commit(&self, pack: &Pack) -> PackResult<()>;
    fn remove(&self, id: &str) -> PackResult<Option<Pack>>;
}

#[derive(Debug, Default)]
pub struct MemoryPackStore {
    packs: RwLock<BTreeMap<String, Pack>>,
}

impl MemoryPackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackStore for MemoryPackStore {
    fn get(&self, id: &str) -> PackResult<Option<Pack>> {
        Ok(self.packs.read().get(id).cloned())
    }

    fn list(&self) -> PackResult<Vec<Pack>> {
        Ok(self.packs.read().values().cloned().collect())
    }

    fn commit(&self, pack: &Pack) -> PackResult<()> {
        self.packs.write().insert(pack.id.clone(), pack.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> PackResult<Option<Pack>> {
        Ok(self.packs.write().remove(id))
    }
}

/// One JSON document per pack under `<root>/records`, written via tmp + rename.
#[derive(Clone, Debug)]
pub struct FsPackStore {
    root: PathBuf,
}

impl FsPackStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.records_dir().join(format!("{}.json", record_file_stem(id)))
    }

    fn tmp_path(&self, id: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("tmp_{}_{}", Uuid::new_v4().simple(), record_file_stem(id)))
    }

    fn read_record(path: &Path) -> PackResult<Pack> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| PackError::Store(format!("corrupt record {}: {err}", path.display())))
    }
}

impl PackStore for FsPackStore {
    fn get(&self, id: &str) -> PackResult<Option<Pack>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn list(&self) -> PackResult<Vec<Pack>> {
        let dir = self.records_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut packs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            packs.push(Self::read_record(&path)?);
        }
        packs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(packs)
    }

    fn commit(&self, pack: &Pack) -> PackResult<()> {
        fs::create_dir_all(self.records_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        let json = serde_json::to_vec_pretty(pack)
            .map_err(|err| PackError::Store(format!("failed to serialize record: {err}")))?;
        let tmp = self.tmp_path(&pack.id);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.record_path(&pack.id))?;
        Ok(())
    }

    fn remove(&self, id: &str) -> PackResult<Option<Pack>> {
        let existing = self.get(id)?;
        if existing.is_some() {
            fs::remove_file(self.record_path(id))?;
        }
        Ok(existing)
    }
}

fn record_file_stem(id: &str) -> String {
    id.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
