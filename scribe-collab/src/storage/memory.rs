//! In-process store. Default when no data directory is configured; state
//! lives as long as the process.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{DocumentStore, StoreError};
use crate::doc::{DocSnapshot, OpData};

#[derive(Debug)]
struct StoredDoc {
    snapshot: DocSnapshot,
    ops: Vec<OpData>,
}

/// HashMap-backed [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, StoredDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredDoc>>, StoreError> {
        self.docs
            .read()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredDoc>>, StoreError> {
        self.docs
            .write()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl DocumentStore for MemoryStore {
    fn create(&self, name: &str, data: &DocSnapshot) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        if docs.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        docs.insert(
            name.to_string(),
            StoredDoc {
                snapshot: data.clone(),
                ops: Vec::new(),
            },
        );
        Ok(())
    }

    fn get_snapshot(&self, name: &str) -> Result<DocSnapshot, StoreError> {
        self.read()?
            .get(name)
            .map(|d| d.snapshot.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn write_snapshot(&self, name: &str, data: &DocSnapshot) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        let doc = docs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        doc.snapshot = data.clone();
        Ok(())
    }

    fn write_op(&self, name: &str, op: &OpData) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        let doc = docs
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        doc.ops.push(op.clone());
        Ok(())
    }

    fn get_ops(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<OpData>, StoreError> {
        let docs = self.read()?;
        let doc = docs
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(doc
            .ops
            .iter()
            .filter(|op| op.v >= start && end.map_or(true, |end| op.v < end))
            .cloned()
            .collect())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.write()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
