//! In-memory storage engine
//!
//! Collections live in a concurrent map keyed by collection name. Records
//! are kept when a collection is closed, mirroring the on-disk engine.

use crate::error::{StorageError, StorageResult};
use crate::query_native::{NativeQuery, Predicate};
use crate::storage::StorageEngine;
use crate::types::{NewObject, Object, ObjectId, ObjectPatch};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Volatile storage engine
#[derive(Default)]
pub struct MemoryStorage {
    collections: DashMap<String, BTreeMap<ObjectId, Object>>,
    open: RwLock<HashSet<String>>,
    calls: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Number of record operations served so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Names of the currently open collections, sorted
    pub fn open_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.open.read().iter().cloned().collect();
        names.sort();
        names
    }

    /// Number of stored records, open or not
    pub fn record_count(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    fn enter(&self, collection: &str) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.open.read().contains(collection) {
            Ok(())
        } else {
            Err(StorageError::CollectionClosed(collection.to_string()))
        }
    }

    fn snapshot(&self, collection: &str) -> Vec<Object> {
        self.collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl StorageEngine for MemoryStorage {
    fn initialize(&self, collections: &[String]) -> StorageResult<()> {
        let mut open = self.open.write();
        open.clear();
        open.extend(collections.iter().cloned());
        debug!(collections = collections.len(), "memory connection set initialized");
        Ok(())
    }

    fn teardown(&self) -> StorageResult<()> {
        self.open.write().clear();
        Ok(())
    }

    fn open_collection(&self, collection: &str) -> StorageResult<()> {
        self.open.write().insert(collection.to_string());
        Ok(())
    }

    fn close_collection(&self, collection: &str) -> StorageResult<()> {
        self.open.write().remove(collection);
        Ok(())
    }

    fn create(&self, collection: &str, object: NewObject) -> StorageResult<Object> {
        self.enter(collection)?;
        let object = object.into_object();
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(object.id.clone(), object.clone());
        Ok(object)
    }

    fn find_by_id(&self, collection: &str, id: &ObjectId) -> StorageResult<Option<Object>> {
        self.enter(collection)?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(id).cloned()))
    }

    fn find(&self, collection: &str, query: &NativeQuery) -> StorageResult<Vec<Object>> {
        self.enter(collection)?;
        Ok(query.execute(self.snapshot(collection)))
    }

    fn count(&self, collection: &str, predicate: &Predicate) -> StorageResult<u64> {
        self.enter(collection)?;
        Ok(self.collections.get(collection).map_or(0, |c| {
            c.values().filter(|o| predicate.matches(o)).count() as u64
        }))
    }

    fn update(&self, collection: &str, id: &ObjectId, patch: ObjectPatch) -> StorageResult<Option<Object>> {
        self.enter(collection)?;
        let Some(mut records) = self.collections.get_mut(collection) else {
            return Ok(None);
        };
        Ok(records.get_mut(id).map(|object| {
            object.apply(patch);
            object.clone()
        }))
    }

    fn delete(&self, collection: &str, id: &ObjectId) -> StorageResult<bool> {
        self.enter(collection)?;
        Ok(self
            .collections
            .get_mut(collection)
            .is_some_and(|mut c| c.remove(id).is_some()))
    }
}
