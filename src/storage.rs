//! Storage engine contract and the RocksDB-backed engine
//!
//! The object store treats the engine as an opaque persistent store of
//! objects grouped in collections. The engine owns id and timestamp
//! assignment. Its connection set (which collections are open) is rebuilt
//! by the schema registry; records survive `teardown` and
//! `close_collection`, so objects of a removed class stay on disk.

use crate::config::StorageConfig;
use crate::error::{ParcelResult, StorageResult};
use crate::query_native::{NativeQuery, Predicate};
use crate::types::{NewObject, Object, ObjectId, ObjectPatch};
use std::sync::Arc;

/// Persistent object store consumed by the executor
pub trait StorageEngine: Send + Sync {
    /// Open the connection set with exactly these collections.
    fn initialize(&self, collections: &[String]) -> StorageResult<()>;

    /// Close every collection.
    fn teardown(&self) -> StorageResult<()>;

    fn open_collection(&self, collection: &str) -> StorageResult<()>;

    fn close_collection(&self, collection: &str) -> StorageResult<()>;

    /// Store a new object, assigning its id and timestamps.
    fn create(&self, collection: &str, object: NewObject) -> StorageResult<Object>;

    fn find_by_id(&self, collection: &str, id: &ObjectId) -> StorageResult<Option<Object>>;

    fn find(&self, collection: &str, query: &NativeQuery) -> StorageResult<Vec<Object>>;

    /// Number of objects matching, ignoring paging.
    fn count(&self, collection: &str, predicate: &Predicate) -> StorageResult<u64>;

    /// Apply a patch; `None` when the object does not exist.
    fn update(&self, collection: &str, id: &ObjectId, patch: ObjectPatch) -> StorageResult<Option<Object>>;

    /// Remove an object; `false` when it did not exist.
    fn delete(&self, collection: &str, id: &ObjectId) -> StorageResult<bool>;
}

/// Build the configured engine
pub fn open(config: &StorageConfig) -> ParcelResult<Arc<dyn StorageEngine>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(crate::memory_storage::MemoryStorage::new())),
        #[cfg(feature = "rocksdb")]
        StorageConfig::RocksDb { path } => Ok(Arc::new(rocks::RocksStorage::open(path)?)),
        #[cfg(not(feature = "rocksdb"))]
        StorageConfig::RocksDb { .. } => Err(crate::error::ParcelError::InvalidConfig(
            "built without the rocksdb feature".into(),
        )),
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksStorage;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::StorageEngine;
    use crate::error::{StorageError, StorageResult};
    use crate::query_native::{NativeQuery, Predicate};
    use crate::types::{NewObject, Object, ObjectId, ObjectPatch};
    use parking_lot::RwLock;
    use rocksdb::{Direction, IteratorMode, Options, DB};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Arc;
    use tracing::debug;

    /// Column families
    const CF_OBJECTS: &str = "objects";
    const CF_METADATA: &str = "metadata";

    /// Storage engine backed by RocksDB
    ///
    /// Objects are JSON-encoded under `o:{collection}:{id}`, so a collection
    /// is a contiguous key range scanned with a prefix iterator.
    pub struct RocksStorage {
        db: Arc<DB>,
        open: RwLock<HashSet<String>>,
    }

    impl RocksStorage {
        /// Open or create a database at the given path
        pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            // Performance tuning
            opts.set_max_background_jobs(4);
            opts.set_bytes_per_sync(1024 * 1024); // 1MB
            opts.increase_parallelism(num_cpus::get() as i32);
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

            let db = DB::open_cf(&opts, path, [CF_OBJECTS, CF_METADATA])
                .map_err(|e| StorageError::Backend(format!("failed to open database: {e}")))?;

            Ok(RocksStorage {
                db: Arc::new(db),
                open: RwLock::new(HashSet::new()),
            })
        }

        fn ensure_open(&self, collection: &str) -> StorageResult<()> {
            if self.open.read().contains(collection) {
                Ok(())
            } else {
                Err(StorageError::CollectionClosed(collection.to_string()))
            }
        }

        fn cf(&self) -> StorageResult<&rocksdb::ColumnFamily> {
            self.db
                .cf_handle(CF_OBJECTS)
                .ok_or_else(|| StorageError::Backend("object column family not found".into()))
        }

        fn put(&self, collection: &str, object: &Object) -> StorageResult<()> {
            let value = serde_json::to_vec(object)?;
            self.db
                .put_cf(self.cf()?, object_key(collection, &object.id), value)
                .map_err(|e| StorageError::Backend(format!("put error: {e}")))
        }

        fn get(&self, collection: &str, id: &ObjectId) -> StorageResult<Option<Object>> {
            match self.db.get_cf(self.cf()?, object_key(collection, id)) {
                Ok(Some(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Ok(None) => Ok(None),
                Err(e) => Err(StorageError::Backend(format!("get error: {e}"))),
            }
        }

        /// Scan every object of a collection
        fn scan(&self, collection: &str) -> StorageResult<Vec<Object>> {
            let prefix = collection_prefix(collection);
            let iter = self
                .db
                .iterator_cf(self.cf()?, IteratorMode::From(&prefix, Direction::Forward));

            let mut objects = Vec::new();
            for item in iter {
                let (key, value) = item.map_err(|e| StorageError::Backend(format!("iterator error: {e}")))?;
                if !key.starts_with(&prefix) {
                    break;
                }
                objects.push(serde_json::from_slice(&value)?);
            }
            Ok(objects)
        }
    }

    impl StorageEngine for RocksStorage {
        fn initialize(&self, collections: &[String]) -> StorageResult<()> {
            let mut open = self.open.write();
            open.clear();
            open.extend(collections.iter().cloned());
            debug!(collections = collections.len(), "rocksdb connection set initialized");
            Ok(())
        }

        fn teardown(&self) -> StorageResult<()> {
            self.open.write().clear();
            self.db
                .flush()
                .map_err(|e| StorageError::Backend(format!("flush error: {e}")))
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
            self.ensure_open(collection)?;
            let object = object.into_object();
            self.put(collection, &object)?;
            Ok(object)
        }

        fn find_by_id(&self, collection: &str, id: &ObjectId) -> StorageResult<Option<Object>> {
            self.ensure_open(collection)?;
            self.get(collection, id)
        }

        fn find(&self, collection: &str, query: &NativeQuery) -> StorageResult<Vec<Object>> {
            self.ensure_open(collection)?;
            Ok(query.execute(self.scan(collection)?))
        }

        fn count(&self, collection: &str, predicate: &Predicate) -> StorageResult<u64> {
            self.ensure_open(collection)?;
            Ok(self
                .scan(collection)?
                .iter()
                .filter(|o| predicate.matches(o))
                .count() as u64)
        }

        fn update(&self, collection: &str, id: &ObjectId, patch: ObjectPatch) -> StorageResult<Option<Object>> {
            self.ensure_open(collection)?;
            match self.get(collection, id)? {
                Some(mut object) => {
                    object.apply(patch);
                    self.put(collection, &object)?;
                    Ok(Some(object))
                }
                None => Ok(None),
            }
        }

        fn delete(&self, collection: &str, id: &ObjectId) -> StorageResult<bool> {
            self.ensure_open(collection)?;
            if self.get(collection, id)?.is_none() {
                return Ok(false);
            }
            self.db
                .delete_cf(self.cf()?, object_key(collection, id))
                .map_err(|e| StorageError::Backend(format!("delete error: {e}")))?;
            Ok(true)
        }
    }

    // Key encoding functions

    fn collection_prefix(collection: &str) -> Vec<u8> {
        format!("o:{}:", collection).into_bytes()
    }

    fn object_key(collection: &str, id: &ObjectId) -> Vec<u8> {
        format!("o:{}:{}", collection, id).into_bytes()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::types::Attributes;
        use serde_json::json;
        use tempfile::TempDir;

        fn new_object(class: &str, data: serde_json::Value) -> NewObject {
            let attributes: Attributes = serde_json::from_value(data).unwrap();
            NewObject {
                class_name: class.into(),
                attributes,
                acl: None,
            }
        }

        #[test]
        fn test_storage_roundtrip() {
            let temp_dir = TempDir::new().unwrap();
            let storage = RocksStorage::open(temp_dir.path()).unwrap();
            storage.initialize(&["player".to_string()]).unwrap();

            let created = storage.create("player", new_object("Player", json!({"name": "Alice"}))).unwrap();
            let retrieved = storage.find_by_id("player", &created.id).unwrap().unwrap();
            assert_eq!(retrieved, created);
        }

        #[test]
        fn test_records_survive_teardown() {
            let temp_dir = TempDir::new().unwrap();
            let storage = RocksStorage::open(temp_dir.path()).unwrap();
            storage.initialize(&["player".to_string(), "team".to_string()]).unwrap();

            let created = storage.create("player", new_object("Player", json!({"n": 1}))).unwrap();
            storage.create("team", new_object("Team", json!({"n": 2}))).unwrap();

            storage.teardown().unwrap();
            assert!(matches!(
                storage.find_by_id("player", &created.id),
                Err(StorageError::CollectionClosed(_))
            ));

            storage.initialize(&["player".to_string()]).unwrap();
            let all = storage.find("player", &NativeQuery::all()).unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(storage.count("player", &Predicate::True).unwrap(), 1);
        }
    }
}
