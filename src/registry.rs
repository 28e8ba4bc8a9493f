//! Schema registry
//!
//! Owns the set of loaded classes and the storage connection set backing
//! them. Features:
//! - Case-insensitive class lookup returning shared handles
//! - Single-writer discipline: load, unload and reload take the write lock
//! - Snapshots: CRUD calls hold a read guard across their storage calls, so
//!   they never see a half torn-down connection set
//! - Handle liveness: unloading a class invalidates handles already handed out

use crate::acl::{Acl, AclSubject};
use crate::error::{ParcelError, ParcelResult};
use crate::schema::{meta_class_definition, ClassDefinition};
use crate::storage::StorageEngine;
use crate::types::{collection_name, META_CLASS, SYSTEM_ATTRIBUTES};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

/// Live handle on a loaded class
#[derive(Debug)]
pub struct ClassHandle {
    definition: ClassDefinition,
    key: String,
    collection: String,
    generation: u64,
    live: AtomicBool,
}

impl ClassHandle {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ClassDefinition {
        &self.definition
    }

    /// Storage collection of this class
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Load counter value at the time the class was loaded
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once the class has been unloaded
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_meta(&self) -> bool {
        self.definition.name == META_CLASS
    }
}

impl AclSubject for ClassHandle {
    fn acl(&self) -> Option<&Acl> {
        self.definition.acl.as_ref()
    }

    fn is_class_row(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct RegistryState {
    classes: HashMap<String, Arc<ClassHandle>>,
}

impl RegistryState {
    fn lookup(&self, name: &str) -> ParcelResult<Arc<ClassHandle>> {
        self.classes
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| ParcelError::ClassNotFound(name.to_string()))
    }

    fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.values().map(|h| h.collection.clone()).collect();
        names.sort();
        names
    }
}

/// Process-wide registry of loaded classes, owned by the service
pub struct SchemaRegistry {
    state: Arc<RwLock<RegistryState>>,
    storage: Arc<dyn StorageEngine>,
    generation: AtomicU64,
}

impl SchemaRegistry {
    /// Create a registry holding only the meta-class
    pub async fn open(storage: Arc<dyn StorageEngine>, meta_acl: Acl) -> ParcelResult<Self> {
        let registry = SchemaRegistry {
            state: Arc::new(RwLock::new(RegistryState::default())),
            storage,
            generation: AtomicU64::new(0),
        };
        registry
            .load_class(meta_class_definition().with_acl(meta_acl))
            .await?;
        registry.reload().await?;
        Ok(registry)
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Register a class and open its collection
    pub async fn load_class(&self, definition: ClassDefinition) -> ParcelResult<Arc<ClassHandle>> {
        check_definition(&definition)?;

        let mut state = self.state.write().await;
        let key = definition.name.to_lowercase();
        if state.classes.contains_key(&key) {
            return Err(ParcelError::DuplicateClass(definition.name));
        }

        let collection = collection_name(&definition.name);
        self.storage.open_collection(&collection)?;

        let handle = Arc::new(ClassHandle {
            key: key.clone(),
            collection,
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            live: AtomicBool::new(true),
            definition,
        });
        state.classes.insert(key, handle.clone());

        info!(class = %handle.name(), generation = handle.generation, "class loaded");
        Ok(handle)
    }

    /// Remove a class; handles already handed out stop working
    pub async fn unload_class(&self, name: &str) -> ParcelResult<()> {
        if name.eq_ignore_ascii_case(META_CLASS) {
            return Err(ParcelError::InvalidClass(format!("{META_CLASS} cannot be unloaded")));
        }

        let mut state = self.state.write().await;
        let handle = state
            .classes
            .remove(&name.to_lowercase())
            .ok_or_else(|| ParcelError::ClassNotFound(name.to_string()))?;
        handle.live.store(false, Ordering::Release);

        if let Err(e) = self.storage.close_collection(&handle.collection) {
            warn!(class = %handle.name(), error = %e, "failed to close collection");
        }

        info!(class = %handle.name(), "class unloaded");
        Ok(())
    }

    /// Tear down and rebuild the connection set from the loaded classes
    pub async fn reload(&self) -> ParcelResult<()> {
        let state = self.state.write().await;
        let collections = state.collections();

        self.storage.teardown()?;
        self.storage.initialize(&collections)?;

        debug!(collections = collections.len(), "connection set reloaded");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> ParcelResult<Arc<ClassHandle>> {
        self.state.read().await.lookup(name)
    }

    /// Load each definition independently; failures are logged and skipped.
    pub async fn load_all<I>(&self, definitions: I) -> Vec<Arc<ClassHandle>>
    where
        I: IntoIterator<Item = ClassDefinition>,
    {
        let mut loaded = Vec::new();
        for definition in definitions {
            let name = definition.name.clone();
            match self.load_class(definition).await {
                Ok(handle) => loaded.push(handle),
                Err(e) => warn!(class = %name, error = %e, "skipping class"),
            }
        }
        loaded
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.state.read().await.lookup(name).is_ok()
    }

    /// Loaded class names, sorted
    pub async fn class_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.classes.values().map(|h| h.name().to_string()).collect();
        names.sort();
        names
    }

    pub async fn definitions(&self) -> Vec<ClassDefinition> {
        let state = self.state.read().await;
        let mut definitions: Vec<ClassDefinition> =
            state.classes.values().map(|h| h.definition.clone()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Consistent view of the registry, blocking mutations while held
    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            guard: self.state.clone().read_owned().await,
            storage: self.storage.clone(),
        }
    }
}

/// Read guard over the registry, paired with the storage engine
pub struct RegistrySnapshot {
    guard: OwnedRwLockReadGuard<RegistryState>,
    storage: Arc<dyn StorageEngine>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> ParcelResult<Arc<ClassHandle>> {
        self.guard.lookup(name)
    }

    /// Fail with `ClassNotFound` unless the handle is the one currently loaded
    pub fn validate(&self, handle: &ClassHandle) -> ParcelResult<()> {
        let current = self.guard.classes.get(&handle.key);
        match current {
            Some(loaded) if handle.is_live() && std::ptr::eq(Arc::as_ptr(loaded), handle) => Ok(()),
            _ => Err(ParcelError::ClassNotFound(handle.name().to_string())),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }
}

fn check_definition(definition: &ClassDefinition) -> ParcelResult<()> {
    if definition.name.trim().is_empty() {
        return Err(ParcelError::InvalidClass("no name specified".into()));
    }
    if let Some(reserved) = definition
        .attributes
        .keys()
        .find(|name| SYSTEM_ATTRIBUTES.contains(&name.as_str()))
    {
        return Err(ParcelError::InvalidClass(format!(
            "{}: attribute '{}' is reserved",
            definition.name, reserved
        )));
    }
    Ok(())
}
