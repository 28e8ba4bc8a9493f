//! Object service
//!
//! The boundary handed to the routing layer. Every operation runs as an
//! actor and is authorized in two steps: the class-level ACL first, then the
//! ACL of the object read or written. Responses are public JSON, with
//! protected attributes removed.

use crate::acl::{permits, require, Acl, AclSubject, Actor, Operation};
use crate::auth::AccountService;
use crate::config::ServiceConfig;
use crate::error::{ParcelError, ParcelResult};
use crate::executor::{is_embedded, Executor};
use crate::hasher::Argon2Hasher;
use crate::query_filter::Filter;
use crate::query_translator::QueryOptions;
use crate::registry::{ClassHandle, RegistrySnapshot, SchemaRegistry};
use crate::session::SessionResolver;
use crate::storage::{self, StorageEngine};
use crate::types::{Attributes, Object, ObjectId, META_CLASS, RESERVED_CLASSES};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Query response in public form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Authorized object store
pub struct ObjectService {
    executor: Arc<Executor>,
    sessions: SessionResolver,
    accounts: AccountService,
}

impl ObjectService {
    /// Open the configured storage engine and start the service
    pub async fn from_config(config: ServiceConfig) -> ParcelResult<Self> {
        let storage = storage::open(&config.storage)?;
        ObjectService::open(storage, config).await
    }

    /// Start the service: load the meta-class, replay the stored class
    /// definitions, then create the default classes if asked to.
    pub async fn open(storage: Arc<dyn StorageEngine>, config: ServiceConfig) -> ParcelResult<Self> {
        let registry = Arc::new(SchemaRegistry::open(storage, config.meta_class_acl.clone()).await?);
        let executor = Arc::new(Executor::new(registry.clone()));

        let stored = executor.stored_definitions().await?;
        let total = stored.len();
        let loaded = registry.load_all(stored).await;
        registry.reload().await?;
        info!(loaded = loaded.len(), stored = total, "stored classes loaded");

        if config.bootstrap_default_classes {
            executor.bootstrap_default_classes().await?;
        }

        let hasher = Arc::new(Argon2Hasher::new(&config.password_hash)?);
        Ok(ObjectService {
            sessions: SessionResolver::new(executor.clone()),
            accounts: AccountService::new(
                executor.clone(),
                hasher,
                Duration::from_millis(config.login_failure_delay_ms),
            ),
            executor,
        })
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.executor.registry()
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    /// Resolve the actor of a request from its session token
    pub async fn authenticate(&self, token: Option<&str>) -> ParcelResult<Actor> {
        self.sessions.resolve(token).await
    }

    pub async fn query(&self, actor: &Actor, class_name: &str, options: &QueryOptions) -> ParcelResult<QueryResponse> {
        let handle = self.registry().get(class_name).await?;
        require(handle.as_ref(), actor, Operation::Find)?;
        if !actor.is_master() {
            check_query_paths(&handle, options)?;
        }

        let result = self.executor.query_handle(&handle, options).await?;
        let snapshot = self.registry().snapshot().await;
        let results = result
            .results
            .iter()
            .filter(|object| permits(*object, actor, Operation::Read))
            .map(|object| present(&snapshot, actor, &handle, object))
            .collect();

        Ok(QueryResponse {
            results,
            count: result.count,
        })
    }

    pub async fn get(&self, actor: &Actor, class_name: &str, id: &ObjectId) -> ParcelResult<Value> {
        let handle = self.registry().get(class_name).await?;
        require(handle.as_ref(), actor, Operation::Get)?;

        let object = self.executor.get_handle(&handle, id).await?;
        require(&object, actor, Operation::Read)?;

        let snapshot = self.registry().snapshot().await;
        Ok(present(&snapshot, actor, &handle, &object))
    }

    pub async fn insert(&self, actor: &Actor, class_name: &str, mut data: Attributes) -> ParcelResult<Value> {
        let handle = self.registry().get(class_name).await?;
        require(handle.as_ref(), actor, Operation::Create)?;
        check_write(&handle, actor, &data)?;

        if handle.is_meta() {
            let name = data.get("name").and_then(Value::as_str).unwrap_or_default();
            check_reserved_class(actor, name)?;
        } else if let Some(user_id) = &actor.user_id {
            if !data.contains_key("acl") && !data.contains_key("ACL") {
                let acl = serde_json::to_value(Acl::owned_by(user_id))
                    .map_err(|e| ParcelError::Validation(format!("invalid acl: {e}")))?;
                data.insert("acl".into(), acl);
            }
        }

        let object = self.executor.insert_handle(&handle, data).await?;
        Ok(object.to_public_json(&handle.definition().protected_attributes()))
    }

    pub async fn update(&self, actor: &Actor, class_name: &str, id: &ObjectId, data: Attributes) -> ParcelResult<Value> {
        let handle = self.registry().get(class_name).await?;
        require(handle.as_ref(), actor, Operation::Update)?;
        check_write(&handle, actor, &data)?;

        let existing = self.executor.get_handle(&handle, id).await?;
        require(&existing, actor, Operation::Write)?;
        if handle.is_meta() {
            check_reserved_class(actor, existing.get_str("name").unwrap_or_default())?;
            if let Some(name) = data.get("name").and_then(Value::as_str) {
                check_reserved_class(actor, name)?;
            }
        }

        let object = self.executor.update_handle(&handle, id, data).await?;
        Ok(object.to_public_json(&handle.definition().protected_attributes()))
    }

    pub async fn delete(&self, actor: &Actor, class_name: &str, id: &ObjectId) -> ParcelResult<()> {
        let handle = self.registry().get(class_name).await?;
        require(handle.as_ref(), actor, Operation::Delete)?;

        let existing = self.executor.get_handle(&handle, id).await?;
        require(&existing, actor, Operation::Write)?;
        if handle.is_meta() {
            check_reserved_class(actor, existing.get_str("name").unwrap_or_default())?;
        }

        self.executor.delete_handle(&handle, id).await
    }
}

/// Rows of the reserved classes may only be changed by the master actor
fn check_reserved_class(actor: &Actor, name: &str) -> ParcelResult<()> {
    if !actor.is_master() && RESERVED_CLASSES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(ParcelError::Unauthorized(format!("class {name} is reserved")));
    }
    Ok(())
}

/// Protected attributes are written through the account service
fn check_write(handle: &ClassHandle, actor: &Actor, data: &Attributes) -> ParcelResult<()> {
    if actor.is_master() {
        return Ok(());
    }
    let protected = handle.definition().protected_attributes();
    match data.keys().find(|k| protected.contains(&k.as_str())) {
        Some(name) => Err(ParcelError::Unauthorized(format!("attribute '{name}' is protected"))),
        None => Ok(()),
    }
}

/// Filtering or sorting on a protected attribute would leak its value
fn check_query_paths(handle: &ClassHandle, options: &QueryOptions) -> ParcelResult<()> {
    let filter = Filter::parse(&options.filter)?;
    let sort = options.sort_keys()?;
    let protected = handle.definition().protected_attributes();

    let paths = filter.paths().into_iter().chain(sort.iter().map(|key| key.path.as_str()));
    for path in paths {
        let head = path.split('.').next().unwrap_or(path);
        if protected.contains(&head) {
            return Err(ParcelError::InvalidQuery(format!("cannot query on protected attribute '{head}'")));
        }
    }
    Ok(())
}

/// Public JSON of an object, with included objects checked for read access
fn present(snapshot: &RegistrySnapshot, actor: &Actor, handle: &ClassHandle, object: &Object) -> Value {
    let mut out = object.to_public_json(&handle.definition().protected_attributes());
    if let Value::Object(map) = &mut out {
        sanitize_embedded(snapshot, actor, map);
    }
    out
}

/// ACL view of an included object
struct EmbeddedRow {
    acl: Option<Acl>,
    class_row: bool,
}

impl AclSubject for EmbeddedRow {
    fn acl(&self) -> Option<&Acl> {
        self.acl.as_ref()
    }

    fn is_class_row(&self) -> bool {
        self.class_row
    }
}

/// Collapse unreadable included objects back to pointers and strip the
/// protected attributes of readable ones.
fn sanitize_embedded(snapshot: &RegistrySnapshot, actor: &Actor, attributes: &mut Map<String, Value>) {
    for value in attributes.values_mut() {
        let Value::Object(embedded) = value else {
            continue;
        };
        if !is_embedded(embedded) {
            continue;
        }

        let class_name = embedded
            .get("className")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let row = EmbeddedRow {
            acl: embedded
                .get("acl")
                .and_then(|acl| serde_json::from_value(acl.clone()).ok()),
            class_row: class_name == META_CLASS,
        };

        if !permits(&row, actor, Operation::Read) {
            let mut pointer = Map::new();
            pointer.insert("__type".into(), Value::String("Pointer".into()));
            pointer.insert("className".into(), Value::String(class_name));
            if let Some(id) = embedded.get("objectId") {
                pointer.insert("objectId".into(), id.clone());
            }
            *value = Value::Object(pointer);
            continue;
        }

        if let Ok(target) = snapshot.get(&class_name) {
            for name in target.definition().protected_attributes() {
                embedded.remove(name);
            }
        }
        sanitize_embedded(snapshot, actor, embedded);
    }
}
