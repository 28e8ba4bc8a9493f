//! CRUD execution engine
//!
//! Runs create/read/update/delete against loaded classes through the
//! registry and the query translator, and keeps the registry in step with
//! the rows of the meta-class `__Class`.
//!
//! Results are raw objects; authorization is applied by the service layer.

use crate::acl::Acl;
use crate::attribute::AttributeType;
use crate::error::{ParcelError, ParcelResult, StorageError, StorageResult};
use crate::query_native::{NativeQuery, Predicate};
use crate::query_translator::{translate, QueryOptions};
use crate::registry::{ClassHandle, RegistrySnapshot, SchemaRegistry};
use crate::schema::{default_class_rows, ClassDefinition};
use crate::types::{
    format_timestamp, normalize_value, Attributes, NewObject, Object, ObjectId, ObjectPatch, META_CLASS,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Page of query results
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub results: Vec<Object>,
    /// Total matches ignoring skip/limit, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// CRUD executor
pub struct Executor {
    registry: Arc<SchemaRegistry>,
}

impl Executor {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Executor { registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub async fn query(&self, class_name: &str, options: &QueryOptions) -> ParcelResult<QueryResult> {
        let handle = self.registry.get(class_name).await?;
        self.query_handle(&handle, options).await
    }

    /// Run a query. `limit = 0` skips the page query; the count query still
    /// runs when requested, concurrently with the page query otherwise.
    pub async fn query_handle(&self, handle: &ClassHandle, options: &QueryOptions) -> ParcelResult<QueryResult> {
        let snapshot = self.registry.snapshot().await;
        snapshot.validate(handle)?;

        let native = translate(&options.filter, options)?;
        let wants_page = native.limit != Some(0);
        let storage = snapshot.storage().clone();
        let collection = handle.collection().to_string();

        let (results, count) = match (wants_page, options.count) {
            (false, false) => (Vec::new(), None),
            (true, false) => (find_blocking(storage, collection, native).await?, None),
            (false, true) => {
                let count = count_blocking(storage, collection, native.predicate).await?;
                (Vec::new(), Some(count))
            }
            (true, true) => {
                let predicate = native.predicate.clone();
                let (results, count) = tokio::try_join!(
                    find_blocking(storage.clone(), collection.clone(), native),
                    count_blocking(storage, collection, predicate),
                )?;
                (results, Some(count))
            }
        };

        let mut results = results;
        let includes = options.include_paths();
        if !includes.is_empty() {
            for object in &mut results {
                for path in &includes {
                    include_path(&snapshot, handle.definition(), &mut object.attributes, path)?;
                }
            }
        }

        debug!(class = %handle.name(), results = results.len(), "query executed");
        Ok(QueryResult { results, count })
    }

    /// First object matching the filter
    pub async fn query_one(&self, class_name: &str, filter: Value) -> ParcelResult<Option<Object>> {
        let options = QueryOptions::new().filter(filter).limit(1);
        Ok(self.query(class_name, &options).await?.results.into_iter().next())
    }

    pub async fn get(&self, class_name: &str, id: &ObjectId) -> ParcelResult<Object> {
        let handle = self.registry.get(class_name).await?;
        self.get_handle(&handle, id).await
    }

    pub async fn get_handle(&self, handle: &ClassHandle, id: &ObjectId) -> ParcelResult<Object> {
        let snapshot = self.registry.snapshot().await;
        snapshot.validate(handle)?;
        snapshot
            .storage()
            .find_by_id(handle.collection(), id)?
            .ok_or_else(|| ParcelError::not_found(handle.name(), id))
    }

    pub async fn insert(&self, class_name: &str, data: Attributes) -> ParcelResult<Object> {
        let handle = self.registry.get(class_name).await?;
        self.insert_handle(&handle, data).await
    }

    pub async fn insert_handle(&self, handle: &ClassHandle, data: Attributes) -> ParcelResult<Object> {
        let (attributes, acl) = split_acl(data)?;
        let attributes = normalize(attributes);
        handle.definition().validate_insert(&attributes)?;

        if handle.is_meta() {
            return self.insert_class(handle, attributes, acl).await;
        }

        let snapshot = self.registry.snapshot().await;
        snapshot.validate(handle)?;
        check_unique(&snapshot, handle, &attributes, None)?;

        let object = snapshot.storage().create(
            handle.collection(),
            NewObject {
                class_name: handle.name().to_string(),
                attributes,
                acl,
            },
        )?;
        debug!(class = %handle.name(), id = %object.id, "object created");
        Ok(object)
    }

    /// Load the class first, then commit its row; unload it again when the
    /// commit fails.
    async fn insert_class(&self, meta: &ClassHandle, attributes: Attributes, acl: Option<Acl>) -> ParcelResult<Object> {
        let definition = ClassDefinition::from_row(&attributes, acl.clone())?;
        let name = definition.name.clone();
        self.registry.load_class(definition).await?;

        let committed = self.commit_class_row(meta, attributes, acl).await;
        let row = match committed {
            Ok(row) => row,
            Err(e) => {
                warn!(class = %name, error = %e, "class row not committed, unloading class");
                if let Err(rollback) = self.registry.unload_class(&name).await {
                    error!(class = %name, error = %rollback, "compensating unload failed");
                }
                return Err(e);
            }
        };

        self.registry.reload().await?;
        info!(class = %name, id = %row.id, "class created");
        Ok(row)
    }

    async fn commit_class_row(&self, meta: &ClassHandle, attributes: Attributes, acl: Option<Acl>) -> ParcelResult<Object> {
        let snapshot = self.registry.snapshot().await;
        snapshot.validate(meta)?;
        check_unique(&snapshot, meta, &attributes, None)?;
        Ok(snapshot.storage().create(
            meta.collection(),
            NewObject {
                class_name: META_CLASS.to_string(),
                attributes,
                acl,
            },
        )?)
    }

    pub async fn update(&self, class_name: &str, id: &ObjectId, data: Attributes) -> ParcelResult<Object> {
        let handle = self.registry.get(class_name).await?;
        self.update_handle(&handle, id, data).await
    }

    pub async fn update_handle(&self, handle: &ClassHandle, id: &ObjectId, data: Attributes) -> ParcelResult<Object> {
        let patch = build_patch(data)?;
        handle.definition().validate_update(&patch.set, &patch.unset)?;

        if handle.is_meta() {
            return self.update_class(handle, id, patch).await;
        }

        let snapshot = self.registry.snapshot().await;
        snapshot.validate(handle)?;
        check_unique(&snapshot, handle, &patch.set, Some(id))?;

        let object = snapshot
            .storage()
            .update(handle.collection(), id, patch)?
            .ok_or_else(|| ParcelError::not_found(handle.name(), id))?;
        debug!(class = %handle.name(), id = %id, "object updated");
        Ok(object)
    }

    /// Swap a class definition. The new definition is validated before the
    /// row changes; a registry failure after the commit is reported even
    /// though the row was written.
    async fn update_class(&self, meta: &ClassHandle, id: &ObjectId, patch: ObjectPatch) -> ParcelResult<Object> {
        let (old_name, definition, row) = {
            let snapshot = self.registry.snapshot().await;
            snapshot.validate(meta)?;

            let existing = snapshot
                .storage()
                .find_by_id(meta.collection(), id)?
                .ok_or_else(|| ParcelError::not_found(META_CLASS, id))?;
            let old_name = existing.get_str("name").unwrap_or_default().to_string();

            let mut preview = existing.clone();
            preview.apply(patch.clone());
            let definition = ClassDefinition::from_row(&preview.attributes, preview.acl.clone())?;
            if !definition.name.eq_ignore_ascii_case(&old_name) && snapshot.get(&definition.name).is_ok() {
                return Err(ParcelError::DuplicateClass(definition.name));
            }
            check_unique(&snapshot, meta, &patch.set, Some(id))?;

            let row = snapshot
                .storage()
                .update(meta.collection(), id, patch)?
                .ok_or_else(|| ParcelError::not_found(META_CLASS, id))?;
            (old_name, definition, row)
        };

        let name = definition.name.clone();
        if let Err(e) = self.swap_class(&old_name, definition).await {
            error!(
                class = %name,
                error = %e,
                "class row updated but registry reload failed; registry and stored definitions diverge"
            );
            return Err(e);
        }

        info!(class = %name, id = %id, "class updated");
        Ok(row)
    }

    async fn swap_class(&self, old_name: &str, definition: ClassDefinition) -> ParcelResult<()> {
        match self.registry.unload_class(old_name).await {
            Ok(()) | Err(ParcelError::ClassNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.registry.load_class(definition).await?;
        self.registry.reload().await
    }

    pub async fn delete(&self, class_name: &str, id: &ObjectId) -> ParcelResult<()> {
        let handle = self.registry.get(class_name).await?;
        self.delete_handle(&handle, id).await
    }

    pub async fn delete_handle(&self, handle: &ClassHandle, id: &ObjectId) -> ParcelResult<()> {
        let removed_class = {
            let snapshot = self.registry.snapshot().await;
            snapshot.validate(handle)?;

            let class_name = if handle.is_meta() {
                snapshot
                    .storage()
                    .find_by_id(handle.collection(), id)?
                    .and_then(|row| row.get_str("name").map(str::to_string))
            } else {
                None
            };

            if !snapshot.storage().delete(handle.collection(), id)? {
                return Err(ParcelError::not_found(handle.name(), id));
            }
            class_name
        };
        debug!(class = %handle.name(), id = %id, "object deleted");

        if let Some(name) = removed_class {
            match self.registry.unload_class(&name).await {
                Ok(()) => {}
                Err(ParcelError::ClassNotFound(_)) => {
                    warn!(class = %name, "deleted class row was not loaded")
                }
                Err(e) => {
                    error!(class = %name, error = %e, "class row deleted but class still loaded");
                    return Err(e);
                }
            }
            self.registry.reload().await?;
            info!(class = %name, "class deleted");
        }
        Ok(())
    }

    /// Create the built-in `_User` and `_Role` classes when missing
    pub async fn bootstrap_default_classes(&self) -> ParcelResult<()> {
        for row in default_class_rows() {
            let name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            if self.registry.is_loaded(&name).await {
                continue;
            }
            self.insert(META_CLASS, row).await?;
            info!(class = %name, "default class created");
        }
        Ok(())
    }

    /// Definitions stored as `__Class` rows
    pub async fn stored_definitions(&self) -> ParcelResult<Vec<ClassDefinition>> {
        let rows = self.query(META_CLASS, &QueryOptions::new()).await?.results;
        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            match ClassDefinition::from_row(&row.attributes, row.acl.clone()) {
                Ok(definition) => definitions.push(definition),
                Err(e) => warn!(id = %row.id, error = %e, "ignoring unreadable class row"),
            }
        }
        Ok(definitions)
    }
}

async fn find_blocking(
    storage: Arc<dyn crate::storage::StorageEngine>,
    collection: String,
    query: NativeQuery,
) -> ParcelResult<Vec<Object>> {
    run_blocking(move || storage.find(&collection, &query)).await
}

async fn count_blocking(
    storage: Arc<dyn crate::storage::StorageEngine>,
    collection: String,
    predicate: Predicate,
) -> ParcelResult<u64> {
    run_blocking(move || storage.count(&collection, &predicate)).await
}

async fn run_blocking<T, F>(task: F) -> ParcelResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?;
    Ok(outcome?)
}

/// Take `acl`/`ACL` out of the submitted attributes
fn split_acl(mut data: Attributes) -> ParcelResult<(Attributes, Option<Acl>)> {
    let raw = match (data.remove("acl"), data.remove("ACL")) {
        (Some(acl), _) | (None, Some(acl)) => acl,
        (None, None) => return Ok((data, None)),
    };
    if raw.is_null() {
        return Ok((data, None));
    }
    let acl = serde_json::from_value(raw).map_err(|e| ParcelError::Validation(format!("invalid acl: {e}")))?;
    Ok((data, Some(acl)))
}

fn normalize(data: Attributes) -> Attributes {
    data.into_iter().map(|(k, v)| (k, normalize_value(v))).collect()
}

/// Build a patch; `{"__op": "Delete"}` unsets the attribute
fn build_patch(data: Attributes) -> ParcelResult<ObjectPatch> {
    let (attributes, acl) = split_acl(data)?;
    let mut patch = ObjectPatch {
        acl,
        ..ObjectPatch::default()
    };
    for (key, value) in attributes {
        match value.get("__op").and_then(Value::as_str) {
            Some("Delete") => patch.unset.push(key),
            Some(op) => return Err(ParcelError::UnsupportedOperator(format!("__op {op}"))),
            None => {
                patch.set.insert(key, normalize_value(value));
            }
        }
    }
    Ok(patch)
}

/// Reject values already taken for a unique attribute
fn check_unique(
    snapshot: &RegistrySnapshot,
    handle: &ClassHandle,
    attributes: &Attributes,
    exclude: Option<&ObjectId>,
) -> ParcelResult<()> {
    for name in handle.definition().unique_attributes() {
        let value = match attributes.get(name) {
            Some(value) if !value.is_null() => value.clone(),
            _ => continue,
        };
        let mut clauses = vec![Predicate::Eq {
            path: name.to_string(),
            value,
        }];
        if let Some(id) = exclude {
            clauses.push(Predicate::Not(Box::new(Predicate::Eq {
                path: "objectId".into(),
                value: Value::String(id.to_string()),
            })));
        }
        if snapshot.storage().count(handle.collection(), &Predicate::And(clauses))? > 0 {
            return Err(ParcelError::DuplicateValue {
                class_name: handle.name().to_string(),
                attribute: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Replace the pointer at `path` by the referenced object, recursively.
/// Dangling pointers and attributes without a target class are left as is.
fn include_path(
    snapshot: &RegistrySnapshot,
    definition: &ClassDefinition,
    attributes: &mut Attributes,
    path: &[String],
) -> ParcelResult<()> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    let target = match definition.get_attribute(head).map(|spec| &spec.ty) {
        Some(AttributeType::Pointer(Some(target))) => target,
        _ => return Ok(()),
    };
    let target = match snapshot.get(target) {
        Ok(handle) => handle,
        Err(ParcelError::ClassNotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    let Some(value) = attributes.get_mut(head.as_str()) else {
        return Ok(());
    };
    if let Some(id) = value.as_str().map(ObjectId::new) {
        match snapshot.storage().find_by_id(target.collection(), &id)? {
            Some(object) => *value = Value::Object(embed(&object)),
            None => return Ok(()),
        }
    }

    match value {
        Value::Object(embedded) if is_embedded(embedded) => {
            include_path(snapshot, target.definition(), embedded, rest)
        }
        _ => Ok(()),
    }
}

/// JSON form of an included object
pub fn embed(object: &Object) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("__type".into(), Value::String("Object".into()));
    out.insert("className".into(), Value::String(object.class_name.clone()));
    out.insert("objectId".into(), Value::String(object.id.to_string()));
    out.insert("createdAt".into(), Value::String(format_timestamp(&object.created_at)));
    out.insert("updatedAt".into(), Value::String(format_timestamp(&object.updated_at)));
    if let Some(acl) = &object.acl {
        if let Ok(acl) = serde_json::to_value(acl) {
            out.insert("acl".into(), acl);
        }
    }
    for (key, value) in &object.attributes {
        out.insert(key.clone(), value.clone());
    }
    out
}

pub fn is_embedded(map: &Map<String, Value>) -> bool {
    map.get("__type").and_then(Value::as_str) == Some("Object")
}
