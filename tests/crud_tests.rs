//! CRUD Operations Tests
//!
//! Create, read, update and delete against runtime classes

use parcel_core::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

async fn setup() -> (Executor, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let registry = SchemaRegistry::open(storage.clone(), acl::class_default_acl())
        .await
        .unwrap();
    (Executor::new(Arc::new(registry)), storage)
}

async fn setup_game_scores() -> (Executor, Arc<MemoryStorage>) {
    let (executor, storage) = setup().await;
    executor
        .insert(
            META_CLASS,
            attrs(json!({
                "name": "GameScore",
                "attributes": {
                    "player": {"type": "string", "required": true},
                    "score": "number",
                    "cheatMode": "boolean",
                    "playedAt": "date",
                }
            })),
        )
        .await
        .unwrap();
    (executor, storage)
}

#[tokio::test]
async fn test_insert_round_trip() {
    let (executor, _) = setup_game_scores().await;

    let created = executor
        .insert(
            "GameScore",
            attrs(json!({"player": "Sean Plott", "score": 1337, "cheatMode": false})),
        )
        .await
        .unwrap();

    let fetched = executor.get("GameScore", &created.id).await.unwrap();
    assert_eq!(fetched.get("player"), Some(&json!("Sean Plott")));
    assert_eq!(fetched.get("score"), Some(&json!(1337)));
    assert_eq!(fetched.get("cheatMode"), Some(&json!(false)));
    assert_eq!(fetched.created_at, fetched.updated_at, "updatedAt should equal createdAt");
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn test_class_names_are_case_insensitive() {
    let (executor, _) = setup_game_scores().await;
    let created = executor
        .insert("gamescore", attrs(json!({"player": "a"})))
        .await
        .unwrap();
    assert_eq!(created.class_name, "GameScore");
    assert!(executor.get("GAMESCORE", &created.id).await.is_ok());
}

#[tokio::test]
async fn test_update_advances_updated_at() {
    let (executor, _) = setup_game_scores().await;
    let created = executor
        .insert("GameScore", attrs(json!({"player": "a", "score": 1})))
        .await
        .unwrap();

    let mut previous = created.updated_at;
    for score in 2..6 {
        let updated = executor
            .update("GameScore", &created.id, attrs(json!({"score": score})))
            .await
            .unwrap();
        assert!(updated.updated_at >= previous);
        assert_eq!(updated.created_at, created.created_at);
        previous = updated.updated_at;
    }
}

#[tokio::test]
async fn test_update_unsets_with_delete_op() {
    let (executor, _) = setup_game_scores().await;
    let created = executor
        .insert("GameScore", attrs(json!({"player": "a", "score": 1})))
        .await
        .unwrap();

    let updated = executor
        .update("GameScore", &created.id, attrs(json!({"score": {"__op": "Delete"}})))
        .await
        .unwrap();
    assert!(updated.get("score").is_none());

    let err = executor
        .update("GameScore", &created.id, attrs(json!({"score": {"__op": "Increment", "amount": 1}})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::UnsupportedOperator(_)));
}

#[tokio::test]
async fn test_typed_literals_are_normalized() {
    let (executor, _) = setup_game_scores().await;
    let created = executor
        .insert(
            "GameScore",
            attrs(json!({
                "player": "a",
                "playedAt": {"__type": "Date", "iso": "2024-03-01T10:00:00+00:00"}
            })),
        )
        .await
        .unwrap();
    assert_eq!(created.get("playedAt"), Some(&json!("2024-03-01T10:00:00.000Z")));
}

#[tokio::test]
async fn test_schema_validation() {
    let (executor, _) = setup_game_scores().await;

    let err = executor
        .insert("GameScore", attrs(json!({"player": "a", "score": "lots"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::Validation(_)));

    let err = executor
        .insert("GameScore", attrs(json!({"score": 3})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::Validation(_)), "player is required");

    let err = executor
        .insert("GameScore", attrs(json!({"player": "a", "createdAt": "yesterday"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::Validation(_)), "createdAt is managed by the store");

    // Undeclared attributes are accepted: classes are not strict by default
    executor
        .insert("GameScore", attrs(json!({"player": "a", "level": 3})))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_class_and_object() {
    let (executor, _) = setup_game_scores().await;

    let err = executor.insert("Nope", attrs(json!({}))).await.unwrap_err();
    assert!(matches!(err, ParcelError::ClassNotFound(name) if name == "Nope"));

    let missing = ObjectId::new("doesnotexist");
    assert!(matches!(
        executor.get("GameScore", &missing).await,
        Err(ParcelError::NotFound { .. })
    ));
    assert!(matches!(
        executor.update("GameScore", &missing, attrs(json!({"score": 1}))).await,
        Err(ParcelError::NotFound { .. })
    ));
    assert!(matches!(
        executor.delete("GameScore", &missing).await,
        Err(ParcelError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_delete_object() {
    let (executor, storage) = setup_game_scores().await;
    let created = executor
        .insert("GameScore", attrs(json!({"player": "a"})))
        .await
        .unwrap();
    assert_eq!(storage.record_count("gamescore"), 1);

    executor.delete("GameScore", &created.id).await.unwrap();
    assert_eq!(storage.record_count("gamescore"), 0);
    assert!(matches!(
        executor.get("GameScore", &created.id).await,
        Err(ParcelError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_deleting_class_orphans_objects() {
    let (executor, storage) = setup_game_scores().await;
    for n in 0..3 {
        executor
            .insert("GameScore", attrs(json!({"player": format!("p{n}")})))
            .await
            .unwrap();
    }

    let row = executor
        .query_one(META_CLASS, json!({"name": "GameScore"}))
        .await
        .unwrap()
        .unwrap();
    executor.delete(META_CLASS, &row.id).await.unwrap();

    assert!(matches!(
        executor.query("GameScore", &QueryOptions::new()).await,
        Err(ParcelError::ClassNotFound(_))
    ));
    assert_eq!(storage.record_count("gamescore"), 3, "objects stay in storage");
    assert!(!storage.open_collections().contains(&"gamescore".to_string()));
}

#[tokio::test]
async fn test_recreated_class_sees_orphans() {
    let (executor, _) = setup_game_scores().await;
    executor
        .insert("GameScore", attrs(json!({"player": "old"})))
        .await
        .unwrap();

    let row = executor
        .query_one(META_CLASS, json!({"name": "GameScore"}))
        .await
        .unwrap()
        .unwrap();
    executor.delete(META_CLASS, &row.id).await.unwrap();
    executor
        .insert(META_CLASS, attrs(json!({"name": "GameScore", "attributes": {}})))
        .await
        .unwrap();

    let result = executor.query("GameScore", &QueryOptions::new()).await.unwrap();
    assert_eq!(result.results.len(), 1);
}

#[tokio::test]
async fn test_duplicate_class_insert() {
    let (executor, storage) = setup_game_scores().await;
    let err = executor
        .insert(META_CLASS, attrs(json!({"name": "gamescore", "attributes": {}})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::DuplicateClass(_)));
    assert_eq!(storage.record_count("__class"), 1);
}

#[tokio::test]
async fn test_bootstrap_default_classes() {
    let (executor, _) = setup().await;
    executor.bootstrap_default_classes().await.unwrap();
    executor.bootstrap_default_classes().await.unwrap();

    let registry = executor.registry();
    assert_eq!(
        registry.class_names().await,
        vec!["_Role".to_string(), "_User".to_string(), META_CLASS.to_string()]
    );

    let user = registry.get(USER_CLASS).await.unwrap();
    let protected = user.definition().protected_attributes();
    assert!(protected.contains(&"password"));
    assert!(protected.contains(&"sessionToken"));
}
