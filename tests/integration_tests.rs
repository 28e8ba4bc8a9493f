//! Integration Tests - End-to-End Scenarios
//!
//! Accounts, sessions and roles through the object service, the way a
//! routing layer drives it.

use parcel_core::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

fn config(memory_kib: u32) -> ServiceConfig {
    ServiceConfig {
        login_failure_delay_ms: 0,
        password_hash: PasswordHashConfig {
            memory_kib,
            iterations: 1,
            parallelism: 1,
        },
        ..ServiceConfig::default()
    }
}

async fn setup_service() -> ObjectService {
    ObjectService::open(Arc::new(MemoryStorage::new()), config(8))
        .await
        .unwrap()
}

async fn signup(service: &ObjectService, username: &str, password: &str) -> AuthenticatedUser {
    service
        .accounts()
        .signup(attrs(json!({"username": username, "password": password})))
        .await
        .unwrap()
}

/// Test: signup, login, me, logout
#[tokio::test]
async fn test_account_lifecycle() {
    let service = setup_service().await;
    let accounts = service.accounts();

    let signed_up = signup(&service, "ann", "s3cret").await;
    let public = signed_up.to_json();
    assert_eq!(public["username"], json!("ann"));
    assert_eq!(public["sessionToken"], json!(&signed_up.session_token));
    assert!(public.get("password").is_none());
    assert_ne!(signed_up.user.get_str("password"), Some("s3cret"), "stored as a digest");

    let logged_in = accounts.login("ann", "s3cret").await.unwrap();
    assert_eq!(logged_in.user.id, signed_up.user.id);
    assert_eq!(logged_in.session_token, signed_up.session_token, "session is reused");

    let me = accounts.current_user(&logged_in.session_token).await.unwrap();
    assert_eq!(me.id, signed_up.user.id);

    let actor = service.authenticate(Some(&logged_in.session_token)).await.unwrap();
    assert_eq!(actor.user_id.as_ref(), Some(&signed_up.user.id));

    accounts.logout(&logged_in.session_token).await.unwrap();
    assert!(matches!(
        service.authenticate(Some(&logged_in.session_token)).await,
        Err(ParcelError::InvalidSession)
    ));

    let again = accounts.login("ann", "s3cret").await.unwrap();
    assert_ne!(again.session_token, logged_in.session_token);
}

#[tokio::test]
async fn test_login_failures() {
    let service = setup_service().await;
    signup(&service, "ann", "s3cret").await;

    assert!(matches!(
        service.accounts().login("ann", "wrong").await,
        Err(ParcelError::InvalidCredentials)
    ));
    assert!(matches!(
        service.accounts().login("nobody", "s3cret").await,
        Err(ParcelError::InvalidCredentials)
    ));
}

#[tokio::test]
async fn test_signup_validation() {
    let service = setup_service().await;
    let accounts = service.accounts();
    signup(&service, "ann", "s3cret").await;

    let err = accounts
        .signup(attrs(json!({"username": "bob"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::Validation(_)));

    let err = accounts
        .signup(attrs(json!({"username": "ann", "password": "other"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::DuplicateValue { .. }));

    let err = accounts
        .signup(attrs(json!({"username": "cid", "password": "x", "sessionToken": "mine"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ParcelError::Validation(_)));
}

#[tokio::test]
async fn test_session_tokens() {
    let service = setup_service().await;

    assert_eq!(service.authenticate(None).await.unwrap(), Actor::anonymous());
    assert_eq!(service.authenticate(Some("")).await.unwrap(), Actor::anonymous());
    assert!(matches!(
        service.authenticate(Some("not-a-session")).await,
        Err(ParcelError::InvalidSession)
    ));
    assert!(matches!(
        service.accounts().current_user("").await,
        Err(ParcelError::InvalidSession)
    ));
}

/// Test: roles held directly and through parent roles
#[tokio::test]
async fn test_role_inheritance() {
    let service = setup_service().await;
    let master = Actor::master();
    let ann = signup(&service, "ann", "pw").await;

    let admins = service
        .insert(
            &master,
            ROLE_CLASS,
            attrs(json!({"name": "admins", "users": [ann.user.id.as_str()]})),
        )
        .await
        .unwrap();
    let admins_id = admins["objectId"].as_str().unwrap().to_string();
    let staff = service
        .insert(&master, ROLE_CLASS, attrs(json!({"name": "staff", "roles": [admins_id]})))
        .await
        .unwrap();
    let staff_id = staff["objectId"].as_str().unwrap().to_string();
    service
        .insert(&master, ROLE_CLASS, attrs(json!({"name": "everyone", "roles": [staff_id]})))
        .await
        .unwrap();
    service
        .insert(&master, ROLE_CLASS, attrs(json!({"name": "guests"})))
        .await
        .unwrap();

    let actor = service.authenticate(Some(&ann.session_token)).await.unwrap();
    assert_eq!(actor.roles, vec!["admins", "everyone", "staff"]);

    // A staff-only object is reachable through the inherited role
    service
        .insert(&master, META_CLASS, attrs(json!({"name": "Memo", "attributes": {}})))
        .await
        .unwrap();
    let memo = service
        .insert(
            &master,
            "Memo",
            attrs(json!({"text": "hi", "acl": {"role:staff": {"read": true}}})),
        )
        .await
        .unwrap();
    let memo_id = ObjectId::new(memo["objectId"].as_str().unwrap());
    assert!(service.get(&actor, "Memo", &memo_id).await.is_ok());
    assert!(matches!(
        service.get(&Actor::anonymous(), "Memo", &memo_id).await,
        Err(ParcelError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn test_users_own_their_row() {
    let service = setup_service().await;
    let ann = signup(&service, "ann", "pw").await;
    let bob = signup(&service, "bob", "pw").await;
    let ann_actor = service.authenticate(Some(&ann.session_token)).await.unwrap();
    let bob_actor = service.authenticate(Some(&bob.session_token)).await.unwrap();

    // Credentials are hidden even from the owner
    let fetched = service.get(&ann_actor, USER_CLASS, &ann.user.id).await.unwrap();
    assert!(fetched.get("password").is_none());
    assert!(fetched.get("sessionToken").is_none());

    // Filtering on a credential is rejected
    let options = QueryOptions::new().filter(json!({"sessionToken": &ann.session_token}));
    assert!(matches!(
        service.query(&bob_actor, USER_CLASS, &options).await,
        Err(ParcelError::InvalidQuery(_))
    ));

    let accounts = service.accounts();
    assert!(matches!(
        accounts
            .update_user(&bob_actor, &ann.user.id, attrs(json!({"email": "x@y.z"})))
            .await,
        Err(ParcelError::Unauthorized(_))
    ));
    assert!(matches!(
        accounts.delete_user(&bob_actor, &ann.user.id).await,
        Err(ParcelError::Unauthorized(_))
    ));

    let updated = accounts
        .update_user(&ann_actor, &ann.user.id, attrs(json!({"email": "ann@example.com"})))
        .await
        .unwrap();
    assert_eq!(updated.get_str("email"), Some("ann@example.com"));

    accounts.delete_user(&ann_actor, &ann.user.id).await.unwrap();
    assert!(matches!(
        service.authenticate(Some(&ann.session_token)).await,
        Err(ParcelError::InvalidSession)
    ));
}

#[tokio::test]
async fn test_password_change() {
    let service = setup_service().await;
    let ann = signup(&service, "ann", "old-pw").await;
    let actor = service.authenticate(Some(&ann.session_token)).await.unwrap();
    let accounts = service.accounts();

    let updated = accounts
        .update_user(&actor, &ann.user.id, attrs(json!({"password": "new-pw"})))
        .await
        .unwrap();
    assert!(updated.get_str("password").is_some_and(|d| d.starts_with("$argon2id$")));

    assert!(matches!(
        accounts.login("ann", "old-pw").await,
        Err(ParcelError::InvalidCredentials)
    ));
    assert!(accounts.login("ann", "new-pw").await.is_ok());

    assert!(matches!(
        accounts
            .update_user(&actor, &ann.user.id, attrs(json!({"sessionToken": "forged"})))
            .await,
        Err(ParcelError::Unauthorized(_))
    ));
}

/// Test: digests made with old parameters are upgraded at login
#[tokio::test]
async fn test_login_rehashes_outdated_digest() {
    let storage = Arc::new(MemoryStorage::new());
    let old = ObjectService::open(storage.clone(), config(8)).await.unwrap();
    let ann = signup(&old, "ann", "pw").await;
    let old_digest = ann.user.get_str("password").unwrap().to_string();
    assert!(old_digest.contains("m=8,"));

    let new = ObjectService::open(storage, config(16)).await.unwrap();
    let logged_in = new.accounts().login("ann", "pw").await.unwrap();
    let new_digest = logged_in.user.get_str("password").unwrap();
    assert!(new_digest.contains("m=16,"));
    assert_eq!(logged_in.session_token, ann.session_token);

    assert!(new.accounts().login("ann", "pw").await.is_ok());
}

/// Test: a tenant defines a class, fills it, then drops it
#[tokio::test]
async fn test_class_lifecycle_through_service() {
    let service = setup_service().await;
    let ann = signup(&service, "ann", "pw").await;
    let actor = service.authenticate(Some(&ann.session_token)).await.unwrap();

    let row = service
        .insert(
            &actor,
            META_CLASS,
            attrs(json!({"name": "Recipe", "attributes": {"title": {"type": "string", "required": true}}})),
        )
        .await
        .unwrap();
    let row_id = ObjectId::new(row["objectId"].as_str().unwrap());

    for title in ["soup", "bread", "salad"] {
        service
            .insert(&actor, "Recipe", attrs(json!({"title": title})))
            .await
            .unwrap();
    }
    let listed = service
        .query(&actor, "Recipe", &QueryOptions::new().sort("title").with_count())
        .await
        .unwrap();
    let titles: Vec<_> = listed.results.iter().map(|r| r["title"].clone()).collect();
    assert_eq!(titles, vec![json!("bread"), json!("salad"), json!("soup")]);
    assert_eq!(listed.count, Some(3));

    // Reserved classes stay out of reach
    let user_row = service
        .executor()
        .query_one(META_CLASS, json!({"name": USER_CLASS}))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        service.delete(&actor, META_CLASS, &user_row.id).await,
        Err(ParcelError::Unauthorized(_))
    ));

    service.delete(&actor, META_CLASS, &row_id).await.unwrap();
    assert!(matches!(
        service.query(&actor, "Recipe", &QueryOptions::new()).await,
        Err(ParcelError::ClassNotFound(_))
    ));
}

#[cfg(feature = "rocksdb")]
#[tokio::test]
async fn test_rocksdb_service_survives_restart() {
    use tempfile::TempDir;

    let dir = TempDir::new().unwrap();
    let mut config = config(8);
    config.storage = StorageConfig::RocksDb {
        path: dir.path().join("parcel"),
    };

    let token = {
        let service = ObjectService::from_config(config.clone()).await.unwrap();
        service
            .insert(&Actor::master(), META_CLASS, attrs(json!({"name": "Note", "attributes": {}})))
            .await
            .unwrap();
        service
            .insert(&Actor::master(), "Note", attrs(json!({"text": "kept"})))
            .await
            .unwrap();
        signup(&service, "ann", "pw").await.session_token
    };

    let service = ObjectService::from_config(config).await.unwrap();
    let actor = service.authenticate(Some(&token)).await.unwrap();
    let notes = service.query(&actor, "Note", &QueryOptions::new()).await.unwrap();
    assert_eq!(notes.results.len(), 1);
    assert_eq!(notes.results[0]["text"], json!("kept"));
}
