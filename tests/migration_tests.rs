//! Integration tests for opening connections and applying migration plans

use std::time::Duration;

use reactive_objstore::{
   Connection, CreateStore, Error, IndexDefinition, KeyRange, MigrationPlan, MigrationStep,
   OpenState, UpdateStore, open_connection,
};
use serde_json::json;
use tempfile::TempDir;

fn users_plan() -> MigrationPlan {
   MigrationPlan::new().step(
      0,
      1,
      MigrationStep::new().create(
         CreateStore::new("users")
            .key_path("id")
            .index(IndexDefinition::new("byEmail", "email").unique(true)),
      ),
   )
}

/// A plan whose only step fails if it is ever applied.
fn failing_plan() -> MigrationPlan {
   MigrationPlan::new().step(
      0,
      1,
      MigrationStep::new().update("missing", UpdateStore::new().delete_index("nope")),
   )
}

#[tokio::test]
async fn test_plan_creates_collection_and_index() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("users.db");

   let conn = open_connection(&path, Some(1), users_plan()).await.unwrap();
   assert_eq!(conn.version(), 1);
   assert_eq!(conn.collection_names(), vec!["users"]);

   let key = conn
      .readwrite("users")
      .unwrap()
      .add(json!({"id": 1, "email": "a@x.com"}), None)
      .await
      .unwrap();
   assert_eq!(key, 1.into());

   let by_key = conn.readonly("users").unwrap().get(1).await.unwrap();
   let by_email = conn
      .index("users.byEmail")
      .unwrap()
      .get("a@x.com")
      .await
      .unwrap();
   assert_eq!(by_key, Some(json!({"id": 1, "email": "a@x.com"})));
   assert_eq!(by_email, by_key);
}

#[tokio::test]
async fn test_one_to_two_plan_creates_collection_and_index() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("v2.db");

   let conn = open_connection(&path, Some(1), MigrationPlan::new()).await.unwrap();
   assert!(conn.collection_names().is_empty());
   conn.close();

   let plan = MigrationPlan::new().step(
      1,
      2,
      MigrationStep::new().create(
         CreateStore::new("users")
            .key_path("id")
            .index(IndexDefinition::new("byEmail", "email").unique(true)),
      ),
   );
   let conn = open_connection(&path, Some(2), plan).await.unwrap();
   assert_eq!(conn.version(), 2);

   conn
      .readwrite("users")
      .unwrap()
      .add(json!({"id": 1, "email": "a@x.com"}), None)
      .await
      .unwrap();
   let by_key = conn.readonly("users").unwrap().get(1).await.unwrap();
   let by_email = conn
      .index("users.byEmail")
      .unwrap()
      .get("a@x.com")
      .await
      .unwrap();
   assert_eq!(by_key, Some(json!({"id": 1, "email": "a@x.com"})));
   assert_eq!(by_email, by_key);
}

#[tokio::test]
async fn test_reopen_at_same_version_applies_nothing() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("idempotent.db");

   open_connection(&path, Some(1), users_plan())
      .await
      .unwrap()
      .close();

   // The plan would fail if any step ran
   let builder = Connection::builder(&path).version(1).plan(failing_plan());
   let mut state = builder.watch_state();
   let conn = builder.open().await.unwrap();

   assert_eq!(*state.borrow_and_update(), OpenState::Open);
   assert!(state.changed().await.is_err(), "state channel should be closed");
   assert_eq!(conn.version(), 1);
   assert_eq!(conn.collection_names(), vec!["users"]);
}

#[tokio::test]
async fn test_open_without_version_uses_stored_version() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("stored.db");

   let plan = users_plan().step(1, 2, MigrationStep::new().create(CreateStore::new("posts")));
   open_connection(&path, Some(2), plan).await.unwrap().close();

   let conn = open_connection(&path, None, failing_plan()).await.unwrap();
   assert_eq!(conn.version(), 2);

   let fresh = temp_dir.path().join("fresh.db");
   let conn = open_connection(&fresh, None, users_plan()).await.unwrap();
   assert_eq!(conn.version(), 1);
   assert_eq!(conn.collection_names(), vec!["users"]);
}

#[tokio::test]
async fn test_steps_apply_in_order_with_updates_and_seed_data() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("steps.db");

   let plan: MigrationPlan = serde_json::from_value(json!({
      "0-1": {
         "create": [{
            "name": "users",
            "keyPath": "id",
            "index": [{ "name": "byEmail", "keyPath": "email", "unique": true }],
            "data": [
               { "id": 1, "email": "a@x.com", "age": 30 },
               { "id": 2, "email": "b@x.com", "age": 20 }
            ]
         }, {
            "name": "legacy"
         }]
      },
      "1-3": {
         "delete": ["legacy"],
         "update": {
            "users": {
               "create": [{ "name": "byAge", "keyPath": "age" }],
               "delete": ["byEmail"],
               "data": [{ "id": 3, "email": "c@x.com", "age": 25 }]
            }
         }
      }
   }))
   .unwrap();

   let conn = open_connection(&path, Some(3), plan).await.unwrap();
   assert_eq!(conn.version(), 3);
   assert_eq!(conn.collection_names(), vec!["users"]);

   assert!(matches!(
      conn.index("users.byEmail"),
      Err(Error::Transaction(_))
   ));

   // The new index covers both seeded and pre-existing records
   let ages = conn
      .index("users.byAge")
      .unwrap()
      .get_all(Some(KeyRange::lower_bound(21, false)), None)
      .await
      .unwrap();
   let ids: Vec<_> = ages.iter().map(|user| user["id"].clone()).collect();
   assert_eq!(ids, vec![json!(3), json!(1)]);
}

#[tokio::test]
async fn test_existing_collection_is_not_recreated() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("skip.db");

   let conn = open_connection(&path, Some(1), users_plan()).await.unwrap();
   conn
      .readwrite("users")
      .unwrap()
      .put(json!({"id": 7, "email": "keep@x.com"}), None)
      .await
      .unwrap();
   conn.close();

   let plan = users_plan().step(1, 2, MigrationStep::new().create(CreateStore::new("users")));
   let conn = open_connection(&path, Some(2), plan).await.unwrap();
   assert_eq!(conn.readonly("users").unwrap().count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failing_update_aborts_upgrade() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("failing.db");

   let conn = open_connection(&path, Some(1), users_plan()).await.unwrap();
   for (id, name) in [(1, "same"), (2, "same")] {
      conn
         .readwrite("users")
         .unwrap()
         .add(json!({"id": id, "email": format!("{id}@x.com"), "name": name}), None)
         .await
         .unwrap();
   }
   conn.close();

   let plan = users_plan().step(
      1,
      2,
      MigrationStep::new()
         .create(CreateStore::new("posts"))
         .update(
            "users",
            UpdateStore::new().create_index(IndexDefinition::new("byName", "name").unique(true)),
         ),
   );
   let builder = Connection::builder(&path).version(2).plan(plan);
   let state = builder.watch_state();
   let err = builder.open().await.unwrap_err();

   match &err {
      Error::Upgrade { from, to, source } => {
         assert_eq!((*from, *to), (1, 2));
         assert_eq!(source.error_code(), "CONSTRAINT_ERROR");
      }
      other => panic!("expected upgrade error, got {other:?}"),
   }
   assert_eq!(err.error_code(), "UPGRADE_ERROR");
   assert_eq!(*state.borrow(), OpenState::Failed);

   // Nothing from the failed upgrade was kept, including the new collection
   let conn = open_connection(&path, None, MigrationPlan::new()).await.unwrap();
   assert_eq!(conn.version(), 1);
   assert_eq!(conn.collection_names(), vec!["users"]);
}

#[tokio::test]
async fn test_failing_create_aborts_upgrade() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("bad-index.db");

   let plan = MigrationPlan::new().step(
      0,
      1,
      MigrationStep::new().create(
         CreateStore::new("tags").index(
            IndexDefinition::new("bad", reactive_objstore::KeyPath::compound(["a", "b"]))
               .multi_entry(true),
         ),
      ),
   );
   let err = open_connection(&path, Some(1), plan).await.unwrap_err();
   assert!(matches!(err, Error::Upgrade { from: 0, to: 1, .. }));

   let conn = open_connection(&path, None, MigrationPlan::new()).await.unwrap();
   assert!(conn.collection_names().is_empty());
}

#[tokio::test]
async fn test_open_errors() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("versions.db");

   let plan = users_plan().step(1, 2, MigrationStep::new());
   open_connection(&path, Some(2), plan).await.unwrap().close();

   let builder = Connection::builder(&path).version(1);
   let state = builder.watch_state();
   let err = builder.open().await.unwrap_err();
   assert_eq!(err.error_code(), "OPEN_ERROR");
   assert_eq!(err.engine_error().unwrap().error_code(), "VERSION_ERROR");
   assert_eq!(*state.borrow(), OpenState::Failed);

   let err = open_connection(&path, Some(0), MigrationPlan::new())
      .await
      .unwrap_err();
   assert_eq!(err.engine_error().unwrap().error_code(), "INVALID_VERSION");

   let err = open_connection(":memory:", None, MigrationPlan::new())
      .await
      .unwrap_err();
   assert_eq!(err.engine_error().unwrap().error_code(), "INVALID_PATH");
}

#[tokio::test]
async fn test_blocked_upgrade_waits_for_close() {
   let _ = tracing_subscriber::fmt().with_test_writer().try_init();
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("blocked.db");

   let old = open_connection(&path, Some(1), users_plan()).await.unwrap();
   let mut version_changes = old.version_changes();

   let plan = users_plan().step(1, 2, MigrationStep::new().create(CreateStore::new("posts")));
   let mut upgrade = tokio::spawn(open_connection(path.clone(), Some(2), plan));

   let event = version_changes.recv().await.unwrap();
   assert_eq!((event.old_version, event.new_version), (1, Some(2)));
   assert!(
      tokio::time::timeout(Duration::from_millis(50), &mut upgrade)
         .await
         .is_err(),
      "upgrade should stay blocked while the old connection is open"
   );

   old.close();
   let conn = upgrade.await.unwrap().unwrap();
   assert_eq!(conn.version(), 2);
   assert_eq!(conn.collection_names(), vec!["posts", "users"]);
}
