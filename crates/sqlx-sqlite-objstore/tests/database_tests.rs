use futures::StreamExt;
use serde_json::json;
use sqlx_sqlite_objstore::{
   CursorDirection, Error, IndexParameters, Key, KeyPath, KeyRange, ObjectDatabase,
   ObjectDatabaseConfig, ObjectStoreParameters, OpenEvent, OpenRequest, Output, TransactionMode,
   VersionChange,
};
use std::path::Path;
use tempfile::TempDir;

async fn expect_upgrade(request: &mut OpenRequest) -> VersionChange {
   match request.next().await {
      Some(OpenEvent::UpgradeNeeded(change)) => change,
      other => panic!("expected UpgradeNeeded, got {other:?}"),
   }
}

async fn expect_success(request: &mut OpenRequest) -> ObjectDatabase {
   match request.next().await {
      Some(OpenEvent::Success(db)) => db,
      other => panic!("expected Success, got {other:?}"),
   }
}

async fn expect_error(request: &mut OpenRequest) -> Error {
   match request.next().await {
      Some(OpenEvent::Error(e)) => e,
      other => panic!("expected Error, got {other:?}"),
   }
}

/// Opens a database with a `users` store keyed by `id` and a unique
/// `byEmail` index.
async fn open_users(path: &Path) -> ObjectDatabase {
   let mut request = ObjectDatabase::open(path, Some(1), ObjectDatabaseConfig::default());
   let change = expect_upgrade(&mut request).await;
   change
      .create_object_store("users", ObjectStoreParameters::new().key_path("id"))
      .await
      .unwrap();
   change
      .create_index(
         "users",
         "byEmail",
         "email",
         IndexParameters {
            unique: true,
            ..Default::default()
         },
      )
      .await
      .unwrap();
   change.finish();
   expect_success(&mut request).await
}

#[tokio::test]
async fn test_open_new_database_defaults_to_version_one() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("fresh.db");

   let mut request = ObjectDatabase::open(&path, None, ObjectDatabaseConfig::default());
   let change = expect_upgrade(&mut request).await;
   assert_eq!(change.old_version(), 0);
   assert_eq!(change.new_version(), 1);
   assert!(change.object_store_names().is_empty());
   drop(change);

   let db = expect_success(&mut request).await;
   assert_eq!(db.version(), 1);
   assert_eq!(db.name(), "fresh");
   assert!(request.next().await.is_none());
}

#[tokio::test]
async fn test_reopen_at_stored_version_skips_upgrade() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("reopen.db");

   let db = open_users(&path).await;
   db.close();

   let mut request = ObjectDatabase::open(&path, Some(1), ObjectDatabaseConfig::default());
   let db = expect_success(&mut request).await;
   assert_eq!(db.version(), 1);
   assert_eq!(db.object_store_names(), vec!["users".to_string()]);
   assert!(db.has_index("users", "byEmail"));

   // Omitting the version uses the stored one
   let mut request = ObjectDatabase::open(&path, None, ObjectDatabaseConfig::default());
   let other = expect_success(&mut request).await;
   assert_eq!(other.version(), 1);
}

#[tokio::test]
async fn test_open_lower_version_fails() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("lower.db");

   let mut request = ObjectDatabase::open(&path, Some(3), ObjectDatabaseConfig::default());
   expect_upgrade(&mut request).await.finish();
   expect_success(&mut request).await.close();

   let mut request = ObjectDatabase::open(&path, Some(2), ObjectDatabaseConfig::default());
   let err = expect_error(&mut request).await;
   assert!(matches!(
      err,
      Error::VersionError {
         requested: 2,
         stored: 3
      }
   ));
   assert_eq!(err.error_code(), "VERSION_ERROR");
}

#[tokio::test]
async fn test_open_rejects_version_zero_and_memory_paths() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("zero.db");

   let mut request = ObjectDatabase::open(&path, Some(0), ObjectDatabaseConfig::default());
   assert!(matches!(
      expect_error(&mut request).await,
      Error::InvalidVersion(0)
   ));

   let mut request = ObjectDatabase::open(":memory:", Some(1), ObjectDatabaseConfig::default());
   assert!(matches!(
      expect_error(&mut request).await,
      Error::InvalidPath(_)
   ));
}

#[tokio::test]
async fn test_put_get_and_index_lookup() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("crud.db")).await;

   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let users = tx.object_store("users").unwrap();
   let key = users
      .add(json!({"id": 1, "email": "a@x.com"}), None)
      .await
      .unwrap();
   assert_eq!(key, Output::Key(Some(Key::from(1))));
   tx.commit().await.unwrap();

   let tx = db.transaction(["users"], TransactionMode::ReadOnly).unwrap();
   let by_id = tx.object_store("users").unwrap().get(1).await.unwrap();
   let by_email = tx
      .index("users", "byEmail")
      .unwrap()
      .get("a@x.com")
      .await
      .unwrap();
   tx.commit().await.unwrap();

   assert_eq!(by_id, Output::Value(Some(json!({"id": 1, "email": "a@x.com"}))));
   assert_eq!(by_id, by_email);
}

#[tokio::test]
async fn test_failed_request_aborts_transaction() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("abort.db")).await;

   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let users = tx.object_store("users").unwrap();
   users
      .add(json!({"id": 1, "email": "a@x.com"}), None)
      .await
      .unwrap();
   tx.commit().await.unwrap();

   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let users = tx.object_store("users").unwrap();
   users
      .put(json!({"id": 2, "email": "b@x.com"}), None)
      .await
      .unwrap();

   // Duplicate primary key
   let err = users
      .add(json!({"id": 1, "email": "c@x.com"}), None)
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "CONSTRAINT_ERROR");

   // Later requests in the same transaction fail too
   let err = users.count(None).await.unwrap_err();
   assert!(matches!(err, Error::Aborted(_)));

   let done = tx.commit().await;
   assert!(matches!(done, Err(Error::Aborted(_))));

   // The put of id 2 was rolled back
   let tx = db.transaction(["users"], TransactionMode::ReadOnly).unwrap();
   let count = tx.object_store("users").unwrap().count(None).await.unwrap();
   assert_eq!(count, Output::Count(1));
}

#[tokio::test]
async fn test_unique_index_violation() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("unique.db")).await;

   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let users = tx.object_store("users").unwrap();
   users
      .put(json!({"id": 1, "email": "a@x.com"}), None)
      .await
      .unwrap();
   // Overwriting the same record keeps its own index entry
   users
      .put(json!({"id": 1, "email": "a@x.com", "name": "Ada"}), None)
      .await
      .unwrap();
   let err = users
      .put(json!({"id": 2, "email": "a@x.com"}), None)
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Constraint(_)));
   assert!(tx.commit().await.is_err());
}

#[tokio::test]
async fn test_scope_and_mode_are_enforced() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("scope.db")).await;

   assert!(matches!(
      db.transaction(["missing"], TransactionMode::ReadOnly),
      Err(Error::NotFound(_))
   ));

   let tx = db.transaction(["users"], TransactionMode::ReadOnly).unwrap();
   let err = tx
      .object_store("users")
      .unwrap()
      .put(json!({"id": 1}), None)
      .await
      .unwrap_err();
   assert!(matches!(err, Error::ReadOnly(_)));
   assert!(matches!(tx.object_store("orders"), Err(Error::NotFound(_))));

   // Issuance-time rejections do not abort the transaction
   let count = tx.object_store("users").unwrap().count(None).await.unwrap();
   assert_eq!(count, Output::Count(0));
   tx.commit().await.unwrap();

   db.close();
   assert!(matches!(
      db.transaction(["users"], TransactionMode::ReadOnly),
      Err(Error::DatabaseClosed)
   ));
}

#[tokio::test]
async fn test_auto_increment_generates_and_injects_keys() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("auto.db");

   let mut request = ObjectDatabase::open(&path, Some(1), ObjectDatabaseConfig::default());
   let change = expect_upgrade(&mut request).await;
   change
      .create_object_store(
         "notes",
         ObjectStoreParameters::new()
            .key_path("id")
            .auto_increment(true),
      )
      .await
      .unwrap();
   change
      .create_object_store("log", ObjectStoreParameters::new().auto_increment(true))
      .await
      .unwrap();
   change.finish();
   let db = expect_success(&mut request).await;

   let tx = db
      .transaction(["notes", "log"], TransactionMode::ReadWrite)
      .unwrap();
   let notes = tx.object_store("notes").unwrap();
   let first = notes.add(json!({"text": "a"}), None).await.unwrap();
   let explicit = notes.add(json!({"id": 10, "text": "b"}), None).await.unwrap();
   let next = notes.add(json!({"text": "c"}), None).await.unwrap();
   let log_key = tx
      .object_store("log")
      .unwrap()
      .add(json!("entry"), None)
      .await
      .unwrap();
   let stored = notes.get(1).await.unwrap();
   tx.commit().await.unwrap();

   assert_eq!(first, Output::Key(Some(Key::from(1))));
   assert_eq!(explicit, Output::Key(Some(Key::from(10))));
   assert_eq!(next, Output::Key(Some(Key::from(11))));
   assert_eq!(log_key, Output::Key(Some(Key::from(1))));
   assert_eq!(stored, Output::Value(Some(json!({"id": 1, "text": "a"}))));
}

#[tokio::test]
async fn test_out_of_line_keys_require_a_key() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("outofline.db");

   let mut request = ObjectDatabase::open(&path, Some(1), ObjectDatabaseConfig::default());
   let change = expect_upgrade(&mut request).await;
   change
      .create_object_store("settings", ObjectStoreParameters::new())
      .await
      .unwrap();
   change.finish();
   let db = expect_success(&mut request).await;

   let tx = db
      .transaction(["settings"], TransactionMode::ReadWrite)
      .unwrap();
   let settings = tx.object_store("settings").unwrap();
   settings
      .put(json!({"theme": "dark"}), Some(Key::from("ui")))
      .await
      .unwrap();
   let got = settings.get("ui").await.unwrap();
   assert_eq!(got, Output::Value(Some(json!({"theme": "dark"}))));

   let err = settings.put(json!({"x": 1}), None).await.unwrap_err();
   assert_eq!(err.error_code(), "DATA_ERROR");
}

#[tokio::test]
async fn test_ranges_counts_and_deletes() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("ranges.db")).await;

   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let users = tx.object_store("users").unwrap();
   for id in 1..=5 {
      users
         .put(json!({"id": id, "email": format!("u{id}@x.com")}), None)
         .await
         .unwrap();
   }

   let middle = users
      .get_all(Some(KeyRange::bound(2, 4, false, true).unwrap()), None)
      .await
      .unwrap();
   let Output::Values(values) = middle else {
      panic!("expected values");
   };
   let ids: Vec<_> = values.iter().map(|v| v["id"].clone()).collect();
   assert_eq!(ids, vec![json!(2), json!(3)]);

   let limited = users.get_all_keys(None, Some(2)).await.unwrap();
   assert_eq!(limited, Output::Keys(vec![Key::from(1), Key::from(2)]));

   let first_above = users
      .get_key(KeyRange::lower_bound(3, true))
      .await
      .unwrap();
   assert_eq!(first_above, Output::Key(Some(Key::from(4))));

   users.delete(KeyRange::upper_bound(2, false)).await.unwrap();
   assert_eq!(users.count(None).await.unwrap(), Output::Count(3));

   // Deleted records leave the index too
   let by_email = tx
      .index("users", "byEmail")
      .unwrap()
      .count(Some(KeyRange::only("u1@x.com")))
      .await
      .unwrap();
   assert_eq!(by_email, Output::Count(0));

   users.clear().await.unwrap();
   assert_eq!(users.count(None).await.unwrap(), Output::Count(0));
   tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_index_cursor_directions() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("cursors.db");

   let mut request = ObjectDatabase::open(&path, Some(1), ObjectDatabaseConfig::default());
   let change = expect_upgrade(&mut request).await;
   change
      .create_object_store("people", ObjectStoreParameters::new().key_path("id"))
      .await
      .unwrap();
   change
      .create_index("people", "byAge", "age", IndexParameters::default())
      .await
      .unwrap();
   change.finish();
   let db = expect_success(&mut request).await;

   let tx = db
      .transaction(["people"], TransactionMode::ReadWrite)
      .unwrap();
   let people = tx.object_store("people").unwrap();
   for (id, age) in [(1, 30), (2, 25), (3, 30)] {
      people.put(json!({"id": id, "age": age}), None).await.unwrap();
   }

   let by_age = tx.index("people", "byAge").unwrap();
   let mut orders = Vec::new();
   for direction in [
      CursorDirection::Next,
      CursorDirection::NextUnique,
      CursorDirection::Prev,
      CursorDirection::PrevUnique,
   ] {
      let Output::Cursor(cursor) = by_age.open_cursor(None, direction).await.unwrap() else {
         panic!("expected cursor");
      };
      assert_eq!(cursor.direction(), direction);
      orders.push(cursor.primary_keys());
   }
   tx.commit().await.unwrap();

   let keys = |ids: &[i64]| ids.iter().map(|id| Key::from(*id)).collect::<Vec<_>>();
   assert_eq!(orders[0], keys(&[2, 1, 3]));
   assert_eq!(orders[1], keys(&[2, 1]));
   assert_eq!(orders[2], keys(&[3, 1, 2]));
   assert_eq!(orders[3], keys(&[1, 2]));
}

#[tokio::test]
async fn test_key_cursor_and_multi_entry_index() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("multi.db");

   let mut request = ObjectDatabase::open(&path, Some(1), ObjectDatabaseConfig::default());
   let change = expect_upgrade(&mut request).await;
   change
      .create_object_store("posts", ObjectStoreParameters::new().key_path("id"))
      .await
      .unwrap();
   change
      .create_index(
         "posts",
         "byTag",
         "tags",
         IndexParameters {
            multi_entry: true,
            ..Default::default()
         },
      )
      .await
      .unwrap();
   change
      .create_index(
         "posts",
         "byAuthorAndId",
         KeyPath::compound(["author", "id"]),
         IndexParameters::default(),
      )
      .await
      .unwrap();
   change.finish();
   let db = expect_success(&mut request).await;

   let tx = db
      .transaction(["posts"], TransactionMode::ReadWrite)
      .unwrap();
   let posts = tx.object_store("posts").unwrap();
   posts
      .put(json!({"id": 1, "author": "ada", "tags": ["rust", "db", "rust"]}), None)
      .await
      .unwrap();
   posts
      .put(json!({"id": 2, "author": "bob", "tags": ["db"]}), None)
      .await
      .unwrap();

   let db_posts = tx
      .index("posts", "byTag")
      .unwrap()
      .get_all_keys(Some(KeyRange::only("db")), None)
      .await
      .unwrap();
   assert_eq!(db_posts, Output::Keys(vec![Key::from(1), Key::from(2)]));

   let rust_posts = tx
      .index("posts", "byTag")
      .unwrap()
      .count(Some(KeyRange::only("rust")))
      .await
      .unwrap();
   assert_eq!(rust_posts, Output::Count(1));

   let Output::Cursor(cursor) = tx
      .index("posts", "byAuthorAndId")
      .unwrap()
      .open_key_cursor(None, CursorDirection::Prev)
      .await
      .unwrap()
   else {
      panic!("expected cursor");
   };
   tx.commit().await.unwrap();

   let first = &cursor.records()[0];
   assert_eq!(
      first.key,
      Key::Array(vec![Key::from("bob"), Key::from(2)])
   );
   assert_eq!(first.primary_key, Key::from(2));
   assert!(first.value.is_none());
}

#[tokio::test]
async fn test_abort_rolls_back() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("explicit_abort.db")).await;

   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let pending = tx
      .object_store("users")
      .unwrap()
      .put(json!({"id": 1, "email": "a@x.com"}), None);
   pending.await.unwrap();
   assert!(matches!(tx.abort().await, Err(Error::Aborted(_))));

   let tx = db.transaction(["users"], TransactionMode::ReadOnly).unwrap();
   let count = tx.object_store("users").unwrap().count(None).await.unwrap();
   assert_eq!(count, Output::Count(0));
}

#[tokio::test]
async fn test_idle_transactions_do_not_hold_connections() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("idle.db")).await;
   let within = std::time::Duration::from_secs(5);

   // An unused read-write transaction leaves the writer free
   let idle_writer = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let tx = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let put = tx
      .object_store("users")
      .unwrap()
      .put(json!({"id": 1, "email": "a@x.com"}), None);
   tokio::time::timeout(within, put).await.unwrap().unwrap();
   tokio::time::timeout(within, tx.commit()).await.unwrap().unwrap();

   // More idle readers than the read pool has connections
   let idle_readers: Vec<_> = (0..ObjectDatabaseConfig::default().max_read_connections + 1)
      .map(|_| db.transaction(["users"], TransactionMode::ReadOnly).unwrap())
      .collect();
   let tx = db.transaction(["users"], TransactionMode::ReadOnly).unwrap();
   let count = tx.object_store("users").unwrap().count(None);
   assert_eq!(
      tokio::time::timeout(within, count).await.unwrap().unwrap(),
      Output::Count(1)
   );

   // Released without a request, they complete without touching a pool
   idle_writer.commit().await.unwrap();
   for reader in idle_readers {
      reader.commit().await.unwrap();
   }
}

#[tokio::test]
async fn test_later_write_transaction_runs_first() {
   let temp_dir = TempDir::new().unwrap();
   let db = open_users(&temp_dir.path().join("out_of_order.db")).await;

   let first = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();
   let second = db
      .transaction(["users"], TransactionMode::ReadWrite)
      .unwrap();

   second
      .object_store("users")
      .unwrap()
      .add(json!({"id": 2, "email": "b@x.com"}), None)
      .await
      .unwrap();
   second.commit().await.unwrap();

   first
      .object_store("users")
      .unwrap()
      .add(json!({"id": 1, "email": "a@x.com"}), None)
      .await
      .unwrap();
   first.commit().await.unwrap();

   let tx = db.transaction(["users"], TransactionMode::ReadOnly).unwrap();
   let count = tx.object_store("users").unwrap().count(None).await.unwrap();
   assert_eq!(count, Output::Count(2));
}
