//! Versioned migration plans and the state machine that applies them while a
//! connection opens.
//!
//! A [`MigrationPlan`] maps `"from-to"` step keys to the schema changes that
//! move a database from one version to the next. During an upgrade every
//! version in `[old, new)` is visited in order; for version `v` the step
//! `"v-(v+1)"` is used if present, otherwise `"v-new"`, otherwise the version
//! is skipped.
//!
//! Plans deserialize from JSON:
//!
//! ```
//! use reactive_objstore::MigrationPlan;
//!
//! let plan: MigrationPlan = serde_json::from_str(r#"{
//!    "0-1": {
//!       "create": [{
//!          "name": "users",
//!          "keyPath": "id",
//!          "index": [{ "name": "byEmail", "keyPath": "email", "unique": true }]
//!       }]
//!    },
//!    "1-2": {
//!       "update": { "users": { "create": [{ "name": "byAge", "keyPath": "age" }] } }
//!    }
//! }"#).unwrap();
//!
//! assert!(plan.step_for(0, 2).is_some());
//! assert_eq!(plan.len(), 2);
//! ```

use std::path::PathBuf;

use futures::StreamExt;
use futures::future::{BoxFuture, try_join_all};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx_sqlite_objstore::{
   IndexParameters, KeyPath, ObjectDatabase, ObjectStoreParameters, OpenEvent, VersionChange,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Ordered set of migration steps keyed by `"from-to"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationPlan {
   steps: IndexMap<String, MigrationStep>,
}

impl MigrationPlan {
   pub fn new() -> Self {
      Self::default()
   }

   /// Adds (or replaces) the step moving from `from` to `to`.
   pub fn step(mut self, from: u32, to: u32, step: MigrationStep) -> Self {
      self.steps.insert(step_key(from, to), step);
      self
   }

   /// The step to apply while at `version`, upgrading towards `target`.
   pub fn step_for(&self, version: u32, target: u32) -> Option<&MigrationStep> {
      self
         .steps
         .get(&step_key(version, version + 1))
         .or_else(|| self.steps.get(&step_key(version, target)))
   }

   pub fn len(&self) -> usize {
      self.steps.len()
   }

   pub fn is_empty(&self) -> bool {
      self.steps.is_empty()
   }
}

fn step_key(from: u32, to: u32) -> String {
   format!("{from}-{to}")
}

/// Schema changes for one step. Applied as: creates, deletes, then updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationStep {
   pub create: Vec<CreateStore>,
   pub delete: Vec<String>,
   pub update: IndexMap<String, UpdateStore>,
}

impl MigrationStep {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn create(mut self, store: CreateStore) -> Self {
      self.create.push(store);
      self
   }

   pub fn delete(mut self, store: impl Into<String>) -> Self {
      self.delete.push(store.into());
      self
   }

   pub fn update(mut self, store: impl Into<String>, update: UpdateStore) -> Self {
      self.update.insert(store.into(), update);
      self
   }
}

/// A collection to create, with its indexes and seed records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStore {
   pub name: String,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub key_path: Option<KeyPath>,
   #[serde(default)]
   pub auto_increment: bool,
   #[serde(default, alias = "index")]
   pub indexes: Vec<IndexDefinition>,
   #[serde(default)]
   pub data: Vec<Value>,
}

impl CreateStore {
   pub fn new(name: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         key_path: None,
         auto_increment: false,
         indexes: Vec::new(),
         data: Vec::new(),
      }
   }

   pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
      self.key_path = Some(key_path.into());
      self
   }

   pub fn auto_increment(mut self, auto_increment: bool) -> Self {
      self.auto_increment = auto_increment;
      self
   }

   pub fn index(mut self, index: IndexDefinition) -> Self {
      self.indexes.push(index);
      self
   }

   pub fn data(mut self, records: impl IntoIterator<Item = Value>) -> Self {
      self.data.extend(records);
      self
   }

   fn parameters(&self) -> ObjectStoreParameters {
      ObjectStoreParameters {
         key_path: self.key_path.clone(),
         auto_increment: self.auto_increment,
      }
   }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
   pub name: String,
   pub key_path: KeyPath,
   #[serde(default)]
   pub unique: bool,
   #[serde(default)]
   pub multi_entry: bool,
}

impl IndexDefinition {
   pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
      Self {
         name: name.into(),
         key_path: key_path.into(),
         unique: false,
         multi_entry: false,
      }
   }

   pub fn unique(mut self, unique: bool) -> Self {
      self.unique = unique;
      self
   }

   pub fn multi_entry(mut self, multi_entry: bool) -> Self {
      self.multi_entry = multi_entry;
      self
   }

   fn parameters(&self) -> IndexParameters {
      IndexParameters {
         unique: self.unique,
         multi_entry: self.multi_entry,
      }
   }
}

/// Index changes and seed records for an existing collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateStore {
   pub create: Vec<IndexDefinition>,
   pub delete: Vec<String>,
   pub data: Vec<Value>,
}

impl UpdateStore {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn create_index(mut self, index: IndexDefinition) -> Self {
      self.create.push(index);
      self
   }

   pub fn delete_index(mut self, name: impl Into<String>) -> Self {
      self.delete.push(name.into());
      self
   }

   pub fn data(mut self, records: impl IntoIterator<Item = Value>) -> Self {
      self.data.extend(records);
      self
   }
}

/// Where a connection is in its open sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenState {
   #[default]
   Closed,
   Opening,
   UpgradeNeeded,
   Upgrading,
   Open,
   Failed,
}

impl OpenState {
   pub fn is_terminal(&self) -> bool {
      matches!(self, OpenState::Open | OpenState::Failed)
   }

   fn can_transition_to(self, next: OpenState) -> bool {
      use OpenState::*;
      matches!(
         (self, next),
         (Closed, Opening)
            | (Opening, UpgradeNeeded | Open | Failed)
            | (UpgradeNeeded, Upgrading | Failed)
            | (Upgrading, Open | Failed)
      )
   }
}

/// Drives one open request to completion, applying the plan if the engine
/// asks for an upgrade.
pub(crate) struct MigrationEngine {
   path: PathBuf,
   version: Option<u32>,
   plan: MigrationPlan,
   config: ConnectionConfig,
   state: watch::Sender<OpenState>,
}

impl MigrationEngine {
   pub(crate) fn new(
      path: PathBuf,
      version: Option<u32>,
      plan: MigrationPlan,
      config: ConnectionConfig,
      state: watch::Sender<OpenState>,
   ) -> Self {
      Self {
         path,
         version,
         plan,
         config,
         state,
      }
   }

   fn transition(&self, next: OpenState) -> bool {
      let current = *self.state.borrow();
      if !current.can_transition_to(next) {
         warn!(from = ?current, to = ?next, "Rejected invalid open state transition");
         return false;
      }
      trace!(from = ?current, to = ?next, "Open state transition");
      self.state.send_replace(next);
      true
   }

   /// Runs the open sequence. The state channel closes when this returns.
   pub(crate) async fn run(self) -> Result<ObjectDatabase> {
      self.transition(OpenState::Opening);
      let mut request =
         ObjectDatabase::open(&self.path, self.version, self.config.database.clone());

      while let Some(event) = request.next().await {
         match event {
            OpenEvent::Blocked {
               old_version,
               new_version,
            } => {
               warn!(
                  path = %self.path.display(),
                  old_version,
                  new_version,
                  "Open blocked until other connections close"
               );
            }
            OpenEvent::UpgradeNeeded(change) => {
               let (from, to) = (change.old_version(), change.new_version());
               self.transition(OpenState::UpgradeNeeded);
               self.transition(OpenState::Upgrading);
               debug!(path = %self.path.display(), from, to, "Applying migration plan");

               if let Err(e) = apply_plan(&self.plan, &change).await {
                  warn!(path = %self.path.display(), from, to, error = %e, "Migration failed");
                  change.abort();
                  self.transition(OpenState::Failed);
                  return Err(Error::upgrade(from, to, e));
               }
               change.finish();
            }
            OpenEvent::Success(db) => {
               debug!(path = %self.path.display(), version = db.version(), "Database open");
               self.transition(OpenState::Open);
               return Ok(db);
            }
            OpenEvent::Error(e) => {
               self.transition(OpenState::Failed);
               return Err(Error::open(e));
            }
         }
      }

      self.transition(OpenState::Failed);
      Err(Error::open(sqlx_sqlite_objstore::Error::Aborted(
         "open request ended without a result".into(),
      )))
   }
}

/// Applies every step between the change's old and new version.
///
/// Creates and deletes run one at a time. Each step's update batch is queued
/// behind them without waiting, and all batches are joined at the end.
async fn apply_plan(
   plan: &MigrationPlan,
   change: &VersionChange,
) -> sqlx_sqlite_objstore::Result<()> {
   let target = change.new_version();
   let mut updates: Vec<BoxFuture<'static, sqlx_sqlite_objstore::Result<()>>> = Vec::new();

   for version in change.old_version()..target {
      let Some(step) = plan.step_for(version, target) else {
         trace!(version, target, "No migration step");
         continue;
      };

      for store in &step.create {
         if change.contains(&store.name) {
            debug!(store = %store.name, "Collection already exists, skipping create");
            continue;
         }
         change
            .create_object_store(&store.name, store.parameters())
            .await?;
         for index in &store.indexes {
            change
               .create_index(&store.name, &index.name, index.key_path.clone(), index.parameters())
               .await?;
         }
         for record in &store.data {
            change.put(&store.name, record.clone(), None).await?;
         }
      }

      for name in &step.delete {
         change.delete_object_store(name).await?;
      }

      if step.update.is_empty() {
         continue;
      }
      let mut batch = change.transaction(step.update.keys().cloned())?;
      for (store, update) in &step.update {
         for index in &update.create {
            batch.create_index(store, &index.name, index.key_path.clone(), index.parameters());
         }
         for name in &update.delete {
            batch.delete_index(store, name);
         }
         for record in &update.data {
            batch.put(store, record.clone(), None);
         }
      }
      updates.push(batch.commit());
   }

   try_join_all(updates).await?;
   Ok(())
}
