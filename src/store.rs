//! The schema store and its rows.
//!
//! `Database` holds every collection definition, every record, and the
//! ledger of applied migrations. It is persisted as a single JSON document
//! that is rewritten atomically after each successful mutation.

use crate::error::{ApiError, ApiResult};
use crate::record::Record;
use crate::schema::{self, Collection, FieldKind};
use crate::storage::{BlobCleanup, FileStorage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the document inside the data directory
pub const DATA_FILE: &str = "data.json";

/// Lock file serializing writers of one data directory
pub const LOCK_FILE: &str = "data.lock";

/// Timestamp in the backend's `2025-10-20 19:15:14.292Z` format
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ").to_string()
}

/// New random 15-character record/collection id
pub fn generate_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..15].to_string()
}

/// Exclusive hold on a data directory, released on drop.
///
/// Writers take it before loading the store and keep it until the store
/// is saved, so concurrent commands never overwrite each other's rows.
pub struct DataLock {
    file: File,
}

impl DataLock {
    /// Block until the data directory is free
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("failed to lock {}", path.display()))?;
        debug!(path = %path.display(), "acquired data lock");
        Ok(Self { file })
    }
}

impl Drop for DataLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Migration-interface operations on collection definitions
pub trait SchemaDao {
    fn find_collection_by_name_or_id(&self, key: &str) -> ApiResult<Collection>;
    fn save_collection(&mut self, collection: Collection) -> ApiResult<()>;
    fn delete_collection(&mut self, collection: &Collection) -> ApiResult<()>;
}

/// One entry of the applied-migrations ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub key: u64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    collections: Vec<Collection>,
    #[serde(default)]
    records: BTreeMap<String, Vec<Record>>,
    #[serde(default)]
    migrations: Vec<AppliedMigration>,
    /// Blob removals that wait until the store has been saved
    #[serde(skip)]
    pending_cleanup: Vec<BlobCleanup>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Fresh in-memory store holding only the built-in users collection
    pub fn new() -> Self {
        let mut users = schema::users_collection();
        let now = now_timestamp();
        users.created = now.clone();
        users.updated = now;
        Self {
            collections: vec![users],
            records: BTreeMap::new(),
            migrations: Vec::new(),
            pending_cleanup: Vec::new(),
            path: None,
        }
    }

    /// Load the store from `data_dir`, or start a fresh one there
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(DATA_FILE);
        let mut db = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let db: Database = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            debug!(path = %path.display(), collections = db.collections.len(), "loaded store");
            db
        } else {
            info!(path = %path.display(), "initializing new store");
            Database::new()
        };
        db.path = Some(path);
        Ok(db)
    }

    /// Write the store back to disk (no-op for in-memory stores)
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "saved store");
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn collection(&self, key: &str) -> Option<&Collection> {
        self.collections
            .iter()
            .find(|c| c.id == key)
            .or_else(|| self.collections.iter().find(|c| c.name == key))
    }

    /// Look up a collection or report it as not found
    pub fn require_collection(&self, key: &str) -> ApiResult<&Collection> {
        self.collection(key)
            .ok_or_else(|| ApiError::NotFound(format!("collection '{}'", key)))
    }

    pub fn records(&self, collection_id: &str) -> &[Record] {
        self.records
            .get(collection_id)
            .map(|r| r.as_slice())
            .unwrap_or(&[])
    }

    pub fn record(&self, collection_id: &str, id: &str) -> Option<&Record> {
        self.records(collection_id).iter().find(|r| r.id == id)
    }

    pub fn record_exists(&self, collection_id: &str, id: &str) -> bool {
        self.record(collection_id, id).is_some()
    }

    /// Whether an auth collection already has a row with this email
    pub fn email_in_use(&self, collection_id: &str, email: &str, except_id: Option<&str>) -> bool {
        self.records(collection_id).iter().any(|r| {
            Some(r.id.as_str()) != except_id
                && r.get_str("email")
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
        })
    }

    pub fn insert_record(&mut self, record: Record) -> ApiResult<()> {
        if self.record_exists(&record.collection_id, &record.id) {
            return Err(ApiError::Conflict(format!(
                "record '{}' already exists",
                record.id
            )));
        }
        self.records
            .entry(record.collection_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    pub fn replace_record(&mut self, record: Record) -> ApiResult<()> {
        let rows = self.records.entry(record.collection_id.clone()).or_default();
        match rows.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(ApiError::NotFound(format!("record '{}'", record.id))),
        }
    }

    pub fn remove_record(&mut self, collection_id: &str, id: &str) -> Option<Record> {
        let rows = self.records.get_mut(collection_id)?;
        let index = rows.iter().position(|r| r.id == id)?;
        Some(rows.remove(index))
    }

    pub fn applied_migrations(&self) -> &[AppliedMigration] {
        &self.migrations
    }

    pub fn is_applied(&self, key: u64) -> bool {
        self.migrations.iter().any(|m| m.key == key)
    }

    pub fn mark_applied(&mut self, key: u64, name: &str) {
        self.migrations.push(AppliedMigration {
            key,
            name: name.to_string(),
            applied_at: Utc::now(),
        });
    }

    pub fn mark_reverted(&mut self, key: u64) {
        self.migrations.retain(|m| m.key != key);
    }

    /// Queue a blob removal for after the next successful save
    pub fn queue_cleanup(&mut self, item: BlobCleanup) {
        self.pending_cleanup.push(item);
    }

    pub fn take_cleanup(&mut self) -> Vec<BlobCleanup> {
        std::mem::take(&mut self.pending_cleanup)
    }

    /// Save the store, then remove the blobs its changes orphaned.
    ///
    /// When the save fails the queue is kept and no file is touched.
    pub fn commit(&mut self, storage: &FileStorage) -> Result<()> {
        self.save()?;
        storage.cleanup(self.take_cleanup());
        Ok(())
    }

    /// Collections with a relation field pointing at `collection_id`
    pub fn referencing_fields(&self, collection_id: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for c in &self.collections {
            for f in &c.schema {
                if let FieldKind::Relation(o) = &f.kind {
                    if o.collection_id == collection_id {
                        out.push((c.id.clone(), f.name.clone()));
                    }
                }
            }
        }
        out
    }

    fn check_relations_and_names(&self, collection: &Collection) -> ApiResult<()> {
        let mut errors = collection.validate_definition();

        if self
            .collections
            .iter()
            .any(|c| c.id != collection.id && c.name.eq_ignore_ascii_case(&collection.name))
        {
            errors.add(
                "name",
                "name_taken",
                format!("Collection name '{}' is already in use", collection.name),
            );
        }

        for (i, field) in collection.schema.iter().enumerate() {
            if let FieldKind::Relation(o) = &field.kind {
                let target_exists = o.collection_id == collection.id
                    || self.collections.iter().any(|c| c.id == o.collection_id);
                if !target_exists {
                    errors.add(
                        &format!("schema.{}", i),
                        "missing_collection",
                        format!("Related collection '{}' does not exist", o.collection_id),
                    );
                }
            }
        }

        errors.into_result()
    }

    /// Carry row data across a schema change: renamed fields follow their
    /// field id, removed fields are dropped.
    fn migrate_rows(&mut self, old: &Collection, new: &Collection) {
        let Some(rows) = self.records.get_mut(&new.id) else {
            return;
        };
        for row in rows.iter_mut() {
            for old_field in &old.schema {
                match new.schema.iter().find(|f| f.id == old_field.id) {
                    Some(f) if f.name != old_field.name => {
                        if let Some(v) = row.data.remove(&old_field.name) {
                            row.data.insert(f.name.clone(), v);
                        }
                    }
                    Some(_) => {}
                    None => {
                        row.data.remove(&old_field.name);
                    }
                }
            }
            row.collection_name = new.name.clone();
        }
    }
}

impl SchemaDao for Database {
    fn find_collection_by_name_or_id(&self, key: &str) -> ApiResult<Collection> {
        self.require_collection(key).cloned()
    }

    fn save_collection(&mut self, mut collection: Collection) -> ApiResult<()> {
        if collection.id.is_empty() {
            collection.id = generate_id();
        }
        self.check_relations_and_names(&collection)?;

        let now = now_timestamp();
        collection.updated = now.clone();

        match self.collections.iter().position(|c| c.id == collection.id) {
            Some(index) => {
                let old = self.collections[index].clone();
                if collection.collection_type != old.collection_type {
                    return Err(ApiError::BadRequest(format!(
                        "cannot change the type of collection '{}'",
                        old.name
                    )));
                }
                if collection.created.is_empty() {
                    collection.created = old.created.clone();
                }
                self.migrate_rows(&old, &collection);
                debug!(collection = %collection.name, "updated collection");
                self.collections[index] = collection;
            }
            None => {
                if collection.created.is_empty() {
                    collection.created = now;
                }
                debug!(collection = %collection.name, "created collection");
                self.collections.push(collection);
            }
        }
        Ok(())
    }

    fn delete_collection(&mut self, collection: &Collection) -> ApiResult<()> {
        let Some(index) = self.collections.iter().position(|c| c.id == collection.id) else {
            return Err(ApiError::NotFound(format!("collection '{}'", collection.id)));
        };
        if self.collections[index].system {
            return Err(ApiError::BadRequest(format!(
                "system collection '{}' cannot be deleted",
                collection.name
            )));
        }
        let referenced_by: Vec<String> = self
            .referencing_fields(&collection.id)
            .into_iter()
            .filter(|(owner, _)| owner != &collection.id)
            .map(|(owner, field)| format!("{}.{}", owner, field))
            .collect();
        if !referenced_by.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "collection '{}' is referenced by {}",
                collection.name,
                referenced_by.join(", ")
            )));
        }

        let removed = self.collections.remove(index);
        let rows = self.records.remove(&removed.id).map_or(0, |r| r.len());
        info!(collection = %removed.name, rows, "deleted collection");
        self.queue_cleanup(BlobCleanup::Collection(removed.id));
        Ok(())
    }
}
