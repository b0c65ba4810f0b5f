//! Schema migrations.
//!
//! A migration is a keyed pair of functions over the store. The runner
//! applies pending units in key order and reverts applied units newest
//! first. Each unit runs against a copy of the store that replaces the
//! original only when the unit succeeds, so a failing unit changes nothing.

pub mod m1760987154_updated_users;
pub mod m1760987714_created_audio_files;
pub mod m1760987767_updated_audio_files;

use crate::audit::AuditLog;
use crate::error::{ApiError, ApiResult};
use crate::store::Database;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub type MigrationFn = fn(&mut Database) -> ApiResult<()>;

#[derive(Clone, Copy)]
pub struct Migration {
    pub key: u64,
    pub name: &'static str,
    pub up: MigrationFn,
    pub down: MigrationFn,
}

/// Every migration shipped with the application
pub fn all() -> Vec<Migration> {
    vec![
        m1760987154_updated_users::migration(),
        m1760987714_created_audio_files::migration(),
        m1760987767_updated_audio_files::migration(),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatus {
    pub key: u64,
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

pub struct MigrationRunner {
    units: Vec<Migration>,
}

impl MigrationRunner {
    pub fn new(mut units: Vec<Migration>) -> ApiResult<Self> {
        units.sort_by_key(|m| m.key);
        if let Some(pair) = units.windows(2).find(|w| w[0].key == w[1].key) {
            return Err(ApiError::Conflict(format!(
                "duplicate migration key {} ({} and {})",
                pair[0].key, pair[0].name, pair[1].name
            )));
        }
        Ok(Self { units })
    }

    pub fn units(&self) -> &[Migration] {
        &self.units
    }

    pub fn pending(&self, db: &Database) -> Vec<Migration> {
        self.units
            .iter()
            .filter(|m| !db.is_applied(m.key))
            .copied()
            .collect()
    }

    /// Apply every pending unit in key order.
    ///
    /// Stops at the first failing unit; units applied before it stay
    /// applied.
    pub fn up(&self, db: &mut Database, audit: &mut AuditLog) -> ApiResult<Vec<Migration>> {
        let mut applied = Vec::new();
        for unit in self.pending(db) {
            run_unit(db, &unit, true)?;
            info!(key = unit.key, name = unit.name, "applied migration");
            log_audit(audit.migration("up", unit.key, unit.name));
            applied.push(unit);
        }
        Ok(applied)
    }

    /// Revert the last `count` applied units, newest first
    pub fn down(
        &self,
        db: &mut Database,
        count: usize,
        audit: &mut AuditLog,
    ) -> ApiResult<Vec<Migration>> {
        let mut keys: Vec<u64> = db.applied_migrations().iter().map(|m| m.key).collect();
        keys.sort_unstable_by(|a, b| b.cmp(a));

        let mut reverted = Vec::new();
        for key in keys.into_iter().take(count) {
            let Some(unit) = self.units.iter().find(|m| m.key == key) else {
                return Err(ApiError::Conflict(format!(
                    "applied migration {} is unknown to this build",
                    key
                )));
            };
            run_unit(db, unit, false)?;
            info!(key = unit.key, name = unit.name, "reverted migration");
            log_audit(audit.migration("down", unit.key, unit.name));
            reverted.push(*unit);
        }
        Ok(reverted)
    }

    /// The store as it would be after `up`, without touching `db`
    pub fn preview_up(&self, db: &Database) -> ApiResult<Database> {
        let mut draft = db.clone();
        for unit in self.pending(db) {
            run_unit(&mut draft, &unit, true)?;
        }
        Ok(draft)
    }

    pub fn status(&self, db: &Database) -> Vec<MigrationStatus> {
        let mut out: Vec<MigrationStatus> = self
            .units
            .iter()
            .map(|m| MigrationStatus {
                key: m.key,
                name: m.name.to_string(),
                applied_at: db
                    .applied_migrations()
                    .iter()
                    .find(|a| a.key == m.key)
                    .map(|a| a.applied_at),
            })
            .collect();
        // Applied units this build no longer ships
        for applied in db.applied_migrations() {
            if !self.units.iter().any(|m| m.key == applied.key) {
                out.push(MigrationStatus {
                    key: applied.key,
                    name: applied.name.clone(),
                    applied_at: Some(applied.applied_at),
                });
            }
        }
        out.sort_by_key(|s| s.key);
        out
    }
}

fn run_unit(db: &mut Database, unit: &Migration, forward: bool) -> ApiResult<()> {
    let mut draft = db.clone();
    let result = if forward {
        (unit.up)(&mut draft)
    } else {
        (unit.down)(&mut draft)
    };
    if let Err(e) = result {
        warn!(key = unit.key, name = unit.name, forward, error = %e, "migration failed");
        return Err(e);
    }
    if forward {
        draft.mark_applied(unit.key, unit.name);
    } else {
        draft.mark_reverted(unit.key);
    }
    *db = draft;
    Ok(())
}

fn log_audit(result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "failed to write audit event");
    }
}

#[cfg(test)]
mod tests {
    use super::m1760987714_created_audio_files::{AUDIO_FILES_ID, CATEGORIES};
    use super::*;
    use crate::auth::{AuthIdentity, RequestContext};
    use crate::record::{FileUpload, Record, RecordPayload};
    use crate::records::RecordService;
    use crate::rule::{Operation, RulePolicy};
    use crate::schema::{Collection, USERS_COLLECTION_ID};
    use crate::storage::{BlobCleanup, FileStorage};
    use crate::store::SchemaDao;
    use serde_json::json;
    use tempfile::TempDir;

    const MP3: &[u8] = b"ID3\x04\x00\x00\x00\x00\x00\x00frames";

    fn runner() -> MigrationRunner {
        MigrationRunner::new(all()).unwrap()
    }

    fn migrated(count: usize) -> Database {
        let mut db = Database::new();
        let units = runner();
        for unit in &units.units()[..count] {
            run_unit(&mut db, unit, true).unwrap();
        }
        db
    }

    fn assert_same_collections(a: &Database, b: &Database) {
        assert_eq!(a.collections().len(), b.collections().len());
        for (x, y) in a.collections().iter().zip(b.collections()) {
            assert!(x.same_definition(y), "{} differs", x.name);
        }
    }

    struct App {
        _dir: TempDir,
        db: Database,
        storage: FileStorage,
        audit: AuditLog,
    }

    impl App {
        fn new(db: Database) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                storage: FileStorage::new(dir.path()),
                _dir: dir,
                db,
                audit: AuditLog::disabled(),
            }
        }

        fn service(&mut self) -> RecordService<'_> {
            RecordService::new(&mut self.db, &self.storage, "http://localhost:8090", &mut self.audit)
        }

        fn user(&mut self, email: &str) -> RequestContext {
            let payload = RecordPayload::new()
                .field("email", email)
                .field("password", "password123");
            let record = self
                .service()
                .create(&RequestContext::superuser(), "users", payload)
                .unwrap();
            RequestContext::authenticated(AuthIdentity::new(record))
        }

        fn upload(&mut self, ctx: &RequestContext, uploader: &RequestContext) -> Record {
            let payload = RecordPayload::new()
                .field("uploader_id", id_of(uploader))
                .field("description", "demo")
                .field("category", "Podcast")
                .file(FileUpload::new("file", "episode.mp3", MP3.to_vec()));
            self.service().create(ctx, "audio_files", payload).unwrap()
        }
    }

    fn id_of(ctx: &RequestContext) -> String {
        ctx.auth.as_ref().unwrap().id().to_string()
    }

    #[test]
    fn test_runner_sorts_and_rejects_duplicates() {
        let mut units = all();
        units.reverse();
        let runner = MigrationRunner::new(units).unwrap();
        let keys: Vec<u64> = runner.units().iter().map(|m| m.key).collect();
        assert_eq!(keys, vec![1760987154, 1760987714, 1760987767]);

        let mut dup = all();
        dup.push(all()[0]);
        assert!(matches!(MigrationRunner::new(dup), Err(ApiError::Conflict(_))));
    }

    #[test]
    fn test_up_applies_once_in_order() {
        let mut db = Database::new();
        let mut audit = AuditLog::disabled();
        let runner = runner();

        let applied = runner.up(&mut db, &mut audit).unwrap();
        assert_eq!(applied.len(), 3);
        assert!(runner.pending(&db).is_empty());
        assert!(runner.status(&db).iter().all(|s| s.is_applied()));
        assert!(runner.up(&mut db, &mut audit).unwrap().is_empty());
        assert_eq!(db.applied_migrations().len(), 3);

        let audio = db.find_collection_by_name_or_id("audio_files").unwrap();
        assert_eq!(
            audio.rule(Operation::View).unwrap().policy(),
            RulePolicy::FieldEquals {
                auth_field: "id".to_string(),
                record_field: "uploader_id".to_string()
            }
        );
        assert_eq!(
            audio.rule(Operation::Create).unwrap().policy(),
            RulePolicy::AuthenticatedOnly
        );
    }

    #[test]
    fn test_each_unit_round_trips() {
        let units = runner();
        for (i, unit) in units.units().iter().enumerate() {
            let before = migrated(i);
            let mut db = before.clone();
            run_unit(&mut db, unit, true).unwrap();
            assert!(db.is_applied(unit.key));
            run_unit(&mut db, unit, false).unwrap();
            assert!(!db.is_applied(unit.key));
            assert_same_collections(&before, &db);
            assert_eq!(
                db.applied_migrations().len(),
                before.applied_migrations().len()
            );
        }
    }

    #[test]
    fn test_users_revert_restores_exact_rules() {
        let mut db = migrated(1);
        let users = db.find_collection_by_name_or_id(USERS_COLLECTION_ID).unwrap();
        assert_eq!(users.list_rule.as_deref(), Some("@request.auth.id != \"\""));
        assert_eq!(
            users.auth_options().unwrap().manage_rule.as_deref(),
            Some("@request.auth.id != \"\"")
        );

        runner()
            .down(&mut db, 1, &mut AuditLog::disabled())
            .unwrap();
        let users = db.find_collection_by_name_or_id(USERS_COLLECTION_ID).unwrap();
        assert_eq!(users.create_rule.as_deref(), Some(""));
        assert_eq!(users.list_rule.as_deref(), Some("id = @request.auth.id"));
        assert!(users.auth_options().unwrap().manage_rule.is_none());
    }

    #[test]
    fn test_manage_rule_lets_accounts_verify_each_other() {
        let mut app = App::new(migrated(0));
        let u = app.user("u@example.com");
        let v = app.user("v@example.com");
        let verify = || RecordPayload::new().field("verified", true);

        let err = app.service().update(&v, "users", &id_of(&u), verify()).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        let own = app.service().update(&u, "users", &id_of(&u), verify()).unwrap();
        assert_eq!(own.data["verified"], json!(false));

        let mut app = App::new(migrated(1));
        let u = app.user("u@example.com");
        let v = app.user("v@example.com");
        let updated = app.service().update(&v, "users", &id_of(&u), verify()).unwrap();
        assert_eq!(updated.data["verified"], json!(true));
    }

    #[test]
    fn test_down_reverts_newest_first() {
        let mut db = migrated(3);
        let reverted = runner()
            .down(&mut db, 2, &mut AuditLog::disabled())
            .unwrap();
        let keys: Vec<u64> = reverted.iter().map(|m| m.key).collect();
        assert_eq!(keys, vec![1760987767, 1760987714]);
        assert!(db.collection(AUDIO_FILES_ID).is_none());
        assert!(db.is_applied(1760987154));
    }

    #[test]
    fn test_failed_unit_changes_nothing() {
        fn broken_up(db: &mut Database) -> ApiResult<()> {
            db.save_collection(Collection::new_base("scratch00000001", "scratch"))?;
            Err(ApiError::BadRequest("boom".to_string()))
        }
        fn noop(_db: &mut Database) -> ApiResult<()> {
            Ok(())
        }

        let mut units = all();
        units.push(Migration {
            key: 1760990000,
            name: "1760990000_broken",
            up: broken_up,
            down: noop,
        });
        let runner = MigrationRunner::new(units).unwrap();
        let mut db = Database::new();
        assert!(runner.up(&mut db, &mut AuditLog::disabled()).is_err());
        assert_eq!(db.applied_migrations().len(), 3);
        assert!(db.collection("scratch").is_none());
        assert_eq!(runner.pending(&db).len(), 1);
    }

    #[test]
    fn test_unit_without_prerequisite_fails_cleanly() {
        let mut db = Database::new();
        let unit = m1760987767_updated_audio_files::migration();
        assert!(matches!(
            run_unit(&mut db, &unit, true),
            Err(ApiError::NotFound(_))
        ));
        assert!(db.applied_migrations().is_empty());
    }

    #[test]
    fn test_preview_leaves_store_untouched() {
        let db = Database::new();
        let preview = runner().preview_up(&db).unwrap();
        assert!(preview.collection("audio_files").is_some());
        assert!(db.collection("audio_files").is_none());
        assert!(db.applied_migrations().is_empty());
    }

    #[test]
    fn test_owner_only_audio_files() {
        let mut app = App::new(migrated(3));
        let u = app.user("u@example.com");
        let v = app.user("v@example.com");
        let record = app.upload(&u, &u);

        let listed = app.service().get_full_list(&u, "audio_files", None, None).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(app.service().get_one(&u, "audio_files", &record.id).is_ok());
        app.service()
            .update(
                &u,
                "audio_files",
                &record.id,
                RecordPayload::new().field("category", "Music"),
            )
            .unwrap();

        assert!(app
            .service()
            .get_full_list(&v, "audio_files", None, None)
            .unwrap()
            .is_empty());
        assert!(matches!(
            app.service().get_one(&v, "audio_files", &record.id),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            app.service().update(
                &v,
                "audio_files",
                &record.id,
                RecordPayload::new().field("description", "mine now")
            ),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            app.service().delete(&v, "audio_files", &record.id),
            Err(ApiError::NotFound(_))
        ));

        app.service().delete(&u, "audio_files", &record.id).unwrap();
        assert!(app.db.records(AUDIO_FILES_ID).is_empty());
    }

    #[test]
    fn test_create_on_behalf_of_another_uploader() {
        let mut app = App::new(migrated(3));
        let u = app.user("u@example.com");
        let v = app.user("v@example.com");

        // Any authenticated account may create, whoever it names as uploader
        let record = app.upload(&v, &u);
        assert_eq!(record.get_str("uploader_id"), Some(id_of(&u).as_str()));
        assert!(matches!(
            app.service().get_one(&v, "audio_files", &record.id),
            Err(ApiError::NotFound(_))
        ));

        let anonymous = RecordPayload::new().field("description", "x");
        assert!(matches!(
            app.service()
                .create(&RequestContext::anonymous(), "audio_files", anonymous),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_any_authenticated_user_manages_users() {
        let mut app = App::new(migrated(1));
        let u = app.user("u@example.com");
        let v = app.user("v@example.com");
        let u_id = id_of(&u);

        let listed = app.service().get_full_list(&v, "users", None, None).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(app.service().get_one(&v, "users", &u_id).is_ok());
        let updated = app
            .service()
            .update(&v, "users", &u_id, RecordPayload::new().field("name", "Renamed"))
            .unwrap();
        assert_eq!(updated.get_str("name"), Some("Renamed"));

        let anon = RequestContext::anonymous();
        assert!(app
            .service()
            .get_full_list(&anon, "users", None, None)
            .unwrap()
            .is_empty());
        assert!(app.service().get_one(&anon, "users", &u_id).is_err());
        assert!(app
            .service()
            .update(&anon, "users", &u_id, RecordPayload::new().field("name", "x"))
            .is_err());
        assert!(app.service().delete(&anon, "users", &u_id).is_err());
        let signup = RecordPayload::new()
            .field("email", "w@example.com")
            .field("password", "password123");
        assert!(matches!(
            app.service().create(&anon, "users", signup),
            Err(ApiError::Forbidden(_))
        ));

        app.service().delete(&v, "users", &u_id).unwrap();
        assert!(!app.db.record_exists(USERS_COLLECTION_ID, &u_id));
    }

    #[test]
    fn test_attachment_limits_apply_to_everyone() {
        let mut app = App::new(migrated(3));
        let u = app.user("u@example.com");
        let su = RequestContext::superuser();

        for ctx in [&u, &su] {
            let oversized = [MP3, &vec![0u8; 5_242_880][..]].concat();
            let payload = RecordPayload::new()
                .field("uploader_id", id_of(&u))
                .file(FileUpload::new("file", "long.mp3", oversized));
            let err = app.service().create(ctx, "audio_files", payload).unwrap_err();
            assert!(err.field_errors().iter().any(|e| e.code == "file_too_large"));

            let wav = b"RIFF\x00\x00\x00\x00WAVEfmt ".to_vec();
            let payload = RecordPayload::new()
                .field("uploader_id", id_of(&u))
                .file(FileUpload::new("file", "clip.mp3", wav));
            let err = app.service().create(ctx, "audio_files", payload).unwrap_err();
            assert!(err.field_errors().iter().any(|e| e.code == "invalid_mime_type"));
        }
    }

    #[test]
    fn test_category_must_be_listed() {
        let mut app = App::new(migrated(3));
        let u = app.user("u@example.com");
        for category in CATEGORIES {
            let payload = RecordPayload::new()
                .field("uploader_id", id_of(&u))
                .field("category", category);
            assert!(app.service().create(&u, "audio_files", payload).is_ok());
        }
        let payload = RecordPayload::new()
            .field("uploader_id", id_of(&u))
            .field("category", "Jazz");
        let err = app.service().create(&u, "audio_files", payload).unwrap_err();
        assert_eq!(err.field_errors()[0].field, "category");
    }

    #[test]
    fn test_reverting_creation_drops_rows() {
        let mut app = App::new(migrated(3));
        let u = app.user("u@example.com");
        app.upload(&u, &u);
        app.upload(&u, &u);
        assert_eq!(app.db.records(AUDIO_FILES_ID).len(), 2);

        runner()
            .down(&mut app.db, 2, &mut AuditLog::disabled())
            .unwrap();
        assert!(app.db.collection("audio_files").is_none());
        assert!(app.db.records(AUDIO_FILES_ID).is_empty());
        assert_eq!(
            app.db.take_cleanup(),
            vec![BlobCleanup::Collection(AUDIO_FILES_ID.to_string())]
        );

        // Re-applying starts from an empty collection
        runner().up(&mut app.db, &mut AuditLog::disabled()).unwrap();
        assert!(app.db.records(AUDIO_FILES_ID).is_empty());
    }
}
