//! Password authentication and the persisted client session.
//!
//! The identity of the requester is never global: commands load the session
//! file, resolve it against the store, and pass the resulting
//! `RequestContext` into every record operation.

use crate::error::{ApiError, ApiResult};
use crate::record::Record;
use crate::rule::FieldSource;
use crate::store::Database;
use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

pub const SESSION_FILE: &str = "session.json";

/// Hash a password into an argon2id PHC string with a fresh random salt
pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| ApiError::Internal(format!("failed to encode password salt: {}", e)))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC hash; malformed hashes never match
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(encoded) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// An authenticated auth-collection record
#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity {
    record: Record,
}

impl AuthIdentity {
    pub fn new(record: Record) -> Self {
        Self { record }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn email(&self) -> &str {
        self.record.get_str("email").unwrap_or("")
    }

    pub fn collection_id(&self) -> &str {
        &self.record.collection_id
    }

    pub fn collection_name(&self) -> &str {
        &self.record.collection_name
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

impl FieldSource for AuthIdentity {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.record.get(name)
    }
}

/// Who is making a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    pub auth: Option<AuthIdentity>,
    /// Platform administrator; bypasses every access rule
    pub superuser: bool,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn superuser() -> Self {
        Self {
            auth: None,
            superuser: true,
        }
    }

    pub fn authenticated(identity: AuthIdentity) -> Self {
        Self {
            auth: Some(identity),
            superuser: false,
        }
    }

    pub fn auth_source(&self) -> Option<&dyn FieldSource> {
        self.auth.as_ref().map(|a| a as &dyn FieldSource)
    }

    /// Short label for logs and audit events
    pub fn actor(&self) -> Option<String> {
        match (&self.auth, self.superuser) {
            (_, true) => Some("superuser".to_string()),
            (Some(a), false) => Some(a.email().to_string()),
            (None, false) => None,
        }
    }
}

/// Verify email and password against an auth collection
pub fn authenticate_with_password(
    db: &Database,
    collection: &str,
    email: &str,
    password: &str,
) -> ApiResult<AuthIdentity> {
    let collection = db.require_collection(collection)?;
    let Some(options) = collection.auth_options() else {
        return Err(ApiError::BadRequest(format!(
            "'{}' is not an auth collection",
            collection.name
        )));
    };
    if !options.allow_email_auth {
        return Err(ApiError::BadRequest(
            "Email/password authentication is not enabled".to_string(),
        ));
    }

    let failed = || ApiError::BadRequest("Failed to authenticate.".to_string());
    let record = db
        .records(&collection.id)
        .iter()
        .find(|r| {
            r.get_str("email")
                .is_some_and(|e| !e.is_empty() && e.eq_ignore_ascii_case(email))
        })
        .ok_or_else(failed)?;
    let hash = record.password_hash.as_deref().ok_or_else(failed)?;
    if !verify_password(password, hash) {
        return Err(failed());
    }
    if options.only_verified && record.get("verified") != Some(Value::Bool(true)) {
        return Err(ApiError::Forbidden(
            "The account is not verified".to_string(),
        ));
    }

    debug!(collection = %collection.name, record_id = %record.id, "authenticated");
    Ok(AuthIdentity::new(record.clone()))
}

/// The client's persisted login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub collection_id: String,
    pub record_id: String,
    pub email: String,
    pub issued_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn new(identity: &AuthIdentity) -> Self {
        Self {
            collection_id: identity.collection_id().to_string(),
            record_id: identity.id().to_string(),
            email: identity.email().to_string(),
            issued_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let session = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(session))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Delete the session file; returns whether one existed
    pub fn clear(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the session into a request context.
    ///
    /// A session whose record no longer exists is treated as logged out.
    pub fn resolve(&self, db: &Database) -> RequestContext {
        match db.record(&self.collection_id, &self.record_id) {
            Some(record) => RequestContext::authenticated(AuthIdentity::new(record.clone())),
            None => {
                warn!(
                    email = %self.email,
                    record_id = %self.record_id,
                    "session refers to a missing account; continuing unauthenticated"
                );
                RequestContext::anonymous()
            }
        }
    }
}

/// Build the request context for a command
pub fn request_context(db: &Database, session: Option<&AuthSession>, superuser: bool) -> RequestContext {
    let mut ctx = session
        .map(|s| s.resolve(db))
        .unwrap_or_else(RequestContext::anonymous);
    ctx.superuser = superuser;
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::USERS_COLLECTION_ID;
    use crate::store::now_timestamp;
    use serde_json::{json, Map};

    fn user(id: &str, email: &str, password: &str) -> Record {
        let mut data = Map::new();
        data.insert("email".to_string(), json!(email));
        data.insert("isAdmin".to_string(), json!(false));
        Record {
            id: id.to_string(),
            collection_id: USERS_COLLECTION_ID.to_string(),
            collection_name: "users".to_string(),
            created: now_timestamp(),
            updated: now_timestamp(),
            data,
            password_hash: Some(hash_password(password).unwrap()),
        }
    }

    fn db_with_user() -> Database {
        let mut db = Database::new();
        db.insert_record(user("u1", "ana@example.com", "correct horse"))
            .unwrap();
        db
    }

    #[test]
    fn test_hash_format_and_verify() {
        let hash = hash_password("secret123").unwrap();
        assert!(hash.starts_with("$argon2id$"), "{}", hash);
        assert!(verify_password("secret123", &hash));
        assert!(!verify_password("secret124", &hash));
        assert_ne!(hash_password("secret123").unwrap(), hash);
    }

    #[test]
    fn test_verify_rejects_malformed() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "md5$1$AAAA$00"));
        assert!(!verify_password("x", "sha256$10000$AAAA$00"));
    }

    #[test]
    fn test_authenticate() {
        let db = db_with_user();
        let identity =
            authenticate_with_password(&db, "users", "ANA@example.com", "correct horse").unwrap();
        assert_eq!(identity.id(), "u1");
        assert_eq!(identity.lookup("isAdmin"), Some(json!(false)));
        assert_eq!(identity.lookup("collectionName"), Some(json!("users")));

        assert!(matches!(
            authenticate_with_password(&db, "users", "ana@example.com", "wrong"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(authenticate_with_password(&db, "users", "bo@example.com", "x").is_err());
    }

    #[test]
    fn test_session_roundtrip_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        let mut db = db_with_user();
        let identity = authenticate_with_password(&db, "users", "ana@example.com", "correct horse")
            .unwrap();

        assert!(AuthSession::load(&path).unwrap().is_none());
        let session = AuthSession::new(&identity);
        session.save(&path).unwrap();
        let loaded = AuthSession::load(&path).unwrap().unwrap();
        assert_eq!(loaded, session);

        let ctx = request_context(&db, Some(&loaded), false);
        assert_eq!(ctx.auth.as_ref().map(|a| a.id()), Some("u1"));
        assert_eq!(ctx.actor().as_deref(), Some("ana@example.com"));

        db.remove_record(USERS_COLLECTION_ID, "u1");
        let ctx = request_context(&db, Some(&loaded), false);
        assert!(ctx.auth.is_none());

        assert!(AuthSession::clear(&path).unwrap());
        assert!(!AuthSession::clear(&path).unwrap());
    }

    #[test]
    fn test_session_identifies_by_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        std::fs::write(
            &path,
            r#"{"collection_id":"_pb_users_auth_","record_id":"u1","email":"ana@example.com","token":"stale","issued_at":"2025-10-20T19:15:14Z"}"#,
        )
        .unwrap();
        let session = AuthSession::load(&path).unwrap().unwrap();
        let ctx = session.resolve(&db_with_user());
        assert_eq!(ctx.auth.as_ref().map(|a| a.id()), Some("u1"));

        session.save(&path).unwrap();
        assert!(!std::fs::read_to_string(&path).unwrap().contains("token"));
    }

    #[test]
    fn test_superuser_context() {
        let ctx = request_context(&Database::new(), None, true);
        assert!(ctx.superuser);
        assert!(ctx.auth_source().is_none());
        assert_eq!(ctx.actor().as_deref(), Some("superuser"));
    }
}
