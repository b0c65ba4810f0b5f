//! The record service.
//!
//! Every operation takes an explicit `RequestContext`, checks the
//! collection's rule for the operation, validates payloads against the
//! schema, and keeps attachment blobs in step with the rows.
//!
//! Rule outcomes follow the hosted backend: a locked operation is
//! `Forbidden`, a list silently omits rows the rule hides, and a single row
//! hidden by its view/update/delete rule is reported as `NotFound`.

use crate::audit::AuditLog;
use crate::auth::{hash_password, RequestContext};
use crate::error::{ApiError, ApiResult, ValidationErrors};
use crate::record::{self, FileUpload, Record, RecordPayload};
use crate::rule::{Expr, FieldSource, Operation, Rule, Scope};
use crate::schema::{Collection, FieldKind};
use crate::storage::{self, BlobCleanup, FileStorage};
use crate::store::{generate_id, now_timestamp, Database};
use crate::validation::{self, AuthWrite};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::{debug, warn};

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]{15}$").unwrap());

const DEFAULT_SORT: &str = "created";

pub struct RecordService<'a> {
    db: &'a mut Database,
    storage: &'a FileStorage,
    public_url: &'a str,
    audit: &'a mut AuditLog,
}

/// Files to write for one request, and stored files they displace
struct UploadPlan<'p> {
    writes: Vec<(String, &'p FileUpload)>,
    replaced: Vec<String>,
}

struct SortKey {
    field: String,
    descending: bool,
}

impl<'a> RecordService<'a> {
    pub fn new(
        db: &'a mut Database,
        storage: &'a FileStorage,
        public_url: &'a str,
        audit: &'a mut AuditLog,
    ) -> Self {
        Self {
            db,
            storage,
            public_url,
            audit,
        }
    }

    /// All rows the requester may list, optionally filtered and sorted.
    ///
    /// `filter` is ANDed with the list rule; `sort` is a comma-separated
    /// field list where a leading `-` means descending.
    pub fn get_full_list(
        &mut self,
        ctx: &RequestContext,
        collection: &str,
        filter: Option<&str>,
        sort: Option<&str>,
    ) -> ApiResult<Vec<Record>> {
        let collection = self.db.require_collection(collection)?.clone();
        let rule = self.rule_for(ctx, &collection, Operation::List)?;
        let filter = match filter.map(str::trim).filter(|f| !f.is_empty()) {
            Some(f) => Some(parse_filter(&collection, f)?),
            None => None,
        };
        let sort = parse_sort(&collection, sort.unwrap_or(DEFAULT_SORT))?;

        let auth = ctx.auth_source();
        let mut rows: Vec<Record> = self
            .db
            .records(&collection.id)
            .iter()
            .filter(|r| {
                let scope = Scope {
                    auth,
                    record: *r,
                    data: None,
                };
                rule.as_ref().map_or(true, |rule| rule.allows(&scope))
                    && filter.as_ref().map_or(true, |f| f.eval(&scope))
            })
            .cloned()
            .collect();
        sort_records(&mut rows, &sort);

        debug!(collection = %collection.name, count = rows.len(), "listed records");
        self.audit_decision(&collection, Operation::List, "allow", None);
        Ok(rows)
    }

    pub fn get_one(
        &mut self,
        ctx: &RequestContext,
        collection: &str,
        id: &str,
    ) -> ApiResult<Record> {
        let collection = self.db.require_collection(collection)?.clone();
        let rule = self.rule_for(ctx, &collection, Operation::View)?;
        let record = self
            .db
            .record(&collection.id, id)
            .cloned()
            .ok_or_else(|| not_found(&collection, id))?;

        if let Some(rule) = &rule {
            let scope = Scope {
                auth: ctx.auth_source(),
                record: &record,
                data: None,
            };
            if !rule.allows(&scope) {
                self.audit_decision(&collection, Operation::View, "deny", Some(id));
                return Err(not_found(&collection, id));
            }
        }
        self.audit_decision(&collection, Operation::View, "allow", Some(id));
        Ok(record)
    }

    pub fn create(
        &mut self,
        ctx: &RequestContext,
        collection: &str,
        payload: RecordPayload,
    ) -> ApiResult<Record> {
        let collection = self.db.require_collection(collection)?.clone();
        let rule = self.rule_for(ctx, &collection, Operation::Create)?;

        let id = match payload
            .fields
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            Some(id) if !ID_RE.is_match(id) => {
                return Err(ApiError::validation(
                    "id",
                    "invalid_id",
                    "Must be 15 lowercase letters or digits",
                ))
            }
            Some(id) if self.db.record_exists(&collection.id, id) => {
                return Err(ApiError::validation("id", "id_taken", "The id is already in use"))
            }
            Some(id) => id.to_string(),
            None => generate_id(),
        };

        let mut data = Map::new();
        for field in &collection.schema {
            // Attachments only arrive as uploads on create
            let submitted = match field.kind {
                FieldKind::File(_) => Value::Null,
                _ => payload
                    .fields
                    .get(&field.name)
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            data.insert(
                field.name.clone(),
                validation::normalize(&field.kind, submitted),
            );
        }
        let plan = plan_uploads(&collection, &mut data, &payload.files);

        let mut errors = self.validate_data(&collection, &data, &payload.files);
        let password_hash =
            self.apply_auth_fields(ctx, &collection, &payload.fields, &mut data, None, &mut errors)?;
        errors.extend(self.check_unique(&collection, &data, None));
        errors.into_result()?;

        let now = now_timestamp();
        let record = Record {
            id,
            collection_id: collection.id.clone(),
            collection_name: collection.name.clone(),
            created: now.clone(),
            updated: now,
            data,
            password_hash,
        };

        if let Some(rule) = &rule {
            let scope = Scope {
                auth: ctx.auth_source(),
                record: &record,
                data: Some(&payload.fields),
            };
            if !rule.allows(&scope) {
                self.audit_decision(&collection, Operation::Create, "deny", None);
                return Err(ApiError::Forbidden(format!(
                    "The create rule of '{}' rejected the request",
                    collection.name
                )));
            }
        }

        self.write_uploads(&record, &plan)?;
        if let Err(e) = self.db.insert_record(record.clone()) {
            self.storage.delete_many(
                &record.collection_id,
                &record.id,
                &plan.writes.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
            );
            return Err(e);
        }

        self.audit_decision(&collection, Operation::Create, "allow", Some(&record.id));
        audited(self.audit.record_created(&collection.name, &record.id));
        debug!(collection = %collection.name, id = %record.id, "created record");
        Ok(record)
    }

    pub fn update(
        &mut self,
        ctx: &RequestContext,
        collection: &str,
        id: &str,
        payload: RecordPayload,
    ) -> ApiResult<Record> {
        let collection = self.db.require_collection(collection)?.clone();
        let rule = self.rule_for(ctx, &collection, Operation::Update)?;
        let existing = self
            .db
            .record(&collection.id, id)
            .cloned()
            .ok_or_else(|| not_found(&collection, id))?;

        if let Some(rule) = &rule {
            let scope = Scope {
                auth: ctx.auth_source(),
                record: &existing,
                data: Some(&payload.fields),
            };
            if !rule.allows(&scope) {
                self.audit_decision(&collection, Operation::Update, "deny", Some(id));
                return Err(not_found(&collection, id));
            }
        }

        let mut data = existing.data.clone();
        let mut removed = Vec::new();
        for field in &collection.schema {
            let Some(submitted) = payload.fields.get(&field.name) else {
                continue;
            };
            let value = if matches!(field.kind, FieldKind::File(_)) {
                // The submitted names are the stored files to keep
                let current = existing.string_list(&field.name);
                let keep: Vec<String> = record::string_list(Some(submitted))
                    .into_iter()
                    .filter(|n| current.contains(n))
                    .collect();
                removed.extend(current.into_iter().filter(|n| !keep.contains(n)));
                Value::Array(keep.into_iter().map(Value::String).collect())
            } else {
                submitted.clone()
            };
            data.insert(
                field.name.clone(),
                validation::normalize(&field.kind, value),
            );
        }
        let plan = plan_uploads(&collection, &mut data, &payload.files);
        removed.extend(plan.replaced.iter().cloned());

        let mut errors = self.validate_data(&collection, &data, &payload.files);
        let password_hash = self.apply_auth_fields(
            ctx,
            &collection,
            &payload.fields,
            &mut data,
            Some(&existing),
            &mut errors,
        )?;
        errors.extend(self.check_unique(&collection, &data, Some(&existing.id)));
        errors.into_result()?;

        let mut record = existing;
        record.data = data;
        record.updated = now_timestamp();
        if password_hash.is_some() {
            record.password_hash = password_hash;
        }

        self.write_uploads(&record, &plan)?;
        self.db.replace_record(record.clone())?;
        if !removed.is_empty() {
            self.db.queue_cleanup(BlobCleanup::Files {
                collection_id: record.collection_id.clone(),
                record_id: record.id.clone(),
                filenames: removed.clone(),
            });
        }

        self.audit_decision(&collection, Operation::Update, "allow", Some(id));
        audited(self.audit.record_updated(&collection.name, id));
        debug!(collection = %collection.name, id, removed_files = removed.len(), "updated record");
        Ok(record)
    }

    /// Delete a row, its attachments, and whatever its relations require.
    ///
    /// Rows referencing it through a `cascadeDelete` relation are deleted
    /// too; a required relation without cascade blocks the delete; an
    /// optional one is cleared. Nothing changes unless the whole cascade
    /// succeeds.
    pub fn delete(&mut self, ctx: &RequestContext, collection: &str, id: &str) -> ApiResult<()> {
        let collection = self.db.require_collection(collection)?.clone();
        let rule = self.rule_for(ctx, &collection, Operation::Delete)?;
        let existing = self
            .db
            .record(&collection.id, id)
            .cloned()
            .ok_or_else(|| not_found(&collection, id))?;

        if let Some(rule) = &rule {
            let scope = Scope {
                auth: ctx.auth_source(),
                record: &existing,
                data: None,
            };
            if !rule.allows(&scope) {
                self.audit_decision(&collection, Operation::Delete, "deny", Some(id));
                return Err(not_found(&collection, id));
            }
        }

        let mut draft = self.db.clone();
        let mut removed = Vec::new();
        delete_cascade(&mut draft, &collection.id, id, &mut removed)?;
        *self.db = draft;

        self.audit_decision(&collection, Operation::Delete, "allow", Some(id));
        for gone in &removed {
            self.db.queue_cleanup(BlobCleanup::Record {
                collection_id: gone.collection_id.clone(),
                record_id: gone.id.clone(),
            });
            let cascade = (gone.id != id).then_some(id);
            audited(
                self.audit
                    .record_deleted(&gone.collection_name, &gone.id, cascade),
            );
        }
        debug!(collection = %collection.name, id, rows = removed.len(), "deleted record");
        Ok(())
    }

    /// Public URLs of the files stored in a record's file field
    pub fn file_urls(&self, record: &Record, field: &str) -> ApiResult<Vec<String>> {
        let collection = self.db.require_collection(&record.collection_id)?;
        match collection.field(field).map(|f| &f.kind) {
            Some(FieldKind::File(_)) => Ok(record
                .string_list(field)
                .iter()
                .map(|name| storage::file_url(self.public_url, &record.collection_id, &record.id, name))
                .collect()),
            _ => Err(ApiError::BadRequest(format!(
                "'{}' is not a file field of '{}'",
                field, collection.name
            ))),
        }
    }

    /// The rule guarding `op`, or `None` for superusers.
    /// Locked operations fail here for everyone else.
    fn rule_for(
        &mut self,
        ctx: &RequestContext,
        collection: &Collection,
        op: Operation,
    ) -> ApiResult<Option<Rule>> {
        if ctx.superuser {
            return Ok(None);
        }
        let rule = collection.rule(op)?;
        if matches!(rule, Rule::Locked) {
            self.audit_decision(collection, op, "deny_locked", None);
            return Err(ApiError::Forbidden(format!(
                "Only superusers can {} records of '{}'",
                op.as_str(),
                collection.name
            )));
        }
        Ok(Some(rule))
    }

    fn audit_decision(
        &mut self,
        collection: &Collection,
        op: Operation,
        decision: &str,
        record_id: Option<&str>,
    ) {
        audited(
            self.audit
                .rule_decision(&collection.name, op.as_str(), decision, record_id),
        );
    }

    fn validate_data(
        &self,
        collection: &Collection,
        data: &Map<String, Value>,
        uploads: &[FileUpload],
    ) -> ValidationErrors {
        let db: &Database = &*self.db;
        validation::validate_fields(collection, data, uploads, &|cid, rid| {
            db.record_exists(cid, rid)
        })
    }

    fn check_unique(
        &self,
        collection: &Collection,
        data: &Map<String, Value>,
        except_id: Option<&str>,
    ) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        for field in collection.schema.iter().filter(|f| f.unique) {
            let value = data.get(&field.name);
            if validation::is_blank(value) {
                continue;
            }
            let taken = self
                .db
                .records(&collection.id)
                .iter()
                .any(|r| Some(r.id.as_str()) != except_id && r.data.get(&field.name) == value);
            if taken {
                errors.add(&field.name, "value_not_unique", "Value must be unique");
            }
        }
        errors
    }

    /// Copy the auth system fields of a payload into `data`.
    ///
    /// Returns the hash of a newly set password. `verified` can only be
    /// changed by superusers and by requesters satisfying the collection's
    /// `manageRule` for the target row.
    fn apply_auth_fields(
        &self,
        ctx: &RequestContext,
        collection: &Collection,
        payload: &Map<String, Value>,
        data: &mut Map<String, Value>,
        existing: Option<&Record>,
        errors: &mut ValidationErrors,
    ) -> ApiResult<Option<String>> {
        let Some(options) = collection.auth_options() else {
            return Ok(None);
        };
        let can_manage = ctx.superuser || {
            let target: &dyn FieldSource = match existing {
                Some(r) => r,
                None => &*data,
            };
            manage_allowed(options.manage_rule.as_deref(), ctx, target, payload)
        };
        let except_id = existing.map(|r| r.id.as_str());

        let email = match payload.get("email").and_then(Value::as_str) {
            Some(e) => Some(e.trim().to_string()),
            None => existing.and_then(|r| r.get_str("email")).map(String::from),
        };
        let password = payload.get("password").and_then(Value::as_str);
        let email_taken = email
            .as_deref()
            .filter(|e| !e.is_empty())
            .is_some_and(|e| self.db.email_in_use(&collection.id, e, except_id));
        errors.extend(validation::validate_auth_fields(
            options,
            &AuthWrite {
                email: email.as_deref(),
                password,
                password_confirm: payload.get("passwordConfirm").and_then(Value::as_str),
                creating: existing.is_none(),
                email_taken,
            },
        ));

        let previous = |name: &str| existing.and_then(|r| r.get(name));
        let flag = |value: &Value| validation::normalize(&FieldKind::Bool, value.clone());

        let visibility = payload
            .get("emailVisibility")
            .map(flag)
            .or_else(|| previous("emailVisibility"))
            .unwrap_or(Value::Bool(false));
        let verified = match payload.get("verified") {
            Some(v) if can_manage => flag(v),
            _ => previous("verified").unwrap_or(Value::Bool(false)),
        };
        let username = payload
            .get("username")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .or_else(|| existing.and_then(|r| r.get_str("username")).map(String::from))
            .unwrap_or_else(|| format!("{}{}", collection.name, &generate_id()[..6]));
        let username_taken = self.db.records(&collection.id).iter().any(|r| {
            Some(r.id.as_str()) != except_id && r.get_str("username") == Some(username.as_str())
        });
        if username_taken {
            errors.add("username", "username_taken", "The username is already in use");
        }

        data.insert("email".to_string(), Value::String(email.unwrap_or_default()));
        data.insert("emailVisibility".to_string(), visibility);
        data.insert("verified".to_string(), verified);
        data.insert("username".to_string(), Value::String(username));

        match password.filter(|_| errors.is_empty()) {
            Some(p) => Ok(Some(hash_password(p)?)),
            None => Ok(None),
        }
    }

    fn write_uploads(&self, record: &Record, plan: &UploadPlan<'_>) -> ApiResult<()> {
        let mut written = Vec::new();
        for (name, upload) in &plan.writes {
            if let Err(e) = self
                .storage
                .write(&record.collection_id, &record.id, name, &upload.bytes)
            {
                self.storage
                    .delete_many(&record.collection_id, &record.id, &written);
                return Err(e.into());
            }
            written.push(name.clone());
        }
        Ok(())
    }
}

fn audited(result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "failed to write audit event");
    }
}

/// Whether a non-superuser satisfies an auth collection's `manageRule`
fn manage_allowed(
    source: Option<&str>,
    ctx: &RequestContext,
    target: &dyn FieldSource,
    payload: &Map<String, Value>,
) -> bool {
    match Rule::parse(source) {
        Ok(rule) => rule.allows(&Scope {
            auth: ctx.auth_source(),
            record: target,
            data: Some(payload),
        }),
        Err(e) => {
            warn!(error = %e, "unparsable manageRule treated as locked");
            false
        }
    }
}

fn not_found(collection: &Collection, id: &str) -> ApiError {
    ApiError::NotFound(format!("record '{}' in '{}'", id, collection.name))
}

/// Give each upload a storage name and record it in the file field.
///
/// Multi-file fields append; single-file fields replace their file.
fn plan_uploads<'p>(
    collection: &Collection,
    data: &mut Map<String, Value>,
    uploads: &'p [FileUpload],
) -> UploadPlan<'p> {
    let mut plan = UploadPlan {
        writes: Vec::new(),
        replaced: Vec::new(),
    };
    for field in &collection.schema {
        if !matches!(field.kind, FieldKind::File(_)) {
            continue;
        }
        let mut new_names = Vec::new();
        for upload in uploads.iter().filter(|u| u.field == field.name) {
            let name = storage::stored_filename(&upload.filename);
            plan.writes.push((name.clone(), upload));
            new_names.push(name);
        }
        if new_names.is_empty() {
            continue;
        }

        let mut names = record::string_list(data.get(&field.name));
        if field.kind.is_multi() {
            names.extend(new_names);
        } else {
            plan.replaced.append(&mut names);
            names = new_names;
        }
        let value = if field.kind.is_multi() || names.len() > 1 {
            Value::Array(names.into_iter().map(Value::String).collect())
        } else {
            Value::String(names.into_iter().next().unwrap_or_default())
        };
        data.insert(field.name.clone(), value);
    }
    plan
}

fn parse_filter(collection: &Collection, filter: &str) -> ApiResult<Expr> {
    let expr = Expr::parse(filter)?;
    if let Some(name) = expr
        .record_fields()
        .into_iter()
        .find(|name| !collection.has_field(name))
    {
        return Err(ApiError::InvalidExpression(format!(
            "unknown field '{}' in filter",
            name
        )));
    }
    Ok(expr)
}

fn parse_sort(collection: &Collection, sort: &str) -> ApiResult<Vec<SortKey>> {
    sort.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|part| {
            let (descending, field) = match part.strip_prefix('-') {
                Some(field) => (true, field),
                None => (false, part.strip_prefix('+').unwrap_or(part)),
            };
            if !collection.has_field(field) {
                return Err(ApiError::BadRequest(format!(
                    "cannot sort by unknown field '{}'",
                    field
                )));
            }
            Ok(SortKey {
                field: field.to_string(),
                descending,
            })
        })
        .collect()
}

fn sort_records(rows: &mut [Record], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        for key in keys {
            let ord = compare_values(a.get(&key.field).as_ref(), b.get(&key.field).as_ref());
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => sort_text(a).cmp(&sort_text(b)),
    }
}

fn sort_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Remove a row and apply its relation consequences to `db`
fn delete_cascade(
    db: &mut Database,
    collection_id: &str,
    record_id: &str,
    removed: &mut Vec<Record>,
) -> ApiResult<()> {
    let Some(row) = db.remove_record(collection_id, record_id) else {
        // Already removed earlier in this cascade
        return Ok(());
    };
    removed.push(row);

    for (ref_collection_id, field_name) in db.referencing_fields(collection_id) {
        let Some(field) = db
            .collection(&ref_collection_id)
            .and_then(|c| c.field(&field_name))
            .cloned()
        else {
            continue;
        };
        let FieldKind::Relation(options) = &field.kind else {
            continue;
        };
        let referencing: Vec<String> = db
            .records(&ref_collection_id)
            .iter()
            .filter(|r| r.string_list(&field_name).iter().any(|v| v == record_id))
            .map(|r| r.id.clone())
            .collect();

        for ref_id in referencing {
            if options.cascade_delete {
                delete_cascade(db, &ref_collection_id, &ref_id, removed)?;
                continue;
            }
            let Some(mut row) = db.record(&ref_collection_id, &ref_id).cloned() else {
                continue;
            };
            let remaining: Vec<String> = row
                .string_list(&field_name)
                .into_iter()
                .filter(|v| v != record_id)
                .collect();
            if field.required && remaining.is_empty() {
                return Err(ApiError::BadRequest(format!(
                    "record '{}' is still required by {}.{} of '{}'",
                    record_id, row.collection_name, field_name, ref_id
                )));
            }
            let value = if field.kind.is_multi() {
                Value::Array(remaining.into_iter().map(Value::String).collect())
            } else {
                Value::String(remaining.into_iter().next().unwrap_or_default())
            };
            row.data.insert(field_name.clone(), value);
            row.updated = now_timestamp();
            db.replace_record(row)?;
        }
    }
    Ok(())
}
