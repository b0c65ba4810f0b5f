//! Payload validation against a collection schema.
//!
//! Values arrive loosely typed (form submissions send every scalar as a
//! string), so each value is first normalized to the field's storage shape
//! and then checked against the field's options. All failures are collected
//! so the caller sees every rejected field at once.

use crate::error::ValidationErrors;
use crate::mime;
use crate::record::{string_list, FileUpload};
use crate::schema::{AuthOptions, Collection, FieldKind, SchemaField};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$").unwrap()
});

/// Convert a submitted value into the field's storage shape.
///
/// Values that cannot be converted are returned unchanged so validation
/// reports them against the field.
pub fn normalize(kind: &FieldKind, value: Value) -> Value {
    match kind {
        FieldKind::Text(_) | FieldKind::Email(_) => match value {
            Value::Null => Value::String(String::new()),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => other,
        },
        FieldKind::Number(_) => match &value {
            Value::Null => Value::from(0),
            Value::String(s) if s.trim().is_empty() => Value::from(0),
            Value::String(s) => match s.trim().parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => value.clone(),
            },
            _ => value.clone(),
        },
        FieldKind::Bool => match &value {
            Value::Null => Value::Bool(false),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "on" | "yes" => Value::Bool(true),
                "false" | "0" | "off" | "no" | "" => Value::Bool(false),
                _ => value.clone(),
            },
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            _ => value.clone(),
        },
        FieldKind::Select(_) | FieldKind::Relation(_) | FieldKind::File(_) => {
            if !is_string_or_string_list(&value) {
                return value;
            }
            let items = string_list(Some(&value));
            if kind.is_multi() {
                Value::Array(items.into_iter().map(Value::String).collect())
            } else if items.len() <= 1 {
                Value::String(items.into_iter().next().unwrap_or_default())
            } else {
                // Too many values for a single field; keep them for the error
                Value::Array(items.into_iter().map(Value::String).collect())
            }
        }
    }
}

fn is_string_or_string_list(value: &Value) -> bool {
    match value {
        Value::Null | Value::String(_) => true,
        Value::Array(items) => items.iter().all(|v| v.is_string()),
        _ => false,
    }
}

/// Whether a stored value counts as blank for `required`
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Object(m)) => m.is_empty(),
    }
}

/// Check a candidate row against every schema field.
///
/// `uploads` are the attachments newly submitted with the request;
/// `relation_exists(collection_id, record_id)` resolves relation targets.
pub fn validate_fields(
    collection: &Collection,
    data: &Map<String, Value>,
    uploads: &[FileUpload],
    relation_exists: &dyn Fn(&str, &str) -> bool,
) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    for field in &collection.schema {
        let value = data.get(&field.name);
        if is_blank(value) {
            if field.required {
                errors.add(&field.name, "required", "Cannot be blank");
            }
            continue;
        }
        if let Some(value) = value {
            validate_value(field, value, relation_exists, &mut errors);
        }
    }

    for upload in uploads {
        match collection.field(&upload.field).map(|f| &f.kind) {
            Some(FieldKind::File(options)) => {
                if upload.size() > options.max_size {
                    errors.add(
                        &upload.field,
                        "file_too_large",
                        format!(
                            "File '{}' is {} bytes, the limit is {}",
                            upload.filename,
                            upload.size(),
                            options.max_size
                        ),
                    );
                }
                let detected = mime::sniff(&upload.bytes);
                if !mime::is_allowed(detected, &options.mime_types) {
                    errors.add(
                        &upload.field,
                        "invalid_mime_type",
                        format!(
                            "File '{}' has type {}, allowed: {}",
                            upload.filename,
                            detected,
                            options.mime_types.join(", ")
                        ),
                    );
                }
            }
            _ => errors.add(
                &upload.field,
                "not_a_file_field",
                format!("'{}' does not accept files", upload.field),
            ),
        }
    }

    errors
}

fn validate_value(
    field: &SchemaField,
    value: &Value,
    relation_exists: &dyn Fn(&str, &str) -> bool,
    errors: &mut ValidationErrors,
) {
    let name = field.name.as_str();
    match &field.kind {
        FieldKind::Text(o) => {
            let Some(s) = value.as_str() else {
                errors.add(name, "invalid_type", "Must be a string");
                return;
            };
            let len = s.chars().count();
            if let Some(min) = o.min {
                if len < min {
                    errors.add(name, "too_short", format!("Must be at least {} characters", min));
                }
            }
            if let Some(max) = o.max {
                if len > max {
                    errors.add(name, "too_long", format!("Must be at most {} characters", max));
                }
            }
            if !o.pattern.is_empty() {
                match Regex::new(&o.pattern) {
                    Ok(re) if !re.is_match(s) => {
                        errors.add(name, "pattern_mismatch", format!("Must match {}", o.pattern))
                    }
                    Ok(_) => {}
                    Err(_) => errors.add(name, "invalid_pattern", "Field pattern is invalid"),
                }
            }
        }
        FieldKind::Number(o) => {
            let Some(n) = value.as_f64() else {
                errors.add(name, "invalid_type", "Must be a number");
                return;
            };
            if let Some(min) = o.min.filter(|min| n < *min) {
                errors.add(name, "out_of_range", format!("Must be at least {}", min));
            }
            if let Some(max) = o.max.filter(|max| n > *max) {
                errors.add(name, "out_of_range", format!("Must be at most {}", max));
            }
            if o.no_decimal && n.fract() != 0.0 {
                errors.add(name, "not_integer", "Must be a whole number");
            }
        }
        FieldKind::Bool => {
            if !value.is_boolean() {
                errors.add(name, "invalid_type", "Must be true or false");
            }
        }
        FieldKind::Email(o) => {
            let Some(s) = value.as_str() else {
                errors.add(name, "invalid_type", "Must be a string");
                return;
            };
            validate_email_address(name, s, &o.only_domains, &o.except_domains, errors);
        }
        FieldKind::Select(o) => {
            if !is_string_or_string_list(value) {
                errors.add(name, "invalid_type", "Must be a string or list of strings");
                return;
            }
            let selected = string_list(Some(value));
            if selected.len() > o.max_select {
                errors.add(
                    name,
                    "too_many_values",
                    format!("Select at most {} value(s)", o.max_select),
                );
            }
            for v in &selected {
                if !o.values.contains(v) {
                    errors.add(
                        name,
                        "invalid_value",
                        format!("'{}' is not one of: {}", v, o.values.join(", ")),
                    );
                }
            }
        }
        FieldKind::Relation(o) => {
            if !is_string_or_string_list(value) {
                errors.add(name, "invalid_type", "Must be a record id or list of ids");
                return;
            }
            let ids = string_list(Some(value));
            if let Some(max) = o.max_select {
                if ids.len() > max {
                    errors.add(name, "too_many_values", format!("Select at most {} record(s)", max));
                }
            }
            if let Some(min) = o.min_select {
                if ids.len() < min {
                    errors.add(name, "too_few_values", format!("Select at least {} record(s)", min));
                }
            }
            for id in &ids {
                if !relation_exists(&o.collection_id, id) {
                    errors.add(
                        name,
                        "missing_relation",
                        format!("Record '{}' does not exist", id),
                    );
                }
            }
        }
        FieldKind::File(o) => {
            let files = string_list(Some(value));
            if files.len() > o.max_select {
                errors.add(
                    name,
                    "too_many_files",
                    format!("At most {} file(s) allowed", o.max_select),
                );
            }
        }
    }
}

fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
}

fn validate_email_address(
    name: &str,
    address: &str,
    only_domains: &Option<Vec<String>>,
    except_domains: &Option<Vec<String>>,
    errors: &mut ValidationErrors,
) {
    if !EMAIL_RE.is_match(address) {
        errors.add(name, "invalid_email", "Must be a valid email address");
        return;
    }
    let domain = domain_of(address).to_lowercase();
    if let Some(only) = only_domains.as_ref().filter(|d| !d.is_empty()) {
        if !only.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            errors.add(name, "email_domain_not_allowed", format!("Domain '{}' is not allowed", domain));
        }
    }
    if let Some(except) = except_domains.as_ref() {
        if except.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
            errors.add(name, "email_domain_not_allowed", format!("Domain '{}' is not allowed", domain));
        }
    }
}

/// Inputs specific to writes on an auth collection
pub struct AuthWrite<'a> {
    pub email: Option<&'a str>,
    pub password: Option<&'a str>,
    pub password_confirm: Option<&'a str>,
    pub creating: bool,
    pub email_taken: bool,
}

/// Check the email/password system fields of an auth collection
pub fn validate_auth_fields(options: &AuthOptions, input: &AuthWrite<'_>) -> ValidationErrors {
    let mut errors = ValidationErrors::new();

    match input.email.filter(|e| !e.is_empty()) {
        Some(email) => {
            validate_email_address(
                "email",
                email,
                &options.only_email_domains,
                &options.except_email_domains,
                &mut errors,
            );
            if input.email_taken {
                errors.add("email", "email_taken", "The email is already in use");
            }
        }
        None if options.require_email => {
            errors.add("email", "required", "Cannot be blank");
        }
        None => {}
    }

    match input.password {
        Some(password) => {
            if password.chars().count() < options.min_password_length {
                errors.add(
                    "password",
                    "too_short",
                    format!("Must be at least {} characters", options.min_password_length),
                );
            }
            if let Some(confirm) = input.password_confirm {
                if confirm != password {
                    errors.add("passwordConfirm", "mismatch", "Values don't match");
                }
            }
        }
        None if input.creating => errors.add("password", "required", "Cannot be blank"),
        None => {}
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FileOptions, RelationOptions, SelectOptions, TextOptions};
    use serde_json::json;

    fn audio_collection() -> Collection {
        let mut c = Collection::new_base("wbzryti42j4f1bz", "audio_files");
        c.schema = vec![
            SchemaField::new(
                "xndqtwvh",
                "uploader_id",
                FieldKind::Relation(RelationOptions {
                    collection_id: "_pb_users_auth_".to_string(),
                    cascade_delete: false,
                    min_select: None,
                    max_select: Some(1),
                    display_fields: None,
                }),
            ),
            SchemaField::new(
                "ymo8qywp",
                "description",
                FieldKind::Text(TextOptions {
                    min: None,
                    max: Some(20),
                    pattern: String::new(),
                }),
            ),
            SchemaField::new(
                "uiukasyq",
                "category",
                FieldKind::Select(SelectOptions {
                    max_select: 1,
                    values: ["Music", "Podcast", "Audiobook", "Lecture", "Others"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                }),
            ),
            SchemaField::new(
                "ezj48rnq",
                "file",
                FieldKind::File(FileOptions {
                    mime_types: vec![
                        "audio/mp4".to_string(),
                        "audio/mpeg".to_string(),
                        "video/x-msvideo".to_string(),
                    ],
                    thumbs: vec![],
                    max_select: 1,
                    max_size: 5_242_880,
                    protected: false,
                }),
            ),
        ];
        c
    }

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn no_relations(_: &str, _: &str) -> bool {
        false
    }

    fn any_relation(_: &str, _: &str) -> bool {
        true
    }

    fn mp3(size: usize) -> Vec<u8> {
        let mut bytes = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
        bytes.resize(size.max(bytes.len()), 0);
        bytes
    }

    #[test]
    fn test_normalize_form_strings() {
        let c = audio_collection();
        let category = &c.field("category").unwrap().kind;
        assert_eq!(normalize(category, json!(["Music"])), json!("Music"));
        assert_eq!(normalize(category, Value::Null), json!(""));
        assert_eq!(normalize(&FieldKind::Bool, json!("true")), json!(true));
        assert_eq!(normalize(&FieldKind::Bool, json!("")), json!(false));
        let number = FieldKind::Number(crate::schema::NumberOptions {
            min: None,
            max: None,
            no_decimal: false,
        });
        assert_eq!(normalize(&number, json!("2.5")), json!(2.5));
        assert_eq!(normalize(&number, json!("abc")), json!("abc"));
    }

    #[test]
    fn test_valid_audio_record() {
        let c = audio_collection();
        let row = data(json!({
            "uploader_id": "u1",
            "description": "demo",
            "category": "Podcast",
            "file": "demo_x1.mp3"
        }));
        let uploads = vec![FileUpload::new("file", "demo.mp3", mp3(1024))];
        assert!(validate_fields(&c, &row, &uploads, &any_relation).is_empty());
    }

    #[test]
    fn test_category_outside_enumeration() {
        let c = audio_collection();
        let row = data(json!({"category": "Jazz"}));
        let errors = validate_fields(&c, &row, &[], &any_relation);
        assert!(errors.has("category"));
        assert_eq!(errors.0[0].code, "invalid_value");
    }

    #[test]
    fn test_category_multiple_values() {
        let c = audio_collection();
        let row = data(json!({"category": ["Music", "Podcast"]}));
        let errors = validate_fields(&c, &row, &[], &any_relation);
        assert_eq!(errors.0[0].code, "too_many_values");
    }

    #[test]
    fn test_oversized_upload() {
        let c = audio_collection();
        let row = data(json!({"file": "big.mp3"}));
        let uploads = vec![FileUpload::new("file", "big.mp3", mp3(5_242_881))];
        let errors = validate_fields(&c, &row, &uploads, &any_relation);
        assert!(errors.has("file"));
        assert_eq!(errors.0[0].code, "file_too_large");

        let exact = vec![FileUpload::new("file", "ok.mp3", mp3(5_242_880))];
        assert!(validate_fields(&c, &row, &exact, &any_relation).is_empty());
    }

    #[test]
    fn test_disallowed_mime_type() {
        let c = audio_collection();
        let row = data(json!({"file": "notes.txt"}));
        let uploads = vec![FileUpload::new("file", "notes.mp3", b"just text".to_vec())];
        let errors = validate_fields(&c, &row, &uploads, &any_relation);
        assert_eq!(errors.0[0].code, "invalid_mime_type");
    }

    #[test]
    fn test_upload_to_non_file_field() {
        let c = audio_collection();
        let uploads = vec![FileUpload::new("description", "a.mp3", mp3(16))];
        let errors = validate_fields(&c, &Map::new(), &uploads, &any_relation);
        assert!(errors.has("description"));
    }

    #[test]
    fn test_missing_relation_target() {
        let c = audio_collection();
        let row = data(json!({"uploader_id": "ghost"}));
        let errors = validate_fields(&c, &row, &[], &no_relations);
        assert_eq!(errors.0[0].code, "missing_relation");
    }

    #[test]
    fn test_text_limits_and_required() {
        let mut c = audio_collection();
        c.schema[1].required = true;
        let errors = validate_fields(&c, &Map::new(), &[], &any_relation);
        assert!(errors.has("description"));

        let row = data(json!({"description": "x".repeat(21)}));
        let errors = validate_fields(&c, &row, &[], &any_relation);
        assert_eq!(errors.0[0].code, "too_long");
    }

    #[test]
    fn test_auth_fields() {
        let options = AuthOptions::default();
        let ok = AuthWrite {
            email: Some("ana@example.com"),
            password: Some("longenough"),
            password_confirm: Some("longenough"),
            creating: true,
            email_taken: false,
        };
        assert!(validate_auth_fields(&options, &ok).is_empty());

        let bad = AuthWrite {
            email: Some("not-an-email"),
            password: Some("short"),
            password_confirm: Some("different"),
            creating: true,
            email_taken: false,
        };
        let errors = validate_auth_fields(&options, &bad);
        assert!(errors.has("email"));
        assert!(errors.has("password"));
        assert!(errors.has("passwordConfirm"));

        let missing = AuthWrite {
            email: None,
            password: None,
            password_confirm: None,
            creating: true,
            email_taken: false,
        };
        let errors = validate_auth_fields(&options, &missing);
        assert!(!errors.has("email"));
        assert!(errors.has("password"));

        let strict = AuthOptions {
            require_email: true,
            ..AuthOptions::default()
        };
        let errors = validate_auth_fields(&strict, &missing);
        assert!(errors.has("email"));
    }

    #[test]
    fn test_email_domain_lists() {
        let options = AuthOptions {
            only_email_domains: Some(vec!["example.com".to_string()]),
            ..AuthOptions::default()
        };
        let input = AuthWrite {
            email: Some("ana@other.org"),
            password: None,
            password_confirm: None,
            creating: false,
            email_taken: true,
        };
        let errors = validate_auth_fields(&options, &input);
        let codes: Vec<&str> = errors.0.iter().map(|e| e.code).collect();
        assert!(codes.contains(&"email_domain_not_allowed"));
        assert!(codes.contains(&"email_taken"));
    }
}
