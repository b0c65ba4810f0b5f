//! Collection definitions.
//!
//! A collection is a named schema (field list), five access rules and a
//! set of type-specific options. The JSON shape matches the hosted backend's
//! export format, so definitions can be copied in and out verbatim.

use crate::error::ValidationErrors;
use crate::rule::{Operation, Rule};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id of the built-in users collection
pub const USERS_COLLECTION_ID: &str = "_pb_users_auth_";

/// Attachments larger than this are rejected unless a field says otherwise
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5_242_880;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Fields every record has regardless of its schema
pub const BASE_SYSTEM_FIELDS: &[&str] = &["id", "created", "updated", "collectionId", "collectionName"];

/// Extra system fields of auth collections
pub const AUTH_SYSTEM_FIELDS: &[&str] = &["email", "emailVisibility", "verified", "username"];

/// Payload keys auth collections accept but never store as-is
pub const AUTH_WRITE_ONLY_FIELDS: &[&str] = &["password", "passwordConfirm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    #[default]
    Base,
    Auth,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Auth => "auth",
        }
    }
}

/// Options of an auth collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOptions {
    pub allow_email_auth: bool,
    #[serde(rename = "allowOAuth2Auth")]
    pub allow_oauth2_auth: bool,
    pub allow_username_auth: bool,
    pub except_email_domains: Option<Vec<String>>,
    pub manage_rule: Option<String>,
    pub min_password_length: usize,
    pub only_email_domains: Option<Vec<String>>,
    pub only_verified: bool,
    pub require_email: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            allow_email_auth: true,
            allow_oauth2_auth: true,
            allow_username_auth: true,
            except_email_domains: None,
            manage_rule: None,
            min_password_length: 8,
            only_email_domains: None,
            only_verified: false,
            require_email: false,
        }
    }
}

/// Base collections carry an empty options object
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseOptions {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionOptions {
    Auth(AuthOptions),
    Base(BaseOptions),
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions::Base(BaseOptions {})
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOptions {
    pub min: Option<usize>,
    pub max: Option<usize>,
    #[serde(default)]
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberOptions {
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub no_decimal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailOptions {
    pub except_domains: Option<Vec<String>>,
    pub only_domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectOptions {
    pub max_select: usize,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationOptions {
    pub collection_id: String,
    #[serde(default)]
    pub cascade_delete: bool,
    pub min_select: Option<usize>,
    pub max_select: Option<usize>,
    pub display_fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOptions {
    #[serde(default)]
    pub mime_types: Vec<String>,
    #[serde(default)]
    pub thumbs: Vec<String>,
    pub max_select: usize,
    pub max_size: u64,
    #[serde(default)]
    pub protected: bool,
}

/// Field type together with its type-specific options
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text(TextOptions),
    Number(NumberOptions),
    Bool,
    Email(EmailOptions),
    Select(SelectOptions),
    Relation(RelationOptions),
    File(FileOptions),
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Bool => "bool",
            Self::Email(_) => "email",
            Self::Select(_) => "select",
            Self::Relation(_) => "relation",
            Self::File(_) => "file",
        }
    }

    /// Whether stored values are arrays rather than scalars
    pub fn is_multi(&self) -> bool {
        match self {
            Self::Select(o) => o.max_select > 1,
            Self::Relation(o) => o.max_select.map_or(true, |m| m > 1),
            Self::File(o) => o.max_select > 1,
            _ => false,
        }
    }

    fn options_value(&self) -> Value {
        let value = match self {
            Self::Text(o) => serde_json::to_value(o),
            Self::Number(o) => serde_json::to_value(o),
            Self::Bool => Ok(Value::Object(Default::default())),
            Self::Email(o) => serde_json::to_value(o),
            Self::Select(o) => serde_json::to_value(o),
            Self::Relation(o) => serde_json::to_value(o),
            Self::File(o) => serde_json::to_value(o),
        };
        value.unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// One entry of a collection's field list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawField", into = "RawField")]
pub struct SchemaField {
    pub system: bool,
    pub id: String,
    pub name: String,
    pub required: bool,
    pub presentable: bool,
    pub unique: bool,
    pub kind: FieldKind,
}

/// Wire form of a field: `type` plus untyped `options`
#[derive(Serialize, Deserialize)]
struct RawField {
    #[serde(default)]
    system: bool,
    #[serde(default)]
    id: String,
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    presentable: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    options: Value,
}

impl TryFrom<RawField> for SchemaField {
    type Error = String;

    fn try_from(raw: RawField) -> Result<Self, Self::Error> {
        let options = if raw.options.is_null() {
            Value::Object(Default::default())
        } else {
            raw.options
        };
        let bad = |e: serde_json::Error| format!("field '{}': invalid options: {}", raw.name, e);
        let kind = match raw.field_type.as_str() {
            "text" => FieldKind::Text(serde_json::from_value(options).map_err(bad)?),
            "number" => FieldKind::Number(serde_json::from_value(options).map_err(bad)?),
            "bool" => FieldKind::Bool,
            "email" => FieldKind::Email(serde_json::from_value(options).map_err(bad)?),
            "select" => FieldKind::Select(serde_json::from_value(options).map_err(bad)?),
            "relation" => FieldKind::Relation(serde_json::from_value(options).map_err(bad)?),
            "file" => FieldKind::File(serde_json::from_value(options).map_err(bad)?),
            other => {
                return Err(format!(
                    "field '{}': unsupported type '{}'",
                    raw.name, other
                ))
            }
        };
        Ok(SchemaField {
            system: raw.system,
            id: raw.id,
            name: raw.name,
            required: raw.required,
            presentable: raw.presentable,
            unique: raw.unique,
            kind,
        })
    }
}

impl From<SchemaField> for RawField {
    fn from(field: SchemaField) -> Self {
        RawField {
            system: field.system,
            field_type: field.kind.type_name().to_string(),
            options: field.kind.options_value(),
            id: field.id,
            name: field.name,
            required: field.required,
            presentable: field.presentable,
            unique: field.unique,
        }
    }
}

impl SchemaField {
    pub fn new(id: &str, name: &str, kind: FieldKind) -> Self {
        Self {
            system: false,
            id: id.to_string(),
            name: name.to_string(),
            required: false,
            presentable: false,
            unique: false,
            kind,
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// A named schema with its access rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub collection_type: CollectionType,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub schema: Vec<SchemaField>,
    #[serde(default)]
    pub indexes: Vec<String>,
    pub list_rule: Option<String>,
    pub view_rule: Option<String>,
    pub create_rule: Option<String>,
    pub update_rule: Option<String>,
    pub delete_rule: Option<String>,
    #[serde(default)]
    pub options: CollectionOptions,
}

impl Collection {
    /// New base collection with every rule locked
    pub fn new_base(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            created: String::new(),
            updated: String::new(),
            name: name.to_string(),
            collection_type: CollectionType::Base,
            system: false,
            schema: Vec::new(),
            indexes: Vec::new(),
            list_rule: None,
            view_rule: None,
            create_rule: None,
            update_rule: None,
            delete_rule: None,
            options: CollectionOptions::default(),
        }
    }

    pub fn is_auth(&self) -> bool {
        self.collection_type == CollectionType::Auth
    }

    pub fn auth_options(&self) -> Option<&AuthOptions> {
        match &self.options {
            CollectionOptions::Auth(o) => Some(o),
            CollectionOptions::Base(_) => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.schema.iter().find(|f| f.name == name)
    }

    pub fn rule_source(&self, op: Operation) -> Option<&str> {
        match op {
            Operation::List => self.list_rule.as_deref(),
            Operation::View => self.view_rule.as_deref(),
            Operation::Create => self.create_rule.as_deref(),
            Operation::Update => self.update_rule.as_deref(),
            Operation::Delete => self.delete_rule.as_deref(),
        }
    }

    pub fn set_rule(&mut self, op: Operation, source: Option<&str>) {
        let source = source.map(String::from);
        match op {
            Operation::List => self.list_rule = source,
            Operation::View => self.view_rule = source,
            Operation::Create => self.create_rule = source,
            Operation::Update => self.update_rule = source,
            Operation::Delete => self.delete_rule = source,
        }
    }

    /// Set all five rules at once
    pub fn set_all_rules(&mut self, source: Option<&str>) {
        for op in Operation::ALL {
            self.set_rule(op, source);
        }
    }

    /// Parse the stored rule for an operation
    pub fn rule(&self, op: Operation) -> crate::error::ApiResult<Rule> {
        Rule::parse(self.rule_source(op))
    }

    /// Names readable by rules and filters besides the schema fields
    pub fn system_field_names(&self) -> Vec<&'static str> {
        let mut names = BASE_SYSTEM_FIELDS.to_vec();
        if self.is_auth() {
            names.extend_from_slice(AUTH_SYSTEM_FIELDS);
        }
        names
    }

    /// Whether a rule or filter may reference this name
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some() || self.system_field_names().contains(&name)
    }

    /// Compare everything except timestamps
    pub fn same_definition(&self, other: &Collection) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.created.clear();
        a.updated.clear();
        b.created.clear();
        b.updated.clear();
        a == b
    }

    /// Structural checks that need no other collection
    pub fn validate_definition(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::new();

        if !NAME_RE.is_match(&self.name) {
            errors.add(
                "name",
                "invalid_name",
                format!("Invalid collection name '{}'", self.name),
            );
        }

        match (&self.collection_type, &self.options) {
            (CollectionType::Auth, CollectionOptions::Base(_)) => {
                errors.add("options", "missing_auth_options", "Auth collections need auth options")
            }
            (CollectionType::Base, CollectionOptions::Auth(_)) => errors.add(
                "options",
                "unexpected_auth_options",
                "Base collections cannot carry auth options",
            ),
            _ => {}
        }

        let reserved = self.system_field_names();
        let mut seen: Vec<&str> = Vec::new();
        for (i, field) in self.schema.iter().enumerate() {
            let key = format!("schema.{}", i);
            if !NAME_RE.is_match(&field.name) {
                errors.add(
                    &key,
                    "invalid_name",
                    format!("Invalid field name '{}'", field.name),
                );
            } else if reserved.contains(&field.name.as_str())
                || (self.is_auth() && AUTH_WRITE_ONLY_FIELDS.contains(&field.name.as_str()))
            {
                errors.add(
                    &key,
                    "reserved_name",
                    format!("'{}' is a reserved field name", field.name),
                );
            } else if seen.contains(&field.name.as_str()) {
                errors.add(
                    &key,
                    "duplicate_name",
                    format!("Duplicate field name '{}'", field.name),
                );
            }
            seen.push(field.name.as_str());
            validate_field_options(&key, field, &mut errors);
        }

        for op in Operation::ALL {
            let key = format!("{}Rule", op.as_str());
            match self.rule(op) {
                Ok(Rule::Expr(expr)) => {
                    for name in expr.record_fields() {
                        if !self.has_field(name) {
                            errors.add(
                                &key,
                                "unknown_field",
                                format!("Rule references unknown field '{}'", name),
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => errors.add(&key, "invalid_rule", e.to_string()),
            }
        }

        if let Some(manage) = self.auth_options().and_then(|o| o.manage_rule.as_deref()) {
            if let Err(e) = Rule::parse(Some(manage)) {
                errors.add("options.manageRule", "invalid_rule", e.to_string());
            }
        }

        errors
    }
}

fn validate_field_options(key: &str, field: &SchemaField, errors: &mut ValidationErrors) {
    match &field.kind {
        FieldKind::Text(o) => {
            if let (Some(min), Some(max)) = (o.min, o.max) {
                if min > max {
                    errors.add(key, "invalid_options", "min must not exceed max");
                }
            }
            if !o.pattern.is_empty() && Regex::new(&o.pattern).is_err() {
                errors.add(
                    key,
                    "invalid_options",
                    format!("Invalid pattern '{}'", o.pattern),
                );
            }
        }
        FieldKind::Number(o) => {
            if let (Some(min), Some(max)) = (o.min, o.max) {
                if min > max {
                    errors.add(key, "invalid_options", "min must not exceed max");
                }
            }
        }
        FieldKind::Select(o) => {
            if o.values.is_empty() {
                errors.add(key, "invalid_options", "Select fields need at least one value");
            }
            if o.max_select == 0 || o.max_select > o.values.len().max(1) {
                errors.add(
                    key,
                    "invalid_options",
                    format!("maxSelect must be between 1 and {}", o.values.len().max(1)),
                );
            }
        }
        FieldKind::Relation(o) => {
            if o.collection_id.is_empty() {
                errors.add(key, "invalid_options", "Relation fields need a collectionId");
            }
            if o.max_select == Some(0) {
                errors.add(key, "invalid_options", "maxSelect must be at least 1");
            }
        }
        FieldKind::File(o) => {
            if o.max_select == 0 {
                errors.add(key, "invalid_options", "maxSelect must be at least 1");
            }
            if o.max_size == 0 {
                errors.add(key, "invalid_options", "maxSize must be greater than 0");
            }
        }
        FieldKind::Bool | FieldKind::Email(_) => {}
    }
}

/// The built-in users collection as it exists before any migration
pub fn users_collection() -> Collection {
    let self_only = Some("id = @request.auth.id".to_string());
    Collection {
        id: USERS_COLLECTION_ID.to_string(),
        created: String::new(),
        updated: String::new(),
        name: "users".to_string(),
        collection_type: CollectionType::Auth,
        system: false,
        schema: vec![
            SchemaField::new(
                "users_name",
                "name",
                FieldKind::Text(TextOptions {
                    min: None,
                    max: None,
                    pattern: String::new(),
                }),
            ),
            SchemaField::new(
                "users_avatar",
                "avatar",
                FieldKind::File(FileOptions {
                    mime_types: vec![
                        "image/jpeg".to_string(),
                        "image/png".to_string(),
                        "image/svg+xml".to_string(),
                        "image/gif".to_string(),
                        "image/webp".to_string(),
                    ],
                    thumbs: Vec::new(),
                    max_select: 1,
                    max_size: DEFAULT_MAX_FILE_SIZE,
                    protected: false,
                }),
            ),
            SchemaField::new("users_isadmin", "isAdmin", FieldKind::Bool),
        ],
        indexes: Vec::new(),
        list_rule: self_only.clone(),
        view_rule: self_only.clone(),
        create_rule: Some(String::new()),
        update_rule: self_only.clone(),
        delete_rule: self_only,
        options: CollectionOptions::Auth(AuthOptions::default()),
    }
}
