//! Record rows and write payloads.

use crate::rule::FieldSource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One stored row of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub collection_id: String,
    pub collection_name: String,
    pub created: String,
    pub updated: String,
    /// Schema field values plus auth system fields such as `email`
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Auth collections only; never exposed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "collectionId" => Some(Value::String(self.collection_id.clone())),
            "collectionName" => Some(Value::String(self.collection_name.clone())),
            "created" => Some(Value::String(self.created.clone())),
            "updated" => Some(Value::String(self.updated.clone())),
            _ => self.data.get(name).cloned(),
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match name {
            "id" => Some(&self.id),
            _ => self.data.get(name).and_then(|v| v.as_str()),
        }
    }

    /// Values of a relation/file/select field, whether stored as scalar or array
    pub fn string_list(&self, name: &str) -> Vec<String> {
        string_list(self.data.get(name))
    }

    /// The row as the client sees it: system fields plus data, no secrets
    pub fn to_public_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "collectionId".to_string(),
            Value::String(self.collection_id.clone()),
        );
        out.insert(
            "collectionName".to_string(),
            Value::String(self.collection_name.clone()),
        );
        out.insert("created".to_string(), Value::String(self.created.clone()));
        out.insert("updated".to_string(), Value::String(self.updated.clone()));
        for (k, v) in &self.data {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}

impl FieldSource for Record {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

/// Read a scalar-or-array value as a list of non-empty strings
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// A binary attachment submitted with a create or update
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub field: String,
    /// Client-side file name; sanitized before storage
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(field: &str, filename: &str, bytes: Vec<u8>) -> Self {
        Self {
            field: field.to_string(),
            filename: filename.to_string(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Multipart-style payload: scalar fields plus attachments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPayload {
    pub fields: Map<String, Value>,
    pub files: Vec<FileUpload>,
}

impl RecordPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn file(mut self, upload: FileUpload) -> Self {
        self.files.push(upload);
        self
    }

    pub fn uploads_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a FileUpload> + 'a {
        self.files.iter().filter(move |f| f.field == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Record {
        let mut data = Map::new();
        data.insert("uploader_id".to_string(), json!("u1"));
        data.insert("file".to_string(), json!("song_abc.mp3"));
        data.insert("tags".to_string(), json!(["a", "", "b"]));
        Record {
            id: "r1".to_string(),
            collection_id: "c1".to_string(),
            collection_name: "audio_files".to_string(),
            created: "2025-10-20 19:15:14.292Z".to_string(),
            updated: "2025-10-20 19:15:14.292Z".to_string(),
            data,
            password_hash: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_system_field_lookup() {
        let record = sample();
        assert_eq!(record.get("id"), Some(json!("r1")));
        assert_eq!(record.get("collectionName"), Some(json!("audio_files")));
        assert_eq!(record.get("uploader_id"), Some(json!("u1")));
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.get_str("uploader_id"), Some("u1"));
    }

    #[test]
    fn test_string_list() {
        let record = sample();
        assert_eq!(record.string_list("file"), vec!["song_abc.mp3"]);
        assert_eq!(record.string_list("tags"), vec!["a", "b"]);
        assert!(record.string_list("missing").is_empty());
    }

    #[test]
    fn test_public_json_hides_password() {
        let value = sample().to_public_json();
        assert_eq!(value["collectionId"], "c1");
        assert_eq!(value["uploader_id"], "u1");
        assert!(value.get("password_hash").is_none());
        assert!(value.get("passwordHash").is_none());
    }

    #[test]
    fn test_payload_builder() {
        let payload = RecordPayload::new()
            .field("description", "demo")
            .file(FileUpload::new("file", "a.mp3", vec![1, 2, 3]))
            .file(FileUpload::new("cover", "c.png", vec![]));
        assert_eq!(payload.fields["description"], "demo");
        assert_eq!(payload.uploads_for("file").count(), 1);
        assert_eq!(payload.uploads_for("file").next().unwrap().size(), 3);
    }
}
