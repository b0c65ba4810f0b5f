use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSONL log of access decisions and mutations.
///
/// A disabled log accepts every call and writes nothing.
pub struct AuditLog {
    pub path: Option<PathBuf>,
    session_id: String,
    actor: Option<String>,
    file: Option<File>,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<&'a str>,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl AuditLog {
    pub fn new(path: &Path, session_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: Some(path.to_path_buf()),
            session_id: session_id.to_string(),
            actor: None,
            file: Some(file),
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            session_id: String::new(),
            actor: None,
            file: None,
        }
    }

    /// Record who is acting for subsequent events
    pub fn set_actor(&mut self, actor: Option<&str>) {
        self.actor = actor.map(String::from);
    }

    pub fn log(&mut self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let event = Event {
            ts: Utc::now(),
            session_id: &self.session_id,
            actor: self.actor.as_deref(),
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    /// Log the outcome of a rule check
    pub fn rule_decision(
        &mut self,
        collection: &str,
        operation: &str,
        decision: &str,
        record_id: Option<&str>,
    ) -> Result<()> {
        self.log(
            "rule_decision",
            serde_json::json!({
                "collection": collection,
                "operation": operation,
                "decision": decision,
                "record_id": record_id,
            }),
        )
    }

    pub fn record_created(&mut self, collection: &str, record_id: &str) -> Result<()> {
        self.log(
            "record_created",
            serde_json::json!({ "collection": collection, "record_id": record_id }),
        )
    }

    pub fn record_updated(&mut self, collection: &str, record_id: &str) -> Result<()> {
        self.log(
            "record_updated",
            serde_json::json!({ "collection": collection, "record_id": record_id }),
        )
    }

    /// Log a deleted row; `cascade` names the row whose deletion caused it
    pub fn record_deleted(
        &mut self,
        collection: &str,
        record_id: &str,
        cascade: Option<&str>,
    ) -> Result<()> {
        self.log(
            "record_deleted",
            serde_json::json!({
                "collection": collection,
                "record_id": record_id,
                "cascade_from": cascade,
            }),
        )
    }

    /// Log a migration unit applied (`up`) or reverted (`down`)
    pub fn migration(&mut self, direction: &str, key: u64, name: &str) -> Result<()> {
        self.log(
            "migration",
            serde_json::json!({
                "direction": direction,
                "key": key,
                "name": name,
            }),
        )
    }

    pub fn login(&mut self, collection: &str, email: &str, ok: bool) -> Result<()> {
        self.log(
            "login",
            serde_json::json!({
                "collection": collection,
                "email": email,
                "ok": ok,
            }),
        )
    }

    pub fn logout(&mut self, email: Option<&str>) -> Result<()> {
        self.log("logout", serde_json::json!({ "email": email }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_events_are_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("s1.jsonl");
        let mut log = AuditLog::new(&path, "s1").unwrap();
        log.rule_decision("audio_files", "view", "deny", Some("r1"))
            .unwrap();
        log.set_actor(Some("ana@example.com"));
        log.record_created("audio_files", "r2").unwrap();

        let events = read_lines(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "rule_decision");
        assert_eq!(events[0]["session_id"], "s1");
        assert_eq!(events[0]["decision"], "deny");
        assert!(events[0].get("actor").is_none());
        assert_eq!(events[1]["actor"], "ana@example.com");
        assert_eq!(events[1]["record_id"], "r2");
    }

    #[test]
    fn test_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        AuditLog::new(&path, "a")
            .unwrap()
            .migration("up", 1, "1_first")
            .unwrap();
        AuditLog::new(&path, "b").unwrap().logout(None).unwrap();
        let events = read_lines(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["direction"], "up");
        assert_eq!(events[1]["session_id"], "b");
    }

    #[test]
    fn test_disabled_writes_nothing() {
        let mut log = AuditLog::disabled();
        assert!(log.login("users", "x@y.z", false).is_ok());
        assert!(log.path.is_none());
    }
}
