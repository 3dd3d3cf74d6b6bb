//! Append-only JSONL audit log with PII redaction and rotation.
//!
//! One JSON object per line, UTF-8, absent fields omitted. Writes hold a
//! per-logger mutex; rotation shifts `<path>.1..N` backups, oldest dropped.

mod redaction;

pub use redaction::{hash_value, redact_pii, redact_value, EXEMPT_KEYS};

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ToolCall,
    PermissionDecision,
    UserConfirmation,
    MemoryWrite,
    Error,
    SessionStart,
    SessionEnd,
}

/// A single audit record. Optional fields are omitted from the JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_confirmed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            tool: None,
            args_hash: None,
            decision: None,
            decision_reason: None,
            user_confirmed: None,
            latency_ms: None,
            result_hash: None,
            success: None,
            session_id: None,
            turn_number: None,
            risk_level: None,
            message: None,
            extra: HashMap::new(),
        }
    }
}

struct WriterState;

/// Append-only JSONL audit logger. Share via `Arc`.
pub struct AuditLogger {
    path: PathBuf,
    max_bytes: u64,
    max_backups: u32,
    redact: bool,
    write_lock: Mutex<WriterState>,
}

impl AuditLogger {
    pub fn new(path: PathBuf, max_bytes: u64, max_backups: u32, redact: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create audit dir {}", parent.display()))?;
        }
        Ok(Self {
            path,
            max_bytes,
            max_backups,
            redact,
            write_lock: Mutex::new(WriterState),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event to the log file, redacting string fields first
    /// (unless the logger was built with `redact = false`).
    pub fn log(&self, event: &AuditEvent) -> Result<()> {
        let mut value = serde_json::to_value(event).context("serialize audit event")?;
        if self.redact {
            value = redact_value(&value);
        }
        let line = serde_json::to_string(&value).context("encode audit line")?;

        let _guard = self.write_lock.lock().expect("audit lock poisoned");
        self.maybe_rotate()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Convenience: log a tool invocation with hashed args/result.
    #[allow(clippy::too_many_arguments)]
    pub fn log_tool_call(
        &self,
        tool: &str,
        args: Option<&Value>,
        decision: Option<&str>,
        result: Option<&Value>,
        latency_ms: Option<f64>,
        success: bool,
        session_id: Option<&str>,
        turn_number: Option<u64>,
        risk_level: Option<&str>,
    ) -> Result<()> {
        let mut event = AuditEvent::new(AuditEventType::ToolCall);
        event.tool = Some(tool.to_string());
        event.args_hash = args.map(hash_value);
        event.decision = decision.map(str::to_string);
        event.result_hash = result.map(hash_value);
        event.latency_ms = latency_ms;
        event.success = Some(success);
        event.session_id = session_id.map(str::to_string);
        event.turn_number = turn_number;
        event.risk_level = risk_level.map(str::to_string);
        self.log(&event)
    }

    /// Last `n` events from the log, oldest of the tail first.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEvent>> {
        let lines = self.read_lines()?;
        let start = lines.len().saturating_sub(n);
        lines[start..]
            .iter()
            .map(|l| serde_json::from_str(l).context("parse audit line"))
            .collect()
    }

    /// Scan the log newest-first. `query` substring-matches the raw line,
    /// `event_type` filters exactly, `since` bounds the timestamp.
    pub fn search(
        &self,
        query: Option<&str>,
        event_type: Option<AuditEventType>,
        since: Option<Duration>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let cutoff = since.map(|s| {
            Utc::now() - chrono::Duration::from_std(s).unwrap_or_else(|_| chrono::Duration::zero())
        });
        let mut results = Vec::new();

        for line in self.read_lines()?.iter().rev() {
            if results.len() >= limit {
                break;
            }
            let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                continue;
            };
            if let Some(t) = event_type {
                if event.event_type != t {
                    continue;
                }
            }
            if let Some(c) = cutoff {
                if event.timestamp < c {
                    continue;
                }
            }
            if let Some(q) = query {
                if !line.to_lowercase().contains(&q.to_lowercase()) {
                    continue;
                }
            }
            results.push(event);
        }
        Ok(results)
    }

    /// Rotate if the current file exceeds `max_bytes` (caller holds the
    /// write lock). Shifts `.N → .N+1` up to `max_backups`, oldest dropped.
    fn maybe_rotate(&self) -> Result<()> {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < self.max_bytes {
            return Ok(());
        }

        for i in (1..=self.max_backups).rev() {
            let src = self.backup_path(i);
            if i == self.max_backups {
                if src.exists() {
                    std::fs::remove_file(&src)?;
                }
            } else if src.exists() {
                std::fs::rename(&src, self.backup_path(i + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;
        tracing::info!(path = %self.path.display(), "audit log rotated");
        Ok(())
    }

    fn backup_path(&self, i: u32) -> PathBuf {
        PathBuf::from(format!("{}.{i}", self.path.display()))
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let body = std::fs::read_to_string(&self.path)?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_logger(dir: &tempfile::TempDir) -> AuditLogger {
        AuditLogger::new(dir.path().join("audit.jsonl"), 50 * 1024 * 1024, 5, true).unwrap()
    }

    #[test]
    fn log_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(&dir);

        logger
            .log_tool_call(
                "calendar.list_events",
                Some(&json!({"window_hint": "today"})),
                Some("allow"),
                Some(&json!({"ok": true, "count": 2})),
                Some(12.5),
                true,
                Some("s1"),
                Some(1),
                Some("low"),
            )
            .unwrap();

        let events = logger.tail(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool.as_deref(), Some("calendar.list_events"));
        assert!(events[0].args_hash.as_deref().unwrap().starts_with("sha256:"));
        assert_eq!(events[0].success, Some(true));
    }

    #[test]
    fn lines_are_compact_no_null_fields() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(&dir);
        logger.log(&AuditEvent::new(AuditEventType::SessionStart)).unwrap();

        let body = std::fs::read_to_string(logger.path()).unwrap();
        assert!(!body.contains("null"));
        assert!(body.contains("\"event_type\":\"session_start\""));
    }

    #[test]
    fn redaction_applies_to_message_but_not_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(&dir);

        let mut event = AuditEvent::new(AuditEventType::Error);
        event.message = Some("contact alice@example.com secret=hunter2 in /home/alice/".into());
        event.args_hash = Some("sha256:deadbeefdeadbeef".into());
        logger.log(&event).unwrap();

        let body = std::fs::read_to_string(logger.path()).unwrap();
        assert!(!body.contains("alice@example.com"));
        assert!(!body.contains("hunter2"));
        assert!(!body.contains("/home/alice/"));
        assert!(body.contains("sha256:deadbeefdeadbeef"));
    }

    #[test]
    fn search_filters_by_type_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(&dir);

        let mut e1 = AuditEvent::new(AuditEventType::ToolCall);
        e1.tool = Some("gmail.send".into());
        logger.log(&e1).unwrap();
        logger.log(&AuditEvent::new(AuditEventType::SessionStart)).unwrap();

        let hits = logger
            .search(Some("gmail"), Some(AuditEventType::ToolCall), None, 10)
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = logger.search(None, None, None, 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn search_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let logger = test_logger(&dir);

        for tool in ["a", "b", "c"] {
            let mut e = AuditEvent::new(AuditEventType::ToolCall);
            e.tool = Some(tool.into());
            logger.log(&e).unwrap();
        }
        let hits = logger.search(None, None, None, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].tool.as_deref(), Some("c"));
        assert_eq!(hits[1].tool.as_deref(), Some("b"));
    }

    #[test]
    fn rotation_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path().join("audit.jsonl"), 64, 2, false).unwrap();

        // Each line is well over 64 bytes, so every write after the first
        // triggers a rotation.
        for i in 0..4 {
            let mut e = AuditEvent::new(AuditEventType::ToolCall);
            e.tool = Some(format!("tool.number_{i}_padding_padding_padding_padding"));
            logger.log(&e).unwrap();
        }

        assert!(dir.path().join("audit.jsonl").exists());
        assert!(dir.path().join("audit.jsonl.1").exists());
        assert!(dir.path().join("audit.jsonl.2").exists());
        assert!(!dir.path().join("audit.jsonl.3").exists());
    }
}
