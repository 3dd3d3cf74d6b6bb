//! PII scrubbing applied to audit records before they reach disk.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\+?\d[\d\s\-()]{7,}\d").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:token|secret|api[_-]?key|password|passwd|[Şş]ifre|parola|auth[_-]?token)\s*[:=]\s*\S+",
    )
    .unwrap()
});
static PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/home/[a-zA-Z0-9_.]+/").unwrap());

/// Redact PII from a string:
/// emails → `u***@***.tld`, phone numbers → `[PHONE]`,
/// token/secret assignments → `[REDACTED]`, home paths → `~/.../`.
pub fn redact_pii(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = EMAIL_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let whole = caps.get(0).expect("group 0").as_str();
        let (local, domain) = whole.split_once('@').expect("email match contains @");
        let tld = domain.rsplit('.').next().filter(|t| !t.is_empty()).unwrap_or("com");
        let first = local.chars().next().unwrap_or('u');
        format!("{first}***@***.{tld}")
    });
    let text = redact_phones(&text);
    let text = TOKEN_RE.replace_all(&text, "[REDACTED]");
    PATH_RE.replace_all(&text, "~/.../").into_owned()
}

/// Phone masking with manual boundary checks: the match must not be
/// preceded by a digit or `T` and not followed by a digit or `T`, so ISO
/// timestamps (`2026-08-01T10:00`) survive intact.
fn redact_phones(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for m in PHONE_RE.find_iter(text) {
        let before = text[..m.start()].chars().next_back();
        let after = text[m.end()..].chars().next();
        let blocked_before = matches!(before, Some(c) if c.is_ascii_digit() || c == 'T');
        let blocked_after = matches!(after, Some(c) if c.is_ascii_digit() || c == 'T');

        out.push_str(&text[last..m.start()]);
        if blocked_before || blocked_after {
            out.push_str(m.as_str());
        } else {
            out.push_str("[PHONE]");
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// SHA-256 hash of a JSON-serialised value, 16-hex prefix.
/// `serde_json` keeps object keys sorted, so the hash is stable.
pub fn hash_value(value: &Value) -> String {
    let raw = value.to_string();
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{}", &hex[..16])
}

/// Keys whose values carry non-PII structured data and skip redaction.
pub const EXEMPT_KEYS: &[&str] = &["timestamp", "event_type", "args_hash", "result_hash"];

/// Recursively redact string values inside a JSON structure, skipping the
/// exempt key set at any nesting depth.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_pii(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if EXEMPT_KEYS.contains(&k.as_str()) {
                        (k.clone(), v.clone())
                    } else {
                        (k.clone(), redact_value(v))
                    }
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn email_masked_keeps_first_char_and_tld() {
        let out = redact_pii("mail to alice@example.com please");
        assert_eq!(out, "mail to a***@***.com please");
        assert!(!out.contains("alice"));
        assert!(!out.contains("example"));
    }

    #[test]
    fn phone_masked() {
        let out = redact_pii("ara beni: +90 532 123 45 67");
        assert!(out.contains("[PHONE]"), "{out}");
    }

    #[test]
    fn iso_timestamp_survives() {
        let out = redact_pii("at 2026-08-01T10:00:00 sharp");
        assert!(out.contains("2026-08-01T10:00:00"), "{out}");
    }

    #[test]
    fn token_assignments_redacted() {
        assert_eq!(redact_pii("secret=hunter2"), "[REDACTED]");
        assert_eq!(redact_pii("api_key: abc123xyz"), "[REDACTED]");
        assert_eq!(redact_pii("şifre = gizli"), "[REDACTED]");
    }

    #[test]
    fn home_path_masked() {
        let out = redact_pii("rm -rf /home/alice/docs");
        assert_eq!(out, "rm -rf ~/.../docs");
        assert!(!out.contains("alice"));
    }

    #[test]
    fn hash_value_is_stable_and_prefixed() {
        let a = hash_value(&json!({"b": 2, "a": 1}));
        let b = hash_value(&json!({"a": 1, "b": 2}));
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 16);
    }

    #[test]
    fn redact_value_skips_exempt_keys() {
        let v = json!({
            "args_hash": "alice@example.com",
            "message": "alice@example.com",
            "extra": {"note": "bob@example.com"}
        });
        let out = redact_value(&v);
        assert_eq!(out["args_hash"], "alice@example.com");
        assert_eq!(out["message"], "a***@***.com");
        assert_eq!(out["extra"]["note"], "b***@***.com");
    }
}
