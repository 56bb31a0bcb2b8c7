// src/cache/fingerprint.rs
//! Deterministic identity of a stage invocation.
//!
//! A fingerprint is the SHA-256 of the stage name and a canonical JSON
//! rendering of every input that can influence the stage's output. Object
//! keys are sorted and text is normalized before hashing, so incidental
//! formatting does not change the key while any real input change does.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{collapse_whitespace, StageKind};

/// Bump when the canonical form changes; old entries simply stop matching.
pub const FINGERPRINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builder collecting the canonicalized inputs of one stage invocation.
#[derive(Debug, Clone)]
pub struct FingerprintInput {
    stage: StageKind,
    fields: BTreeMap<String, Value>,
}

impl FingerprintInput {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            fields: BTreeMap::new(),
        }
    }

    /// Free prose (problem statements, descriptions): all whitespace runs collapse to one space.
    pub fn prose(mut self, key: &str, text: &str) -> Self {
        self.fields.insert(key.to_string(), Value::String(collapse_whitespace(text)));
        self
    }

    /// Layout-sensitive text (code, scripts): only line endings and trailing
    /// whitespace are normalized, indentation is kept.
    pub fn text(mut self, key: &str, text: &str) -> Self {
        self.fields.insert(key.to_string(), Value::String(canonical_text(text)));
        self
    }

    pub fn number(mut self, key: &str, n: u64) -> Self {
        self.fields.insert(key.to_string(), Value::from(n));
        self
    }

    /// Identity of a collaborator (model id, voice engine, renderer settings).
    pub fn collaborator(self, identity: &str) -> Self {
        self.prose("collaborator", identity)
    }

    /// Output of an upstream stage, referenced by its own fingerprint.
    pub fn upstream(mut self, key: &str, fingerprint: &Fingerprint) -> Self {
        self.fields.insert(key.to_string(), Value::String(fingerprint.as_str().to_string()));
        self
    }

    pub fn value<T: Serialize>(mut self, key: &str, value: &T) -> Self {
        let value = serde_json::to_value(value)
            .unwrap_or_else(|e| Value::String(format!("unserializable input: {}", e)));
        self.fields.insert(key.to_string(), canonical_value(value));
        self
    }

    pub fn finish(self) -> Fingerprint {
        let mut canonical = String::new();
        write_canonical(&Value::Object(self.fields.into_iter().collect()), &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(format!("v{}\n", FINGERPRINT_VERSION).as_bytes());
        hasher.update(self.stage.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

/// CRLF to LF, trailing whitespace stripped per line, surrounding blank lines dropped.
pub fn canonical_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = normalized.lines().map(str::trim_end).collect();
    lines.join("\n").trim_matches('\n').to_string()
}

fn canonical_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(canonical_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_value).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, canonical_value(v))).collect()),
        other => other,
    }
}

/// Serializes with object keys sorted, independent of serde_json's map ordering.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
