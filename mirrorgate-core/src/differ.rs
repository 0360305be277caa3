//! Response differ for baseline/candidate body comparison.
//!
//! Two bodies are "equivalent" when, after normalization, their canonical JSON
//! encodings are byte-identical. Normalization drops volatile keys (timestamps,
//! trace identifiers) and masks PII values so that neither produces noise in
//! the mismatch counters.
//!
//! # Comparison Flow
//!
//! ```text
//! (body_a, body_b) ──► parse both as JSON
//!                          │
//!          ┌───────────────┴───────────────┐
//!     either fails                      both parse
//!          │                               │
//!   trimmed raw bytes             sanitize ► canonical encode
//!      compared                        ► bytes compared
//! ```
//!
//! Sanitized objects are rebuilt with their keys in lexicographic order, so the
//! canonical encoding does not depend on the order the upstream emitted them
//! in (nor on whether `serde_json`'s `preserve_order` feature is unified in).

use std::collections::HashSet;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Replacement value for PII fields.
pub const PII_MASK: &str = "***";

/// Keys dropped entirely before comparison (matched case-insensitively).
const DEFAULT_IGNORED_KEYS: &[&str] = &[
    "timestamp",
    "trace_id",
    "traceid",
    "request_id",
    "requestid",
];

/// Keys whose values are replaced by [`PII_MASK`] (matched case-insensitively).
const DEFAULT_PII_KEYS: &[&str] = &["email", "phone", "name", "cc_last4"];

/// Errors raised while diffing.
///
/// A diff error is an internal fault, never a mismatch. Callers must not count
/// it towards `mirror_diff_mismatches_total`.
#[derive(Debug, Error)]
pub enum DiffError {
    /// Canonical encoding of a sanitized value failed.
    #[error("canonical serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Case-insensitive key sets driving sanitization.
///
/// Constant for the process lifetime; shared read-only between mirror tasks.
#[derive(Debug, Clone)]
pub struct NormalizationRules {
    ignored: HashSet<String>,
    pii: HashSet<String>,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        Self::new(
            DEFAULT_IGNORED_KEYS.iter().copied(),
            DEFAULT_PII_KEYS.iter().copied(),
        )
    }
}

impl NormalizationRules {
    /// Build rules from arbitrary key lists. Keys are lowercased on insert.
    pub fn new<'a>(
        ignored: impl IntoIterator<Item = &'a str>,
        pii: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            ignored: ignored.into_iter().map(str::to_lowercase).collect(),
            pii: pii.into_iter().map(str::to_lowercase).collect(),
        }
    }

    /// Returns true if `key` is dropped during sanitization.
    pub fn is_ignored(&self, key: &str) -> bool {
        self.ignored.contains(&key.to_lowercase())
    }

    /// Returns true if the value under `key` is masked during sanitization.
    pub fn is_pii(&self, key: &str) -> bool {
        self.pii.contains(&key.to_lowercase())
    }

    /// Recursively remove ignored keys, mask PII values and canonicalize numbers.
    ///
    /// Arrays keep their order and length. Scalars other than numbers pass
    /// through untouched; numbers are re-encoded as `f64` so that `1` and `1.0`
    /// produce the same canonical text (but `1` and `"1"` still differ).
    pub fn sanitize(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                entries.sort_by(|(a, _), (b, _)| a.cmp(b));

                let mut out = Map::new();
                for (key, val) in entries {
                    let lowered = key.to_lowercase();
                    if self.ignored.contains(&lowered) {
                        continue;
                    }
                    if self.pii.contains(&lowered) {
                        out.insert(key, Value::String(PII_MASK.to_string()));
                        continue;
                    }
                    out.insert(key, self.sanitize(val));
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.sanitize(v)).collect())
            }
            Value::Number(n) => Value::Number(canonical_number(n)),
            scalar @ (Value::String(_) | Value::Bool(_) | Value::Null) => scalar,
        }
    }

    /// Compare two response bodies under these rules.
    ///
    /// Falls back to comparing whitespace-trimmed raw bytes if either body is
    /// not valid JSON. The fallback always uses the original bytes of both
    /// sides, whichever one failed to parse.
    ///
    /// # Errors
    ///
    /// Returns [`DiffError::Serialization`] if canonical encoding fails.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<bool, DiffError> {
        let (va, vb) = match (
            serde_json::from_slice::<Value>(a),
            serde_json::from_slice::<Value>(b),
        ) {
            (Ok(va), Ok(vb)) => (va, vb),
            _ => return Ok(trim_space(a) == trim_space(b)),
        };

        let ca = serde_json::to_vec(&self.sanitize(va))?;
        let cb = serde_json::to_vec(&self.sanitize(vb))?;
        Ok(ca == cb)
    }
}

/// Compare two bodies with the default normalization rules.
///
/// # Errors
///
/// See [`NormalizationRules::compare`].
pub fn compare(a: &[u8], b: &[u8]) -> Result<bool, DiffError> {
    NormalizationRules::default().compare(a, b)
}

/// Strip leading and trailing Unicode white space from raw bytes.
///
/// Trimming stops at the first byte sequence that is not valid UTF-8, so
/// binary bodies are compared as-is past that point.
fn trim_space(bytes: &[u8]) -> &[u8] {
    let lead = bytes
        .utf8_chunks()
        .next()
        .map_or(0, |chunk| chunk.valid().len() - chunk.valid().trim_start().len());
    let rest = &bytes[lead..];

    let trail = match rest.utf8_chunks().last() {
        Some(chunk) if chunk.invalid().is_empty() => {
            chunk.valid().len() - chunk.valid().trim_end().len()
        }
        _ => 0,
    };
    &rest[..rest.len() - trail]
}

fn canonical_number(n: Number) -> Number {
    n.as_f64().and_then(Number::from_f64).unwrap_or(n)
}
