//! Tracking URL macro substitution.
//!
//! Two syntactic forms are supported, applied in order: `[NAME]` first, then
//! `${NAME}`. Names are case-sensitive; unknown names are left untouched so
//! partially macro-aware ad servers still receive their own placeholders.
//! Dot-separated names (`ext.domain`) resolve by walking nested maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Macro dictionary. Values may be strings, numbers, bools, or nested maps
/// (reachable via dotted names only).
pub type MacroMap = Map<String, Value>;

/// One substitution pattern: `prefix NAME suffix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroFormat {
    pub prefix: String,
    pub suffix: String,
}

impl MacroFormat {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

/// Default formats, in application order: `[NAME]` then `${NAME}`.
pub fn default_formats() -> Vec<MacroFormat> {
    vec![MacroFormat::new("[", "]"), MacroFormat::new("${", "}")]
}

/// Substitute every resolvable macro in `template`.
///
/// Idempotent for a fixed macro map: substituted text no longer matches any
/// pattern, so a second pass is a no-op.
pub fn expand(template: &str, macros: &MacroMap, formats: &[MacroFormat]) -> String {
    let mut out = template.to_string();
    for format in formats {
        out = expand_format(&out, macros, format);
    }
    out
}

fn expand_format(input: &str, macros: &MacroMap, format: &MacroFormat) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(&format.prefix) {
        out.push_str(&rest[..start]);
        let after_prefix = &rest[start + format.prefix.len()..];

        let replaced = after_prefix.find(&format.suffix).and_then(|end| {
            let name = &after_prefix[..end];
            if !is_macro_name(name) {
                return None;
            }
            resolve(macros, name).map(|value| (end, value))
        });

        match replaced {
            Some((end, value)) => {
                out.push_str(&value);
                rest = &after_prefix[end + format.suffix.len()..];
            }
            None => {
                // Unknown or malformed name: emit the prefix verbatim and
                // keep scanning from just past it.
                out.push_str(&format.prefix);
                rest = after_prefix;
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_macro_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Look up `name` in the map: direct key first, then as a dotted path into
/// nested maps. Objects and arrays have no string form and stay unresolved.
fn resolve(macros: &MacroMap, name: &str) -> Option<String> {
    if let Some(value) = macros.get(name) {
        return stringify(value);
    }
    if name.contains('.') {
        let mut current: &Value = &Value::Object(macros.clone());
        for segment in name.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        return stringify(current);
    }
    None
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

/// Stable fingerprint of a macro map, used to cache expansions per trackable
/// across retries. `serde_json::Map` iterates in key order, so the hash is
/// deterministic.
pub fn fingerprint(macros: &MacroMap) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_value_into(&Value::Object(macros.clone()), &mut hasher);
    hasher.finish()
}

fn hash_value_into(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => (1u8, b).hash(hasher),
        Value::Number(n) => (2u8, n.to_string()).hash(hasher),
        Value::String(s) => (3u8, s).hash(hasher),
        Value::Array(items) => {
            (4u8, items.len()).hash(hasher);
            for item in items {
                hash_value_into(item, hasher);
            }
        }
        Value::Object(map) => {
            (5u8, map.len()).hash(hasher);
            for (k, v) in map {
                k.hash(hasher);
                hash_value_into(v, hasher);
            }
        }
    }
}

/// Format a playback offset as `HH:MM:SS.mmm` for the CONTENTPLAYHEAD macro.
pub fn format_playhead(offset_secs: f64) -> String {
    let total_millis = (offset_secs.max(0.0) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let secs = (total_millis / 1000) % 60;
    let mins = (total_millis / 60_000) % 60;
    let hours = total_millis / 3_600_000;
    format!("{hours:02}:{mins:02}:{secs:02}.{millis:03}")
}
