//! Normalization-then-hash pipeline turning adapter records into canonical entities.
//!
//! Stored field values are NFKC-normalized with collapsed whitespace, so they stay readable.
//! Identity fragments used for the entity key are additionally case-folded and stripped of
//! diacritics. The content hash covers every non-volatile field through a sorted-key JSON
//! serialization, which makes it independent of run time and of payload key order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::{CanonicalEntity, FieldMap, RawRecord};

/// Field names treated as collection metadata for every source.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "fetched_at",
    "scraped_at",
    "collected_at",
    "crawled_at",
    "retrieved_at",
    "run_id",
];

/// Per-source canonicalization rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalizerConfig {
    /// Ordered subset of fields that identifies the real-world entity (e.g. name + region).
    pub identity_fields: Vec<String>,
    /// Extra fields to drop before hashing, on top of [`DEFAULT_VOLATILE_FIELDS`].
    #[serde(default)]
    pub volatile_fields: Vec<String>,
    /// Field carrying a stable external profile link, used by the secondary merge rule.
    #[serde(default)]
    pub profile_url_field: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    identity_fields: Vec<String>,
    volatile_fields: BTreeSet<String>,
    profile_url_field: Option<String>,
}

impl Canonicalizer {
    pub fn new(config: CanonicalizerConfig) -> Self {
        let volatile_fields = DEFAULT_VOLATILE_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(config.volatile_fields.iter().map(|f| normalize_field_name(f)))
            .collect();
        Self {
            identity_fields: config
                .identity_fields
                .iter()
                .map(|f| normalize_field_name(f))
                .collect(),
            volatile_fields,
            profile_url_field: config.profile_url_field.as_deref().map(normalize_field_name),
        }
    }

    pub fn canonicalize(&self, record: &RawRecord) -> CanonicalEntity {
        let normalized_fields = self.normalize_fields(&record.payload);
        let content_hash = content_hash(&normalized_fields);
        let entity_key = self.entity_key(&record.source_id, &normalized_fields, &content_hash);
        let profile_url = self
            .profile_url_field
            .as_ref()
            .and_then(|field| normalized_fields.get(field))
            .and_then(JsonValue::as_str)
            .and_then(normalize_profile_url);

        CanonicalEntity {
            entity_key,
            normalized_fields,
            content_hash,
            origin_urls: BTreeSet::from([record.origin_url.clone()]),
            first_seen_at: record.fetched_at,
            merged_from: Vec::new(),
            profile_url,
            ordinal: record.ordinal,
        }
    }

    fn is_volatile(&self, field: &str) -> bool {
        field.starts_with('_') || self.volatile_fields.contains(field)
    }

    fn normalize_fields(&self, payload: &FieldMap) -> FieldMap {
        payload
            .iter()
            .map(|(name, value)| (normalize_field_name(name), normalize_value(value)))
            .filter(|(name, value)| !name.is_empty() && !self.is_volatile(name) && !value.is_null())
            .collect()
    }

    fn entity_key(&self, source_id: &str, fields: &FieldMap, content_hash: &str) -> String {
        let fragments = self
            .identity_fields
            .iter()
            .map(|name| fields.get(name).map(identity_fragment).unwrap_or_default())
            .collect::<Vec<_>>();

        if fragments.iter().all(String::is_empty) {
            return format!("{source_id}:#{content_hash}");
        }
        format!("{}:{}", source_id, fragments.join("|"))
    }
}

pub fn normalize_field_name(name: &str) -> String {
    collapse_whitespace(&name.nfkc().collect::<String>())
        .to_lowercase()
        .replace(' ', "_")
}

/// NFKC + whitespace collapse. Width variants fold into their canonical forms.
pub fn normalize_text(input: &str) -> String {
    collapse_whitespace(&input.nfkc().collect::<String>())
}

/// Case-folded, diacritic-stripped form used for identity comparison only.
///
/// Only accents on Latin, Greek and Cyrillic letters are dropped. Marks that distinguish
/// letters in other scripts, such as the kana voicing marks, are recomposed and kept.
pub fn fold_for_identity(input: &str) -> String {
    let mut base = None;
    let stripped = input
        .nfkd()
        .filter(|&c| {
            if !is_combining_mark(c) {
                base = Some(c);
                return true;
            }
            !base.is_some_and(has_droppable_accents)
        })
        .nfc()
        .collect::<String>();
    collapse_whitespace(&stripped.to_lowercase())
}

fn has_droppable_accents(base: char) -> bool {
    matches!(
        base,
        '\u{0000}'..='\u{024F}'
            | '\u{0370}'..='\u{052F}'
            | '\u{1E00}'..='\u{1FFF}'
            | '\u{2C60}'..='\u{2C7F}'
            | '\u{A720}'..='\u{A7FF}'
    )
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalizes strings recursively; empty strings and empty containers become `null`.
fn normalize_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => {
            let text = normalize_text(s);
            if text.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(text)
            }
        }
        JsonValue::Array(items) => {
            let items = items
                .iter()
                .map(normalize_value)
                .filter(|v| !v.is_null())
                .collect::<Vec<_>>();
            if items.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::Array(items)
            }
        }
        JsonValue::Object(map) => {
            let map = map
                .iter()
                .map(|(k, v)| (normalize_field_name(k), normalize_value(v)))
                .filter(|(k, v)| !k.is_empty() && !v.is_null())
                .collect::<serde_json::Map<_, _>>();
            if map.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::Object(map)
            }
        }
        other => other.clone(),
    }
}

fn identity_fragment(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => fold_for_identity(s),
        JsonValue::Null => String::new(),
        JsonValue::Array(items) => items
            .iter()
            .map(identity_fragment)
            .collect::<Vec<_>>()
            .join(","),
        other => {
            let mut out = String::new();
            write_canonical_json(other, &mut out);
            fold_for_identity(&out)
        }
    }
}

/// Drops the fragment, trims a trailing slash and lowercases scheme/host. Non-URLs are ignored.
pub fn normalize_profile_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    let text = url.to_string();
    Some(text.trim_end_matches('/').to_string())
}

pub fn content_hash(fields: &FieldMap) -> String {
    let mut serialized = String::new();
    serialized.push('{');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            serialized.push(',');
        }
        write_json_string(key, &mut serialized);
        serialized.push(':');
        write_canonical_json(value, &mut serialized);
    }
    serialized.push('}');

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// JSON with object keys sorted at every depth, no insignificant whitespace.
fn write_canonical_json(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical_json(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        JsonValue::String(s) => write_json_string(s, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push_str(&JsonValue::String(s.to_string()).to_string());
}
