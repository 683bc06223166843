//! Extraction adapter contract + generic, configuration-driven adapters.
//!
//! Per-site heuristics live outside this crate; what ships here are two adapters that cover
//! the common shapes declaratively: JSON APIs (pointer to a record array) and HTML listings
//! (item selector + per-field selectors). A field that cannot be extracted is simply absent
//! from the record; only a payload that cannot be read at all is an error.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use harvest_core::{FieldMap, RawRecord};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "harvest-adapters";

/// Where a payload came from, handed to adapters alongside the bytes.
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    pub source_id: &'a str,
    pub origin_url: &'a str,
    pub fetched_at: DateTime<Utc>,
    pub task_ordinal: usize,
}

impl PageContext<'_> {
    /// Wraps extracted field maps into records, numbering them in page order.
    pub fn records_from(&self, maps: Vec<FieldMap>) -> Vec<RawRecord> {
        maps.into_iter()
            .enumerate()
            .map(|(index, payload)| RawRecord {
                source_id: self.source_id.to_string(),
                fetched_at: self.fetched_at,
                payload,
                origin_url: self.origin_url.to_string(),
                ordinal: (self.task_ordinal, index),
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid UTF-8")]
    Encoding,
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("{0}")]
    Message(String),
}

pub trait ExtractionAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn extract(&self, ctx: &PageContext<'_>, payload: &[u8]) -> Result<Vec<RawRecord>, ExtractionError>;
}

/// Declarative adapter definition as written in the source registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    Json {
        /// JSON pointer to the record array (or single object). Empty means the document root.
        #[serde(default)]
        records_pointer: String,
        /// Output field → JSON pointer relative to each record. Empty keeps every top-level key.
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    Html {
        item_selector: String,
        fields: BTreeMap<String, FieldSelector>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    pub selector: String,
    /// Attribute to read instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    /// Collect every match as a list instead of the first one.
    #[serde(default)]
    pub all: bool,
    /// Resolve the value against the page URL (for links).
    #[serde(default)]
    pub resolve_url: bool,
}

pub fn adapter_from_spec(
    source_id: &str,
    spec: &AdapterSpec,
) -> Result<Box<dyn ExtractionAdapter>, ExtractionError> {
    match spec {
        AdapterSpec::Json {
            records_pointer,
            fields,
        } => Ok(Box::new(JsonRecordsAdapter::new(
            source_id,
            records_pointer.clone(),
            fields.clone(),
        ))),
        AdapterSpec::Html {
            item_selector,
            fields,
        } => Ok(Box::new(HtmlSelectorAdapter::new(source_id, item_selector, fields)?)),
    }
}

#[derive(Debug, Clone)]
pub struct JsonRecordsAdapter {
    source_id: String,
    records_pointer: String,
    fields: BTreeMap<String, String>,
}

impl JsonRecordsAdapter {
    pub fn new(
        source_id: impl Into<String>,
        records_pointer: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            records_pointer: records_pointer.into(),
            fields,
        }
    }

    fn project(&self, item: &JsonValue) -> Option<FieldMap> {
        let object = item.as_object()?;
        if self.fields.is_empty() {
            return Some(object.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        }
        Some(
            self.fields
                .iter()
                .filter_map(|(name, pointer)| {
                    item.pointer(pointer)
                        .filter(|v| !v.is_null())
                        .map(|v| (name.clone(), v.clone()))
                })
                .collect(),
        )
    }
}

impl ExtractionAdapter for JsonRecordsAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn extract(&self, ctx: &PageContext<'_>, payload: &[u8]) -> Result<Vec<RawRecord>, ExtractionError> {
        let document: JsonValue = serde_json::from_slice(payload)?;
        let Some(root) = document.pointer(&self.records_pointer) else {
            debug!(pointer = %self.records_pointer, url = ctx.origin_url, "records pointer not present");
            return Ok(Vec::new());
        };
        let items = match root {
            JsonValue::Array(items) => items.iter().collect::<Vec<_>>(),
            JsonValue::Object(_) => vec![root],
            _ => Vec::new(),
        };
        let maps = items
            .into_iter()
            .filter_map(|item| self.project(item))
            .filter(|map| !map.is_empty())
            .collect();
        Ok(ctx.records_from(maps))
    }
}

#[derive(Debug)]
struct CompiledField {
    name: String,
    selector: Selector,
    attr: Option<String>,
    all: bool,
    resolve_url: bool,
}

#[derive(Debug)]
pub struct HtmlSelectorAdapter {
    source_id: String,
    item_selector: Selector,
    fields: Vec<CompiledField>,
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl HtmlSelectorAdapter {
    pub fn new(
        source_id: impl Into<String>,
        item_selector: &str,
        fields: &BTreeMap<String, FieldSelector>,
    ) -> Result<Self, ExtractionError> {
        let fields = fields
            .iter()
            .map(|(name, spec)| {
                Ok(CompiledField {
                    name: name.clone(),
                    selector: parse_selector(&spec.selector)?,
                    attr: spec.attr.clone(),
                    all: spec.all,
                    resolve_url: spec.resolve_url,
                })
            })
            .collect::<Result<Vec<_>, ExtractionError>>()?;
        Ok(Self {
            source_id: source_id.into(),
            item_selector: parse_selector(item_selector)?,
            fields,
        })
    }

    fn read_value(field: &CompiledField, element: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
        let raw = match &field.attr {
            Some(attr) => element.value().attr(attr).and_then(|s| text_or_none(s.to_string())),
            None => text_or_none(element.text().collect::<String>()),
        }?;
        if !field.resolve_url {
            return Some(raw);
        }
        match base {
            Some(base) => base.join(&raw).ok().map(|u| u.to_string()),
            None => Url::parse(&raw).ok().map(|u| u.to_string()),
        }
    }

    fn extract_item(&self, item: ElementRef<'_>, base: Option<&Url>) -> FieldMap {
        let mut map = FieldMap::new();
        for field in &self.fields {
            let mut values = item
                .select(&field.selector)
                .filter_map(|el| Self::read_value(field, el, base));
            let value = if field.all {
                let list = values.map(JsonValue::String).collect::<Vec<_>>();
                (!list.is_empty()).then_some(JsonValue::Array(list))
            } else {
                values.next().map(JsonValue::String)
            };
            if let Some(value) = value {
                map.insert(field.name.clone(), value);
            }
        }
        map
    }
}

impl ExtractionAdapter for HtmlSelectorAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn extract(&self, ctx: &PageContext<'_>, payload: &[u8]) -> Result<Vec<RawRecord>, ExtractionError> {
        let text = std::str::from_utf8(payload).map_err(|_| ExtractionError::Encoding)?;
        let document = Html::parse_document(text);
        let base = Url::parse(ctx.origin_url).ok();
        let maps = document
            .select(&self.item_selector)
            .map(|item| self.extract_item(item, base.as_ref()))
            .filter(|map| !map.is_empty())
            .collect();
        Ok(ctx.records_from(maps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx(url: &str) -> PageContext<'_> {
        PageContext {
            source_id: "committees",
            origin_url: url,
            fetched_at: Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).single().unwrap(),
            task_ordinal: 7,
        }
    }

    #[test]
    fn json_adapter_projects_fields_by_pointer() {
        let adapter = JsonRecordsAdapter::new(
            "committees",
            "/data/items",
            BTreeMap::from([
                ("title".to_string(), "/title".to_string()),
                ("chair".to_string(), "/people/chair/name".to_string()),
                ("missing".to_string(), "/nope".to_string()),
            ]),
        );
        let payload = json!({
            "data": {"items": [
                {"title": "Budget hearing", "people": {"chair": {"name": "R. Souza"}}},
                {"title": "Health notice"},
                "not-an-object"
            ]}
        });
        let records = adapter
            .extract(&ctx("https://example.org/api?page=1"), payload.to_string().as_bytes())
            .expect("extract");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload["chair"], json!("R. Souza"));
        assert!(!records[1].payload.contains_key("chair"));
        assert!(!records[0].payload.contains_key("missing"));
        assert_eq!(records[1].ordinal, (7, 1));
        assert_eq!(records[0].origin_url, "https://example.org/api?page=1");
    }

    #[test]
    fn json_adapter_rejects_garbage_and_tolerates_missing_pointer() {
        let adapter = JsonRecordsAdapter::new("committees", "/items", BTreeMap::new());
        assert!(matches!(
            adapter.extract(&ctx("u"), b"<html>blocked</html>"),
            Err(ExtractionError::Json(_))
        ));
        let records = adapter.extract(&ctx("u"), br#"{"other": []}"#).expect("extract");
        assert!(records.is_empty());
    }

    #[test]
    fn html_adapter_extracts_items_and_resolves_links() {
        let spec = AdapterSpec::Html {
            item_selector: "li.member".into(),
            fields: BTreeMap::from([
                (
                    "name".to_string(),
                    FieldSelector {
                        selector: ".name".into(),
                        attr: None,
                        all: false,
                        resolve_url: false,
                    },
                ),
                (
                    "profile".to_string(),
                    FieldSelector {
                        selector: "a.profile".into(),
                        attr: Some("href".into()),
                        all: false,
                        resolve_url: true,
                    },
                ),
                (
                    "roles".to_string(),
                    FieldSelector {
                        selector: ".role".into(),
                        attr: None,
                        all: true,
                        resolve_url: false,
                    },
                ),
            ]),
        };
        let adapter = adapter_from_spec("committees", &spec).expect("adapter");
        let html = r#"
            <ul>
              <li class="member"><span class="name"> Ana
                 Lima </span><a class="profile" href="/people/12">x</a>
                 <span class="role">Chair</span><span class="role">Rapporteur</span></li>
              <li class="member"><span class="name">Bruno Reis</span></li>
              <li class="member"></li>
            </ul>"#;
        let records = adapter
            .extract(&ctx("https://example.org/committee/3"), html.as_bytes())
            .expect("extract");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload["name"], json!("Ana Lima"));
        assert_eq!(records[0].payload["profile"], json!("https://example.org/people/12"));
        assert_eq!(records[0].payload["roles"], json!(["Chair", "Rapporteur"]));
        assert!(!records[1].payload.contains_key("profile"));
        assert!(!records[1].payload.contains_key("roles"));
    }

    #[test]
    fn invalid_selector_is_reported_at_construction() {
        let spec = AdapterSpec::Html {
            item_selector: "li[".into(),
            fields: BTreeMap::new(),
        };
        assert!(matches!(
            adapter_from_spec("committees", &spec),
            Err(ExtractionError::Selector { .. })
        ));
    }

    #[test]
    fn adapter_spec_reads_from_yaml_shape() {
        let spec: AdapterSpec = serde_json::from_value(json!({
            "kind": "json",
            "records_pointer": "/results"
        }))
        .expect("spec");
        assert_eq!(
            spec,
            AdapterSpec::Json {
                records_pointer: "/results".into(),
                fields: BTreeMap::new()
            }
        );
    }
}
