//! Best-effort entity recovery from webhook payload tags and alert titles.
//!
//! Runs when the ML gateway fails, and also after a successful extraction to
//! fill any fields the model left empty. Only a narrow allow-list of tag
//! prefixes is recognized; unknown payload shapes are never guessed at.

use serde_json::Value;
use std::collections::BTreeMap;

/// Service tokens recognized in alert titles when tags yield nothing.
const TITLE_SERVICE_TOKENS: &[&str] = &["api", "db", "cache", "queue", "worker"];

/// Mutable view of an alert's extracted-entity fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFields {
    pub service_name: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub error_code: Option<String>,
}

/// Fill still-null entity fields from payload tags and the title.
///
/// Tags look like `["service:api", "env:production", "region:us-east-1"]`.
/// Each recognized prefix populates the matching field once and records
/// provenance `"tags"`. If no tag names a service, the title is scanned for a
/// short whitelist of service tokens with provenance `"title"`.
pub fn apply_fallback_entities(
    fields: &mut EntityFields,
    raw_payload: &Value,
    title: &str,
    sources: &mut BTreeMap<String, String>,
) {
    if let Some(tags) = raw_payload.get("tags").and_then(Value::as_array) {
        for tag in tags {
            let Some(tag) = tag.as_str() else { continue };

            if let Some(value) = tag.strip_prefix("service:") {
                if fields.service_name.is_none() {
                    fields.service_name = Some(value.to_string());
                    sources.insert("service_name".to_string(), "tags".to_string());
                }
            } else if let Some(value) = tag.strip_prefix("env:") {
                if fields.environment.is_none() {
                    fields.environment = Some(value.to_string());
                    sources.insert("environment".to_string(), "tags".to_string());
                }
            } else if let Some(value) = tag.strip_prefix("region:") {
                if fields.region.is_none() {
                    fields.region = Some(value.to_string());
                    sources.insert("region".to_string(), "tags".to_string());
                }
            } else if let Some(value) = tag.strip_prefix("error:") {
                if fields.error_code.is_none() {
                    fields.error_code = Some(value.to_string());
                    sources.insert("error_code".to_string(), "tags".to_string());
                }
            }
        }
    }

    if fields.service_name.is_none() && !title.is_empty() {
        let lowered = title.to_lowercase();
        for candidate in TITLE_SERVICE_TOKENS {
            if lowered.contains(candidate) {
                fields.service_name = Some((*candidate).to_string());
                sources.insert("service_name".to_string(), "title".to_string());
                break;
            }
        }
    }
}

/// Collapse per-field provenance into a single label: `unknown` when no
/// entity was recovered, the single source when uniform, `mixed` otherwise.
pub fn summarize_entity_source(sources: &BTreeMap<String, String>) -> String {
    if sources.is_empty() {
        return "unknown".to_string();
    }
    let mut values: Vec<&str> = sources.values().map(String::as_str).collect();
    values.sort_unstable();
    values.dedup();
    if values.len() == 1 {
        values[0].to_string()
    } else {
        "mixed".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_populate_all_recognized_prefixes() {
        let payload = json!({
            "tags": ["service:api", "env:production", "region:us-east-1", "error:E503"]
        });
        let mut fields = EntityFields::default();
        let mut sources = BTreeMap::new();

        apply_fallback_entities(&mut fields, &payload, "whatever", &mut sources);

        assert_eq!(fields.service_name.as_deref(), Some("api"));
        assert_eq!(fields.environment.as_deref(), Some("production"));
        assert_eq!(fields.region.as_deref(), Some("us-east-1"));
        assert_eq!(fields.error_code.as_deref(), Some("E503"));
        assert!(sources.values().all(|v| v == "tags"));
    }

    #[test]
    fn existing_fields_are_never_overwritten() {
        let payload = json!({ "tags": ["service:db"] });
        let mut fields = EntityFields {
            service_name: Some("api".to_string()),
            ..EntityFields::default()
        };
        let mut sources = BTreeMap::new();

        apply_fallback_entities(&mut fields, &payload, "", &mut sources);

        assert_eq!(fields.service_name.as_deref(), Some("api"));
        assert!(sources.is_empty());
    }

    #[test]
    fn title_scan_kicks_in_without_service_tag() {
        let payload = json!({ "tags": ["env:staging"] });
        let mut fields = EntityFields::default();
        let mut sources = BTreeMap::new();

        apply_fallback_entities(&mut fields, &payload, "Queue backlog growing", &mut sources);

        assert_eq!(fields.service_name.as_deref(), Some("queue"));
        assert_eq!(sources.get("service_name").map(String::as_str), Some("title"));
        assert_eq!(sources.get("environment").map(String::as_str), Some("tags"));
    }

    #[test]
    fn non_string_and_unknown_tags_are_ignored() {
        let payload = json!({ "tags": [42, {"service": "api"}, "team:payments"] });
        let mut fields = EntityFields::default();
        let mut sources = BTreeMap::new();

        apply_fallback_entities(&mut fields, &payload, "no match here", &mut sources);

        assert_eq!(fields, EntityFields::default());
        assert!(sources.is_empty());
    }

    #[test]
    fn provenance_summary_is_unknown_uniform_or_mixed() {
        let mut sources = BTreeMap::new();
        assert_eq!(summarize_entity_source(&sources), "unknown");

        sources.insert("service_name".to_string(), "tags".to_string());
        sources.insert("environment".to_string(), "tags".to_string());
        assert_eq!(summarize_entity_source(&sources), "tags");

        sources.insert("region".to_string(), "ml".to_string());
        assert_eq!(summarize_entity_source(&sources), "mixed");
    }
}
