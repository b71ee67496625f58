//! Typed views of the canonical rows.
//!
//! Every persisted entity shares the base envelope (id, timestamps, soft
//! delete, tenant/user scope, tags, metadata, graph edges). Only the entities
//! the Rust code manipulates directly get a struct; everything else flows
//! through the registry-driven repository as JSON maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One directed edge in an entity's `graph_edges` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub target: String,
    #[serde(default = "default_relation")]
    pub relation: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_relation() -> String {
    "related".to_string()
}

fn default_weight() -> f64 {
    0.5
}

impl GraphEdge {
    /// Parse a `graph_edges` JSONB value, skipping malformed entries.
    pub fn parse_array(value: &Value) -> Vec<GraphEdge> {
        match value {
            Value::Array(items) => items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .filter(|e: &GraphEdge| !e.target.is_empty())
                .collect(),
            Value::String(raw) => serde_json::from_str::<Value>(raw)
                .map(|v| Self::parse_array(&v))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Shared envelope fields, flattened into each entity's serialized form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default)]
    pub graph_edges: Vec<GraphEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Ontology registry row. `kind = table` rows carry the per-table
/// configuration in `json_schema` (kv expression, embedding field, crypto).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    /// agent | evaluator | model | tool | resource | table
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub json_schema: Value,
}

/// A conversation or background run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    /// chat | dreaming | research | ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub total_tokens: i64,
}

/// One turn or tool trace inside a session. Transient: random ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub session_id: Uuid,
    /// user | assistant | tool_call | tool_response | system
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub tool_calls: Value,
    #[serde(default)]
    pub token_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// A durable memory object: dream, session_chunk, meeting, upload, search...
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Moment {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub moment_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub topic_tags: Vec<String>,
    #[serde(default)]
    pub emotion_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<Uuid>,
    #[serde(default)]
    pub previous_moment_keys: Vec<String>,
}

/// Serialize any entity into the JSON map the repository consumes.
pub fn to_map<T: Serialize>(entity: &T) -> Map<String, Value> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn graph_edge_defaults_fill_in() {
        let parsed = GraphEdge::parse_array(&json!([
            {"target": "sarah-chen"},
            {"target": "proj-x", "relation": "works_on", "weight": 0.9, "reason": "daily"},
            {"relation": "orphan-no-target"},
            "not-an-object"
        ]));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].relation, "related");
        assert_eq!(parsed[0].weight, 0.5);
        assert_eq!(parsed[1].reason.as_deref(), Some("daily"));
    }

    #[test]
    fn graph_edges_parse_from_stringified_jsonb() {
        let raw = json!(r#"[{"target":"a","relation":"r","weight":0.2}]"#);
        let parsed = GraphEdge::parse_array(&raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].target, "a");
    }

    #[test]
    fn entities_flatten_the_envelope() {
        let moment = Moment {
            name: "dream-coffee".to_string(),
            moment_type: "dream".to_string(),
            summary: Some("a shared espresso theme".to_string()),
            ..Default::default()
        };
        let map = to_map(&moment);
        // Envelope fields sit at the top level, not nested.
        assert!(map.contains_key("tags"));
        assert_eq!(map["name"], json!("dream-coffee"));
        assert!(!map.contains_key("envelope"));
    }
}
