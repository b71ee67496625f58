//! The table registry: one `TableSpec` per canonical table.
//!
//! Entities vary by table but share the envelope, so the polymorphism lives
//! in data, not types: the repository, the dialect engine, and the migration
//! seeds all read this table. The same configuration is mirrored into
//! `schemas` rows of `kind = 'table'` at migrate time so SQL-side consumers
//! (triggers, operators) see it too.

use p8_crypto::FieldMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    Text,
    TextArray,
    Json,
    Timestamp,
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec { name, kind }
}

/// Envelope columns shared by every canonical table.
const ENVELOPE: &[ColumnSpec] = &[
    col("id", ColumnKind::Uuid),
    col("tenant_id", ColumnKind::Text),
    col("user_id", ColumnKind::Uuid),
    col("tags", ColumnKind::TextArray),
    col("metadata", ColumnKind::Json),
    col("graph_edges", ColumnKind::Json),
];

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub table: &'static str,
    /// Maintained in the kv_store index by triggers.
    pub kv_synced: bool,
    /// Field whose content is embedded, when the table is embeddable.
    pub embedding_field: Option<&'static str>,
    /// Encrypted fields and their modes. Empty for plaintext tables.
    pub encrypted_fields: &'static [(&'static str, FieldMode)],
    /// SQL expression producing `kv_store.content_summary` for this table.
    /// Encrypted tables only expose `name` — ciphertext never leaks here.
    pub kv_summary_expr: &'static str,
    /// Ids derived from `(table, name)`; false for transient rows.
    pub deterministic_ids: bool,
    /// Non-envelope columns.
    pub columns: &'static [ColumnSpec],
}

impl TableSpec {
    pub fn is_encrypted(&self) -> bool {
        !self.encrypted_fields.is_empty()
    }

    /// All columns the repository reads and writes: envelope + own.
    pub fn all_columns(&self) -> impl Iterator<Item = &'static ColumnSpec> {
        ENVELOPE.iter().chain(self.columns.iter())
    }

    pub fn column(&self, name: &str) -> Option<&'static ColumnSpec> {
        self.all_columns().find(|c| c.name == name)
    }
}

const TABLES: &[TableSpec] = &[
    TableSpec {
        table: "tenants",
        kv_synced: true,
        embedding_field: None,
        encrypted_fields: &[],
        kv_summary_expr: "coalesce(rec->>'name', '')",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("encryption_mode", ColumnKind::Text),
        ],
    },
    TableSpec {
        table: "users",
        kv_synced: true,
        embedding_field: None,
        encrypted_fields: &[
            ("email", FieldMode::Deterministic),
            ("content", FieldMode::Randomized),
        ],
        // Encrypted table: the key itself is the only safe summary.
        kv_summary_expr: "coalesce(rec->>'name', '')",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("email", ColumnKind::Text),
            col("content", ColumnKind::Text),
            col("devices", ColumnKind::Json),
        ],
    },
    TableSpec {
        table: "schemas",
        kv_synced: true,
        embedding_field: Some("description"),
        encrypted_fields: &[],
        kv_summary_expr: "coalesce(rec->>'description', '')",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("kind", ColumnKind::Text),
            col("description", ColumnKind::Text),
            col("json_schema", ColumnKind::Json),
        ],
    },
    TableSpec {
        table: "sessions",
        kv_synced: true,
        embedding_field: None,
        encrypted_fields: &[],
        kv_summary_expr: "coalesce(rec->>'name', '') || ' (' || coalesce(rec->>'mode', 'chat') || ')'",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("mode", ColumnKind::Text),
            col("agent_name", ColumnKind::Text),
            col("total_tokens", ColumnKind::Int),
        ],
    },
    TableSpec {
        table: "messages",
        kv_synced: false,
        embedding_field: None,
        encrypted_fields: &[("content", FieldMode::Randomized)],
        kv_summary_expr: "''",
        deterministic_ids: false,
        columns: &[
            col("session_id", ColumnKind::Uuid),
            col("message_type", ColumnKind::Text),
            col("content", ColumnKind::Text),
            col("tool_calls", ColumnKind::Json),
            col("token_count", ColumnKind::Int),
            col("model", ColumnKind::Text),
            col("agent_name", ColumnKind::Text),
        ],
    },
    TableSpec {
        table: "moments",
        kv_synced: true,
        embedding_field: Some("summary"),
        encrypted_fields: &[("summary", FieldMode::Randomized)],
        kv_summary_expr: "coalesce(rec->>'name', '') || ' [' || coalesce(rec->>'moment_type', '') || ']'",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("moment_type", ColumnKind::Text),
            col("summary", ColumnKind::Text),
            col("topic_tags", ColumnKind::TextArray),
            col("emotion_tags", ColumnKind::TextArray),
            col("starts_timestamp", ColumnKind::Timestamp),
            col("ends_timestamp", ColumnKind::Timestamp),
            col("source_session_id", ColumnKind::Uuid),
            col("previous_moment_keys", ColumnKind::TextArray),
        ],
    },
    TableSpec {
        table: "resources",
        kv_synced: true,
        embedding_field: Some("content"),
        encrypted_fields: &[],
        kv_summary_expr: "left(coalesce(rec->>'content', ''), 256)",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("uri", ColumnKind::Text),
            col("ordinal", ColumnKind::Int),
            col("content", ColumnKind::Text),
            col("category", ColumnKind::Text),
            col("comment", ColumnKind::Text),
            col("image_uri", ColumnKind::Text),
            col("rating", ColumnKind::Float),
        ],
    },
    TableSpec {
        table: "files",
        kv_synced: true,
        embedding_field: Some("parsed_content"),
        encrypted_fields: &[],
        kv_summary_expr: "coalesce(rec->>'name', '') || ' (' || coalesce(rec->>'mime_type', 'unknown') || ')'",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("mime_type", ColumnKind::Text),
            col("size_bytes", ColumnKind::Int),
            col("uri", ColumnKind::Text),
            col("parsed_content", ColumnKind::Text),
            col("parsed_output", ColumnKind::Json),
            col("thumbnail_uri", ColumnKind::Text),
            col("processing_status", ColumnKind::Text),
        ],
    },
    TableSpec {
        table: "ontologies",
        kv_synced: true,
        embedding_field: Some("content"),
        encrypted_fields: &[("content", FieldMode::Randomized)],
        kv_summary_expr: "coalesce(rec->>'name', '')",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("content", ColumnKind::Text),
        ],
    },
    TableSpec {
        table: "servers",
        kv_synced: true,
        embedding_field: None,
        encrypted_fields: &[],
        kv_summary_expr: "coalesce(rec->>'description', '')",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("description", ColumnKind::Text),
            col("server_type", ColumnKind::Text),
            col("base_url", ColumnKind::Text),
            col("auth", ColumnKind::Json),
        ],
    },
    TableSpec {
        table: "tools",
        kv_synced: true,
        embedding_field: None,
        encrypted_fields: &[],
        kv_summary_expr: "coalesce(rec->>'description', '')",
        deterministic_ids: true,
        columns: &[
            col("name", ColumnKind::Text),
            col("description", ColumnKind::Text),
            col("server_name", ColumnKind::Text),
            col("input_schema", ColumnKind::Json),
        ],
    },
    TableSpec {
        table: "feedback",
        kv_synced: false,
        embedding_field: None,
        encrypted_fields: &[],
        kv_summary_expr: "''",
        deterministic_ids: false,
        columns: &[
            col("session_id", ColumnKind::Uuid),
            col("message_id", ColumnKind::Uuid),
            col("rating", ColumnKind::Int),
            col("comment", ColumnKind::Text),
        ],
    },
    TableSpec {
        table: "storage_grants",
        kv_synced: false,
        embedding_field: None,
        encrypted_fields: &[],
        kv_summary_expr: "''",
        deterministic_ids: false,
        columns: &[
            col("name", ColumnKind::Text),
            col("provider", ColumnKind::Text),
            col("folder_uri", ColumnKind::Text),
            col("access_token_ref", ColumnKind::Text),
            col("status", ColumnKind::Text),
        ],
    },
];

/// All canonical tables, in dependency-safe seed order.
pub fn tables() -> &'static [TableSpec] {
    TABLES
}

pub fn spec_for(table: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|t| t.table == table)
}

/// Tables with an embedding field (valid targets for SEARCH and backfill).
pub fn embeddable_tables() -> impl Iterator<Item = &'static TableSpec> {
    TABLES.iter().filter(|t| t.embedding_field.is_some())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_is_unique_and_resolvable() {
        for spec in tables() {
            assert_eq!(spec_for(spec.table).unwrap().table, spec.table);
        }
        let mut names: Vec<_> = tables().iter().map(|t| t.table).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tables().len());
    }

    #[test]
    fn encrypted_tables_never_summarize_content() {
        // The kv summary for an encrypted table must not reference any
        // encrypted column, or ciphertext would leak into the index.
        for spec in tables().iter().filter(|t| t.is_encrypted() && t.kv_synced) {
            for (field, _) in spec.encrypted_fields {
                assert!(
                    !spec.kv_summary_expr.contains(field),
                    "{} summary expression references encrypted field {}",
                    spec.table,
                    field
                );
            }
        }
    }

    #[test]
    fn embeddable_tables_declare_a_real_column() {
        for spec in embeddable_tables() {
            let field = spec.embedding_field.unwrap();
            assert!(
                spec.column(field).is_some(),
                "{} embeds unknown column {}",
                spec.table,
                field
            );
        }
    }

    #[test]
    fn envelope_columns_are_present_via_all_columns() {
        let spec = spec_for("moments").unwrap();
        assert!(spec.column("id").is_some());
        assert!(spec.column("metadata").is_some());
        assert!(spec.column("moment_type").is_some());
        assert!(spec.column("no_such_column").is_none());
    }
}
