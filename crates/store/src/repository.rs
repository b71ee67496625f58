//! Registry-driven repository: COALESCE upsert, scoped get, soft delete.
//!
//! Works on JSON maps so one implementation covers every canonical table.
//! The column list and value types come from the [`TableSpec`]; encryption is
//! threaded through on both paths via the tenant's resolved mode.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::debug;
use uuid::Uuid;

use p8_crypto::EncryptionService;

use crate::ids::deterministic_id;
use crate::pool::Db;
use crate::registry::{ColumnKind, TableSpec};
use crate::{Result, StoreError};

pub struct Repository {
    db: Db,
    spec: &'static TableSpec,
    encryption: Arc<EncryptionService>,
}

impl Repository {
    pub fn new(db: Db, spec: &'static TableSpec, encryption: Arc<EncryptionService>) -> Self {
        Self { db, spec, encryption }
    }

    pub fn for_table(
        db: Db,
        table: &str,
        encryption: Arc<EncryptionService>,
    ) -> Result<Self> {
        let spec = crate::registry::spec_for(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(Self::new(db, spec, encryption))
    }

    pub fn spec(&self) -> &'static TableSpec {
        self.spec
    }

    // ── Upsert ────────────────────────────────────────────────────────────────

    /// Insert-or-update one row. Fields absent (or null) in `data` keep their
    /// stored values on conflict, so a partial second upsert never erases
    /// columns the first one set. Returns the stored row as a map, with
    /// encrypted fields in their at-rest form.
    pub async fn upsert(&self, mut data: Map<String, Value>) -> Result<Map<String, Value>> {
        self.assign_id(&mut data);

        let tenant_id = data
            .get("tenant_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.encryption
            .encrypt_fields(self.spec.encrypted_fields, &mut data, tenant_id.as_deref())
            .await?;

        // Only bind columns the caller provided; the rest keep DDL defaults
        // on insert and stored values on update.
        let columns: Vec<&'static crate::registry::ColumnSpec> = self
            .spec
            .all_columns()
            .filter(|c| data.contains_key(c.name))
            .collect();
        if columns.is_empty() {
            return Err(StoreError::Invalid(format!(
                "upsert into {} with no known columns",
                self.spec.table
            )));
        }

        let col_names: Vec<&str> = columns.iter().map(|c| c.name).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let mut updates: Vec<String> = col_names
            .iter()
            .filter(|name| **name != "id")
            .map(|name| format!("{name} = COALESCE(EXCLUDED.{name}, {}.{name})", self.spec.table))
            .collect();
        updates.push("updated_at = CURRENT_TIMESTAMP".to_string());

        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({vals}) \
             ON CONFLICT (id) DO UPDATE SET {updates} \
             RETURNING *",
            table = self.spec.table,
            cols = col_names.join(", "),
            vals = placeholders.join(", "),
            updates = updates.join(", "),
        );

        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, column.kind, data.get(column.name));
        }

        let row = query.fetch_one(self.db.pool()).await?;
        debug!(table = self.spec.table, "row upserted");
        Ok(self.row_to_map(&row))
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Fetch a non-deleted row by id. Decrypts per the tenant's read
    /// contract: platform mode yields plaintext, client/sealed yield the
    /// stored ciphertext.
    pub async fn get(&self, id: Uuid) -> Result<Option<Map<String, Value>>> {
        let sql = format!(
            "SELECT * FROM {} WHERE id = $1 AND deleted_at IS NULL",
            self.spec.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };

        let mut data = self.row_to_map(&row);
        let tenant_id = data
            .get("tenant_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if self
            .encryption
            .should_decrypt_on_read(tenant_id.as_deref())
            .await?
        {
            self.encryption
                .decrypt_fields(self.spec.encrypted_fields, &mut data, tenant_id.as_deref())
                .await?;
        }
        Ok(Some(data))
    }

    /// Fetch by natural name (deterministic-id tables only).
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Map<String, Value>>> {
        if !self.spec.deterministic_ids {
            return Err(StoreError::Invalid(format!(
                "{} rows are not addressable by name",
                self.spec.table
            )));
        }
        self.get(deterministic_id(self.spec.table, name)).await
    }

    /// Soft-delete: sets `deleted_at`, which also removes the kv_store row
    /// via the sync trigger.
    pub async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET deleted_at = CURRENT_TIMESTAMP \
             WHERE id = $1 AND deleted_at IS NULL",
            self.spec.table
        );
        let result = sqlx::query(&sql).bind(id).execute(self.db.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn assign_id(&self, data: &mut Map<String, Value>) {
        let has_id = data
            .get("id")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if has_id {
            return;
        }

        let id = if self.spec.deterministic_ids {
            let name = data.get("name").and_then(Value::as_str).unwrap_or_default();
            if name.is_empty() {
                Uuid::new_v4()
            } else {
                deterministic_id(self.spec.table, name)
            }
        } else {
            Uuid::new_v4()
        };
        data.insert("id".to_string(), Value::String(id.to_string()));
    }

    pub(crate) fn row_to_map(&self, row: &PgRow) -> Map<String, Value> {
        let mut map = Map::new();
        for column in self.spec.all_columns() {
            map.insert(column.name.to_string(), read_column(row, column.name, column.kind));
        }
        for ts in ["created_at", "updated_at", "deleted_at"] {
            map.insert(ts.to_string(), read_column(row, ts, ColumnKind::Timestamp));
        }
        map
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    kind: ColumnKind,
    value: Option<&Value>,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let value = value.cloned().unwrap_or(Value::Null);
    match kind {
        ColumnKind::Uuid => {
            let parsed = value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok());
            query.bind(parsed)
        }
        ColumnKind::Text => query.bind(value.as_str().map(str::to_string)),
        ColumnKind::TextArray => {
            let items: Option<Vec<String>> = value.as_array().map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });
            query.bind(items)
        }
        ColumnKind::Json => {
            if value.is_null() {
                query.bind(None::<Value>)
            } else {
                query.bind(Some(value))
            }
        }
        ColumnKind::Timestamp => {
            let parsed = value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            query.bind(parsed)
        }
        ColumnKind::Int => query.bind(value.as_i64()),
        ColumnKind::Float => query.bind(value.as_f64()),
        ColumnKind::Bool => query.bind(value.as_bool()),
    }
}

fn read_column(row: &PgRow, name: &str, kind: ColumnKind) -> Value {
    match kind {
        ColumnKind::Uuid => row
            .try_get::<Option<Uuid>, _>(name)
            .ok()
            .flatten()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        ColumnKind::Text => row
            .try_get::<Option<String>, _>(name)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnKind::TextArray => row
            .try_get::<Option<Vec<String>>, _>(name)
            .ok()
            .flatten()
            .map(|items| Value::Array(items.into_iter().map(Value::String).collect()))
            .unwrap_or(Value::Null),
        ColumnKind::Json => row
            .try_get::<Option<Value>, _>(name)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        ColumnKind::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(name)
            .ok()
            .flatten()
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        ColumnKind::Int => row
            .try_get::<Option<i64>, _>(name)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        ColumnKind::Float => row
            .try_get::<Option<f64>, _>(name)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        ColumnKind::Bool => row
            .try_get::<Option<bool>, _>(name)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
    }
}
