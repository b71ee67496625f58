//! Pluggable KMS backends for per-tenant data-key wrap/unwrap.
//!
//! Two backends share one contract and one `tenant_keys` table:
//!
//! - [`LocalFileKms`] — a 32-byte master key in a local file. Development.
//! - [`VaultTransitKms`] — HashiCorp Vault transit engine over HTTPS. The raw
//!   key material never leaves Vault; wrap/unwrap are remote calls.
//!
//! Sealed mode stores the tenant's RSA public key (PEM) in the same
//! `wrapped_dek` column, tagged with `mode = 'sealed'`.

mod local;
mod vault;

pub use local::LocalFileKms;
pub use vault::VaultTransitKms;

use async_trait::async_trait;

/// Cleartext data-encryption key (256-bit for AES-256-GCM).
pub type Dek = Vec<u8>;

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("kms backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("key material error: {0}")]
    KeyMaterial(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KmsError>;

/// Contract shared by all KMS backends. Only the wire details differ.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Wrap `dek` and upsert the `tenant_keys` row for this tenant.
    async fn wrap_and_store_dek(&self, tenant_id: &str, dek: &[u8], mode: &str) -> Result<()>;

    /// Return the cleartext DEK, or `None` when no active row exists.
    async fn unwrap_dek(&self, tenant_id: &str) -> Result<Option<Dek>>;

    async fn is_disabled(&self, tenant_id: &str) -> Result<bool>;

    /// Upsert a marker row with `status = 'disabled'`.
    async fn set_disabled(&self, tenant_id: &str) -> Result<()>;

    /// Delete the row so resolution falls back to the system tenant.
    async fn remove_key(&self, tenant_id: &str) -> Result<()>;

    async fn get_mode(&self, tenant_id: &str) -> Result<Option<String>>;

    async fn set_mode(&self, tenant_id: &str, mode: &str) -> Result<()>;

    async fn store_sealed_key(
        &self,
        tenant_id: &str,
        public_key_pem: &[u8],
        origin: &str,
    ) -> Result<()>;

    async fn get_sealed_public_key(&self, tenant_id: &str) -> Result<Option<Vec<u8>>>;
}

// ── SQL shared by both backends (sealed keys live in the same table) ──────────

pub(crate) const SEALED_UPSERT: &str = "INSERT INTO tenant_keys \
     (tenant_id, wrapped_dek, kms_key_id, algorithm, status, mode) \
     VALUES ($1, $2, $3, 'RSA-OAEP-SHA256', 'active', 'sealed') \
     ON CONFLICT (tenant_id) \
     DO UPDATE SET wrapped_dek = $2, kms_key_id = $3, algorithm = 'RSA-OAEP-SHA256', \
                   status = 'active', mode = 'sealed', rotated_at = CURRENT_TIMESTAMP";

pub(crate) const SEALED_SELECT: &str = "SELECT wrapped_dek FROM tenant_keys \
     WHERE tenant_id = $1 AND mode = 'sealed' AND status = 'active'";

pub(crate) const DISABLED_UPSERT: &str = "INSERT INTO tenant_keys \
     (tenant_id, wrapped_dek, kms_key_id, algorithm, status) \
     VALUES ($1, ''::bytea, 'none', 'none', 'disabled') \
     ON CONFLICT (tenant_id) \
     DO UPDATE SET status = 'disabled', rotated_at = CURRENT_TIMESTAMP";

pub(crate) async fn sql_is_disabled(pool: &sqlx::PgPool, tenant_id: &str) -> Result<bool> {
    use sqlx::Row;
    let row = sqlx::query("SELECT status FROM tenant_keys WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    Ok(row
        .map(|r| r.get::<String, _>("status") == "disabled")
        .unwrap_or(false))
}

pub(crate) async fn sql_get_mode(pool: &sqlx::PgPool, tenant_id: &str) -> Result<Option<String>> {
    use sqlx::Row;
    let row =
        sqlx::query("SELECT mode FROM tenant_keys WHERE tenant_id = $1 AND status = 'active'")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| r.get("mode")))
}

pub(crate) async fn sql_set_mode(pool: &sqlx::PgPool, tenant_id: &str, mode: &str) -> Result<()> {
    sqlx::query("UPDATE tenant_keys SET mode = $1 WHERE tenant_id = $2")
        .bind(mode)
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn sql_remove_key(pool: &sqlx::PgPool, tenant_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM tenant_keys WHERE tenant_id = $1")
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn sql_store_sealed_key(
    pool: &sqlx::PgPool,
    tenant_id: &str,
    public_key_pem: &[u8],
    key_id: &str,
) -> Result<()> {
    sqlx::query(SEALED_UPSERT)
        .bind(tenant_id)
        .bind(public_key_pem)
        .bind(key_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub(crate) async fn sql_get_sealed_public_key(
    pool: &sqlx::PgPool,
    tenant_id: &str,
) -> Result<Option<Vec<u8>>> {
    use sqlx::Row;
    let row = sqlx::query(SEALED_SELECT)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<Vec<u8>, _>("wrapped_dek")))
}
