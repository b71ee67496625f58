//! Durable state: the connection pool, canonical entities, the table
//! registry, the trigger-maintained KV index, and the REM query dialect.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  p8-store                                                     │
//! │                                                               │
//! │  Db (sqlx pool + embedded migrations)                         │
//! │    ├── registry   (TableSpec: kv expr, embed field, crypto)   │
//! │    ├── repository (registry-driven COALESCE upsert/get)       │
//! │    ├── rem        (dialect SQL function wrappers)             │
//! │    ├── dialect    (LOOKUP/SEARCH/FUZZY/TRAVERSE/SQL parser)   │
//! │    ├── engine     (parser → dispatch, SEARCH auto-embed)      │
//! │    └── usage      (plan limits, quota check, increment)       │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod dialect;
pub mod engine;
pub mod entity;
pub mod graph;
pub mod ids;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod rem;
pub mod usage;

pub use dialect::{DialectError, RemQuery, parse_query};
pub use engine::{QueryEmbedder, RemQueryEngine};
pub use entity::{GraphEdge, Message, Moment, Schema, Session};
pub use graph::merge_graph_edges;
pub use ids::{deterministic_id, estimate_tokens, normalize_key, short_id};
pub use pool::Db;
pub use registry::{ColumnKind, ColumnSpec, TableSpec, spec_for, tables};
pub use repository::Repository;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error(transparent)]
    Dialect(#[from] DialectError),
    #[error(transparent)]
    Crypto(#[from] p8_crypto::CryptoError),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
