//! Record trait for model-level persistence.
//!
//! Job rows are immortal (terminal rows are kept for auditing) and every
//! status mutation goes through the store's CAS, so the model-level seam
//! is deliberately small: lookup and insert.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for database records owned by a model type.
#[async_trait]
pub trait Record: Sized + Send + Sync {
    /// The table name for this record type.
    const TABLE: &'static str;

    /// The ID type for this record.
    type Id;

    /// Find a record by its ID.
    async fn find_by_id(id: Self::Id, db: &sqlx::PgPool) -> Result<Option<Self>>;

    /// Insert a new record.
    async fn insert(&self, db: &sqlx::PgPool) -> Result<Self>;
}
