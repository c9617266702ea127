// Contact directory lookups

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::Identity;
use crate::storage::IdentityDirectory;
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

pub struct PgIdentityDirectory {
    pool: DbPool,
}

impl PgIdentityDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityDirectory for PgIdentityDirectory {
    #[instrument(skip(self))]
    async fn resolve_identity(&self, identity_id: &str) -> Result<Option<Identity>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, phone, email
            FROM identities
            WHERE id = $1
            "#,
        )
        .bind(identity_id)
        .fetch_optional(self.pool.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(Identity {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                phone: row.try_get("phone")?,
                email: row.try_get("email")?,
            })),
            None => {
                tracing::debug!(identity_id, "Identity not found");
                Ok(None)
            }
        }
    }
}
