//! Database repository for the key/value settings table.

use serde::{Serialize, de::DeserializeOwned};
use sqlx::{PgConnection, types::Json};
use tracing::{instrument, warn};

use crate::db::{
    errors::{DbError, Result},
    models::settings::{SHOP_SETTINGS_KEY, ShopSettings},
};

pub struct Settings<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Settings<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get<T: DeserializeOwned + Send + Unpin + 'static>(&mut self, key: &str) -> Result<Option<T>> {
        let value = sqlx::query_scalar::<_, Json<serde_json::Value>>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut *self.db)
            .await?;

        match value {
            None => Ok(None),
            Some(Json(v)) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| DbError::Other(anyhow::anyhow!("Stored setting '{key}' is malformed: {e}"))),
        }
    }

    #[instrument(skip(self, value), err)]
    pub async fn put<T: Serialize + Sync>(&mut self, key: &str, value: &T) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(Json(value))
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    /// Store `value` only if the key is unset. Returns true if this call stored it.
    #[instrument(skip(self, value), err)]
    pub async fn put_if_absent<T: Serialize + Sync>(&mut self, key: &str, value: &T) -> Result<bool> {
        let result = sqlx::query("INSERT INTO settings (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .bind(Json(value))
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Shop settings, falling back to defaults when unset or unreadable.
    #[instrument(skip(self), err)]
    pub async fn get_shop(&mut self) -> Result<ShopSettings> {
        match self.get::<ShopSettings>(SHOP_SETTINGS_KEY).await {
            Ok(settings) => Ok(settings.unwrap_or_default()),
            Err(DbError::Other(e)) => {
                warn!("Using default shop settings: {:#}", e);
                Ok(ShopSettings::default())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, settings), err)]
    pub async fn put_shop(&mut self, settings: &ShopSettings) -> Result<()> {
        self.put(SHOP_SETTINGS_KEY, settings).await
    }
}
