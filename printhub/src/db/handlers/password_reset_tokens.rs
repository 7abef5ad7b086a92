//! Database repository for password reset tokens.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    auth::password::{self, Argon2Params},
    db::{
        errors::{DbError, Result},
        models::password_reset_tokens::PasswordResetTokenDBResponse,
    },
    types::{UserId, abbrev_uuid},
};

const TOKEN_COLUMNS: &str = "id, user_id, token_hash, expires_at, used_at, created_at";

pub struct PasswordResetTokens<'c> {
    db: &'c mut PgConnection,
}

impl<'c> PasswordResetTokens<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Issue a new token. Returns the raw token (to be emailed) along with the stored row.
    #[instrument(skip(self, params), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn create_for_user(
        &mut self,
        user_id: UserId,
        expires_at: DateTime<Utc>,
        params: Argon2Params,
    ) -> Result<(String, PasswordResetTokenDBResponse)> {
        let raw_token = password::generate_reset_token();
        let hash_input = raw_token.clone();
        let token_hash = tokio::task::spawn_blocking(move || password::hash_string_with_params(&hash_input, Some(params)))
            .await
            .map_err(|e| DbError::Other(anyhow::anyhow!("hashing task failed: {e}")))?
            .map_err(|e| DbError::Other(anyhow::anyhow!(e.to_string())))?;

        let token = sqlx::query_as::<_, PasswordResetTokenDBResponse>(&format!(
            r#"
            INSERT INTO password_reset_tokens (id, user_id, token_hash, expires_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok((raw_token, token))
    }

    /// The token if it exists, is unused, unexpired, and matches `raw_token`.
    #[instrument(skip(self, raw_token), err)]
    pub async fn find_valid(&mut self, token_id: Uuid, raw_token: &str) -> Result<Option<PasswordResetTokenDBResponse>> {
        let token = sqlx::query_as::<_, PasswordResetTokenDBResponse>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM password_reset_tokens WHERE id = $1"
        ))
        .bind(token_id)
        .fetch_optional(&mut *self.db)
        .await?;

        let Some(token) = token.filter(|t| t.is_usable(Utc::now())) else {
            return Ok(None);
        };

        let raw = raw_token.to_string();
        let hash = token.token_hash.clone();
        let matches = tokio::task::spawn_blocking(move || password::verify_string(&raw, &hash))
            .await
            .map_err(|e| DbError::Other(anyhow::anyhow!("verification task failed: {e}")))?;

        match matches {
            Ok(true) => Ok(Some(token)),
            Ok(false) => Ok(None),
            Err(e) => {
                warn!(token_id = %abbrev_uuid(&token_id), "Reset token verification error: {}", e);
                Ok(None)
            }
        }
    }

    /// Mark every outstanding token of the user as used. Returns how many were invalidated.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn invalidate_for_user(&mut self, user_id: UserId) -> Result<u64> {
        let result = sqlx::query("UPDATE password_reset_tokens SET used_at = NOW() WHERE user_id = $1 AND used_at IS NULL")
            .bind(user_id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::test_utils::{create_test_user, fast_argon2_params};
    use chrono::Duration;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_token_is_single_use(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut tokens = PasswordResetTokens::new(&mut conn);

        let (raw, token) = tokens
            .create_for_user(user.id, Utc::now() + Duration::minutes(30), fast_argon2_params())
            .await
            .unwrap();
        assert_ne!(raw, token.token_hash);

        assert!(tokens.find_valid(token.id, "not-the-token").await.unwrap().is_none());
        assert!(tokens.find_valid(token.id, &raw).await.unwrap().is_some());

        assert_eq!(tokens.invalidate_for_user(user.id).await.unwrap(), 1);
        assert!(tokens.find_valid(token.id, &raw).await.unwrap().is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_expired_token_is_rejected(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut tokens = PasswordResetTokens::new(&mut conn);

        let (raw, token) = tokens
            .create_for_user(user.id, Utc::now() - Duration::minutes(1), fast_argon2_params())
            .await
            .unwrap();
        assert!(tokens.find_valid(token.id, &raw).await.unwrap().is_none());
    }
}
