use crate::types::{UserId, abbrev_uuid};
use crate::db::{
    errors::{DbError, Result},
    models::credits::{CreditTransactionCreateDBRequest, CreditTransactionDBResponse},
};
use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection};
use tracing::instrument;
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "id, user_id, transaction_type, amount, balance_after, source_id, description, created_at";

/// Filter for listing credit transactions
#[derive(Debug, Clone)]
pub struct CreditTransactionFilter {
    pub user_id: Option<UserId>,
    pub skip: i64,
    pub limit: i64,
}

impl CreditTransactionFilter {
    pub fn new(user_id: Option<UserId>, skip: i64, limit: i64) -> Self {
        Self { user_id, skip, limit }
    }
}

pub struct Credits<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Credits<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Current balance. Users without a balance row have zero.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn get_balance(&mut self, user_id: UserId) -> Result<Decimal> {
        let balance = sqlx::query_scalar::<_, Decimal>("SELECT balance FROM credits WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    /// Append a ledger entry and move the balance.
    ///
    /// The balance row is locked for the duration. Debits larger than the balance fail with
    /// [`DbError::InsufficientBalance`]; a reused `source_id` fails with a unique violation of
    /// `credits_transactions_source_id_unique`.
    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), kind = ?request.transaction_type, source = %request.source_id), err)]
    pub async fn create_transaction(&mut self, request: &CreditTransactionCreateDBRequest) -> Result<CreditTransactionDBResponse> {
        if request.amount <= Decimal::ZERO {
            return Err(DbError::Other(anyhow::anyhow!(
                "Credit transaction amount must be positive, got {}",
                request.amount
            )));
        }

        let mut tx = self.db.begin().await?;

        sqlx::query("INSERT INTO credits (user_id, balance) VALUES ($1, 0) ON CONFLICT (user_id) DO NOTHING")
            .bind(request.user_id)
            .execute(&mut *tx)
            .await?;

        let balance = sqlx::query_scalar::<_, Decimal>("SELECT balance FROM credits WHERE user_id = $1 FOR UPDATE")
            .bind(request.user_id)
            .fetch_one(&mut *tx)
            .await?;

        let balance_after = if request.transaction_type.is_debit() {
            if balance < request.amount {
                return Err(DbError::InsufficientBalance {
                    balance,
                    requested: request.amount,
                });
            }
            balance - request.amount
        } else {
            balance + request.amount
        };

        let transaction = sqlx::query_as::<_, CreditTransactionDBResponse>(&format!(
            r#"
            INSERT INTO credits_transactions (id, user_id, transaction_type, amount, balance_after, source_id, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(request.transaction_type)
        .bind(request.amount)
        .bind(balance_after)
        .bind(&request.source_id)
        .bind(&request.description)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE credits SET balance = $2, updated_at = NOW() WHERE user_id = $1")
            .bind(request.user_id)
            .bind(balance_after)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(transaction)
    }

    /// True if a ledger entry with this source already exists
    #[instrument(skip(self), err)]
    pub async fn source_exists(&mut self, source_id: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM credits_transactions WHERE source_id = $1)")
            .bind(source_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(exists)
    }

    /// Newest first. Without a user filter this is the admin view across all users.
    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list_transactions(&mut self, filter: &CreditTransactionFilter) -> Result<Vec<CreditTransactionDBResponse>> {
        let transactions = sqlx::query_as::<_, CreditTransactionDBResponse>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credits_transactions
            WHERE ($1::uuid IS NULL OR user_id = $1)
            ORDER BY created_at DESC, id DESC
            OFFSET $2
            LIMIT $3
            "#
        ))
        .bind(filter.user_id)
        .bind(filter.skip)
        .bind(filter.limit)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(transactions)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count_transactions(&mut self, filter: &CreditTransactionFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM credits_transactions WHERE ($1::uuid IS NULL OR user_id = $1)")
            .bind(filter.user_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::db::models::credits::CreditTransactionType;
    use crate::test_utils::create_test_user;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_balance_follows_ledger(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut credits = Credits::new(&mut conn);

        assert_eq!(credits.get_balance(user.id).await.unwrap(), Decimal::ZERO);

        let payment_id = Uuid::new_v4();
        let tx = credits
            .create_transaction(&CreditTransactionCreateDBRequest::top_up(user.id, payment_id, Decimal::new(100, 0)))
            .await
            .unwrap();
        assert_eq!(tx.balance_after, Decimal::new(100, 0));

        let order_id = Uuid::new_v4();
        let tx = credits
            .create_transaction(&CreditTransactionCreateDBRequest::order_payment(
                user.id,
                order_id,
                1,
                Decimal::new(4299, 2),
            ))
            .await
            .unwrap();
        assert_eq!(tx.balance_after, Decimal::new(5701, 2));
        assert_eq!(credits.get_balance(user.id).await.unwrap(), Decimal::new(5701, 2));

        let filter = CreditTransactionFilter::new(Some(user.id), 0, 10);
        let listed = credits.list_transactions(&filter).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].transaction_type, CreditTransactionType::OrderPayment);
        assert_eq!(credits.count_transactions(&filter).await.unwrap(), 2);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_debit_beyond_balance_is_rejected(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut credits = Credits::new(&mut conn);

        let err = credits
            .create_transaction(&CreditTransactionCreateDBRequest::order_payment(
                user.id,
                Uuid::new_v4(),
                1,
                Decimal::new(10, 0),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InsufficientBalance { .. }));
        assert_eq!(credits.get_balance(user.id).await.unwrap(), Decimal::ZERO);
        assert!(credits.list_transactions(&CreditTransactionFilter::new(Some(user.id), 0, 10)).await.unwrap().is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_same_source_applies_once(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut credits = Credits::new(&mut conn);

        let request = CreditTransactionCreateDBRequest::top_up(user.id, Uuid::new_v4(), Decimal::new(25, 0));
        credits.create_transaction(&request).await.unwrap();
        let err = credits.create_transaction(&request).await.unwrap_err();
        assert!(err.is_unique_violation_of("credits_transactions_source_id_unique"));
        assert!(credits.source_exists(&request.source_id).await.unwrap());
        assert_eq!(credits.get_balance(user.id).await.unwrap(), Decimal::new(25, 0));
    }
}
