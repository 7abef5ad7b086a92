//! Database repository for payments.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::{DbError, Result},
        models::payments::{PaymentCreateDBRequest, PaymentDBResponse, PaymentStatus},
    },
    types::{OrderId, PaymentId, abbrev_uuid},
};

const PAYMENT_COLUMNS: &str = "id, user_id, order_id, purpose, method, provider, provider_order_id, amount, currency, \
                               status, redirect_url, created_at, updated_at, completed_at";

pub struct Payments<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Payments<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(payment_id = %abbrev_uuid(&request.id)), err)]
    pub async fn create(&mut self, request: &PaymentCreateDBRequest) -> Result<PaymentDBResponse> {
        let payment = sqlx::query_as::<_, PaymentDBResponse>(&format!(
            r#"
            INSERT INTO payments (id, user_id, order_id, purpose, method, provider, amount, currency, status, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, CASE WHEN $9 = 'completed' THEN NOW() END)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.order_id)
        .bind(request.purpose)
        .bind(request.method)
        .bind(&request.provider)
        .bind(request.amount)
        .bind(&request.currency)
        .bind(request.status)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: PaymentId) -> Result<Option<PaymentDBResponse>> {
        let payment = sqlx::query_as::<_, PaymentDBResponse>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(payment)
    }

    #[instrument(skip(self), fields(payment_id = %abbrev_uuid(&id)), err)]
    pub async fn get_for_update(&mut self, id: PaymentId) -> Result<Option<PaymentDBResponse>> {
        let payment =
            sqlx::query_as::<_, PaymentDBResponse>(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"))
                .bind(id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(payment)
    }

    #[instrument(skip(self), err)]
    pub async fn find_by_provider_order(&mut self, provider: &str, provider_order_id: &str) -> Result<Option<PaymentDBResponse>> {
        let payment = sqlx::query_as::<_, PaymentDBResponse>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider = $1 AND provider_order_id = $2"
        ))
        .bind(provider)
        .bind(provider_order_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(payment)
    }

    /// Record the provider's order id and redirect link after the payment was opened.
    #[instrument(skip(self, redirect_url), fields(payment_id = %abbrev_uuid(&id)), err)]
    pub async fn attach_provider_order(
        &mut self,
        id: PaymentId,
        provider_order_id: &str,
        redirect_url: Option<&str>,
    ) -> Result<PaymentDBResponse> {
        sqlx::query_as::<_, PaymentDBResponse>(&format!(
            r#"
            UPDATE payments SET provider_order_id = $2, redirect_url = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(provider_order_id)
        .bind(redirect_url)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(payment_id = %abbrev_uuid(&id)), err)]
    pub async fn set_status(&mut self, id: PaymentId, status: PaymentStatus) -> Result<PaymentDBResponse> {
        sqlx::query_as::<_, PaymentDBResponse>(&format!(
            r#"
            UPDATE payments SET
                status = $2,
                completed_at = CASE WHEN $2 = 'completed' THEN COALESCE(completed_at, NOW()) ELSE completed_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&order_id)), err)]
    pub async fn list_for_order(&mut self, order_id: OrderId) -> Result<Vec<PaymentDBResponse>> {
        let payments = sqlx::query_as::<_, PaymentDBResponse>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 ORDER BY created_at DESC"
        ))
        .bind(order_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(payments)
    }

    /// The payment that settled the order, if any
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&order_id)), err)]
    pub async fn completed_for_order(&mut self, order_id: OrderId) -> Result<Option<PaymentDBResponse>> {
        let payment = sqlx::query_as::<_, PaymentDBResponse>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 AND status = 'completed' ORDER BY completed_at DESC LIMIT 1"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(payment)
    }

    /// Open provider payments created before `older_than`, oldest first.
    #[instrument(skip(self), err)]
    pub async fn list_open_before(&mut self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<PaymentDBResponse>> {
        let payments = sqlx::query_as::<_, PaymentDBResponse>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE status IN ('pending', 'waiting_for_confirmation')
              AND method <> 'credits'
              AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::payments::{PaymentMethod, PaymentPurpose};
    use crate::test_utils::create_test_user;
    use rust_decimal::Decimal;
    use sqlx::PgPool;
    use uuid::Uuid;

    fn top_up(user_id: uuid::Uuid, status: PaymentStatus) -> PaymentCreateDBRequest {
        PaymentCreateDBRequest {
            id: Uuid::new_v4(),
            user_id: Some(user_id),
            order_id: None,
            purpose: PaymentPurpose::Credits,
            method: PaymentMethod::Blik,
            provider: "payu".to_string(),
            amount: Decimal::new(50, 0),
            currency: "PLN".to_string(),
            status,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_provider_order_lookup_and_status(pool: PgPool) {
        let user = create_test_user(&pool, crate::api::models::users::Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Payments::new(&mut conn);

        let payment = repo.create(&top_up(user.id, PaymentStatus::Pending)).await.unwrap();
        assert!(payment.completed_at.is_none());

        repo.attach_provider_order(payment.id, "P1", Some("https://pay.example/P1"))
            .await
            .unwrap();
        let found = repo.find_by_provider_order("payu", "P1").await.unwrap().unwrap();
        assert_eq!(found.id, payment.id);
        assert_eq!(found.redirect_url.as_deref(), Some("https://pay.example/P1"));

        let completed = repo.set_status(payment.id, PaymentStatus::Completed).await.unwrap();
        assert!(completed.completed_at.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_open_before(pool: PgPool) {
        let user = create_test_user(&pool, crate::api::models::users::Role::Customer).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Payments::new(&mut conn);

        let open = repo.create(&top_up(user.id, PaymentStatus::Pending)).await.unwrap();
        repo.create(&top_up(user.id, PaymentStatus::Completed)).await.unwrap();

        let stale = repo.list_open_before(Utc::now() + chrono::Duration::seconds(5), 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, open.id);

        let none = repo.list_open_before(Utc::now() - chrono::Duration::hours(1), 10).await.unwrap();
        assert!(none.is_empty());
    }
}
