//! Database repository for orders.

use rust_decimal::Decimal;
use sqlx::{PgConnection, types::Json};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result},
        models::orders::{OrderCreateDBRequest, OrderDBResponse, OrderFilter, OrderPaymentStatus, OrderStatus, OrderUpdateDBRequest},
    },
    types::{OrderId, abbrev_uuid},
};

const ORDER_COLUMNS: &str = "id, number, user_id, customer_name, customer_email, customer_phone, material_id, printer_id, \
                             color, infill_percent, quantity, file_ids, volume_cm3, weight_g, print_hours, subtotal, \
                             shipping_cost, total, currency, shipping_method, shipping_address, tracking_number, status, \
                             payment_status, notes, admin_notes, created_at, updated_at";

pub struct Orders<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Orders<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(customer = %request.customer_email), err)]
    pub async fn create(&mut self, request: &OrderCreateDBRequest) -> Result<OrderDBResponse> {
        let order = sqlx::query_as::<_, OrderDBResponse>(&format!(
            r#"
            INSERT INTO orders (id, user_id, customer_name, customer_email, customer_phone, material_id, printer_id,
                                color, infill_percent, quantity, file_ids, volume_cm3, weight_g, print_hours,
                                subtotal, shipping_cost, total, currency, shipping_method, shipping_address, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(request.user_id)
        .bind(&request.customer_name)
        .bind(request.customer_email.trim().to_lowercase())
        .bind(&request.customer_phone)
        .bind(request.material_id)
        .bind(request.printer_id)
        .bind(&request.color)
        .bind(request.infill_percent)
        .bind(request.quantity)
        .bind(&request.file_ids)
        .bind(request.volume_cm3)
        .bind(request.weight_g)
        .bind(request.print_hours)
        .bind(request.subtotal)
        .bind(request.shipping_cost)
        .bind(request.total)
        .bind(&request.currency)
        .bind(request.shipping_method)
        .bind(request.shipping_address.as_ref().map(Json))
        .bind(&request.notes)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(order)
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: OrderId) -> Result<Option<OrderDBResponse>> {
        let order = sqlx::query_as::<_, OrderDBResponse>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(order)
    }

    /// Lock the order row for the rest of the surrounding transaction.
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn get_for_update(&mut self, id: OrderId) -> Result<Option<OrderDBResponse>> {
        let order = sqlx::query_as::<_, OrderDBResponse>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(order)
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list(&mut self, filter: &OrderFilter) -> Result<Vec<OrderDBResponse>> {
        let orders = sqlx::query_as::<_, OrderDBResponse>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.user_id)
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(orders)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &OrderFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.status)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self, request), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn update(&mut self, id: OrderId, request: &OrderUpdateDBRequest) -> Result<OrderDBResponse> {
        sqlx::query_as::<_, OrderDBResponse>(&format!(
            r#"
            UPDATE orders SET
                status = COALESCE($2, status),
                payment_status = COALESCE($3, payment_status),
                printer_id = COALESCE($4, printer_id),
                tracking_number = COALESCE($5, tracking_number),
                admin_notes = COALESCE($6, admin_notes),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.status)
        .bind(request.payment_status)
        .bind(request.printer_id)
        .bind(&request.tracking_number)
        .bind(&request.admin_notes)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn set_payment_status(&mut self, id: OrderId, payment_status: OrderPaymentStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET payment_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(payment_status)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Mark an unpaid order as paid. Returns false if the order had already moved on.
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_paid(&mut self, id: OrderId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = 'paid', payment_status = 'paid', updated_at = NOW()
            WHERE id = $1 AND status = 'pending_payment'
            "#,
        )
        .bind(id)
        .execute(&mut *self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Order counts per status
    #[instrument(skip(self), err)]
    pub async fn status_counts(&mut self) -> Result<Vec<(OrderStatus, i64)>> {
        let rows = sqlx::query_as::<_, (OrderStatus, i64)>("SELECT status, COUNT(*) FROM orders GROUP BY status ORDER BY status")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows)
    }

    /// Sum of paid order totals, optionally limited to the last `days` days
    #[instrument(skip(self), err)]
    pub async fn revenue(&mut self, days: Option<i32>) -> Result<Decimal> {
        let total = sqlx::query_scalar::<_, Option<Decimal>>(
            r#"
            SELECT SUM(total) FROM orders
            WHERE payment_status = 'paid'
              AND ($1::int IS NULL OR created_at >= NOW() - make_interval(days => $1))
            "#,
        )
        .bind(days)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::orders::{ShippingAddress, ShippingMethod};
    use crate::test_utils::{create_test_material, create_test_upload};
    use sqlx::PgPool;

    async fn order_request(pool: &PgPool) -> OrderCreateDBRequest {
        let material = create_test_material(pool).await;
        let file = create_test_upload(pool, None).await;
        OrderCreateDBRequest {
            user_id: None,
            customer_name: "Jan Kowalski".to_string(),
            customer_email: "Jan@Example.com".to_string(),
            customer_phone: None,
            material_id: material.id,
            printer_id: None,
            color: Some("black".to_string()),
            infill_percent: 20,
            quantity: 2,
            file_ids: vec![file.id],
            volume_cm3: Decimal::new(125, 1),
            weight_g: Decimal::new(1550, 2),
            print_hours: Decimal::new(125, 2),
            subtotal: Decimal::new(3000, 2),
            shipping_cost: Decimal::new(1299, 2),
            total: Decimal::new(4299, 2),
            currency: "PLN".to_string(),
            shipping_method: ShippingMethod::InpostLocker,
            shipping_address: Some(ShippingAddress {
                recipient: "Jan Kowalski".to_string(),
                phone: "+48500100200".to_string(),
                street: None,
                city: None,
                postal_code: None,
                country: "PL".to_string(),
                locker_id: Some("KRA01M".to_string()),
            }),
            notes: None,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_assigns_number_and_defaults(pool: PgPool) {
        let request = order_request(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Orders::new(&mut conn);

        let first = repo.create(&request).await.unwrap();
        let second = repo.create(&request).await.unwrap();
        assert!(second.number > first.number);
        assert_eq!(first.status, OrderStatus::PendingPayment);
        assert_eq!(first.payment_status, OrderPaymentStatus::Unpaid);
        assert_eq!(first.customer_email, "jan@example.com");
        assert_eq!(
            first.shipping_address.as_ref().and_then(|a| a.locker_id.clone()).as_deref(),
            Some("KRA01M")
        );
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_mark_paid_only_once(pool: PgPool) {
        let request = order_request(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Orders::new(&mut conn);

        let order = repo.create(&request).await.unwrap();
        assert!(repo.mark_paid(order.id).await.unwrap());
        assert!(!repo.mark_paid(order.id).await.unwrap());

        let order = repo.get_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
        assert_eq!(repo.revenue(Some(30)).await.unwrap(), Decimal::new(4299, 2));
        assert_eq!(repo.revenue(None).await.unwrap(), Decimal::new(4299, 2));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_filters_by_status(pool: PgPool) {
        let request = order_request(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Orders::new(&mut conn);

        let a = repo.create(&request).await.unwrap();
        repo.create(&request).await.unwrap();
        repo.update(
            a.id,
            &OrderUpdateDBRequest {
                status: Some(OrderStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let filter = OrderFilter {
            status: Some(OrderStatus::Cancelled),
            limit: 10,
            ..Default::default()
        };
        let cancelled = repo.list(&filter).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a.id);
        assert_eq!(repo.count(&filter).await.unwrap(), 1);

        let counts = repo.status_counts().await.unwrap();
        assert!(counts.contains(&(OrderStatus::PendingPayment, 1)));
    }
}
