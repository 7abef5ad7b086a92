//! Background sweep for payments whose notification never arrived.
//!
//! Every `interval`, open payments older than `stale_after` are looked up at the provider and
//! settled with whatever it reports. Payments still open after `expire_after` are cancelled so the
//! order can be paid again.

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    AppState,
    config::ReconciliationConfig,
    db::{handlers::Payments, models::payments::PaymentStatus},
    payment_providers::settlement,
    types::abbrev_uuid,
};

/// Payments examined per sweep
const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub updated: usize,
    pub expired: usize,
}

pub async fn run_reconciliation(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = state.config.background_services.reconciliation.clone();
    info!(
        "Starting payment reconciliation every {:?} (stale after {:?}, expire after {:?})",
        config.interval, config.stale_after, config.expire_after
    );

    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Payment reconciliation shutting down");
                break;
            }
            _ = interval.tick() => {
                match sweep(&state, &config).await {
                    Ok(report) if report.checked > 0 => info!(
                        checked = report.checked,
                        updated = report.updated,
                        expired = report.expired,
                        "Reconciled open payments"
                    ),
                    Ok(_) => debug!("No stale payments"),
                    Err(e) => tracing::error!("Payment reconciliation failed: {:#}", e),
                }
            }
        }
    }

    Ok(())
}

/// One pass over the stale open payments.
#[instrument(skip_all, err)]
pub async fn sweep(state: &AppState, config: &ReconciliationConfig) -> anyhow::Result<SweepReport> {
    let now = Utc::now();
    let stale_before = now - TimeDelta::from_std(config.stale_after)?;
    let expire_before = now - TimeDelta::from_std(config.expire_after)?;

    let payments = {
        let mut conn = state.db.acquire().await?;
        Payments::new(&mut conn).list_open_before(stale_before, SWEEP_BATCH).await?
    };

    let mut report = SweepReport {
        checked: payments.len(),
        ..Default::default()
    };

    for payment in payments {
        let provider = state.payment_provider.as_ref().filter(|p| p.name() == payment.provider);

        let reported = match (provider, &payment.provider_order_id) {
            (Some(provider), Some(provider_order_id)) => match provider.get_payment_status(provider_order_id).await {
                Ok(status) => Some(PaymentStatus::from(status)),
                Err(e) => {
                    warn!(payment_id = %abbrev_uuid(&payment.id), "Could not fetch payment status: {}", e);
                    None
                }
            },
            _ => None,
        };

        let expired = payment.created_at < expire_before;
        let next = match reported {
            Some(status) if !status.is_open() => Some(status),
            _ if expired => Some(PaymentStatus::Canceled),
            Some(status) if status != payment.status => Some(status),
            _ => None,
        };

        let Some(next) = next else {
            continue;
        };

        match settlement::settle(state, payment.id, next).await {
            Ok(outcome) if outcome.transitioned => {
                if next == PaymentStatus::Canceled && reported.is_none_or(|s| s.is_open()) {
                    report.expired += 1;
                } else {
                    report.updated += 1;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(payment_id = %abbrev_uuid(&payment.id), "Could not settle payment: {}", e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DummyConfig, PaymentConfig},
        db::{
            handlers::Orders,
            models::{
                orders::{OrderPaymentStatus, OrderStatus},
                payments::{PaymentCreateDBRequest, PaymentDBResponse, PaymentMethod, PaymentPurpose},
            },
        },
        test_utils::{create_test_config, create_test_order, create_test_state},
    };
    use sqlx::PgPool;
    use std::time::Duration;
    use uuid::Uuid;

    fn state_with_dummy(pool: PgPool, complete_immediately: bool) -> AppState {
        let mut config = create_test_config();
        config.payment = Some(PaymentConfig::Dummy(DummyConfig {
            webhook_secret: "secret".to_string(),
            complete_immediately,
        }));
        create_test_state(pool, config)
    }

    async fn open_payment(pool: &PgPool, order_id: crate::types::OrderId, age: Duration) -> PaymentDBResponse {
        let mut conn = pool.acquire().await.unwrap();
        let id = Uuid::new_v4();
        let mut payments = Payments::new(&mut conn);
        payments
            .create(&PaymentCreateDBRequest {
                id,
                user_id: None,
                order_id: Some(order_id),
                purpose: PaymentPurpose::Order,
                method: PaymentMethod::Card,
                provider: "dummy".to_string(),
                amount: rust_decimal::Decimal::new(4299, 2),
                currency: "PLN".to_string(),
                status: PaymentStatus::Pending,
            })
            .await
            .unwrap();
        payments.attach_provider_order(id, &format!("dummy_{id}"), None).await.unwrap();

        sqlx::query("UPDATE payments SET created_at = NOW() - make_interval(secs => $2) WHERE id = $1")
            .bind(id)
            .bind(age.as_secs_f64())
            .execute(&mut *conn)
            .await
            .unwrap();
        Payments::new(&mut conn).get_by_id(id).await.unwrap().unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_sweep_settles_stale_payment_reported_completed(pool: PgPool) {
        let state = state_with_dummy(pool.clone(), true);
        let config = ReconciliationConfig::default();
        let order = create_test_order(&pool, None).await;
        let payment = open_payment(&pool, order.id, Duration::from_secs(60 * 60)).await;

        let report = sweep(&state, &config).await.unwrap();
        assert_eq!(report, SweepReport { checked: 1, updated: 1, expired: 0 });

        let mut conn = pool.acquire().await.unwrap();
        let payment = Payments::new(&mut conn).get_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        let order = Orders::new(&mut conn).get_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_sweep_ignores_fresh_payments(pool: PgPool) {
        let state = state_with_dummy(pool.clone(), true);
        let order = create_test_order(&pool, None).await;
        open_payment(&pool, order.id, Duration::from_secs(30)).await;

        let report = sweep(&state, &ReconciliationConfig::default()).await.unwrap();
        assert_eq!(report.checked, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_sweep_expires_abandoned_payments(pool: PgPool) {
        let state = state_with_dummy(pool.clone(), false);
        let order = create_test_order(&pool, None).await;
        let stale = open_payment(&pool, order.id, Duration::from_secs(60 * 60)).await;
        let abandoned = open_payment(&pool, order.id, Duration::from_secs(72 * 60 * 60)).await;

        let report = sweep(&state, &ReconciliationConfig::default()).await.unwrap();
        assert_eq!(report, SweepReport { checked: 2, updated: 0, expired: 1 });

        let mut conn = pool.acquire().await.unwrap();
        let mut payments = Payments::new(&mut conn);
        assert_eq!(payments.get_by_id(stale.id).await.unwrap().unwrap().status, PaymentStatus::Pending);
        assert_eq!(payments.get_by_id(abandoned.id).await.unwrap().unwrap().status, PaymentStatus::Canceled);

        let order = Orders::new(&mut conn).get_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.payment_status, OrderPaymentStatus::Failed);
    }

    #[sqlx::test]
    async fn test_task_stops_on_cancel(pool: PgPool) {
        let state = state_with_dummy(pool, true);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_reconciliation(state, token.clone()));
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
