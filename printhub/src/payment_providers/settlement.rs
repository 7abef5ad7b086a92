//! Applying a payment outcome to the local payment, order and credit rows.
//!
//! Webhooks, the payment status endpoint and the reconciliation sweep all end up here, often for
//! the same payment at roughly the same time. The payment row is locked for the whole transition,
//! so concurrent callers serialise and later ones see the settled state:
//!
//! - a completed payment never moves back, and a repeated `Completed` is a no-op;
//! - a credits top-up is recorded in the ledger under the payment id, so it is applied once;
//! - money arriving for an order that is no longer awaiting payment is recorded as refunded and
//!   returned to the customer;
//! - side effects (capture, refunds, email, metrics) run only after the commit, and only for the
//!   caller that actually moved the payment.

use metrics::counter;
use sqlx::PgPool;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    AppState,
    db::{
        errors::DbError,
        handlers::{Credits, Orders, Payments, Repository, Users},
        models::{
            credits::CreditTransactionCreateDBRequest,
            orders::{OrderDBResponse, OrderPaymentStatus, OrderStatus},
            payments::{PaymentDBResponse, PaymentPurpose, PaymentStatus},
        },
    },
    payment_providers::{PaymentError, ProviderStatus, Result},
    types::{PaymentId, abbrev_uuid},
};

impl From<ProviderStatus> for PaymentStatus {
    fn from(status: ProviderStatus) -> Self {
        match status {
            ProviderStatus::New | ProviderStatus::Pending => PaymentStatus::Pending,
            ProviderStatus::WaitingForConfirmation => PaymentStatus::WaitingForConfirmation,
            ProviderStatus::Completed => PaymentStatus::Completed,
            ProviderStatus::Canceled => PaymentStatus::Canceled,
        }
    }
}

/// What a call to [`apply_status`] changed
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    /// The payment as it is after the call
    pub payment: PaymentDBResponse,
    /// False when the payment already had this status or could not move to it
    pub transitioned: bool,
    /// The order this payment belongs to, after the call
    pub order: Option<OrderDBResponse>,
    /// A top-up was added to the credit balance by this call
    pub credits_added: bool,
    /// The payment completed for an order that had already been paid or cancelled, and the
    /// money has to go back to the customer
    pub refund_required: bool,
}

/// Move a payment to `status` and apply the consequences, in one transaction.
#[instrument(skip(pool), fields(payment_id = %abbrev_uuid(&payment_id), status = status.as_str()), err)]
pub async fn apply_status(pool: &PgPool, payment_id: PaymentId, status: PaymentStatus) -> Result<SettlementOutcome> {
    let mut tx = pool.begin().await?;

    let payment = Payments::new(&mut tx)
        .get_for_update(payment_id)
        .await?
        .ok_or(PaymentError::Database(DbError::NotFound))?;

    if !payment.status.can_transition_to(status) {
        trace!(current = payment.status.as_str(), "Payment already settled, nothing to do");
        let order = match payment.order_id {
            Some(order_id) => Orders::new(&mut tx).get_by_id(order_id).await?,
            None => None,
        };
        tx.commit().await?;
        return Ok(SettlementOutcome {
            payment,
            transitioned: false,
            order,
            credits_added: false,
            refund_required: false,
        });
    }

    let mut updated = Payments::new(&mut tx).set_status(payment_id, status).await?;
    let mut credits_added = false;
    let mut refund_required = false;

    match (payment.purpose, status) {
        (PaymentPurpose::Credits, PaymentStatus::Completed) => {
            let user_id = payment
                .user_id
                .ok_or_else(|| PaymentError::InvalidData("Credits top-up without a user".to_string()))?;

            let request = CreditTransactionCreateDBRequest::top_up(user_id, payment.id, payment.amount);
            match Credits::new(&mut tx).create_transaction(&request).await {
                Ok(_) => credits_added = true,
                Err(DbError::UniqueViolation { constraint, .. })
                    if constraint.as_deref() == Some("credits_transactions_source_id_unique") =>
                {
                    trace!("Top-up already recorded in the ledger");
                }
                Err(e) => return Err(e.into()),
            }
        }
        (PaymentPurpose::Order, PaymentStatus::Completed) => {
            if let Some(order_id) = payment.order_id {
                let mut orders = Orders::new(&mut tx);
                if !orders.mark_paid(order_id).await? {
                    // Another payment got there first, or the order was cancelled meanwhile
                    warn!(order_id = %abbrev_uuid(&order_id), "Payment completed for an order that was not awaiting payment, refunding");
                    let order = orders.get_for_update(order_id).await?;
                    if order.is_some_and(|o| o.status == OrderStatus::Cancelled) {
                        orders.set_payment_status(order_id, OrderPaymentStatus::Refunded).await?;
                    }
                    updated = Payments::new(&mut tx).set_status(payment_id, PaymentStatus::Refunded).await?;
                    refund_required = true;
                }
            }
        }
        (PaymentPurpose::Order, next) => {
            let order_status = match next {
                PaymentStatus::Canceled | PaymentStatus::Failed => Some(OrderPaymentStatus::Failed),
                PaymentStatus::Pending | PaymentStatus::WaitingForConfirmation => Some(OrderPaymentStatus::Pending),
                PaymentStatus::Refunded => Some(OrderPaymentStatus::Refunded),
                PaymentStatus::Completed => None,
            };
            if let (Some(order_id), Some(order_status)) = (payment.order_id, order_status) {
                let mut orders = Orders::new(&mut tx);
                let order = orders.get_for_update(order_id).await?;
                // Only touch orders still waiting for money; a paid order keeps its state
                let waiting = order.is_some_and(|o| o.status == OrderStatus::PendingPayment);
                if waiting || order_status == OrderPaymentStatus::Refunded {
                    orders.set_payment_status(order_id, order_status).await?;
                }
            }
        }
        (PaymentPurpose::Credits, _) => {}
    }

    let order = match payment.order_id {
        Some(order_id) => Orders::new(&mut tx).get_by_id(order_id).await?,
        None => None,
    };

    tx.commit().await?;

    info!(
        from = payment.status.as_str(),
        to = status.as_str(),
        provider = %payment.provider,
        "Payment status changed"
    );

    Ok(SettlementOutcome {
        payment: updated,
        transitioned: true,
        order,
        credits_added,
        refund_required,
    })
}

/// [`apply_status`] plus the after-commit effects: capture of authorised payments, metrics and
/// the payment confirmation email.
#[instrument(skip(state), fields(payment_id = %abbrev_uuid(&payment_id), status = status.as_str()), err)]
pub async fn settle(state: &AppState, payment_id: PaymentId, status: PaymentStatus) -> Result<SettlementOutcome> {
    let outcome = apply_status(&state.db, payment_id, status).await?;
    if !outcome.transitioned {
        return Ok(outcome);
    }

    let payment = &outcome.payment;
    let purpose = match payment.purpose {
        PaymentPurpose::Order => "order",
        PaymentPurpose::Credits => "credits",
    };
    counter!("printhub_payments_settled_total", "status" => status.as_str(), "purpose" => purpose).increment(1);

    match status {
        PaymentStatus::Completed if outcome.refund_required => refund_surplus(state, payment).await,
        PaymentStatus::WaitingForConfirmation => capture(state, payment).await,
        PaymentStatus::Completed => {
            counter!("printhub_payment_revenue_minor_units_total", "purpose" => purpose)
                .increment(minor_units(payment.amount));
            send_confirmation(state, &outcome).await;
        }
        _ => {}
    }

    Ok(outcome)
}

fn minor_units(amount: rust_decimal::Decimal) -> u64 {
    use rust_decimal::prelude::ToPrimitive;
    (amount * rust_decimal::Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .unwrap_or(0)
}

/// Send back money that arrived for an order which no longer wanted it. The payment row already
/// says `Refunded`; a failure here leaves the money at the provider for staff to return by hand.
async fn refund_surplus(state: &AppState, payment: &PaymentDBResponse) {
    let provider_order_id = payment.provider_order_id.as_deref();
    let provider = state.payment_provider.as_ref().filter(|p| p.name() == payment.provider);

    let result = match (provider, provider_order_id) {
        (Some(provider), Some(provider_order_id)) => {
            provider
                .refund(provider_order_id, payment.amount, "Refund for an order that was no longer awaiting payment")
                .await
        }
        (None, _) => Err(PaymentError::ProviderApi(format!(
            "payment provider '{}' is not configured",
            payment.provider
        ))),
        (_, None) => Err(PaymentError::InvalidData("payment has no provider order id".to_string())),
    };

    match result {
        Ok(()) => {
            counter!("printhub_order_refunds_total", "method" => payment.method.as_str()).increment(1);
            info!(amount = %payment.amount, "Refunded payment for an order that was not awaiting payment");
        }
        Err(e) => {
            counter!("printhub_payment_refunds_failed_total").increment(1);
            tracing::error!(
                payment_id = %payment.id,
                amount = %payment.amount,
                "Automatic refund failed, return the money manually: {}",
                e
            );
        }
    }
}

async fn capture(state: &AppState, payment: &PaymentDBResponse) {
    let Some(provider) = &state.payment_provider else {
        return;
    };
    if !provider.auto_capture() || provider.name() != payment.provider {
        return;
    }
    let Some(provider_order_id) = &payment.provider_order_id else {
        warn!("Authorised payment has no provider order id, cannot capture");
        return;
    };

    match provider.capture(provider_order_id).await {
        // The provider follows up with a COMPLETED notification
        Ok(()) => info!(provider_order_id, "Captured authorised payment"),
        Err(e) => tracing::error!(provider_order_id, "Failed to capture payment: {}", e),
    }
}

async fn send_confirmation(state: &AppState, outcome: &SettlementOutcome) {
    let payment = &outcome.payment;

    let result = match (&outcome.order, payment.purpose) {
        (Some(order), PaymentPurpose::Order) => {
            state
                .email
                .send_payment_received(
                    &order.customer_email,
                    Some(&order.customer_name),
                    payment.amount,
                    &payment.currency,
                    &format!("order #{}", order.number),
                    Some(&format!("/orders/{}", order.id)),
                )
                .await
        }
        (_, PaymentPurpose::Credits) => {
            let Some(user_id) = payment.user_id else {
                return;
            };
            let user = match state.db.acquire().await {
                Ok(mut conn) => Users::new(&mut conn).get_by_id(user_id).await,
                Err(e) => Err(DbError::from(e)),
            };
            match user {
                Ok(Some(user)) => {
                    state
                        .email
                        .send_payment_received(
                            &user.email,
                            user.display_name.as_deref(),
                            payment.amount,
                            &payment.currency,
                            "a credits top-up",
                            Some("/credits"),
                        )
                        .await
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("Could not load user for payment email: {}", e);
                    return;
                }
            }
        }
        (None, PaymentPurpose::Order) => return,
    };

    if let Err(e) = result {
        warn!("Failed to send payment confirmation email: {}", e);
    } else {
        debug!("Payment confirmation email sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        db::models::{
            orders::OrderUpdateDBRequest,
            payments::{PaymentCreateDBRequest, PaymentMethod},
        },
        test_utils::{create_test_config, create_test_order, create_test_state, create_test_user},
    };
    use rust_decimal::Decimal;
    use uuid::Uuid;

    async fn create_payment(
        pool: &PgPool,
        purpose: PaymentPurpose,
        user_id: Option<crate::types::UserId>,
        order_id: Option<crate::types::OrderId>,
        amount: Decimal,
    ) -> PaymentDBResponse {
        let mut conn = pool.acquire().await.unwrap();
        Payments::new(&mut conn)
            .create(&PaymentCreateDBRequest {
                id: Uuid::new_v4(),
                user_id,
                order_id,
                purpose,
                method: PaymentMethod::Blik,
                provider: "dummy".to_string(),
                amount,
                currency: "PLN".to_string(),
                status: PaymentStatus::Pending,
            })
            .await
            .unwrap()
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_top_up_credits_once(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let payment = create_payment(&pool, PaymentPurpose::Credits, Some(user.id), None, Decimal::new(5000, 2)).await;

        let first = apply_status(&pool, payment.id, PaymentStatus::Completed).await.unwrap();
        assert!(first.transitioned);
        assert!(first.credits_added);
        assert_eq!(first.payment.status, PaymentStatus::Completed);
        assert!(first.payment.completed_at.is_some());

        let second = apply_status(&pool, payment.id, PaymentStatus::Completed).await.unwrap();
        assert!(!second.transitioned);
        assert!(!second.credits_added);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Credits::new(&mut conn).get_balance(user.id).await.unwrap(), Decimal::new(5000, 2));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_concurrent_completions_credit_once(pool: PgPool) {
        let user = create_test_user(&pool, Role::Customer).await;
        let payment = create_payment(&pool, PaymentPurpose::Credits, Some(user.id), None, Decimal::new(2000, 2)).await;

        let (a, b) = tokio::join!(
            apply_status(&pool, payment.id, PaymentStatus::Completed),
            apply_status(&pool, payment.id, PaymentStatus::Completed)
        );
        let transitioned = [a.unwrap(), b.unwrap()].iter().filter(|o| o.transitioned).count();
        assert_eq!(transitioned, 1);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Credits::new(&mut conn).get_balance(user.id).await.unwrap(), Decimal::new(2000, 2));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_order_payment_marks_order_paid_and_never_regresses(pool: PgPool) {
        let order = create_test_order(&pool, None).await;
        let payment = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;

        let outcome = apply_status(&pool, payment.id, PaymentStatus::Completed).await.unwrap();
        let paid = outcome.order.unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.payment_status, OrderPaymentStatus::Paid);

        let late_cancel = apply_status(&pool, payment.id, PaymentStatus::Canceled).await.unwrap();
        assert!(!late_cancel.transitioned);
        assert_eq!(late_cancel.payment.status, PaymentStatus::Completed);
        assert_eq!(late_cancel.order.unwrap().payment_status, OrderPaymentStatus::Paid);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_cancelled_payment_leaves_order_retryable(pool: PgPool) {
        let order = create_test_order(&pool, None).await;
        let payment = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;

        let outcome = apply_status(&pool, payment.id, PaymentStatus::Canceled).await.unwrap();
        assert!(outcome.transitioned);
        let order = outcome.order.unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.payment_status, OrderPaymentStatus::Failed);

        // A second attempt can still pay the order
        let retry = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;
        let outcome = apply_status(&pool, retry.id, PaymentStatus::Completed).await.unwrap();
        assert_eq!(outcome.order.unwrap().status, OrderStatus::Paid);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_stale_failure_does_not_touch_paid_order(pool: PgPool) {
        let order = create_test_order(&pool, None).await;
        let card = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;
        let blik = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;

        apply_status(&pool, blik.id, PaymentStatus::Completed).await.unwrap();
        let outcome = apply_status(&pool, card.id, PaymentStatus::Failed).await.unwrap();
        assert!(outcome.transitioned);
        assert_eq!(outcome.order.unwrap().payment_status, OrderPaymentStatus::Paid);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_completion_after_cancellation_is_refunded(pool: PgPool) {
        let state = create_test_state(pool.clone(), create_test_config());
        let order = create_test_order(&pool, None).await;
        let payment = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            Payments::new(&mut conn)
                .attach_provider_order(payment.id, "DUMMY-LATE", None)
                .await
                .unwrap();
            Orders::new(&mut conn)
                .update(
                    order.id,
                    &OrderUpdateDBRequest {
                        status: Some(OrderStatus::Cancelled),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let outcome = settle(&state, payment.id, PaymentStatus::Completed).await.unwrap();
        assert!(outcome.transitioned);
        assert!(outcome.refund_required);
        assert_eq!(outcome.payment.status, PaymentStatus::Refunded);
        let order = outcome.order.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status, OrderPaymentStatus::Refunded);

        // A repeated notification changes nothing
        let again = settle(&state, payment.id, PaymentStatus::Completed).await.unwrap();
        assert!(!again.transitioned);
        assert_eq!(again.payment.status, PaymentStatus::Refunded);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_second_completed_payment_is_refunded(pool: PgPool) {
        let state = create_test_state(pool.clone(), create_test_config());
        let order = create_test_order(&pool, None).await;
        let card = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;
        let blik = create_payment(&pool, PaymentPurpose::Order, None, Some(order.id), order.total).await;
        {
            let mut conn = pool.acquire().await.unwrap();
            Payments::new(&mut conn)
                .attach_provider_order(blik.id, "DUMMY-SECOND", None)
                .await
                .unwrap();
        }

        let first = settle(&state, card.id, PaymentStatus::Completed).await.unwrap();
        assert!(!first.refund_required);
        assert_eq!(first.payment.status, PaymentStatus::Completed);

        let second = settle(&state, blik.id, PaymentStatus::Completed).await.unwrap();
        assert!(second.refund_required);
        assert_eq!(second.payment.status, PaymentStatus::Refunded);
        let order = second.order.unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment_status, OrderPaymentStatus::Paid);

        let mut conn = pool.acquire().await.unwrap();
        let completed = Payments::new(&mut conn).completed_for_order(order.id).await.unwrap().unwrap();
        assert_eq!(completed.id, card.id);
    }

    #[sqlx::test]
    async fn test_unknown_payment_is_not_found(pool: PgPool) {
        let err = apply_status(&pool, Uuid::new_v4(), PaymentStatus::Completed).await.unwrap_err();
        assert!(matches!(err, PaymentError::Database(DbError::NotFound)));
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(PaymentStatus::from(ProviderStatus::New), PaymentStatus::Pending);
        assert_eq!(
            PaymentStatus::from(ProviderStatus::WaitingForConfirmation),
            PaymentStatus::WaitingForConfirmation
        );
        assert_eq!(PaymentStatus::from(ProviderStatus::Canceled), PaymentStatus::Canceled);
        assert_eq!(minor_units(Decimal::new(4299, 2)), 4299);
        assert_eq!(minor_units(Decimal::new(1005, 3)), 101);
        assert_eq!(minor_units(Decimal::new(1025, 3)), 103);
    }
}
