//! Pre-flight checks shared by payment creation and execution.
//!
//! Both entry points re-run their checks inside the mutating transaction,
//! so a caller that raced past a stale read still fails cleanly when the
//! guarded update finds the row moved on.

use crate::{
    common::PAYMENT_AMOUNT_EPSILON,
    config::AppConfig,
    entities::{payment, Order, OrderModel, OrderPaymentStatus, OrderStatus, Payment, PaymentModel, PaymentStatus},
    errors::ServiceError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use uuid::Uuid;

/// Soft findings from [`validate_for_creation`] that do not block the new
/// payment but the caller should surface or act on.
#[derive(Debug, Clone, Default)]
pub struct PaymentPrecheck {
    pub warnings: Vec<String>,
    /// A still-pending payment for the same order; creating the new intent
    /// cancels this one.
    pub superseded: Option<Uuid>,
}

/// Checks that a new payment intent may be created for `order_id`.
///
/// Returns the order plus a [`PaymentPrecheck`] describing any pending
/// payment the creation will supersede. A completed or in-flight payment
/// on the order is a hard stop.
pub(crate) async fn validate_for_creation(
    conn: &impl ConnectionTrait,
    order_id: Uuid,
    amount: Decimal,
    currency: &str,
    config: &AppConfig,
) -> Result<(OrderModel, PaymentPrecheck), ServiceError> {
    let order = Order::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    if order.status == OrderStatus::Cancelled {
        return Err(ServiceError::InvalidOperation(format!(
            "Order {} is cancelled and can no longer be paid",
            order_id
        )));
    }
    if order.payment_status != OrderPaymentStatus::Pending {
        return Err(ServiceError::PaymentState(format!(
            "Order {} is already {}",
            order_id, order.payment_status
        )));
    }

    if Utc::now() - order.created_at > config.payment_order_max_age() {
        return Err(ServiceError::ValidationError(format!(
            "Order {} is older than the {}-hour payment window",
            order_id, config.payment_order_max_age_hours
        )));
    }

    // The client echoes the total back; a mismatch bigger than the epsilon
    // means the displayed price and the stored order have diverged.
    if (amount - order.total_amount).abs() > PAYMENT_AMOUNT_EPSILON {
        return Err(ServiceError::ValidationError(format!(
            "Payment amount {} does not match order total {}",
            amount, order.total_amount
        )));
    }

    if !config.is_supported_currency(currency) {
        return Err(ServiceError::ValidationError(format!(
            "Currency {} is not supported",
            currency
        )));
    }
    if !currency.eq_ignore_ascii_case(&order.currency) {
        return Err(ServiceError::ValidationError(format!(
            "Payment currency {} does not match order currency {}",
            currency, order.currency
        )));
    }

    let mut precheck = PaymentPrecheck::default();
    let existing = Payment::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .order_by_asc(payment::Column::CreatedAt)
        .all(conn)
        .await?;
    for prior in existing {
        match prior.status {
            PaymentStatus::Completed => {
                return Err(ServiceError::PaymentState(format!(
                    "Order {} already has completed payment {}",
                    order_id, prior.id
                )));
            }
            PaymentStatus::Processing => {
                return Err(ServiceError::PaymentState(format!(
                    "Payment {} for order {} is currently being executed",
                    prior.id, order_id
                )));
            }
            PaymentStatus::Pending => {
                precheck
                    .warnings
                    .push(format!("Pending payment {} will be superseded", prior.id));
                precheck.superseded = Some(prior.id);
            }
            PaymentStatus::Failed | PaymentStatus::Cancelled => {}
        }
    }

    Ok((order, precheck))
}

/// Checks that `payment_id` may be sent to the gateway for `order_id`.
///
/// The payment must still be live, belong to the order, and sit inside the
/// execution window measured from its creation. The order must still owe
/// the money.
pub(crate) async fn validate_for_execution(
    conn: &impl ConnectionTrait,
    payment_id: Uuid,
    order_id: Uuid,
    config: &AppConfig,
) -> Result<PaymentModel, ServiceError> {
    let payment = Payment::find_by_id(payment_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;

    if payment.order_id != order_id {
        return Err(ServiceError::ValidationError(format!(
            "Payment {} does not belong to order {}",
            payment_id, order_id
        )));
    }
    if payment.status.is_terminal() {
        return Err(ServiceError::PaymentState(format!(
            "Payment {} is {} and cannot be executed",
            payment_id, payment.status
        )));
    }

    let order = Order::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    if order.payment_status != OrderPaymentStatus::Pending {
        return Err(ServiceError::PaymentState(format!(
            "Order {} is already {}",
            order_id, order.payment_status
        )));
    }

    if Utc::now() - payment.created_at > config.payment_execution_window() {
        return Err(ServiceError::ValidationError(format!(
            "Payment {} has expired; intents must be executed within {} minutes",
            payment_id, config.payment_execution_window_minutes
        )));
    }

    Ok(payment)
}
