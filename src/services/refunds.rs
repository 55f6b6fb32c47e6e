//! Refund claims against completed payments.
//!
//! A refund is born as a `pending` claim whose amount is atomically added
//! to the payment's `refunded_amount`. That column therefore accumulates
//! pending and completed claims together, which is what keeps the running
//! sum under the payment amount even when refund attempts race. Confirming
//! the gateway round-trip completes the claim; a failure releases it and
//! returns the money to the refundable remainder.

use crate::{
    common::round_money,
    config::AppConfig,
    entities::{
        order, order_item, payment, refund, refund_item, Order, OrderItem, OrderItemModel,
        OrderPaymentStatus, OrderRefundStatus, OrderStatus, Payment, PaymentModel, PaymentStatus,
        Refund, RefundKind, RefundModel, RefundStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock::{StockDemand, StockLedger},
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

lazy_static! {
    static ref REFUND_CREATIONS: IntCounter =
        IntCounter::new("refund_creations_total", "Total number of refunds requested")
            .expect("metric can be created");
    static ref REFUND_FAILURES: IntCounter = IntCounter::new(
        "refund_failures_total",
        "Total number of refunds that failed or were rejected at confirmation"
    )
    .expect("metric can be created");
}

/// One order line of an item-specific refund request.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundItemRequest {
    pub order_item_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_refund_request"))]
pub struct RefundRequest {
    pub kind: RefundKind,
    /// Required for `partial` refunds, ignored otherwise.
    pub amount: Option<Decimal>,
    /// Required for `item_specific` refunds.
    pub items: Option<Vec<RefundItemRequest>>,
    pub reason: Option<String>,
}

fn validate_refund_request(request: &RefundRequest) -> Result<(), ValidationError> {
    match request.kind {
        RefundKind::Partial => match request.amount {
            Some(amount) if amount > Decimal::ZERO => Ok(()),
            Some(_) => Err(ValidationError::new("refund_amount_not_positive")),
            None => Err(ValidationError::new("refund_amount_required")),
        },
        RefundKind::ItemSpecific => match request.items.as_deref() {
            Some(items) if !items.is_empty() => Ok(()),
            _ => Err(ValidationError::new("refund_items_required")),
        },
        RefundKind::Full => Ok(()),
    }
}

/// Money view of an order's refund history.
#[derive(Debug, Clone, Serialize)]
pub struct RefundSummary {
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub payment_amount: Decimal,
    /// Refunds the gateway has confirmed.
    pub completed_total: Decimal,
    /// Claims still waiting on the gateway.
    pub pending_total: Decimal,
    /// What a further refund could still take.
    pub remaining_refundable: Decimal,
    pub refunds: Vec<RefundModel>,
}

/// Result of [`RefundEngine::process_refund`], carried out of the
/// transaction so events fire only after commit.
struct RequestedRefund {
    refund: RefundModel,
    restored: Vec<StockDemand>,
}

enum ConfirmOutcome {
    Confirmed {
        refund: RefundModel,
        /// Whether the payment is now refunded in full.
        full: bool,
    },
    /// The defensive re-check found the running sum violated; the refund was
    /// flipped to failed and its claim released before commit.
    LimitViolation {
        refund: RefundModel,
        refunded: Decimal,
        payment_amount: Decimal,
    },
}

/// Computes what a refund request is worth against a payment.
///
/// `full` refunds the remainder the payment still holds, so a full refund
/// after partials only returns what is left. `partial` takes the requested
/// amount as-is. `item_specific` prices the requested lines at their
/// snapshot `unit_price`, capping each quantity at what the order bought.
/// The result is rounded half away from zero to cents.
pub fn calculate_refund_amount(
    payment: &PaymentModel,
    order_items: &[OrderItemModel],
    request: &RefundRequest,
) -> Result<Decimal, ServiceError> {
    let amount = match request.kind {
        RefundKind::Full => payment.amount - payment.refunded_amount,
        RefundKind::Partial => request.amount.ok_or_else(|| {
            ServiceError::ValidationError("A partial refund requires an amount".to_string())
        })?,
        RefundKind::ItemSpecific => {
            let requested = request.items.as_deref().unwrap_or(&[]);
            if requested.is_empty() {
                return Err(ServiceError::ValidationError(
                    "An item-specific refund requires at least one item".to_string(),
                ));
            }

            let by_id: HashMap<Uuid, &OrderItemModel> =
                order_items.iter().map(|item| (item.id, item)).collect();
            let mut sum = Decimal::ZERO;
            for line in requested {
                let item = by_id.get(&line.order_item_id).ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Order item {} does not belong to this order",
                        line.order_item_id
                    ))
                })?;
                if line.quantity <= 0 {
                    return Err(ServiceError::ValidationError(format!(
                        "Refund quantity for {} must be positive",
                        item.name
                    )));
                }
                let quantity = line.quantity.min(item.quantity);
                sum += item.unit_price * Decimal::from(quantity);
            }
            sum
        }
    };

    Ok(round_money(amount))
}

#[derive(Clone)]
pub struct RefundEngine {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl RefundEngine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Creates a pending refund against a completed payment.
    ///
    /// The whole step runs in one transaction: eligibility, the amount
    /// calculation, the atomic claim against the payment's remainder, the
    /// refund row, and the order's money statuses. Full refunds also return
    /// the order's stock to inventory; partial and item-specific refunds
    /// deliberately do not, the units stay sold.
    #[instrument(skip(self, request))]
    pub async fn process_refund(
        &self,
        payment_id: Uuid,
        request: RefundRequest,
    ) -> Result<RefundModel, ServiceError> {
        request.validate()?;

        // The transaction closure must return a future that borrows nothing
        // from `self`; the engine is a bundle of `Arc`s, so a clone moves
        // an owned handle in instead.
        let this = self.clone();
        let outcome = self
            .db
            .transaction::<_, RequestedRefund, ServiceError>(move |txn| {
                Box::pin(async move { this.process_refund_in_txn(txn, payment_id, request).await })
            })
            .await?;

        REFUND_CREATIONS.inc();
        info!(
            refund_id = %outcome.refund.id,
            amount = %outcome.refund.amount,
            kind = %outcome.refund.kind,
            "Refund requested"
        );
        for demand in &outcome.restored {
            self.event_sender
                .send_or_log(Event::StockRestored {
                    product_id: demand.product_id,
                    quantity: demand.quantity,
                    order_id: outcome.refund.order_id,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::RefundRequested {
                refund_id: outcome.refund.id,
                payment_id: outcome.refund.payment_id,
                order_id: outcome.refund.order_id,
                amount: outcome.refund.amount,
            })
            .await;

        Ok(outcome.refund)
    }

    async fn process_refund_in_txn(
        &self,
        txn: &DatabaseTransaction,
        payment_id: Uuid,
        request: RefundRequest,
    ) -> Result<RequestedRefund, ServiceError> {
        let payment = Payment::find_by_id(payment_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        if payment.status != PaymentStatus::Completed {
            return Err(ServiceError::PaymentState(format!(
                "Payment {} is {}; only completed payments can be refunded",
                payment_id, payment.status
            )));
        }

        let order = Order::find_by_id(payment.order_id)
            .one(txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", payment.order_id))
            })?;

        // The execution window keeps capture within minutes of the intent,
        // so the intent's creation anchors the refund window.
        if Utc::now() - payment.created_at > self.config.refund_window() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} was paid more than {} days ago and can no longer be refunded",
                order.id, self.config.refund_window_days
            )));
        }

        let order_items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(txn)
            .await?;

        let amount = calculate_refund_amount(&payment, &order_items, &request)?;
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Refund amount must be positive, got {}",
                amount
            )));
        }

        // The claim lands only while the running sum stays inside the
        // payment; concurrent attempts serialize here and the loser re-reads
        // for the error detail.
        let claim = Payment::update_many()
            .col_expr(
                payment::Column::RefundedAmount,
                Expr::col(payment::Column::RefundedAmount).add(amount),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::RefundedAmount.lte(payment.amount - amount))
            .exec(txn)
            .await?;
        if claim.rows_affected == 0 {
            let current = Payment::find_by_id(payment_id).one(txn).await?.ok_or_else(
                || ServiceError::NotFound(format!("Payment {} not found", payment_id)),
            )?;
            return Err(ServiceError::RefundLimitExceeded {
                requested: amount,
                refunded: current.refunded_amount,
                payment_amount: current.amount,
            });
        }

        let now = Utc::now();
        let refund_id = Uuid::new_v4();
        let created = refund::ActiveModel {
            id: Set(refund_id),
            payment_id: Set(payment_id),
            order_id: Set(order.id),
            amount: Set(amount),
            status: Set(RefundStatus::Pending),
            kind: Set(request.kind.clone()),
            reason: Set(request.reason.clone()),
            transaction_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        }
        .insert(txn)
        .await?;

        if created.kind == RefundKind::ItemSpecific {
            let by_id: HashMap<Uuid, &OrderItemModel> =
                order_items.iter().map(|item| (item.id, item)).collect();
            for line in request.items.as_deref().unwrap_or(&[]) {
                // Unknown ids were already rejected by the calculation.
                if let Some(item) = by_id.get(&line.order_item_id) {
                    let quantity = line.quantity.min(item.quantity);
                    refund_item::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        refund_id: Set(refund_id),
                        order_item_id: Set(item.id),
                        quantity: Set(quantity),
                        amount: Set(round_money(item.unit_price * Decimal::from(quantity))),
                        created_at: Set(now),
                    }
                    .insert(txn)
                    .await?;
                }
            }
        }

        self.recompute_order_money_status(txn, order.id, payment_id)
            .await?;

        // A cancelled order already put its units back when it was
        // cancelled; a full refund of one only moves money.
        let restored = if created.kind == RefundKind::Full && order.status != OrderStatus::Cancelled
        {
            let demands: Vec<StockDemand> = order_items
                .iter()
                .map(|item| StockDemand {
                    product_id: item.product_id,
                    name: item.name.clone(),
                    quantity: item.quantity,
                })
                .collect();
            StockLedger::restore_all(txn, &demands).await?;
            demands
        } else {
            Vec::new()
        };

        Ok(RequestedRefund {
            refund: created,
            restored,
        })
    }

    /// Completes a pending refund once the gateway confirms it.
    ///
    /// Before completing, the running sum is re-checked against the other
    /// completed refunds on the payment. A violation means the rows got out
    /// of sync with the claims; the refund flips to failed, its claim is
    /// released, and the caller gets `RefundLimitExceeded`.
    #[instrument(skip(self, transaction_id))]
    pub async fn confirm_refund(
        &self,
        refund_id: Uuid,
        transaction_id: &str,
    ) -> Result<RefundModel, ServiceError> {
        let transaction_id = transaction_id.to_string();
        let this = self.clone();
        let outcome = self
            .db
            .transaction::<_, ConfirmOutcome, ServiceError>(move |txn| {
                Box::pin(
                    async move { this.confirm_refund_in_txn(txn, refund_id, transaction_id).await },
                )
            })
            .await?;

        match outcome {
            ConfirmOutcome::Confirmed { refund, full } => {
                info!(refund_id = %refund.id, amount = %refund.amount, "Refund completed");
                self.event_sender
                    .send_or_log(Event::RefundCompleted {
                        refund_id: refund.id,
                        order_id: refund.order_id,
                        amount: refund.amount,
                    })
                    .await;
                self.event_sender
                    .send_or_log(Event::OrderRefunded {
                        order_id: refund.order_id,
                        amount: refund.amount,
                        full,
                    })
                    .await;
                Ok(refund)
            }
            ConfirmOutcome::LimitViolation {
                refund,
                refunded,
                payment_amount,
            } => {
                REFUND_FAILURES.inc();
                warn!(
                    refund_id = %refund.id,
                    "Refund rejected at confirmation; completed refunds already cover the payment"
                );
                self.event_sender
                    .send_or_log(Event::RefundFailed {
                        refund_id: refund.id,
                        order_id: refund.order_id,
                    })
                    .await;
                Err(ServiceError::RefundLimitExceeded {
                    requested: refund.amount,
                    refunded,
                    payment_amount,
                })
            }
        }
    }

    async fn confirm_refund_in_txn(
        &self,
        txn: &DatabaseTransaction,
        refund_id: Uuid,
        transaction_id: String,
    ) -> Result<ConfirmOutcome, ServiceError> {
        let pending = Refund::find_by_id(refund_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Refund {} not found", refund_id)))?;
        if pending.status != RefundStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "Refund {} is {}; only pending refunds can be confirmed",
                refund_id, pending.status
            )));
        }

        let payment = Payment::find_by_id(pending.payment_id)
            .one(txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment {} not found", pending.payment_id))
            })?;

        let completed_elsewhere: Decimal = Refund::find()
            .filter(refund::Column::PaymentId.eq(pending.payment_id))
            .filter(refund::Column::Status.eq(RefundStatus::Completed))
            .filter(refund::Column::Id.ne(refund_id))
            .all(txn)
            .await?
            .iter()
            .map(|r| r.amount)
            .sum();

        if completed_elsewhere + pending.amount > payment.amount {
            let failed = self.release_claim(txn, pending).await?;
            return Ok(ConfirmOutcome::LimitViolation {
                refund: failed,
                refunded: completed_elsewhere,
                payment_amount: payment.amount,
            });
        }

        let now = Utc::now();
        let full = completed_elsewhere + pending.amount >= payment.amount;
        let mut active: refund::ActiveModel = pending.into();
        active.status = Set(RefundStatus::Completed);
        active.transaction_id = Set(Some(transaction_id));
        active.updated_at = Set(now);
        active.completed_at = Set(Some(now));
        let confirmed = active.update(txn).await?;

        Ok(ConfirmOutcome::Confirmed {
            refund: confirmed,
            full,
        })
    }

    /// Fails a pending refund after an unsuccessful gateway round-trip and
    /// releases its claim so the money becomes refundable again.
    #[instrument(skip(self, error))]
    pub async fn fail_refund(
        &self,
        refund_id: Uuid,
        error: &str,
    ) -> Result<RefundModel, ServiceError> {
        let error = error.to_string();
        let this = self.clone();
        let failed = self
            .db
            .transaction::<_, RefundModel, ServiceError>(move |txn| {
                Box::pin(async move {
                    let pending = Refund::find_by_id(refund_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!("Refund {} not found", refund_id))
                        })?;
                    if pending.status != RefundStatus::Pending {
                        return Err(ServiceError::InvalidOperation(format!(
                            "Refund {} is {}; only pending refunds can fail",
                            refund_id, pending.status
                        )));
                    }

                    warn!(refund_id = %refund_id, error = %error, "Gateway refund failed");
                    this.release_claim(txn, pending).await
                })
            })
            .await?;

        REFUND_FAILURES.inc();
        self.event_sender
            .send_or_log(Event::RefundFailed {
                refund_id: failed.id,
                order_id: failed.order_id,
            })
            .await;

        Ok(failed)
    }

    /// The money view of an order's refunds.
    pub async fn refund_summary(&self, order_id: Uuid) -> Result<RefundSummary, ServiceError> {
        let payment = Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} has no completed payment", order_id))
            })?;

        let refunds = Refund::find()
            .filter(refund::Column::OrderId.eq(order_id))
            .order_by_desc(refund::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        let completed_total = refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Completed)
            .map(|r| r.amount)
            .sum();
        let pending_total = refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Pending)
            .map(|r| r.amount)
            .sum();

        Ok(RefundSummary {
            order_id,
            payment_id: payment.id,
            payment_amount: payment.amount,
            completed_total,
            pending_total,
            remaining_refundable: payment.amount - payment.refunded_amount,
            refunds,
        })
    }

    /// Flips a pending refund to failed and gives its claim back to the
    /// payment, then recomputes the order's money statuses from what
    /// remains claimed.
    async fn release_claim(
        &self,
        txn: &DatabaseTransaction,
        pending: RefundModel,
    ) -> Result<RefundModel, ServiceError> {
        let now = Utc::now();
        let amount = pending.amount;
        let payment_id = pending.payment_id;
        let order_id = pending.order_id;

        let mut active: refund::ActiveModel = pending.into();
        active.status = Set(RefundStatus::Failed);
        active.updated_at = Set(now);
        let failed = active.update(txn).await?;

        Payment::update_many()
            .col_expr(
                payment::Column::RefundedAmount,
                Expr::col(payment::Column::RefundedAmount).sub(amount),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment_id))
            .exec(txn)
            .await?;

        self.recompute_order_money_status(txn, order_id, payment_id)
            .await?;

        Ok(failed)
    }

    /// Derives `order.refund_status` and `order.payment_status` from the
    /// payment's claimed amount and writes them when they changed.
    async fn recompute_order_money_status(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        payment_id: Uuid,
    ) -> Result<(), ServiceError> {
        let payment = Payment::find_by_id(payment_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        let order = Order::find_by_id(order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let (refund_status, payment_status) = if payment.refunded_amount >= payment.amount {
            (OrderRefundStatus::Full, OrderPaymentStatus::Refunded)
        } else if payment.refunded_amount > Decimal::ZERO {
            (OrderRefundStatus::Partial, OrderPaymentStatus::PartiallyRefunded)
        } else {
            (OrderRefundStatus::None, OrderPaymentStatus::Paid)
        };

        if order.refund_status == refund_status && order.payment_status == payment_status {
            return Ok(());
        }

        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.refund_status = Set(refund_status);
        active.payment_status = Set(payment_status);
        active.version = Set(version + 1);
        active.updated_at = Set(Utc::now());
        active.update(txn).await?;

        Ok(())
    }
}
