//! Payment intents, gateway execution, and webhook reconciliation.
//!
//! A payment is created as a `pending` intent against an order, claimed
//! into `processing` by exactly one executor, charged at the gateway
//! outside any transaction, then settled to `completed` or `failed`.
//! Asynchronous gateway webhooks can resolve an in-flight payment first;
//! every settle step is a guarded update so the two paths cannot both win.

pub mod validation;
pub mod webhooks;

pub use validation::PaymentPrecheck;
pub use webhooks::{WebhookEvent, WebhookOutcome};

use crate::{
    config::AppConfig,
    entities::{payment, OrderStatus, Payment, PaymentModel, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::OrderService,
};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref PAYMENT_CAPTURES: IntCounter =
        IntCounter::new("payment_captures_total", "Total number of payments captured")
            .expect("metric can be created");
    static ref PAYMENT_FAILURES: IntCounter = IntCounter::new(
        "payment_failures_total",
        "Total number of payment attempts that failed"
    )
    .expect("metric can be created");
}

/// Successful charge at the processor.
#[derive(Debug, Clone)]
pub struct GatewayCharge {
    pub transaction_id: String,
}

/// Successful refund at the processor.
#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub refund_id: String,
}

/// Boundary to the payment processor. Implementations must be safe to call
/// outside a database transaction; the caller records the result afterwards.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        amount: Decimal,
        currency: &str,
        payer_token: &str,
    ) -> Result<GatewayCharge, ServiceError>;

    async fn refund(
        &self,
        transaction_id: &str,
        amount: Decimal,
    ) -> Result<GatewayRefund, ServiceError>;
}

/// Gateway for development and tests. Approves everything and fabricates
/// processor identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxGateway;

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn charge(
        &self,
        _amount: Decimal,
        _currency: &str,
        _payer_token: &str,
    ) -> Result<GatewayCharge, ServiceError> {
        Ok(GatewayCharge {
            transaction_id: format!("sandbox_ch_{}", Uuid::new_v4().simple()),
        })
    }

    async fn refund(
        &self,
        _transaction_id: &str,
        _amount: Decimal,
    ) -> Result<GatewayRefund, ServiceError> {
        Ok(GatewayRefund {
            refund_id: format!("sandbox_re_{}", Uuid::new_v4().simple()),
        })
    }
}

#[derive(Debug, Clone, serde::Deserialize, Validate)]
pub struct CreatePaymentRequest {
    pub order_id: Uuid,
    /// Client's view of what it is about to pay. Checked against the order
    /// total; the stored intent always carries the order's own amount.
    pub amount: Decimal,
    #[validate(length(min = 3, max = 3, message = "Currency must be a 3-letter code"))]
    pub currency: String,
    pub method: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, Validate)]
pub struct ExecutePaymentRequest {
    #[validate(length(min = 1, message = "Payer token is required"))]
    pub payer_token: String,
}

/// Capture applied by a webhook, reported out of the transaction so events
/// fire only after commit.
struct CapturedPayment {
    payment_id: Uuid,
    order_id: Uuid,
    amount: Decimal,
    previous_status: OrderStatus,
    new_status: OrderStatus,
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
            gateway,
        }
    }

    /// Creates a pending payment intent for an order.
    ///
    /// An earlier pending intent on the same order is cancelled in the same
    /// transaction; the returned warnings name it. Completed or in-flight
    /// payments block creation outright.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_payment(
        &self,
        request: CreatePaymentRequest,
    ) -> Result<(PaymentModel, Vec<String>), ServiceError> {
        request.validate()?;

        // The transaction closure must return a future that borrows nothing
        // from `self`; the service is a bundle of `Arc`s, so a clone moves
        // an owned handle in instead.
        let this = self.clone();
        let (created, precheck) = self
            .db
            .transaction::<_, (PaymentModel, PaymentPrecheck), ServiceError>(move |txn| {
                Box::pin(async move { this.create_payment_in_txn(txn, request).await })
            })
            .await?;

        info!(payment_id = %created.id, order_id = %created.order_id, "Created payment intent");
        for warning in &precheck.warnings {
            warn!(payment_id = %created.id, "{}", warning);
        }
        self.event_sender
            .send_or_log(Event::PaymentCreated {
                payment_id: created.id,
                order_id: created.order_id,
            })
            .await;

        Ok((created, precheck.warnings))
    }

    async fn create_payment_in_txn(
        &self,
        txn: &DatabaseTransaction,
        request: CreatePaymentRequest,
    ) -> Result<(PaymentModel, PaymentPrecheck), ServiceError> {
        let (order, precheck) = validation::validate_for_creation(
            txn,
            request.order_id,
            request.amount,
            &request.currency,
            &self.config,
        )
        .await?;

        if let Some(superseded) = precheck.superseded {
            let cancelled = Payment::update_many()
                .col_expr(
                    payment::Column::Status,
                    Expr::value(PaymentStatus::Cancelled),
                )
                .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(payment::Column::Id.eq(superseded))
                .filter(payment::Column::Status.eq(PaymentStatus::Pending))
                .exec(txn)
                .await?;
            if cancelled.rows_affected == 0 {
                // The old intent moved between the precheck read and here;
                // execution or a webhook got to it first.
                return Err(ServiceError::PaymentState(format!(
                    "Payment {} for order {} changed state during creation",
                    superseded, request.order_id
                )));
            }
        }

        let now = Utc::now();
        let intent = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            amount: Set(order.total_amount),
            currency: Set(order.currency.to_uppercase()),
            status: Set(PaymentStatus::Pending),
            method: Set(request.method),
            transaction_id: Set(None),
            refunded_amount: Set(Decimal::ZERO),
            error_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Ok((intent.insert(txn).await?, precheck))
    }

    /// Executes a pending payment against the gateway.
    ///
    /// Runs in three phases. A first transaction validates and claims the
    /// intent with a guarded pending-to-processing update, so concurrent
    /// executors get exactly one winner. The gateway charge then runs with
    /// no transaction open. A second transaction settles the claim and marks
    /// the order paid. A decline settles the payment as failed and returns
    /// the gateway's error.
    #[instrument(skip(self, request), fields(payment_id = %payment_id, order_id = %order_id))]
    pub async fn execute_payment(
        &self,
        payment_id: Uuid,
        order_id: Uuid,
        request: ExecutePaymentRequest,
    ) -> Result<PaymentModel, ServiceError> {
        request.validate()?;

        // Cloned so the transaction future owns its handle instead of
        // borrowing `self`.
        let config = self.config.clone();
        let claimed = self
            .db
            .transaction::<_, PaymentModel, ServiceError>(move |txn| {
                Box::pin(async move {
                    let payment = validation::validate_for_execution(
                        txn,
                        payment_id,
                        order_id,
                        &config,
                    )
                    .await?;

                    let claim = Payment::update_many()
                        .col_expr(
                            payment::Column::Status,
                            Expr::value(PaymentStatus::Processing),
                        )
                        .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                        .filter(payment::Column::Id.eq(payment_id))
                        .filter(payment::Column::Status.eq(PaymentStatus::Pending))
                        .exec(txn)
                        .await?;
                    if claim.rows_affected == 0 {
                        return Err(ServiceError::PaymentState(format!(
                            "Payment {} is already being executed",
                            payment_id
                        )));
                    }
                    Ok(payment)
                })
            })
            .await?;

        let charge = match self
            .gateway
            .charge(claimed.amount, &claimed.currency, &request.payer_token)
            .await
        {
            Ok(charge) => charge,
            Err(gateway_err) => {
                self.record_gateway_failure(payment_id, order_id, &gateway_err)
                    .await;
                return Err(gateway_err);
            }
        };

        let (previous_status, order_status, settled) = self
            .db
            .transaction::<_, (OrderStatus, OrderStatus, PaymentModel), ServiceError>(|txn| {
                let transaction_id = charge.transaction_id.clone();
                Box::pin(async move {
                    let settle = Payment::update_many()
                        .col_expr(
                            payment::Column::Status,
                            Expr::value(PaymentStatus::Completed),
                        )
                        .col_expr(
                            payment::Column::TransactionId,
                            Expr::value(Some(transaction_id)),
                        )
                        .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                        .filter(payment::Column::Id.eq(payment_id))
                        .filter(payment::Column::Status.eq(PaymentStatus::Processing))
                        .exec(txn)
                        .await?;
                    if settle.rows_affected == 0 {
                        // A webhook resolved the payment while the charge was
                        // in flight. The processor has the charge either way;
                        // the recorded transaction id is whatever landed first.
                        return Err(ServiceError::PaymentState(format!(
                            "Payment {} left the processing state during gateway execution",
                            payment_id
                        )));
                    }

                    let payment = Payment::find_by_id(payment_id).one(txn).await?.ok_or_else(
                        || ServiceError::NotFound(format!("Payment {} not found", payment_id)),
                    )?;
                    let (previous, order) = OrderService::mark_paid(txn, order_id).await?;
                    Ok((previous, order.status, payment))
                })
            })
            .await?;

        PAYMENT_CAPTURES.inc();
        info!(payment_id = %settled.id, amount = %settled.amount, "Payment captured");
        self.event_sender
            .send_or_log(Event::PaymentCaptured {
                payment_id: settled.id,
                order_id,
                amount: settled.amount,
            })
            .await;
        if previous_status != order_status {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id,
                    old_status: previous_status.to_string(),
                    new_status: order_status.to_string(),
                })
                .await;
        }

        Ok(settled)
    }

    /// Settles a declined charge as failed, outside the execution path's
    /// transactions. The guard keeps a webhook's earlier verdict intact.
    async fn record_gateway_failure(
        &self,
        payment_id: Uuid,
        order_id: Uuid,
        gateway_err: &ServiceError,
    ) {
        let message = gateway_err.to_string();
        let result = Payment::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(
                payment::Column::ErrorMessage,
                Expr::value(Some(message.clone())),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Processing))
            .exec(self.db.as_ref())
            .await;

        match result {
            Ok(updated) if updated.rows_affected > 0 => {
                PAYMENT_FAILURES.inc();
                warn!(payment_id = %payment_id, error = %message, "Gateway declined payment");
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        payment_id,
                        order_id,
                    })
                    .await;
            }
            Ok(_) => {
                warn!(
                    payment_id = %payment_id,
                    "Payment left processing before the decline could be recorded"
                );
            }
            Err(db_err) => {
                error!(payment_id = %payment_id, error = %db_err, "Could not record gateway decline");
            }
        }
    }

    /// Applies a gateway webhook.
    ///
    /// The signature is verified first when a webhook secret is configured.
    /// Redeliveries of an already-applied event acknowledge as
    /// [`WebhookOutcome::Duplicate`]; event kinds this engine does not
    /// consume acknowledge as [`WebhookOutcome::Ignored`].
    #[instrument(skip(self, headers, body))]
    pub async fn handle_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, ServiceError> {
        if let Some(secret) = self.config.webhook_secret.as_deref() {
            webhooks::verify_signature(headers, body, secret, self.config.webhook_tolerance_secs)?;
        }

        let event = webhooks::parse_event(body)?;
        match event.kind.as_str() {
            "payment.captured" => self.apply_captured(event).await,
            "payment.failed" => self.apply_failed(event).await,
            other => {
                info!(kind = %other, "Ignoring webhook event kind");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn apply_captured(&self, event: WebhookEvent) -> Result<WebhookOutcome, ServiceError> {
        let event_payment_id = event.payment_id;
        let applied = self
            .db
            .transaction::<_, Option<CapturedPayment>, ServiceError>(|txn| {
                Box::pin(async move {
                    let payment = Payment::find_by_id(event.payment_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Payment {} not found",
                                event.payment_id
                            ))
                        })?;

                    match payment.status {
                        PaymentStatus::Completed => {
                            if event.transaction_id.is_none()
                                || payment.transaction_id == event.transaction_id
                            {
                                return Ok(None);
                            }
                            Err(ServiceError::PaymentState(format!(
                                "Payment {} is already completed under a different transaction",
                                payment.id
                            )))
                        }
                        PaymentStatus::Failed | PaymentStatus::Cancelled => {
                            Err(ServiceError::PaymentState(format!(
                                "Payment {} is {} and cannot be captured",
                                payment.id, payment.status
                            )))
                        }
                        PaymentStatus::Pending | PaymentStatus::Processing => {
                            let settle = Payment::update_many()
                                .col_expr(
                                    payment::Column::Status,
                                    Expr::value(PaymentStatus::Completed),
                                )
                                .col_expr(
                                    payment::Column::TransactionId,
                                    Expr::value(event.transaction_id.clone()),
                                )
                                .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                                .filter(payment::Column::Id.eq(payment.id))
                                .filter(payment::Column::Status.is_in([
                                    PaymentStatus::Pending,
                                    PaymentStatus::Processing,
                                ]))
                                .exec(txn)
                                .await?;
                            if settle.rows_affected == 0 {
                                return Err(ServiceError::PaymentState(format!(
                                    "Payment {} changed state while the webhook was applied",
                                    payment.id
                                )));
                            }

                            let (previous, order) =
                                OrderService::mark_paid(txn, payment.order_id).await?;
                            Ok(Some(CapturedPayment {
                                payment_id: payment.id,
                                order_id: order.id,
                                amount: payment.amount,
                                previous_status: previous,
                                new_status: order.status,
                            }))
                        }
                    }
                })
            })
            .await?;

        let Some(captured) = applied else {
            info!(payment_id = %event_payment_id, "Duplicate capture webhook acknowledged");
            return Ok(WebhookOutcome::Duplicate);
        };

        PAYMENT_CAPTURES.inc();
        info!(payment_id = %captured.payment_id, "Payment captured via webhook");
        self.event_sender
            .send_or_log(Event::PaymentCaptured {
                payment_id: captured.payment_id,
                order_id: captured.order_id,
                amount: captured.amount,
            })
            .await;
        if captured.previous_status != captured.new_status {
            self.event_sender
                .send_or_log(Event::OrderStatusChanged {
                    order_id: captured.order_id,
                    old_status: captured.previous_status.to_string(),
                    new_status: captured.new_status.to_string(),
                })
                .await;
        }

        Ok(WebhookOutcome::Applied)
    }

    async fn apply_failed(&self, event: WebhookEvent) -> Result<WebhookOutcome, ServiceError> {
        let event_payment_id = event.payment_id;
        let applied = self
            .db
            .transaction::<_, Option<(Uuid, Uuid)>, ServiceError>(|txn| {
                Box::pin(async move {
                    let payment = Payment::find_by_id(event.payment_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Payment {} not found",
                                event.payment_id
                            ))
                        })?;

                    match payment.status {
                        // A cancelled intent owes nothing; acknowledge so the
                        // gateway stops redelivering.
                        PaymentStatus::Failed | PaymentStatus::Cancelled => Ok(None),
                        PaymentStatus::Completed => Err(ServiceError::PaymentState(format!(
                            "Payment {} is completed; a failure webhook cannot undo it",
                            payment.id
                        ))),
                        PaymentStatus::Pending | PaymentStatus::Processing => {
                            let failed = Payment::update_many()
                                .col_expr(
                                    payment::Column::Status,
                                    Expr::value(PaymentStatus::Failed),
                                )
                                .col_expr(
                                    payment::Column::ErrorMessage,
                                    Expr::value(event.error_message.clone()),
                                )
                                .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                                .filter(payment::Column::Id.eq(payment.id))
                                .filter(payment::Column::Status.is_in([
                                    PaymentStatus::Pending,
                                    PaymentStatus::Processing,
                                ]))
                                .exec(txn)
                                .await?;
                            if failed.rows_affected == 0 {
                                return Err(ServiceError::PaymentState(format!(
                                    "Payment {} changed state while the webhook was applied",
                                    payment.id
                                )));
                            }
                            Ok(Some((payment.id, payment.order_id)))
                        }
                    }
                })
            })
            .await?;

        let Some((payment_id, order_id)) = applied else {
            info!(payment_id = %event_payment_id, "Duplicate failure webhook acknowledged");
            return Ok(WebhookOutcome::Duplicate);
        };

        PAYMENT_FAILURES.inc();
        warn!(payment_id = %payment_id, "Payment failed via webhook");
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                payment_id,
                order_id,
            })
            .await;

        Ok(WebhookOutcome::Applied)
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> Result<PaymentModel, ServiceError> {
        Payment::find_by_id(payment_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    /// All payments recorded against an order, newest first.
    pub async fn list_payments_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<PaymentModel>, ServiceError> {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }
}
