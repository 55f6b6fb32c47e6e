use crate::{
    common::round_money,
    config::AppConfig,
    entities::{
        cart, cart_item, order, order_item, Cart, CartItem, CartStatus, Order, OrderItem,
        OrderItemModel, OrderModel, OrderPaymentStatus, OrderRefundStatus, OrderStatus,
        ShippingMethod,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::CatalogReader,
        coupons::CouponEngine,
        order_status,
        stock::{StockDemand, StockLedger},
    },
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, ModelTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref ORDER_CREATIONS: IntCounter =
        IntCounter::new("order_creations_total", "Total number of orders created")
            .expect("metric can be created");
    static ref ORDER_CREATION_FAILURES: IntCounter = IntCounter::new(
        "order_creation_failures_total",
        "Total number of order creation attempts that failed"
    )
    .expect("metric can be created");
}

/// Address snapshot stored on the order as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Street line is required"))]
    pub line1: String,
    pub line2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    pub state: Option<String>,
    #[validate(length(min = 1, message = "Postal code is required"))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 2, message = "Country must be a 2-letter code"))]
    pub country: String,
    /// Contact email; guest orders carry theirs here.
    #[validate(email(message = "A valid email is required"))]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub cart_id: Uuid,
    pub customer_id: Option<Uuid>,
    /// Guest contact email, folded into the shipping snapshot when the
    /// address itself has none.
    #[validate(email(message = "A valid email is required"))]
    pub email: Option<String>,
    #[validate]
    pub shipping_address: Address,
    /// Defaults to the shipping address.
    #[validate]
    pub billing_address: Option<Address>,
    pub shipping_method: ShippingMethod,
}

/// An order together with its line snapshots.
#[derive(Debug, Serialize)]
pub struct OrderWithItems {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

struct CreatedOrder {
    order: OrderModel,
    items: Vec<OrderItemModel>,
    coupon: Option<(Uuid, String)>,
}

/// Order lifecycle: creation from a cart, guarded status transitions, notes,
/// and lookups.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    catalog: Arc<dyn CatalogReader>,
}

impl OrderService {
    /// Creates a new order service instance
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        catalog: Arc<dyn CatalogReader>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
            catalog,
        }
    }

    /// Converts a cart into an order inside a single transaction.
    ///
    /// The transaction claims the cart (`active`/`checkout` -> `converted`
    /// with a guarded update, so a duplicate submission loses), re-validates
    /// every line against the live catalog, prices the lines from current
    /// prices, decrements stock, redeems the attached coupon, and writes the
    /// order with its item snapshots. Any failure rolls the whole thing
    /// back: no order, no stock movement, no coupon usage.
    ///
    /// `order.created` (and `coupon.applied` when a coupon was redeemed) are
    /// published only after the commit.
    #[instrument(skip(self, request), fields(cart_id = %request.cart_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderWithItems, ServiceError> {
        request.validate()?;
        let cart_id = request.cart_id;

        // The transaction closure must return a future that borrows nothing
        // from `self`; the service is a bundle of `Arc`s, so a clone moves
        // an owned handle in instead.
        let this = self.clone();
        let outcome = self
            .db
            .transaction::<_, CreatedOrder, ServiceError>(move |txn| {
                Box::pin(async move { this.create_order_in_txn(txn, request).await })
            })
            .await;

        let created = match outcome {
            Ok(created) => created,
            Err(e) => {
                ORDER_CREATION_FAILURES.inc();
                return Err(e.into());
            }
        };
        ORDER_CREATIONS.inc();

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: created.order.id,
                order_number: created.order.order_number.clone(),
                total: created.order.total_amount,
            })
            .await;

        if let Some((coupon_id, code)) = created.coupon {
            self.event_sender
                .send_or_log(Event::CouponApplied {
                    cart_id,
                    coupon_id,
                    code,
                })
                .await;
        }

        info!(
            order_id = %created.order.id,
            order_number = %created.order.order_number,
            total = %created.order.total_amount,
            "Order created"
        );

        Ok(OrderWithItems {
            order: created.order,
            items: created.items,
        })
    }

    async fn create_order_in_txn(
        &self,
        txn: &DatabaseTransaction,
        request: CreateOrderRequest,
    ) -> Result<CreatedOrder, ServiceError> {
        let CreateOrderRequest {
            cart_id,
            customer_id,
            email,
            shipping_address,
            billing_address,
            shipping_method,
        } = request;

        let cart = Cart::find_by_id(cart_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status == CartStatus::Converted {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been converted to an order",
                cart_id
            )));
        }

        // Claim the cart first. The guarded update lets exactly one of two
        // racing submissions proceed; the loser rolls back here before any
        // stock or coupon movement.
        let claim = Cart::update_many()
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Converted))
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::Id.eq(cart_id))
            .filter(
                cart::Column::Status.is_in([CartStatus::Active, CartStatus::Checkout]),
            )
            .exec(txn)
            .await?;

        if claim.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been converted to an order",
                cart_id
            )));
        }

        let cart_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(txn)
            .await?;

        if cart_items.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "Cart {} is empty",
                cart_id
            )));
        }

        let max = self.config.cart_item_max_quantity;
        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let mut demands = Vec::with_capacity(cart_items.len());
        let mut item_rows = Vec::with_capacity(cart_items.len());
        let mut subtotal = Decimal::ZERO;
        let mut currency: Option<String> = None;

        for item in &cart_items {
            let product = self.catalog.live_product(txn, item.product_id).await?;

            if !product.is_active {
                return Err(ServiceError::ValidationError(format!(
                    "{} is no longer available",
                    product.name
                )));
            }
            if item.quantity < 1 || item.quantity > max {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity {} for {} is outside 1..={}",
                    item.quantity, product.name, max
                )));
            }
            match &currency {
                None => currency = Some(product.currency.clone()),
                Some(c) if *c != product.currency => {
                    return Err(ServiceError::ValidationError(
                        "Cart mixes product currencies".to_string(),
                    ));
                }
                Some(_) => {}
            }

            let total_price = product.price * Decimal::from(item.quantity);
            subtotal += total_price;

            demands.push(StockDemand {
                product_id: product.id,
                name: product.name.clone(),
                quantity: item.quantity,
            });
            item_rows.push(order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                sku: Set(product.sku),
                name: Set(product.name),
                quantity: Set(item.quantity),
                unit_price: Set(product.price),
                total_price: Set(total_price),
                created_at: Set(now),
            });
        }
        let subtotal = round_money(subtotal);

        StockLedger::commit_all(txn, &demands).await?;

        let customer_id = customer_id.or(cart.customer_id);

        let mut discount = Decimal::ZERO;
        let mut free_shipping = false;
        let mut coupon: Option<(Uuid, String)> = None;
        if let Some(code) = cart.coupon_code.as_deref() {
            let model = CouponEngine::validate(txn, code, subtotal).await?;
            discount = CouponEngine::calculate_discount(&model, subtotal);
            free_shipping = CouponEngine::grants_free_shipping(&model);
            CouponEngine::redeem(txn, &model, order_id, customer_id, discount).await?;
            coupon = Some((model.id, model.code));
        }

        // Tax applies to the undiscounted subtotal.
        let tax_total = round_money(subtotal * self.config.tax_rate());
        let shipping_total = if free_shipping {
            Decimal::ZERO
        } else {
            shipping_method.base_rate()
        };
        let total_amount = round_money(subtotal - discount + tax_total + shipping_total);

        let mut shipping_address = shipping_address;
        if shipping_address.email.is_none() {
            shipping_address.email = email;
        }
        let billing_address = billing_address.unwrap_or_else(|| shipping_address.clone());

        let shipping_json = serde_json::to_value(&shipping_address)
            .map_err(|e| ServiceError::ValidationError(format!("Invalid shipping address: {}", e)))?;
        let billing_json = serde_json::to_value(&billing_address)
            .map_err(|e| ServiceError::ValidationError(format!("Invalid billing address: {}", e)))?;

        let order_row = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number_for(order_id)),
            customer_id: Set(customer_id),
            cart_id: Set(Some(cart_id)),
            status: Set(OrderStatus::Pending),
            payment_status: Set(OrderPaymentStatus::Pending),
            refund_status: Set(OrderRefundStatus::None),
            currency: Set(currency.unwrap_or_else(|| "USD".to_string())),
            subtotal: Set(subtotal),
            discount_total: Set(discount),
            tax_total: Set(tax_total),
            shipping_total: Set(shipping_total),
            total_amount: Set(total_amount),
            coupon_id: Set(coupon.as_ref().map(|(id, _)| *id)),
            coupon_code: Set(coupon.as_ref().map(|(_, code)| code.clone())),
            shipping_method: Set(shipping_method),
            shipping_address: Set(shipping_json),
            billing_address: Set(billing_json),
            notes: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let order_model = order_row.insert(txn).await?;

        let mut items = Vec::with_capacity(item_rows.len());
        for row in item_rows {
            items.push(row.insert(txn).await?);
        }

        Ok(CreatedOrder {
            order: order_model,
            items,
            coupon,
        })
    }

    /// Moves the order through its fulfillment lifecycle.
    ///
    /// Illegal moves raise `InvalidTransition`; a same-status call is a
    /// no-op. Cancellation returns the order's committed stock to inventory.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status.clone();
        if old_status == new_status {
            return Ok(order);
        }

        order_status::ensure_transition(&old_status, &new_status)?;

        let mut restored: Vec<StockDemand> = Vec::new();
        if new_status == OrderStatus::Cancelled {
            let items = OrderItem::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(&txn)
                .await?;
            restored = items
                .iter()
                .map(|item| StockDemand {
                    product_id: item.product_id,
                    name: item.name.clone(),
                    quantity: item.quantity,
                })
                .collect();
            StockLedger::restore_all(&txn, &restored).await?;
        }

        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status.clone());
        active.version = Set(version + 1);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;

        txn.commit().await?;

        for demand in &restored {
            self.event_sender
                .send_or_log(Event::StockRestored {
                    product_id: demand.product_id,
                    quantity: demand.quantity,
                    order_id,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        info!(order_id = %order_id, from = %old_status, to = %new_status, "Order status updated");
        Ok(updated)
    }

    /// Records payment capture on the order, inside the caller's transaction.
    ///
    /// `payment_status` moves to `paid`; a still-pending order advances to
    /// `processing` at the same time. Returns the fulfillment status the
    /// order held before the call so the caller can publish the right
    /// lifecycle event after its commit.
    pub(crate) async fn mark_paid(
        txn: &impl ConnectionTrait,
        order_id: Uuid,
    ) -> Result<(OrderStatus, OrderModel), ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_status != OrderPaymentStatus::Pending {
            return Err(ServiceError::PaymentState(format!(
                "Order {} is already {}",
                order_id, order.payment_status
            )));
        }

        let version = order.version;
        let previous = order.status.clone();
        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(OrderPaymentStatus::Paid);
        if previous == OrderStatus::Pending {
            active.status = Set(OrderStatus::Processing);
        }
        active.version = Set(version + 1);
        active.updated_at = Set(Utc::now());

        let updated = active.update(txn).await?;
        Ok((previous, updated))
    }

    /// Appends to the order's notes side channel without touching status.
    #[instrument(skip(self, note), fields(order_id = %order_id))]
    pub async fn add_note(&self, order_id: Uuid, note: &str) -> Result<OrderModel, ServiceError> {
        let trimmed = note.trim();
        if trimmed.is_empty() {
            return Err(ServiceError::ValidationError(
                "Note must not be empty".to_string(),
            ));
        }

        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let combined = match &order.notes {
            Some(existing) => format!("{}\n{}", existing, trimmed),
            None => trimmed.to_string(),
        };

        let version = order.version;
        let mut active: order::ActiveModel = order.into();
        active.notes = Set(Some(combined));
        active.version = Set(version + 1);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::OrderNoteAdded { order_id })
            .await;

        Ok(updated)
    }

    /// Retrieves an order by ID
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Retrieves an order together with its line snapshots
    pub async fn get_order_with_items(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = self.get_order(order_id).await?;
        let items = order.find_related(OrderItem).all(&*self.db).await?;

        Ok(OrderWithItems { order, items })
    }

    /// Lists orders newest-first, optionally scoped to one customer
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        customer_id: Option<Uuid>,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let mut query = Order::find();
        if let Some(customer) = customer_id {
            query = query.filter(order::Column::CustomerId.eq(customer));
        }

        let paginator = query
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok((orders, total))
    }
}

/// Human-facing order reference derived from the order id.
fn order_number_for(order_id: Uuid) -> String {
    format!(
        "ORD-{}",
        order_id.simple().to_string()[..8].to_uppercase()
    )
}
