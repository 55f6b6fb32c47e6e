use crate::{
    config::AppConfig,
    entities::{
        cart, cart_item, product, Cart, CartItem, CartItemModel, CartModel, CartStatus, Product,
        ProductModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::coupons::CouponEngine,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::common::round_money;

/// Shopping cart service for guest and customer carts.
///
/// The `CartStore` provides cart management functionality including:
/// - One active cart per guest session or signed-in customer
/// - Adding, updating, and removing configured cart items
/// - Derived totals: carts store no prices, so every read prices lines
///   from the live catalog and re-evaluates the attached coupon
/// - Folding a guest cart into a customer cart at sign-in
///
/// # Examples
///
/// ```ignore
/// use storefront_core::services::carts::{AddItemRequest, CartStore};
///
/// let carts = CartStore::new(db, event_sender, config);
///
/// let cart = carts.get_or_create(Some("session_123".into()), None).await?;
/// let view = carts
///     .add_item(
///         cart.id,
///         AddItemRequest {
///             product_id,
///             quantity: 2,
///             configuration: Some(serde_json::json!({ "size": "L" })),
///         },
///     )
///     .await?;
///
/// assert_eq!(view.totals.item_count, 2);
/// ```
#[derive(Clone)]
pub struct CartStore {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CartStore {
    /// Creates a new `CartStore` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `config` - Application configuration (item quantity cap, cart TTL)
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

    /// Returns the caller's active cart, creating one if none exists.
    ///
    /// A signed-in caller is identified by `customer_id`; a guest by
    /// `session_id`. When both are supplied the customer identity wins and
    /// the session id is only recorded on a newly created cart. Publishes
    /// `CartCreated` when a cart is created.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Guest session identifier
    /// * `customer_id` - Signed-in customer identifier
    ///
    /// # Returns
    ///
    /// * `Ok(CartModel)` - The existing or freshly created active cart
    /// * `Err(ServiceError::ValidationError)` - Neither identifier supplied
    #[instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        session_id: Option<String>,
        customer_id: Option<Uuid>,
    ) -> Result<CartModel, ServiceError> {
        if session_id.is_none() && customer_id.is_none() {
            return Err(ServiceError::ValidationError(
                "A session id or customer id is required".to_string(),
            ));
        }

        if let Some(existing) =
            Self::find_active(&*self.db, session_id.as_deref(), customer_id).await?
        {
            return Ok(existing);
        }

        let cart = Self::create_cart(&*self.db, session_id, customer_id, &self.config).await?;

        self.event_sender
            .send_or_log(Event::CartCreated { cart_id: cart.id })
            .await;

        info!("Created cart: {}", cart.id);
        Ok(cart)
    }

    /// Adds a configured product to the cart, merging with an existing line.
    ///
    /// Lines are keyed by product and the canonical signature of the selected
    /// options, so adding the same configuration twice increments one line
    /// while a different size or colour opens a new one:
    /// - Cart must be `active`; the product must exist and be active
    /// - Quantity must stay within `1..=cart_item_max_quantity`, including
    ///   after a merge (a merge that would exceed the cap is rejected)
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the target cart
    /// * `request` - Product, quantity, and selected options
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart with freshly derived totals
    /// * `Err(ServiceError::NotFound)` - Cart or product not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart is not active
    /// * `Err(ServiceError::ValidationError)` - Inactive product or quantity
    ///   out of bounds
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        request: AddItemRequest,
    ) -> Result<CartView, ServiceError> {
        request.validate()?;
        let max = self.config.cart_item_max_quantity;
        if request.quantity > max {
            return Err(ServiceError::ValidationError(format!(
                "Quantity {} exceeds the per-item maximum of {}",
                request.quantity, max
            )));
        }

        let txn = self.db.begin().await?;

        let cart = Self::active_cart(&txn, cart_id).await?;

        let product = Product::find_by_id(request.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", request.product_id))
            })?;

        if !product.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not available",
                product.name
            )));
        }

        let configuration = request.configuration.unwrap_or_else(|| serde_json::json!({}));
        let key = configuration_key(&configuration);

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(request.product_id))
            .filter(cart_item::Column::ConfigurationKey.eq(key.clone()))
            .one(&txn)
            .await?;

        if let Some(item) = existing {
            let merged = item.quantity + request.quantity;
            if merged > max {
                return Err(ServiceError::ValidationError(format!(
                    "Cart already holds {} of {}; adding {} would exceed the per-item maximum of {}",
                    item.quantity, product.name, request.quantity, max
                )));
            }

            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(merged);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        } else {
            let item = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart_id),
                product_id: Set(request.product_id),
                quantity: Set(request.quantity),
                configuration: Set(configuration),
                configuration_key: Set(key),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            };
            item.insert(&txn).await?;
        }

        let cart = Self::touch(&txn, cart, &self.config).await?;
        let view = Self::build_view(&txn, cart).await?;
        txn.commit().await?;

        info!(
            "Added item to cart {}: product {} x{}",
            cart_id, request.product_id, request.quantity
        );
        Ok(view)
    }

    /// Replaces the quantity of a cart line.
    ///
    /// Special handling:
    /// - Quantity 0 removes the line
    /// - Positive quantities are bounds-checked against the per-item maximum
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the cart (for ownership validation)
    /// * `item_id` - UUID of the cart line to update
    /// * `quantity` - New quantity (0 to remove)
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart with freshly derived totals
    /// * `Err(ServiceError::NotFound)` - Cart or line not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart not active, or the
    ///   line belongs to a different cart
    /// * `Err(ServiceError::ValidationError)` - Quantity out of bounds
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        let max = self.config.cart_item_max_quantity;
        if quantity < 0 || quantity > max {
            return Err(ServiceError::ValidationError(format!(
                "Quantity must be between 0 and {}",
                max
            )));
        }

        let txn = self.db.begin().await?;

        let cart = Self::active_cart(&txn, cart_id).await?;
        let item = Self::owned_item(&txn, cart_id, item_id).await?;

        if quantity == 0 {
            CartItem::delete_by_id(item.id).exec(&txn).await?;
        } else {
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(Utc::now());
            item.update(&txn).await?;
        }

        let cart = Self::touch(&txn, cart, &self.config).await?;
        let view = Self::build_view(&txn, cart).await?;
        txn.commit().await?;

        Ok(view)
    }

    /// Removes a line from the cart.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the cart (for ownership validation)
    /// * `item_id` - UUID of the cart line to remove
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart with freshly derived totals
    /// * `Err(ServiceError::NotFound)` - Cart or line not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart not active, or the
    ///   line belongs to a different cart
    #[instrument(skip(self))]
    pub async fn remove_item(&self, cart_id: Uuid, item_id: Uuid) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Self::active_cart(&txn, cart_id).await?;
        let item = Self::owned_item(&txn, cart_id, item_id).await?;

        CartItem::delete_by_id(item.id).exec(&txn).await?;

        let cart = Self::touch(&txn, cart, &self.config).await?;
        let view = Self::build_view(&txn, cart).await?;
        txn.commit().await?;

        info!("Removed item {} from cart {}", item_id, cart_id);
        Ok(view)
    }

    /// Retrieves a cart with lines priced from the live catalog.
    ///
    /// Nothing monetary is stored on the cart, so this derives everything:
    /// line prices come from the current product rows, the subtotal from the
    /// lines, and the discount from re-validating the attached coupon against
    /// that subtotal. A coupon that has become ineligible since it was
    /// applied contributes a zero discount and a warning instead of an error;
    /// it stays attached in case eligibility returns.
    ///
    /// Lines whose product row has been deleted are dropped from the view.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the cart to retrieve
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - Cart, priced lines, derived totals
    /// * `Err(ServiceError::NotFound)` - Cart not found
    #[instrument(skip(self))]
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        Self::build_view(&*self.db, cart).await
    }

    /// Applies a coupon to the cart, replacing any previous one.
    ///
    /// The code is validated against the cart's current derived subtotal.
    /// Only the coupon reference is stored; the discount itself is re-derived
    /// on every read so later cart edits or coupon changes are always
    /// reflected. Publishes `CouponApplied` on success.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the target cart
    /// * `code` - Coupon code (matched case-insensitively)
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart with the discount applied
    /// * `Err(ServiceError::NotFound)` - Cart or coupon not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart is not active
    /// * `Err(ServiceError::ValidationError)` - Coupon ineligible; the
    ///   message lists every failing reason
    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, cart_id: Uuid, code: &str) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;

        let cart = Self::active_cart(&txn, cart_id).await?;

        let (_, subtotal, _) = Self::priced_lines(&txn, cart_id).await?;
        let coupon = CouponEngine::validate(&txn, code, subtotal).await?;

        let coupon_id = coupon.id;
        let coupon_code = coupon.code.clone();

        let mut active: cart::ActiveModel = cart.into();
        active.coupon_id = Set(Some(coupon_id));
        active.coupon_code = Set(Some(coupon_code.clone()));
        active.updated_at = Set(Utc::now());
        let cart = active.update(&txn).await?;

        let view = Self::build_view(&txn, cart).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CouponApplied {
                cart_id,
                coupon_id,
                code: coupon_code,
            })
            .await;

        Ok(view)
    }

    /// Detaches the coupon from the cart. No-op when none is attached.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the target cart
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The cart with totals derived without a discount
    /// * `Err(ServiceError::NotFound)` - Cart not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart is not active
    #[instrument(skip(self))]
    pub async fn remove_coupon(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = Self::active_cart(&*self.db, cart_id).await?;

        if cart.coupon_id.is_none() {
            return Self::build_view(&*self.db, cart).await;
        }

        let mut active: cart::ActiveModel = cart.into();
        active.coupon_id = Set(None);
        active.coupon_code = Set(None);
        active.updated_at = Set(Utc::now());
        let cart = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CouponRemoved { cart_id })
            .await;

        Self::build_view(&*self.db, cart).await
    }

    /// Moves an active cart into the checkout state.
    ///
    /// Item and coupon mutations require an `active` cart, so this freezes
    /// the contents while payment details are collected. Calling it again on
    /// a cart already in checkout is a no-op; a converted cart is refused.
    ///
    /// # Arguments
    ///
    /// * `cart_id` - UUID of the cart entering checkout
    ///
    /// # Returns
    ///
    /// * `Ok(CartModel)` - The cart in `checkout` state
    /// * `Err(ServiceError::NotFound)` - Cart not found
    /// * `Err(ServiceError::InvalidOperation)` - Cart already converted
    #[instrument(skip(self))]
    pub async fn begin_checkout(&self, cart_id: Uuid) -> Result<CartModel, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        match cart.status {
            CartStatus::Checkout => Ok(cart),
            CartStatus::Converted => Err(ServiceError::InvalidOperation(format!(
                "Cart {} has already been converted to an order",
                cart_id
            ))),
            CartStatus::Active => {
                let mut active: cart::ActiveModel = cart.into();
                active.status = Set(CartStatus::Checkout);
                active.updated_at = Set(Utc::now());
                let cart = active.update(&*self.db).await?;

                info!("Cart {} entered checkout", cart_id);
                Ok(cart)
            }
        }
    }

    /// Folds a guest session's cart into the customer's cart at sign-in.
    ///
    /// Runs in one transaction:
    /// - Lines with the same product and configuration merge; the summed
    ///   quantity is capped at the per-item maximum rather than rejected
    /// - Distinct guest lines move over unchanged
    /// - The guest coupon carries over only when the customer cart has none
    /// - The guest cart is deleted once emptied
    ///
    /// Idempotent: with no active guest cart for the session this simply
    /// returns the customer's cart (creating it if needed). Publishes
    /// `CartsMerged` after a real merge.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Guest session whose cart is folded in
    /// * `customer_id` - Customer the guest signed in as
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - The customer cart after the merge
    #[instrument(skip(self))]
    pub async fn merge_guest_cart(
        &self,
        session_id: &str,
        customer_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let txn = self.db.begin().await?;

        let guest = Cart::find()
            .filter(cart::Column::SessionId.eq(session_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .one(&txn)
            .await?;

        let mut created = false;
        let customer_cart = match Self::find_active(&txn, None, Some(customer_id)).await? {
            Some(cart) => cart,
            None => {
                created = true;
                Self::create_cart(&txn, None, Some(customer_id), &self.config).await?
            }
        };

        // A cart created while signed in carries both identifiers; nothing
        // to merge when the lookups land on the same row.
        let guest = match guest {
            Some(g) if g.id != customer_cart.id => g,
            _ => {
                let view = Self::build_view(&txn, customer_cart).await?;
                txn.commit().await?;
                if created {
                    self.event_sender
                        .send_or_log(Event::CartCreated { cart_id: view.cart.id })
                        .await;
                }
                return Ok(view);
            }
        };

        let max = self.config.cart_item_max_quantity;

        let guest_items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(guest.id))
            .all(&txn)
            .await?;

        let customer_items: HashMap<(Uuid, String), CartItemModel> = CartItem::find()
            .filter(cart_item::Column::CartId.eq(customer_cart.id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|item| ((item.product_id, item.configuration_key.clone()), item))
            .collect();

        for item in guest_items {
            let key = (item.product_id, item.configuration_key.clone());
            match customer_items.get(&key) {
                Some(existing) => {
                    let merged = (existing.quantity + item.quantity).min(max);
                    let mut target: cart_item::ActiveModel = existing.clone().into();
                    target.quantity = Set(merged);
                    target.updated_at = Set(Utc::now());
                    target.update(&txn).await?;

                    CartItem::delete_by_id(item.id).exec(&txn).await?;
                }
                None => {
                    let mut moved: cart_item::ActiveModel = item.into();
                    moved.cart_id = Set(customer_cart.id);
                    moved.updated_at = Set(Utc::now());
                    moved.update(&txn).await?;
                }
            }
        }

        let mut target: cart::ActiveModel = customer_cart.clone().into();
        if customer_cart.coupon_id.is_none() && guest.coupon_id.is_some() {
            target.coupon_id = Set(guest.coupon_id);
            target.coupon_code = Set(guest.coupon_code.clone());
        }
        target.updated_at = Set(Utc::now());
        target.expires_at = Set(Utc::now() + self.config.cart_ttl());
        let customer_cart = target.update(&txn).await?;

        Cart::delete_by_id(guest.id).exec(&txn).await?;

        let view = Self::build_view(&txn, customer_cart).await?;
        txn.commit().await?;

        if created {
            self.event_sender
                .send_or_log(Event::CartCreated { cart_id: view.cart.id })
                .await;
        }
        self.event_sender
            .send_or_log(Event::CartsMerged {
                guest_cart_id: guest.id,
                customer_cart_id: view.cart.id,
            })
            .await;

        info!(
            "Merged guest cart {} into customer cart {}",
            guest.id, view.cart.id
        );
        Ok(view)
    }

    // ----- internals -----

    async fn find_active(
        conn: &impl ConnectionTrait,
        session_id: Option<&str>,
        customer_id: Option<Uuid>,
    ) -> Result<Option<CartModel>, ServiceError> {
        let mut query = Cart::find().filter(cart::Column::Status.eq(CartStatus::Active));

        if let Some(customer) = customer_id {
            query = query.filter(cart::Column::CustomerId.eq(customer));
        } else if let Some(session) = session_id {
            query = query.filter(cart::Column::SessionId.eq(session));
        } else {
            return Ok(None);
        }

        Ok(query.one(conn).await?)
    }

    async fn create_cart(
        conn: &impl ConnectionTrait,
        session_id: Option<String>,
        customer_id: Option<Uuid>,
        config: &AppConfig,
    ) -> Result<CartModel, ServiceError> {
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            session_id: Set(session_id),
            customer_id: Set(customer_id),
            status: Set(CartStatus::Active),
            coupon_id: Set(None),
            coupon_code: Set(None),
            expires_at: Set(Utc::now() + config.cart_ttl()),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };

        Ok(cart.insert(conn).await?)
    }

    /// Loads the cart and requires it to be mutable (`active`).
    async fn active_cart(
        conn: &impl ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<CartModel, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(format!(
                "Cart {} is {}; it can only change while active",
                cart_id, cart.status
            )));
        }

        Ok(cart)
    }

    async fn owned_item(
        conn: &impl ConnectionTrait,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartItemModel, ServiceError> {
        let item = CartItem::find_by_id(item_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        Ok(item)
    }

    /// Stamps activity on the cart and extends its expiry.
    async fn touch(
        conn: &impl ConnectionTrait,
        cart: CartModel,
        config: &AppConfig,
    ) -> Result<CartModel, ServiceError> {
        let mut active: cart::ActiveModel = cart.into();
        active.updated_at = Set(Utc::now());
        active.expires_at = Set(Utc::now() + config.cart_ttl());
        Ok(active.update(conn).await?)
    }

    /// Prices every line from the live catalog.
    ///
    /// Returns the lines, their rounded subtotal, and the total unit count.
    /// Lines whose product row no longer exists are skipped with a warning.
    async fn priced_lines(
        conn: &impl ConnectionTrait,
        cart_id: Uuid,
    ) -> Result<(Vec<CartLine>, Decimal, i32), ServiceError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?;

        let product_ids: Vec<Uuid> = items.iter().map(|item| item.product_id).collect();
        let products: HashMap<Uuid, ProductModel> = if product_ids.is_empty() {
            HashMap::new()
        } else {
            Product::find()
                .filter(product::Column::Id.is_in(product_ids))
                .all(conn)
                .await?
                .into_iter()
                .map(|p| (p.id, p))
                .collect()
        };

        let mut lines = Vec::with_capacity(items.len());
        let mut subtotal = Decimal::ZERO;
        let mut item_count = 0;

        for item in items {
            let Some(product) = products.get(&item.product_id) else {
                warn!(
                    cart_id = %cart_id,
                    product_id = %item.product_id,
                    "cart line references a product that no longer exists; skipping"
                );
                continue;
            };

            let line_total = product.price * Decimal::from(item.quantity);
            subtotal += line_total;
            item_count += item.quantity;

            lines.push(CartLine {
                item_id: item.id,
                product_id: product.id,
                sku: product.sku.clone(),
                name: product.name.clone(),
                quantity: item.quantity,
                unit_price: product.price,
                line_total,
                configuration: item.configuration,
                product_active: product.is_active,
            });
        }

        Ok((lines, round_money(subtotal), item_count))
    }

    /// Derives the full view: priced lines, coupon re-evaluation, totals.
    async fn build_view(
        conn: &impl ConnectionTrait,
        cart: CartModel,
    ) -> Result<CartView, ServiceError> {
        let (lines, subtotal, item_count) = Self::priced_lines(conn, cart.id).await?;

        let (discount, coupon_warning) = match cart.coupon_code.as_deref() {
            Some(code) if cart.coupon_id.is_some() => {
                match CouponEngine::validate(conn, code, subtotal).await {
                    Ok(coupon) => (CouponEngine::calculate_discount(&coupon, subtotal), None),
                    Err(ServiceError::ValidationError(reason)) => (Decimal::ZERO, Some(reason)),
                    Err(ServiceError::NotFound(_)) => (
                        Decimal::ZERO,
                        Some(format!("Coupon {} no longer exists", code)),
                    ),
                    Err(other) => return Err(other),
                }
            }
            _ => (Decimal::ZERO, None),
        };

        let total = round_money(subtotal - discount);

        Ok(CartView {
            cart,
            items: lines,
            totals: CartTotals {
                subtotal,
                discount,
                item_count,
                total,
            },
            coupon_warning,
        })
    }
}

/// Canonical signature of a line's selected options.
///
/// Object keys are emitted in sorted order at every depth, so two
/// configurations that differ only in key order produce the same signature
/// and merge into one cart line. Arrays keep their order; for option lists
/// order is meaningful.
pub fn configuration_key(configuration: &serde_json::Value) -> String {
    canonicalize(configuration).to_string()
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, &serde_json::Value> =
                map.iter().collect();
            let mut out = serde_json::Map::new();
            for (key, value) in sorted {
                out.insert(key.clone(), canonicalize(value));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Input for adding a product to a cart
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    /// Selected options (variation and add-on choices). Defaults to none.
    pub configuration: Option<serde_json::Value>,
}

/// One cart line priced from the live catalog
#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub item_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub configuration: serde_json::Value,
    /// False when the product has been deactivated since it was added;
    /// the line still prices, but order creation will refuse it.
    pub product_active: bool,
}

/// Derived cart totals. Tax and shipping are order-time concerns.
#[derive(Debug, Clone, Serialize)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub item_count: i32,
    pub total: Decimal,
}

/// A cart with priced lines and derived totals
#[derive(Debug, Serialize)]
pub struct CartView {
    pub cart: CartModel,
    pub items: Vec<CartLine>,
    pub totals: CartTotals,
    /// Set when an attached coupon failed re-validation; its discount is
    /// suppressed but the coupon stays on the cart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_warning: Option<String>,
}
