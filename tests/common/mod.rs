// Shared harness for the integration suites. Not every binary uses every
// helper.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use storefront_core::{
    config::AppConfig,
    db,
    entities::{coupon, product, CouponModel, DiscountType, Order, Payment, ProductModel},
    errors::ServiceError,
    events,
    services::{
        carts::AddItemRequest,
        factory::{ServiceContainer, ServiceFactory},
        orders::{Address, CreateOrderRequest, OrderWithItems},
        payments::{
            CreatePaymentRequest, ExecutePaymentRequest, GatewayCharge, GatewayRefund,
            PaymentGateway, PaymentService,
        },
    },
    AppState,
};
use storefront_core::entities::{OrderModel, PaymentModel, ShippingMethod};
use uuid::Uuid;

/// Harness backing each test with its own file-based SQLite database.
///
/// Every `TestApp` gets a uniquely named database under the system temp
/// directory, so test binaries and tests within a binary can run in
/// parallel without stepping on each other. The file is removed on drop.
pub struct TestApp {
    pub state: AppState,
    db_file: PathBuf,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let db_file = std::env::temp_dir().join(format!(
            "storefront_test_{}.db",
            Uuid::new_v4().simple()
        ));

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_file.display()),
            "testing".to_string(),
        );
        cfg.db_max_connections = 5;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");

        let db = Arc::new(pool);
        let config = Arc::new(cfg);

        let (event_sender, event_rx) = events::event_channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx, Vec::new()));

        let factory = ServiceFactory::new(db, Arc::new(event_sender), config);
        let state = AppState::from_factory(&factory);

        Self {
            state,
            db_file,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.state.services
    }

    /// A payment service over the same database but a different gateway.
    pub fn payment_service_using(&self, gateway: Arc<dyn PaymentGateway>) -> PaymentService {
        PaymentService::new(
            self.state.db.clone(),
            self.state.event_sender.clone(),
            self.state.config.clone(),
            gateway,
        )
    }

    /// A payment service whose webhooks require a valid signature.
    pub fn payment_service_with_secret(&self, secret: &str) -> PaymentService {
        let mut cfg = (*self.state.config).clone();
        cfg.webhook_secret = Some(secret.to_string());
        PaymentService::new(
            self.state.db.clone(),
            self.state.event_sender.clone(),
            Arc::new(cfg),
            Arc::new(storefront_core::services::payments::SandboxGateway),
        )
    }

    pub async fn seed_product(&self, sku: &str, price: Decimal, stock: i32) -> ProductModel {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("Test Product {}", sku)),
            description: Set(None),
            price: Set(price),
            currency: Set("USD".to_string()),
            stock_quantity: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("failed to seed product")
    }

    /// Base coupon row; tests tweak fields before handing it to
    /// [`TestApp::seed_coupon`].
    pub fn coupon(code: &str, discount_type: DiscountType, value: Decimal) -> coupon::ActiveModel {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            description: Set(None),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            min_order_amount: Set(None),
            max_discount_amount: Set(None),
            usage_limit: Set(None),
            usage_count: Set(0),
            per_user_limit: Set(None),
            is_active: Set(true),
            valid_from: Set(None),
            valid_until: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    pub async fn seed_coupon(&self, active: coupon::ActiveModel) -> CouponModel {
        active
            .insert(&*self.state.db)
            .await
            .expect("failed to seed coupon")
    }

    /// A guest cart holding `quantity` of `product`, ready for checkout.
    pub async fn cart_with(&self, product: &ProductModel, quantity: i32) -> Uuid {
        let cart = self
            .services()
            .carts
            .get_or_create(Some(format!("session-{}", Uuid::new_v4().simple())), None)
            .await
            .expect("failed to create cart");
        self.services()
            .carts
            .add_item(
                cart.id,
                AddItemRequest {
                    product_id: product.id,
                    quantity,
                    configuration: None,
                },
            )
            .await
            .expect("failed to add item");
        cart.id
    }

    /// Drives a cart with `quantity` of `product` through order creation.
    pub async fn placed_order(&self, product: &ProductModel, quantity: i32) -> OrderWithItems {
        let cart_id = self.cart_with(product, quantity).await;
        self.services()
            .orders
            .create_order(order_request(cart_id))
            .await
            .expect("failed to create order")
    }

    /// An order taken all the way through payment capture.
    pub async fn paid_order(
        &self,
        product: &ProductModel,
        quantity: i32,
    ) -> (OrderModel, PaymentModel) {
        let placed = self.placed_order(product, quantity).await;
        let (intent, _) = self
            .services()
            .payments
            .create_payment(CreatePaymentRequest {
                order_id: placed.order.id,
                amount: placed.order.total_amount,
                currency: placed.order.currency.clone(),
                method: Some("card".to_string()),
            })
            .await
            .expect("failed to create payment");
        let payment = self
            .services()
            .payments
            .execute_payment(
                intent.id,
                placed.order.id,
                ExecutePaymentRequest {
                    payer_token: "tok_test".to_string(),
                },
            )
            .await
            .expect("failed to execute payment");
        let order = self
            .services()
            .orders
            .get_order(placed.order.id)
            .await
            .expect("failed to reload order");
        (order, payment)
    }

    /// Backdates an order's creation stamp, for age-window tests.
    pub async fn age_order(&self, order_id: Uuid, by: Duration) {
        Order::update_many()
            .col_expr(
                storefront_core::entities::order::Column::CreatedAt,
                Expr::value(Utc::now() - by),
            )
            .filter(storefront_core::entities::order::Column::Id.eq(order_id))
            .exec(&*self.state.db)
            .await
            .expect("failed to age order");
    }

    /// Backdates a payment's creation stamp, for window tests.
    pub async fn age_payment(&self, payment_id: Uuid, by: Duration) {
        Payment::update_many()
            .col_expr(
                storefront_core::entities::payment::Column::CreatedAt,
                Expr::value(Utc::now() - by),
            )
            .filter(storefront_core::entities::payment::Column::Id.eq(payment_id))
            .exec(&*self.state.db)
            .await
            .expect("failed to age payment");
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        let _ = std::fs::remove_file(&self.db_file);
    }
}

pub fn test_address() -> Address {
    Address {
        name: "Alex Doe".to_string(),
        line1: "1 Main St".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        state: Some("IL".to_string()),
        postal_code: "62701".to_string(),
        country: "US".to_string(),
        email: None,
    }
}

pub fn order_request(cart_id: Uuid) -> CreateOrderRequest {
    CreateOrderRequest {
        cart_id,
        customer_id: None,
        email: Some("buyer@example.com".to_string()),
        shipping_address: test_address(),
        billing_address: None,
        shipping_method: ShippingMethod::Standard,
    }
}

/// Gateway that declines every charge, for failure-path tests.
pub struct DecliningGateway;

#[async_trait]
impl PaymentGateway for DecliningGateway {
    async fn charge(
        &self,
        _amount: Decimal,
        _currency: &str,
        _payer_token: &str,
    ) -> Result<GatewayCharge, ServiceError> {
        Err(ServiceError::ExternalService("card declined".to_string()))
    }

    async fn refund(
        &self,
        _transaction_id: &str,
        _amount: Decimal,
    ) -> Result<GatewayRefund, ServiceError> {
        Err(ServiceError::ExternalService("refund rejected".to_string()))
    }
}
