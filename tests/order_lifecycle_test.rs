mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{order_request, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};
use storefront_core::{
    entities::{
        product, Cart, CartStatus, Coupon, CouponUsage, DiscountType, Order, OrderPaymentStatus,
        OrderStatus,
    },
    errors::ServiceError,
    services::{carts::AddItemRequest, catalog::DbCatalog, orders::OrderService},
};
use uuid::Uuid;

#[tokio::test]
async fn checkout_prices_the_cart_and_redeems_the_coupon() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-100", dec!(50.00), 10).await;
    let coupon = app
        .seed_coupon(TestApp::coupon("SAVE10", DiscountType::Percentage, dec!(10)))
        .await;

    let cart_id = app.cart_with(&product, 2).await;
    app.services()
        .carts
        .apply_coupon(cart_id, "SAVE10")
        .await
        .expect("apply coupon");

    let placed = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .expect("create order");
    let order = &placed.order;

    assert!(order.order_number.starts_with("ORD-"));
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, OrderPaymentStatus::Pending);
    assert_eq!(order.currency, "USD");
    assert_eq!(order.subtotal, dec!(100.00));
    assert_eq!(order.discount_total, dec!(10.00));
    assert_eq!(order.tax_total, dec!(0.00));
    assert_eq!(order.shipping_total, dec!(10.00));
    assert_eq!(order.total_amount, dec!(100.00));
    assert_eq!(order.coupon_code, Some("SAVE10".to_string()));
    assert_eq!(order.version, 1);

    // Line snapshots carry the catalog values at purchase time.
    assert_eq!(placed.items.len(), 1);
    assert_eq!(placed.items[0].sku, "SKU-100");
    assert_eq!(placed.items[0].quantity, 2);
    assert_eq!(placed.items[0].unit_price, dec!(50.00));
    assert_eq!(placed.items[0].total_price, dec!(100.00));

    // Stock moved, the coupon redemption was recorded, the cart converted.
    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 8);

    let refreshed = Coupon::find_by_id(coupon.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("coupon");
    assert_eq!(refreshed.usage_count, 1);

    let usages = CouponUsage::find()
        .count(&*app.state.db)
        .await
        .expect("count");
    assert_eq!(usages, 1);

    let cart = Cart::find_by_id(cart_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("cart");
    assert_eq!(cart.status, CartStatus::Converted);
}

#[tokio::test]
async fn insufficient_stock_rolls_the_whole_order_back() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-SCARCE", dec!(20.00), 3).await;
    let coupon = app
        .seed_coupon(TestApp::coupon("ROLLBACK", DiscountType::Fixed, dec!(5)))
        .await;

    let cart_id = app.cart_with(&product, 5).await;
    app.services()
        .carts
        .apply_coupon(cart_id, "ROLLBACK")
        .await
        .expect("apply coupon");

    let err = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .unwrap_err();

    match err {
        ServiceError::InsufficientStock(shortfalls) => {
            assert_eq!(shortfalls.len(), 1);
            assert_eq!(shortfalls[0].product_id, product.id);
            assert_eq!(shortfalls[0].requested, 5);
            assert_eq!(shortfalls[0].available, 3);
        }
        other => panic!("expected InsufficientStock, got {:?}", other),
    }

    // Nothing persisted: stock, coupon count, cart state, order rows.
    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 3);

    let refreshed = Coupon::find_by_id(coupon.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("coupon");
    assert_eq!(refreshed.usage_count, 0);

    let cart = Cart::find_by_id(cart_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("cart");
    assert_eq!(cart.status, CartStatus::Active);

    let orders = Order::find().count(&*app.state.db).await.expect("count");
    assert_eq!(orders, 0);

    // The rolled-back cart can still check out at a quantity that fits.
    let view = app
        .services()
        .carts
        .get_cart(cart_id)
        .await
        .expect("view");
    app.services()
        .carts
        .update_item_quantity(cart_id, view.items[0].item_id, 3)
        .await
        .expect("shrink line");
    app.services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .expect("second attempt succeeds");
}

#[tokio::test]
async fn the_last_unit_sells_exactly_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LAST", dec!(15.00), 1).await;

    let winner = app.cart_with(&product, 1).await;
    let loser = app.cart_with(&product, 1).await;

    app.services()
        .orders
        .create_order(order_request(winner))
        .await
        .expect("first order takes the unit");

    let err = app
        .services()
        .orders
        .create_order(order_request(loser))
        .await
        .unwrap_err();
    match err {
        ServiceError::InsufficientStock(shortfalls) => {
            assert_eq!(shortfalls.len(), 1);
            assert_eq!(shortfalls[0].requested, 1);
            assert_eq!(shortfalls[0].available, 0);
        }
        other => panic!("expected InsufficientStock, got {:?}", other),
    }

    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 0);

    let orders = Order::find().count(&*app.state.db).await.expect("count");
    assert_eq!(orders, 1);
}

#[tokio::test]
async fn a_cart_converts_exactly_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-ONCE", dec!(10.00), 10).await;
    let cart_id = app.cart_with(&product, 1).await;

    app.services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .expect("first conversion");
    let err = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn empty_carts_cannot_convert() {
    let app = TestApp::new().await;
    let cart = app
        .services()
        .carts
        .get_or_create(Some("empty".to_string()), None)
        .await
        .expect("cart");

    let err = app
        .services()
        .orders
        .create_order(order_request(cart.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // The rejection rolled the claim back.
    let cart = Cart::find_by_id(cart.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("cart");
    assert_eq!(cart.status, CartStatus::Active);
}

#[tokio::test]
async fn deactivated_products_block_checkout() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-PULLED", dec!(15.00), 10).await;
    let cart_id = app.cart_with(&product, 2).await;

    let mut retired: product::ActiveModel = product.clone().into();
    retired.is_active = Set(false);
    retired.update(&*app.state.db).await.expect("deactivate");

    let err = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 10);
}

#[tokio::test]
async fn carts_mixing_currencies_are_rejected() {
    let app = TestApp::new().await;
    let usd = app.seed_product("SKU-USD", dec!(10.00), 10).await;
    let eur = app.seed_product("SKU-EUR", dec!(10.00), 10).await;
    let mut eur_active: product::ActiveModel = eur.clone().into();
    eur_active.currency = Set("EUR".to_string());
    eur_active.update(&*app.state.db).await.expect("reprice");

    let cart_id = app.cart_with(&usd, 1).await;
    app.services()
        .carts
        .add_item(
            cart_id,
            AddItemRequest {
                product_id: eur.id,
                quantity: 1,
                configuration: None,
            },
        )
        .await
        .expect("second line");

    let err = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn tax_applies_to_the_undiscounted_subtotal() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-TAXED", dec!(50.00), 10).await;
    app.seed_coupon(TestApp::coupon("TENOFF", DiscountType::Fixed, dec!(10)))
        .await;

    let cart_id = app.cart_with(&product, 2).await;
    app.services()
        .carts
        .apply_coupon(cart_id, "TENOFF")
        .await
        .expect("apply coupon");

    let mut cfg = (*app.state.config).clone();
    cfg.default_tax_rate = 0.08;
    let orders = OrderService::new(
        app.state.db.clone(),
        app.state.event_sender.clone(),
        Arc::new(cfg),
        Arc::new(DbCatalog),
    );

    let placed = orders
        .create_order(order_request(cart_id))
        .await
        .expect("create order");

    // 8% of the full 100.00, not of the discounted 90.00.
    assert_eq!(placed.order.tax_total, dec!(8.00));
    assert_eq!(placed.order.total_amount, dec!(108.00));
}

#[tokio::test]
async fn free_shipping_coupons_waive_the_charge() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-SHIP", dec!(40.00), 10).await;
    app.seed_coupon(TestApp::coupon(
        "FREESHIP",
        DiscountType::FreeShipping,
        dec!(0),
    ))
    .await;

    let cart_id = app.cart_with(&product, 1).await;
    app.services()
        .carts
        .apply_coupon(cart_id, "FREESHIP")
        .await
        .expect("apply coupon");

    let placed = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .expect("create order");

    assert_eq!(placed.order.discount_total, dec!(0));
    assert_eq!(placed.order.shipping_total, dec!(0));
    assert_eq!(placed.order.total_amount, dec!(40.00));
}

#[tokio::test]
async fn coupons_are_revalidated_at_checkout() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-SHRINK", dec!(60.00), 10).await;
    let mut qualifying = TestApp::coupon("BIGCART", DiscountType::Fixed, dec!(20));
    qualifying.min_order_amount = Set(Some(dec!(100.00)));
    app.seed_coupon(qualifying).await;

    let cart_id = app.cart_with(&product, 2).await;
    app.services()
        .carts
        .apply_coupon(cart_id, "BIGCART")
        .await
        .expect("qualifies at 120.00");

    // Shrinking the cart below the minimum invalidates the coupon at
    // conversion time.
    let view = app.services().carts.get_cart(cart_id).await.expect("view");
    app.services()
        .carts
        .update_item_quantity(cart_id, view.items[0].item_id, 1)
        .await
        .expect("shrink");

    let err = app
        .services()
        .orders
        .create_order(order_request(cart_id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let cart = Cart::find_by_id(cart_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("cart");
    assert_eq!(cart.status, CartStatus::Active);
}

#[tokio::test]
async fn exhausted_coupons_fail_the_later_checkout() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LAST", dec!(30.00), 10).await;
    let mut limited = TestApp::coupon("ONEUSE", DiscountType::Fixed, dec!(5));
    limited.usage_limit = Set(Some(1));
    app.seed_coupon(limited).await;

    let first_cart = app.cart_with(&product, 1).await;
    app.services()
        .carts
        .apply_coupon(first_cart, "ONEUSE")
        .await
        .expect("first apply");
    let second_cart = app.cart_with(&product, 1).await;
    app.services()
        .carts
        .apply_coupon(second_cart, "ONEUSE")
        .await
        .expect("second apply");

    app.services()
        .orders
        .create_order(order_request(first_cart))
        .await
        .expect("first order takes the last redemption");

    let err = app
        .services()
        .orders
        .create_order(order_request(second_cart))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // The losing order rolled back its stock take as well.
    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 9);
}

#[tokio::test]
async fn cancellation_returns_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-BACK", dec!(25.00), 6).await;
    let placed = app.placed_order(&product, 4).await;

    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 2);

    let cancelled = app
        .services()
        .orders
        .update_status(placed.order.id, OrderStatus::Cancelled)
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.version, 2);

    let stocked = storefront_core::entities::Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 6);
}

#[tokio::test]
async fn delivered_orders_cannot_move_backwards() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-DONE", dec!(25.00), 5).await;
    let placed = app.placed_order(&product, 1).await;
    let orders = &app.services().orders;

    orders
        .update_status(placed.order.id, OrderStatus::Processing)
        .await
        .expect("processing");
    orders
        .update_status(placed.order.id, OrderStatus::Shipped)
        .await
        .expect("shipped");
    let delivered = orders
        .update_status(placed.order.id, OrderStatus::Delivered)
        .await
        .expect("delivered");

    let err = orders
        .update_status(placed.order.id, OrderStatus::Pending)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InvalidTransition { ref from, ref to }
            if from == "delivered" && to == "pending"
    );

    // The failed transition changed nothing.
    let current = orders.get_order(placed.order.id).await.expect("reload");
    assert_eq!(current.status, OrderStatus::Delivered);
    assert_eq!(current.version, delivered.version);
}

#[tokio::test]
async fn shipped_orders_cannot_cancel() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-SENT", dec!(25.00), 5).await;
    let placed = app.placed_order(&product, 1).await;
    let orders = &app.services().orders;

    orders
        .update_status(placed.order.id, OrderStatus::Processing)
        .await
        .expect("processing");
    orders
        .update_status(placed.order.id, OrderStatus::Shipped)
        .await
        .expect("shipped");

    let err = orders
        .update_status(placed.order.id, OrderStatus::Cancelled)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}

#[tokio::test]
async fn same_status_updates_are_no_ops() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-SAME", dec!(25.00), 5).await;
    let placed = app.placed_order(&product, 1).await;

    let unchanged = app
        .services()
        .orders
        .update_status(placed.order.id, OrderStatus::Pending)
        .await
        .expect("noop");
    assert_eq!(unchanged.version, placed.order.version);
}

#[tokio::test]
async fn holds_pause_and_resume_fulfillment() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-HOLD", dec!(25.00), 5).await;
    let placed = app.placed_order(&product, 1).await;
    let orders = &app.services().orders;

    let held = orders
        .update_status(placed.order.id, OrderStatus::OnHold)
        .await
        .expect("hold");
    assert_eq!(held.status, OrderStatus::OnHold);

    let resumed = orders
        .update_status(placed.order.id, OrderStatus::Processing)
        .await
        .expect("resume");
    assert_eq!(resumed.status, OrderStatus::Processing);
}

#[tokio::test]
async fn notes_append_without_touching_status() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-NOTE", dec!(25.00), 5).await;
    let placed = app.placed_order(&product, 1).await;
    let orders = &app.services().orders;

    orders
        .add_note(placed.order.id, "Customer asked for gift wrap")
        .await
        .expect("first note");
    let noted = orders
        .add_note(placed.order.id, "  Left at reception  ")
        .await
        .expect("second note");

    assert_eq!(
        noted.notes.as_deref(),
        Some("Customer asked for gift wrap\nLeft at reception")
    );
    assert_eq!(noted.status, OrderStatus::Pending);

    let err = orders.add_note(placed.order.id, "   ").await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn guest_email_lands_in_the_shipping_snapshot() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-MAIL", dec!(25.00), 5).await;
    let placed = app.placed_order(&product, 1).await;

    assert_eq!(
        placed.order.shipping_address["email"],
        serde_json::json!("buyer@example.com")
    );
    // Billing defaults to the shipping snapshot.
    assert_eq!(placed.order.billing_address, placed.order.shipping_address);
}

#[tokio::test]
async fn orders_list_newest_first_with_customer_scoping() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LIST", dec!(10.00), 50).await;
    let customer = Uuid::new_v4();

    for i in 0..3 {
        let cart_id = app.cart_with(&product, 1).await;
        let mut request = order_request(cart_id);
        if i < 2 {
            request.customer_id = Some(customer);
        }
        app.services()
            .orders
            .create_order(request)
            .await
            .expect("create order");
    }

    let (page, total) = app
        .services()
        .orders
        .list_orders(None, 1, 2)
        .await
        .expect("list");
    assert_eq!(total, 3);
    assert_eq!(page.len(), 2);

    let (rest, _) = app
        .services()
        .orders
        .list_orders(None, 2, 2)
        .await
        .expect("second page");
    assert_eq!(rest.len(), 1);

    let (scoped, scoped_total) = app
        .services()
        .orders
        .list_orders(Some(customer), 1, 10)
        .await
        .expect("scoped");
    assert_eq!(scoped_total, 2);
    assert!(scoped.iter().all(|order| order.customer_id == Some(customer)));
}
