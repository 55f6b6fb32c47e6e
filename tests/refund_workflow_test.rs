mod common;

use assert_matches::assert_matches;
use chrono::Duration;
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use storefront_core::{
    entities::{
        refund, refund_item, OrderPaymentStatus, OrderRefundStatus, OrderStatus, Product,
        RefundItem, RefundKind, RefundStatus,
    },
    errors::ServiceError,
    services::refunds::{RefundItemRequest, RefundRequest},
};
use uuid::Uuid;

fn full_refund() -> RefundRequest {
    RefundRequest {
        kind: RefundKind::Full,
        amount: None,
        items: None,
        reason: None,
    }
}

fn partial_refund(amount: rust_decimal::Decimal) -> RefundRequest {
    RefundRequest {
        kind: RefundKind::Partial,
        amount: Some(amount),
        items: None,
        reason: Some("Customer kept part of the order".to_string()),
    }
}

fn item_refund(lines: Vec<RefundItemRequest>) -> RefundRequest {
    RefundRequest {
        kind: RefundKind::ItemSpecific,
        amount: None,
        items: Some(lines),
        reason: None,
    }
}

#[tokio::test]
async fn partial_refunds_claim_at_request_time() {
    let app = TestApp::new().await;
    // 110.00 of goods plus standard shipping: a 120.00 payment.
    let product = app.seed_product("SKU-PART", dec!(110.00), 10).await;
    let (order, payment) = app.paid_order(&product, 1).await;

    let refund = app
        .services()
        .refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("request refund");

    assert_eq!(refund.status, RefundStatus::Pending);
    assert_eq!(refund.kind, RefundKind::Partial);
    assert_eq!(refund.amount, dec!(40.00));
    assert_eq!(refund.payment_id, payment.id);
    assert_eq!(refund.order_id, order.id);
    assert!(refund.reason.is_some());
    assert!(refund.completed_at.is_none());

    // The claim and the order's money view move before the gateway answers.
    let payment = app
        .services()
        .payments
        .get_payment(payment.id)
        .await
        .expect("reload payment");
    assert_eq!(payment.refunded_amount, dec!(40.00));

    let order = app
        .services()
        .orders
        .get_order(order.id)
        .await
        .expect("reload order");
    assert_eq!(order.payment_status, OrderPaymentStatus::PartiallyRefunded);
    assert_eq!(order.refund_status, OrderRefundStatus::Partial);
}

#[tokio::test]
async fn confirmation_completes_the_claim() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-CONFIRM", dec!(110.00), 10).await;
    let (_, payment) = app.paid_order(&product, 1).await;

    let refund = app
        .services()
        .refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("request refund");
    let confirmed = app
        .services()
        .refunds
        .confirm_refund(refund.id, "re_txn_1")
        .await
        .expect("confirm refund");

    assert_eq!(confirmed.status, RefundStatus::Completed);
    assert_eq!(confirmed.transaction_id.as_deref(), Some("re_txn_1"));
    assert!(confirmed.completed_at.is_some());

    // Confirmation settles the claim it already holds; the total is unchanged.
    let payment = app
        .services()
        .payments
        .get_payment(payment.id)
        .await
        .expect("reload payment");
    assert_eq!(payment.refunded_amount, dec!(40.00));
}

#[tokio::test]
async fn claims_cannot_outrun_the_payment() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LIMIT", dec!(110.00), 10).await;
    let (_, payment) = app.paid_order(&product, 1).await;
    let refunds = &app.services().refunds;

    refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("first claim");

    let err = refunds
        .process_refund(payment.id, partial_refund(dec!(90.00)))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::RefundLimitExceeded {
            requested,
            refunded,
            payment_amount,
        } if requested == dec!(90.00)
            && refunded == dec!(40.00)
            && payment_amount == dec!(120.00)
    );
}

#[tokio::test]
async fn a_full_refund_takes_the_remainder_and_restores_stock() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-FULL", dec!(110.00), 10).await;
    let (order, payment) = app.paid_order(&product, 1).await;
    let refunds = &app.services().refunds;

    refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("partial claim");
    let remainder = refunds
        .process_refund(payment.id, full_refund())
        .await
        .expect("full refund");
    assert_eq!(remainder.amount, dec!(80.00));

    let payment = app
        .services()
        .payments
        .get_payment(payment.id)
        .await
        .expect("reload payment");
    assert_eq!(payment.refunded_amount, dec!(120.00));

    let order = app
        .services()
        .orders
        .get_order(order.id)
        .await
        .expect("reload order");
    assert_eq!(order.payment_status, OrderPaymentStatus::Refunded);
    assert_eq!(order.refund_status, OrderRefundStatus::Full);

    // The goods come back with the money.
    let stocked = Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 10);
}

#[tokio::test]
async fn a_cancelled_order_full_refund_moves_money_only() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-CXLREF", dec!(110.00), 10).await;
    let (order, payment) = app.paid_order(&product, 1).await;

    // Cancellation already put the unit back on the shelf.
    app.services()
        .orders
        .update_status(order.id, OrderStatus::Cancelled)
        .await
        .expect("cancel");
    let on_shelf = Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product")
        .stock_quantity;
    assert_eq!(on_shelf, 10);

    let refund = app
        .services()
        .refunds
        .process_refund(payment.id, full_refund())
        .await
        .expect("full refund");
    assert_eq!(refund.amount, dec!(120.00));

    let stocked = Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 10);
}

#[tokio::test]
async fn item_refunds_price_the_snapshot_and_cap_quantities() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LINES", dec!(30.00), 10).await;
    let (order, payment) = app.paid_order(&product, 2).await;
    let line = app
        .services()
        .orders
        .get_order_with_items(order.id)
        .await
        .expect("load items")
        .items
        .remove(0);

    // Five requested against two bought: only the bought units count.
    let refund = app
        .services()
        .refunds
        .process_refund(
            payment.id,
            item_refund(vec![RefundItemRequest {
                order_item_id: line.id,
                quantity: 5,
            }]),
        )
        .await
        .expect("item refund");
    assert_eq!(refund.kind, RefundKind::ItemSpecific);
    assert_eq!(refund.amount, dec!(60.00));

    let recorded = RefundItem::find()
        .filter(refund_item::Column::RefundId.eq(refund.id))
        .all(&*app.state.db)
        .await
        .expect("refund items");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].order_item_id, line.id);
    assert_eq!(recorded[0].quantity, 2);
    assert_eq!(recorded[0].amount, dec!(60.00));

    // Item refunds return money, not goods.
    let stocked = Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 8);
}

#[tokio::test]
async fn item_refunds_reject_foreign_lines() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-FOREIGN", dec!(30.00), 10).await;
    let (_, payment) = app.paid_order(&product, 2).await;

    let err = app
        .services()
        .refunds
        .process_refund(
            payment.id,
            item_refund(vec![RefundItemRequest {
                order_item_id: Uuid::new_v4(),
                quantity: 1,
            }]),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn only_completed_payments_refund() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-UNPAID", dec!(110.00), 10).await;
    let placed = app.placed_order(&product, 1).await;

    let (intent, _) = app
        .services()
        .payments
        .create_payment(storefront_core::services::payments::CreatePaymentRequest {
            order_id: placed.order.id,
            amount: placed.order.total_amount,
            currency: placed.order.currency.clone(),
            method: None,
        })
        .await
        .expect("create intent");

    let err = app
        .services()
        .refunds
        .process_refund(intent.id, full_refund())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PaymentState(_));
}

#[tokio::test]
async fn unknown_payments_are_not_found() {
    let app = TestApp::new().await;
    let err = app
        .services()
        .refunds
        .process_refund(Uuid::new_v4(), full_refund())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn the_refund_window_closes() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-LATE", dec!(110.00), 10).await;
    let (_, payment) = app.paid_order(&product, 1).await;
    app.age_payment(payment.id, Duration::days(91)).await;

    let err = app
        .services()
        .refunds
        .process_refund(payment.id, full_refund())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn confirmation_is_for_pending_refunds_only() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-TWICE", dec!(110.00), 10).await;
    let (_, payment) = app.paid_order(&product, 1).await;
    let refunds = &app.services().refunds;

    let refund = refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("request refund");
    refunds
        .confirm_refund(refund.id, "re_txn_1")
        .await
        .expect("confirm");

    let err = refunds.confirm_refund(refund.id, "re_txn_2").await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let err = refunds.fail_refund(refund.id, "late decline").await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn failed_refunds_release_their_claim() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-RELEASE", dec!(110.00), 10).await;
    let (order, payment) = app.paid_order(&product, 1).await;
    let refunds = &app.services().refunds;

    let refund = refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("request refund");
    let failed = refunds
        .fail_refund(refund.id, "gateway timeout")
        .await
        .expect("fail refund");
    assert_eq!(failed.status, RefundStatus::Failed);

    // The claim is released and the order's money view rolls back.
    let payment_after = app
        .services()
        .payments
        .get_payment(payment.id)
        .await
        .expect("reload payment");
    assert_eq!(payment_after.refunded_amount, dec!(0));

    let order = app
        .services()
        .orders
        .get_order(order.id)
        .await
        .expect("reload order");
    assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
    assert_eq!(order.refund_status, OrderRefundStatus::None);

    // The full amount is refundable again.
    let fresh = refunds
        .process_refund(payment.id, full_refund())
        .await
        .expect("fresh refund");
    assert_eq!(fresh.amount, dec!(120.00));
}

#[tokio::test]
async fn confirmation_rechecks_completed_refunds() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-DRIFT", dec!(110.00), 10).await;
    let (order, payment) = app.paid_order(&product, 1).await;
    let refunds = &app.services().refunds;

    let pending = refunds
        .process_refund(payment.id, full_refund())
        .await
        .expect("request refund");

    // A completed refund that never went through the claim path, as if the
    // rows drifted out of sync with the payment's counter.
    let now = chrono::Utc::now();
    refund::ActiveModel {
        id: Set(Uuid::new_v4()),
        payment_id: Set(payment.id),
        order_id: Set(order.id),
        amount: Set(dec!(120.00)),
        status: Set(RefundStatus::Completed),
        kind: Set(RefundKind::Full),
        reason: Set(None),
        transaction_id: Set(Some("re_rogue".to_string())),
        created_at: Set(now),
        updated_at: Set(now),
        completed_at: Set(Some(now)),
    }
    .insert(&*app.state.db)
    .await
    .expect("insert rogue refund");

    let err = refunds
        .confirm_refund(pending.id, "re_txn_1")
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::RefundLimitExceeded {
            requested,
            refunded,
            payment_amount,
        } if requested == dec!(120.00)
            && refunded == dec!(120.00)
            && payment_amount == dec!(120.00)
    );

    // The pending refund failed and gave its claim back.
    let flipped = storefront_core::entities::Refund::find_by_id(pending.id)
        .one(&*app.state.db)
        .await
        .expect("query refund")
        .expect("refund exists");
    assert_eq!(flipped.status, RefundStatus::Failed);

    let payment_after = app
        .services()
        .payments
        .get_payment(payment.id)
        .await
        .expect("reload payment");
    assert_eq!(payment_after.refunded_amount, dec!(0));
}

#[tokio::test]
async fn summaries_report_the_running_position() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-SUMMARY", dec!(110.00), 10).await;
    let (order, payment) = app.paid_order(&product, 1).await;
    let refunds = &app.services().refunds;

    let first = refunds
        .process_refund(payment.id, partial_refund(dec!(40.00)))
        .await
        .expect("first refund");
    refunds
        .confirm_refund(first.id, "re_txn_1")
        .await
        .expect("confirm first");
    refunds
        .process_refund(payment.id, partial_refund(dec!(30.00)))
        .await
        .expect("second refund");

    let summary = refunds.refund_summary(order.id).await.expect("summary");
    assert_eq!(summary.payment_id, payment.id);
    assert_eq!(summary.payment_amount, dec!(120.00));
    assert_eq!(summary.completed_total, dec!(40.00));
    assert_eq!(summary.pending_total, dec!(30.00));
    assert_eq!(summary.remaining_refundable, dec!(50.00));
    assert_eq!(summary.refunds.len(), 2);
}

#[tokio::test]
async fn summaries_need_a_completed_payment() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-NOSUM", dec!(110.00), 10).await;
    let placed = app.placed_order(&product, 1).await;

    let err = app
        .services()
        .refunds
        .refund_summary(placed.order.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn partial_refunds_leave_the_units_sold() {
    let app = TestApp::new().await;
    let product = app.seed_product("SKU-KEEP", dec!(110.00), 10).await;
    let (_, payment) = app.paid_order(&product, 1).await;

    let refund = app
        .services()
        .refunds
        .process_refund(payment.id, partial_refund(dec!(25.00)))
        .await
        .expect("partial refund");
    app.services()
        .refunds
        .confirm_refund(refund.id, "re_txn_1")
        .await
        .expect("confirm");

    let stocked = Product::find_by_id(product.id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("product");
    assert_eq!(stocked.stock_quantity, 9);
}
