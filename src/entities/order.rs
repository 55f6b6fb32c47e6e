use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An order. Totals and item snapshots are fixed at creation time; the three
/// status columns advance through their lifecycle machines and everything
/// else is immutable apart from the `notes` side channel and `version`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Human-facing reference, `ORD-XXXXXXXX`.
    #[sea_orm(unique)]
    pub order_number: String,

    pub customer_id: Option<Uuid>,

    /// Cart this order was created from, kept for traceability.
    pub cart_id: Option<Uuid>,

    /// Fulfillment lifecycle.
    pub status: OrderStatus,

    /// Money lifecycle, driven by payment capture and refunds.
    pub payment_status: OrderPaymentStatus,

    /// Refund coverage, derived from the refund claims against the payment.
    pub refund_status: OrderRefundStatus,

    pub currency: String,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,

    pub coupon_id: Option<Uuid>,
    pub coupon_code: Option<String>,

    pub shipping_method: ShippingMethod,

    /// Address snapshots taken at creation; later address-book edits do not
    /// reach committed orders.
    pub shipping_address: Json,
    pub billing_address: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,

    /// Bumped on every mutation.
    pub version: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "on_hold")]
    OnHold,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

#[derive(
    Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderPaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

#[derive(
    Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderRefundStatus {
    #[sea_orm(string_value = "none")]
    None,
    #[sea_orm(string_value = "partial")]
    Partial,
    #[sea_orm(string_value = "full")]
    Full,
}

#[derive(
    Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShippingMethod {
    #[sea_orm(string_value = "standard")]
    Standard,
    #[sea_orm(string_value = "express")]
    Express,
    #[sea_orm(string_value = "overnight")]
    Overnight,
}

impl ShippingMethod {
    /// Flat rate charged unless the applied coupon grants free shipping.
    pub fn base_rate(&self) -> Decimal {
        match self {
            ShippingMethod::Standard => dec!(10.00),
            ShippingMethod::Express => dec!(25.00),
            ShippingMethod::Overnight => dec!(50.00),
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payment,
    #[sea_orm(has_many = "super::refund::Entity")]
    Refund,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
    }
}

impl Related<super::refund::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Refund.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
