use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Customer-facing code, stored uppercase; lookups normalize before
    /// matching.
    #[sea_orm(unique)]
    pub code: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    pub discount_type: DiscountType,

    /// Percentage points for `percentage`, a currency amount for `fixed`.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_value: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub min_order_amount: Option<Decimal>,

    /// Cap applied after the raw discount is computed.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub max_discount_amount: Option<Decimal>,

    /// Total redemptions allowed across all customers. `None` is unlimited.
    pub usage_limit: Option<i32>,

    /// Redemptions so far. Incremented with a guarded update at order
    /// creation, never read-modify-write.
    pub usage_count: i32,

    /// Redemptions allowed per customer, enforced against `coupon_usages`.
    pub per_user_limit: Option<i32>,

    pub is_active: bool,

    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscountType {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "fixed")]
    Fixed,
    /// Waives the shipping charge; contributes nothing to the item discount.
    #[sea_orm(string_value = "free_shipping")]
    FreeShipping,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::coupon_usage::Entity")]
    CouponUsage,
}

impl Related<super::coupon_usage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CouponUsage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
