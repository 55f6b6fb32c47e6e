use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shopping cart. Owned by a guest session (`session_id`) or a signed-in
/// customer (`customer_id`). Carries no totals: subtotal and discount are
/// derived from live product prices on every read, so they cannot go stale.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "carts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub session_id: Option<String>,
    pub customer_id: Option<Uuid>,

    pub status: CartStatus,

    /// Applied coupon, by reference only. The discount it grants is
    /// recomputed against the current cart contents whenever totals are read.
    pub coupon_id: Option<Uuid>,
    pub coupon_code: Option<String>,

    /// TTL stamp consumed by an external cleanup job.
    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CartStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "checkout")]
    Checkout,
    #[sea_orm(string_value = "converted")]
    Converted,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cart_item::Entity")]
    CartItem,
    #[sea_orm(
        belongs_to = "super::coupon::Entity",
        from = "Column::CouponId",
        to = "super::coupon::Column::Id"
    )]
    Coupon,
}

impl Related<super::cart_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartItem.def()
    }
}

impl Related<super::coupon::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Coupon.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
