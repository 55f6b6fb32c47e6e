use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, Set,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    common::round_money,
    entities::{coupon, coupon_usage, Coupon, CouponModel, CouponUsage, DiscountType},
    errors::ServiceError,
};

lazy_static! {
    static ref COUPON_REDEMPTIONS: IntCounter = IntCounter::new(
        "coupon_redemptions_total",
        "Total number of coupon redemptions recorded at order creation"
    )
    .expect("metric can be created");
}

/// Coupon lookup, eligibility checking, discount math, and redemption.
///
/// Stateless apart from the `usage_count` increment at redemption; every
/// operation takes the caller's connection so validation and redemption run
/// inside the order-creation transaction when needed.
pub struct CouponEngine;

impl CouponEngine {
    /// Looks up `code` and checks eligibility against `cart_subtotal`.
    ///
    /// An unknown code is `NotFound`. Every other failing check is
    /// accumulated so the caller sees all reasons at once: inactive,
    /// validity window, minimum order amount, exhausted usage limit.
    pub async fn validate(
        conn: &impl ConnectionTrait,
        code: &str,
        cart_subtotal: Decimal,
    ) -> Result<CouponModel, ServiceError> {
        let normalized = code.trim().to_uppercase();

        let coupon = Coupon::find()
            .filter(coupon::Column::Code.eq(normalized.clone()))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", normalized)))?;

        let mut reasons = Vec::new();
        let now = Utc::now();

        if !coupon.is_active {
            reasons.push(format!("coupon {} is not active", coupon.code));
        }

        if let Some(valid_from) = coupon.valid_from {
            if now < valid_from {
                reasons.push(format!("coupon {} is not valid yet", coupon.code));
            }
        }
        if let Some(valid_until) = coupon.valid_until {
            if now > valid_until {
                reasons.push(format!("coupon {} has expired", coupon.code));
            }
        }

        if let Some(min_order) = coupon.min_order_amount {
            if cart_subtotal < min_order {
                reasons.push(format!(
                    "order subtotal {} is below the minimum {} for coupon {}",
                    cart_subtotal, min_order, coupon.code
                ));
            }
        }

        if let Some(limit) = coupon.usage_limit {
            if coupon.usage_count >= limit {
                reasons.push(format!("coupon {} has reached its usage limit", coupon.code));
            }
        }

        if !reasons.is_empty() {
            debug!(code = %coupon.code, reasons = reasons.len(), "coupon rejected");
            return Err(ServiceError::ValidationError(reasons.join("; ")));
        }

        Ok(coupon)
    }

    /// Discount granted by `coupon` on `subtotal`. Pure.
    ///
    /// Percentage and fixed discounts are capped by `max_discount_amount`
    /// when set, clamped so they never exceed the subtotal, and rounded
    /// half-up to 2 decimal places. Free-shipping coupons grant no item
    /// discount; their benefit is the waived shipping charge.
    pub fn calculate_discount(coupon: &CouponModel, subtotal: Decimal) -> Decimal {
        let raw = match coupon.discount_type {
            DiscountType::Percentage => subtotal * coupon.discount_value / Decimal::from(100),
            DiscountType::Fixed => coupon.discount_value,
            DiscountType::FreeShipping => return Decimal::ZERO,
        };

        let capped = match coupon.max_discount_amount {
            Some(max) => raw.min(max),
            None => raw,
        };

        round_money(capped.min(subtotal).max(Decimal::ZERO))
    }

    /// Whether the coupon waives the shipping charge.
    pub fn grants_free_shipping(coupon: &CouponModel) -> bool {
        matches!(coupon.discount_type, DiscountType::FreeShipping)
    }

    /// Records one redemption inside the order-creation transaction.
    ///
    /// Re-checks the per-customer limit against `coupon_usages`, then bumps
    /// `usage_count` with a guarded update: the increment only applies while
    /// the overall limit has room, so two checkouts racing for the last
    /// redemption cannot both win. The usage row rolls back with the order
    /// if a later step fails.
    pub async fn redeem(
        txn: &impl ConnectionTrait,
        coupon: &CouponModel,
        order_id: Uuid,
        customer_id: Option<Uuid>,
        discount: Decimal,
    ) -> Result<(), ServiceError> {
        if let (Some(per_user_limit), Some(customer)) = (coupon.per_user_limit, customer_id) {
            let used = CouponUsage::find()
                .filter(coupon_usage::Column::CouponId.eq(coupon.id))
                .filter(coupon_usage::Column::CustomerId.eq(customer))
                .count(txn)
                .await?;

            if used >= per_user_limit as u64 {
                return Err(ServiceError::ValidationError(format!(
                    "coupon {} already used the maximum {} times by this customer",
                    coupon.code, per_user_limit
                )));
            }
        }

        let result = Coupon::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(coupon::Column::Id.eq(coupon.id))
            .filter(
                Condition::any()
                    .add(coupon::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(coupon::Column::UsageCount)
                            .lt(Expr::col(coupon::Column::UsageLimit)),
                    ),
            )
            .exec(txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ValidationError(format!(
                "coupon {} has reached its usage limit",
                coupon.code
            )));
        }

        let usage = coupon_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon.id),
            order_id: Set(order_id),
            customer_id: Set(customer_id),
            discount_amount: Set(discount),
            created_at: Set(Utc::now()),
        };
        usage.insert(txn).await?;

        COUPON_REDEMPTIONS.inc();
        info!(code = %coupon.code, %order_id, %discount, "coupon redeemed");

        Ok(())
    }
}
