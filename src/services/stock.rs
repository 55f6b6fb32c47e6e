use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    entities::{product, Product},
    errors::{ServiceError, StockShortfall},
};

lazy_static! {
    static ref STOCK_REJECTIONS: IntCounter = IntCounter::new(
        "stock_insufficient_rejections_total",
        "Total number of order attempts rejected for insufficient stock"
    )
    .expect("metric can be created");
}

/// A quantity of one product an order wants to take from (or return to)
/// inventory.
#[derive(Debug, Clone)]
pub struct StockDemand {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
}

/// Inventory mutations over `products.stock_quantity`.
///
/// Every operation takes `&impl ConnectionTrait` so it composes into the
/// caller's transaction; decrements are guarded updates, never a read
/// followed by a write, so stock cannot go below zero even when two
/// checkouts race for the last unit.
pub struct StockLedger;

impl StockLedger {
    /// Current on-hand quantity. Unknown products are `NotFound`.
    pub async fn available(
        conn: &impl ConnectionTrait,
        product_id: Uuid,
    ) -> Result<i32, ServiceError> {
        let product = Product::find_by_id(product_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        Ok(product.stock_quantity)
    }

    /// Takes `quantity` units of one product.
    ///
    /// The decrement only applies while enough stock remains
    /// (`stock_quantity >= quantity` in the WHERE clause); zero rows affected
    /// on an existing product means the stock ran out and surfaces as
    /// `InsufficientStock` carrying the current availability.
    pub async fn commit(
        conn: &impl ConnectionTrait,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Stock commit quantity must be positive, got {}",
                quantity
            )));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).sub(quantity),
            )
            .col_expr(
                product::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::StockQuantity.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let product = Product::find_by_id(product_id)
                .one(conn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", product_id))
                })?;

            STOCK_REJECTIONS.inc();
            return Err(ServiceError::InsufficientStock(vec![StockShortfall {
                product_id,
                name: product.name,
                requested: quantity,
                available: product.stock_quantity,
            }]));
        }

        Ok(())
    }

    /// Takes stock for a whole order.
    ///
    /// Reads the rows first so one error can name every product that cannot
    /// be filled, then applies the guarded decrements. The guard stays on
    /// each decrement: a checkout that wins a race between the read and the
    /// write still cannot drive stock negative, it simply turns into a
    /// single-item shortfall.
    pub async fn commit_all(
        conn: &impl ConnectionTrait,
        demands: &[StockDemand],
    ) -> Result<(), ServiceError> {
        let mut shortfalls = Vec::new();
        for demand in demands {
            if demand.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Stock commit quantity must be positive, got {} for {}",
                    demand.quantity, demand.name
                )));
            }

            let available = Self::available(conn, demand.product_id).await?;
            if available < demand.quantity {
                shortfalls.push(StockShortfall {
                    product_id: demand.product_id,
                    name: demand.name.clone(),
                    requested: demand.quantity,
                    available,
                });
            }
        }

        if !shortfalls.is_empty() {
            STOCK_REJECTIONS.inc();
            warn!(
                shortfall_count = shortfalls.len(),
                "rejecting stock commit, insufficient inventory"
            );
            return Err(ServiceError::InsufficientStock(shortfalls));
        }

        for demand in demands {
            Self::commit(conn, demand.product_id, demand.quantity).await?;
        }

        Ok(())
    }

    /// Returns `quantity` units of one product to inventory. Unlike commits,
    /// restores have no upper bound.
    pub async fn restore(
        conn: &impl ConnectionTrait,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Stock restore quantity must be positive, got {}",
                quantity
            )));
        }

        let result = Product::update_many()
            .col_expr(
                product::Column::StockQuantity,
                Expr::col(product::Column::StockQuantity).add(quantity),
            )
            .col_expr(
                product::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }

        Ok(())
    }

    /// Batch restore, used by cancellation and full refunds.
    pub async fn restore_all(
        conn: &impl ConnectionTrait,
        demands: &[StockDemand],
    ) -> Result<(), ServiceError> {
        for demand in demands {
            Self::restore(conn, demand.product_id, demand.quantity).await?;
        }
        Ok(())
    }
}
