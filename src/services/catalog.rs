use async_trait::async_trait;
use sea_orm::{DatabaseTransaction, EntityTrait};
use uuid::Uuid;

use crate::{
    entities::{Product, ProductModel},
    errors::ServiceError,
};

/// Read access to the product catalog from inside the order-creation
/// transaction, so the price and availability an order is built on are
/// transaction-consistent. The default implementation reads the local
/// `products` table; an embedding service can substitute a remote catalog.
///
/// Returns the row as stored; active/inactive policy belongs to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn live_product(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<ProductModel, ServiceError>;
}

/// Catalog backed by the local `products` table.
#[derive(Debug, Clone, Default)]
pub struct DbCatalog;

#[async_trait]
impl CatalogReader for DbCatalog {
    async fn live_product(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<ProductModel, ServiceError> {
        Product::find_by_id(product_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }
}
