use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    config::AppConfig,
    events::EventSender,
    services::{
        carts::CartStore,
        catalog::{CatalogReader, DbCatalog},
        orders::OrderService,
        payments::{PaymentGateway, PaymentService, SandboxGateway},
        refunds::RefundEngine,
    },
};

/// Factory for creating service instances with shared dependencies.
///
/// Defaults to the local-table catalog and the sandbox gateway; embedders
/// swap in their own implementations with the builder methods before
/// constructing services.
pub struct ServiceFactory {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    catalog: Arc<dyn CatalogReader>,
    gateway: Arc<dyn PaymentGateway>,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies.
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
            catalog: Arc::new(DbCatalog),
            gateway: Arc::new(SandboxGateway),
        }
    }

    /// Substitutes the catalog read implementation.
    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogReader>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Substitutes the payment gateway implementation.
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    /// Creates a cart store instance.
    pub fn cart_store(&self) -> CartStore {
        CartStore::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.config.clone(),
        )
    }

    /// Creates an order service instance.
    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.config.clone(),
            self.catalog.clone(),
        )
    }

    /// Creates a payment service instance.
    pub fn payment_service(&self) -> PaymentService {
        PaymentService::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.config.clone(),
            self.gateway.clone(),
        )
    }

    /// Creates a refund engine instance.
    pub fn refund_engine(&self) -> RefundEngine {
        RefundEngine::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.config.clone(),
        )
    }

    /// Creates all services as a tuple for convenience.
    pub fn create_all(&self) -> (CartStore, OrderService, PaymentService, RefundEngine) {
        (
            self.cart_store(),
            self.order_service(),
            self.payment_service(),
            self.refund_engine(),
        )
    }

    /// Gets a reference to the database connection.
    pub fn db(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    /// Gets a reference to the event sender.
    pub fn event_sender(&self) -> &Arc<EventSender> {
        &self.event_sender
    }

    /// Gets a reference to the configuration.
    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }
}

/// Service container holding all service instances.
#[derive(Clone)]
pub struct ServiceContainer {
    pub carts: Arc<CartStore>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub refunds: Arc<RefundEngine>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized.
    pub fn new(factory: &ServiceFactory) -> Self {
        let (carts, orders, payments, refunds) = factory.create_all();

        Self {
            carts: Arc::new(carts),
            orders: Arc::new(orders),
            payments: Arc::new(payments),
            refunds: Arc::new(refunds),
        }
    }
}
