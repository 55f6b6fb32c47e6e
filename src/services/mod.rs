// Core lifecycle services
pub mod carts;
pub mod catalog;
pub mod coupons;
pub mod orders;
pub mod payments;
pub mod refunds;
pub mod stock;

// Status transition tables shared by the services above
pub mod order_status;

// Service factory for dependency injection
pub mod factory;
