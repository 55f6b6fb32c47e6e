//! Storefront Core
//!
//! Transactional order, payment, and inventory lifecycle engine for
//! e-commerce storefronts: carts with coupons, cart-to-order conversion
//! with guarded stock commits, payment intents with gateway execution and
//! webhook reconciliation, and claim-based refunds. The HTTP surface stays
//! with the embedding application; this crate supplies the services, the
//! entities, and the post-commit event stream it wires up.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod common;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use services::factory::{ServiceContainer, ServiceFactory};

/// Everything an embedding application needs to drive the engine: the
/// connection, the configuration, the sender feeding
/// [`events::process_events`], and the constructed services.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: ServiceContainer,
}

impl AppState {
    /// Builds the state from a factory's shared dependencies.
    pub fn from_factory(factory: &ServiceFactory) -> Self {
        Self {
            db: factory.db().clone(),
            config: factory.config().clone(),
            event_sender: factory.event_sender().clone(),
            services: ServiceContainer::new(factory),
        }
    }
}

pub mod prelude {
    pub use crate::common::*;
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::services::carts::*;
    pub use crate::services::catalog::*;
    pub use crate::services::coupons::*;
    pub use crate::services::factory::*;
    pub use crate::services::orders::*;
    pub use crate::services::payments::*;
    pub use crate::services::refunds::*;
    pub use crate::services::stock::*;
    pub use crate::AppState;
}
