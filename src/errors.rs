use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::TransactionError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One product an order could not be filled from, carried inside
/// [`ServiceError::InsufficientStock`] so callers learn every offender at
/// once instead of failing item by item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortfall {
    pub product_id: Uuid,
    pub name: String,
    pub requested: i32,
    pub available: i32,
}

fn stock_message(items: &[StockShortfall]) -> String {
    items
        .iter()
        .map(|s| format!("{} (requested {}, available {})", s.name, s.requested, s.available))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Insufficient stock: {}", stock_message(.0))]
    InsufficientStock(Vec<StockShortfall>),

    #[error("Payment state error: {0}")]
    PaymentState(String),

    #[error("Refund limit exceeded: requested {requested}, already claimed {refunded} of {payment_amount}")]
    RefundLimitExceeded {
        requested: Decimal,
        refunded: Decimal,
        payment_amount: Decimal,
    },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

/// Lets `?` unwrap `db.transaction(..)` results: connection failures become
/// database errors, domain errors pass through unchanged.
impl From<TransactionError<ServiceError>> for ServiceError {
    fn from(err: TransactionError<ServiceError>) -> Self {
        match err {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(service_err) => service_err,
        }
    }
}

impl ServiceError {
    /// Builds the transition error from any pair of status enums.
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        ServiceError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable machine-readable code, independent of message wording.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::PaymentState(_) => "payment_state_conflict",
            Self::RefundLimitExceeded { .. } => "refund_limit_exceeded",
            Self::ExternalService(_) => "external_service_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PaymentState(_) | Self::RefundLimitExceeded { .. } => StatusCode::CONFLICT,
            Self::ExternalService(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured payload for the response `details` field, where a variant
    /// has one.
    fn response_details(&self) -> Option<String> {
        match self {
            Self::InsufficientStock(items) => serde_json::to_string(items).ok(),
            _ => None,
        }
    }
}

/// Standardized error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Additional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.response_details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
