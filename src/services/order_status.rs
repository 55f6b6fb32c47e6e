//! Status transition tables for the order lifecycle machines.
//!
//! Fulfillment, payment, and refund statuses each advance through a fixed
//! graph; everything not listed is rejected. Same-status transitions are
//! accepted as no-ops so retried requests stay idempotent.

use crate::{
    entities::{OrderPaymentStatus, OrderRefundStatus, OrderStatus},
    errors::ServiceError,
};

/// Whether the fulfillment machine allows `from -> to`.
pub fn is_valid_transition(from: &OrderStatus, to: &OrderStatus) -> bool {
    use OrderStatus::*;

    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Processing)
            | (Pending, OnHold)
            | (Pending, Cancelled)
            | (Processing, Shipped)
            | (Processing, OnHold)
            | (Processing, Cancelled)
            | (Shipped, Delivered)
            | (OnHold, Processing)
            | (OnHold, Cancelled)
    )
}

/// `is_valid_transition` as a guard that raises `InvalidTransition`.
pub fn ensure_transition(from: &OrderStatus, to: &OrderStatus) -> Result<(), ServiceError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(ServiceError::invalid_transition(from, to))
    }
}

/// Whether the payment-status machine allows `from -> to`. Driven by payment
/// capture and the refund engine, never set directly by callers.
pub fn is_valid_payment_transition(
    from: &OrderPaymentStatus,
    to: &OrderPaymentStatus,
) -> bool {
    use OrderPaymentStatus::*;

    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Paid)
            | (Paid, PartiallyRefunded)
            | (Paid, Refunded)
            | (PartiallyRefunded, Refunded)
    )
}

/// Whether the refund-coverage machine allows `from -> to`.
pub fn is_valid_refund_transition(from: &OrderRefundStatus, to: &OrderRefundStatus) -> bool {
    use OrderRefundStatus::*;

    if from == to {
        return true;
    }

    matches!((from, to), (None, Partial) | (None, Full) | (Partial, Full))
}
