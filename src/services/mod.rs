//! Core coordination services.

pub mod auto_cashout;
pub mod cashout_retry;
pub mod escrow_state;
pub mod expiry_processor;
pub mod idempotency_guard;
pub mod outbox;
pub mod reconciler;
pub mod refund_state;
