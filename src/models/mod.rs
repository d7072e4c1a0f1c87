//! Database models and their query helpers.

pub mod cashout;
pub mod destination;
pub mod escrow;
pub mod idempotency;
pub mod refund;
pub mod transaction;
pub mod user;
pub mod webhook_event;
pub mod work_item;
