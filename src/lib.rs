//! Coordination engine for escrowed trades, cashouts, and refunds.
//!
//! Guarantees that every money-moving operation executes at most once
//! under retries, webhook duplication, and concurrent workers. The engine
//! owns the state machines and the idempotency layer; payment rails, FX
//! rates, and notification delivery sit behind the traits in [`rails`].

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod rails;
pub mod schema;
pub mod services;
pub mod validation;
