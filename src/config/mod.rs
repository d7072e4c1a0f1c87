//! Configuration for the coordination engine.
//!
//! All values load from the environment once and are passed into the
//! workers by value. Batch runs receive a [`PlatformFlags`] snapshot so a
//! flag flip mid-scan cannot change behavior halfway through.

pub mod cashout;
pub mod flags;
pub mod monitor;

pub use cashout::CashoutPolicy;
pub use flags::PlatformFlags;
pub use monitor::MonitorConfig;
