//! Event handlers plugged into the watchers.
//!
//! - [`registry::RegistryHandler`] folds Base messages into the accumulator
//!   and publishes checkpoints (and optionally relays) on Solana.
//! - [`deposit::DepositHandler`] prices and relays Solana deposits to Base.

pub mod deposit;
pub mod registry;

pub use deposit::DepositHandler;
pub use registry::RegistryHandler;

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
