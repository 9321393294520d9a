//! Base <-> Solana bridge oracle - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod deposit;
pub mod error;
pub mod fees;
pub mod handlers;
pub mod hash;
pub mod message;
pub mod mmr;
pub mod pda;
pub mod relayers;
pub mod retry;
pub mod shutdown;
pub mod supervisor;
pub mod watchers;
