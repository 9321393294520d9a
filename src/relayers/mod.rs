//! Destination-chain submitters.
//!
//! Handlers talk to relayers through the traits here so the drivers and
//! handlers can be exercised without a node.

use async_trait::async_trait;

use crate::checkpoint::OutputRoot;
use crate::error::HandlerError;
use crate::message::OutgoingMessage;
use crate::mmr::Proof;

pub mod evm;
pub mod solana;

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReceipt {
    /// Transaction hash or signature, as the destination chain prints it
    pub tx_id: String,
    /// Whether inclusion was awaited before returning
    pub confirmed: bool,
}

/// Submits one kind of event to its destination chain.
#[async_trait]
pub trait Relay<E: Sync>: Send + Sync {
    async fn relay(&self, event: &E) -> Result<RelayReceipt, HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSubmission {
    Submitted(String),
    /// The destination already holds a root for this block
    AlreadyPresent,
}

/// Publishes accumulator roots to Solana.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn submit_checkpoint(
        &self,
        checkpoint: &OutputRoot,
    ) -> Result<CheckpointSubmission, HandlerError>;

    /// Whether the output root for `block` is readable on Solana.
    async fn output_root_exists(&self, block: u64) -> Result<bool, HandlerError>;
}

/// A message ready for proving and execution on Solana
#[derive(Debug, Clone)]
pub struct ProvenMessage {
    pub message: OutgoingMessage,
    pub hash: [u8; 32],
    /// Membership proof against `checkpoint.root`
    pub proof: Proof,
    pub checkpoint: OutputRoot,
}
