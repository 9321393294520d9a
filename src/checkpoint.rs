//! Output root checkpoints published on Solana.
//!
//! Checkpoints are strictly increasing in reference block number. A
//! submission at or below the latest accepted block is rejected before any
//! transaction is built, so the destination's view never regresses.

use serde::Serialize;

use crate::error::ProtocolError;
use crate::hash::{bytes32_to_hex, instruction_discriminator};

/// Anchor instruction that stores an output root
pub const REGISTER_OUTPUT_ROOT: &str = "register_output_root";

/// An accumulator root pinned to the Base block it was computed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputRoot {
    pub root: [u8; 32],
    pub reference_block_number: u64,
    /// Leaves covered by `root`; proofs against this checkpoint use it
    pub total_leaf_count: u64,
}

impl OutputRoot {
    /// `discriminator ‖ root ‖ block_number LE`
    pub fn instruction_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + 32 + 8);
        data.extend_from_slice(&instruction_discriminator(REGISTER_OUTPUT_ROOT));
        data.extend_from_slice(&self.root);
        data.extend_from_slice(&self.reference_block_number.to_le_bytes());
        data
    }

    pub fn root_hex(&self) -> String {
        bytes32_to_hex(&self.root)
    }
}

/// Checkpoints accepted so far, oldest first.
#[derive(Debug, Default)]
pub struct CheckpointLog {
    accepted: Vec<OutputRoot>,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&OutputRoot> {
        self.accepted.last()
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    /// Reject a candidate that would not move the checkpoint forward.
    pub fn check(&self, candidate: &OutputRoot) -> Result<(), ProtocolError> {
        match self.latest() {
            Some(latest) if candidate.reference_block_number <= latest.reference_block_number => {
                Err(ProtocolError::StaleCheckpoint {
                    submitted: candidate.reference_block_number,
                    latest: latest.reference_block_number,
                })
            }
            _ => Ok(()),
        }
    }

    /// Record a checkpoint the destination now holds.
    pub fn accept(&mut self, checkpoint: OutputRoot) -> Result<(), ProtocolError> {
        self.check(&checkpoint)?;
        self.accepted.push(checkpoint);
        Ok(())
    }

    /// Checkpoint recorded for an exact block, if any.
    pub fn at_block(&self, block_number: u64) -> Option<&OutputRoot> {
        self.accepted
            .binary_search_by_key(&block_number, |c| c.reference_block_number)
            .ok()
            .map(|i| &self.accepted[i])
    }
}

/// Latest checkpoint block at or below `height`. Checkpoints land on
/// multiples of `interval`.
pub fn aligned_block(height: u64, interval: u64) -> u64 {
    let interval = interval.max(1);
    height - height % interval
}
