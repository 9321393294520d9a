//! Base → Solana: commit registered messages and publish checkpoints.
//!
//! Every fresh `MessageRegistered` event is appended to the accumulator in
//! nonce order. At each batch boundary the handler checkpoints the root at the
//! latest aligned block it has fully seen, and with auto-relay enabled proves
//! and executes the messages covered by the newest checkpoint readable on
//! Solana. A checkpoint that has not landed yet defers relaying to a later
//! batch.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::checkpoint::{aligned_block, CheckpointLog, OutputRoot};
use crate::error::{HandlerError, ProtocolError};
use crate::hash::bytes32_to_hex;
use crate::message::{MessageBook, MessageStatus, NonceCheck, NonceTracker};
use crate::mmr::{self, Accumulator};
use crate::relayers::{CheckpointSink, CheckpointSubmission, ProvenMessage, Relay};
use crate::watchers::evm::RegisteredMessage;
use crate::watchers::{Handler, Observed};

pub struct RegistryHandler<S, R> {
    accumulator: Accumulator,
    nonces: NonceTracker,
    book: MessageBook,
    checkpoints: CheckpointLog,
    /// Newest accepted checkpoint confirmed on Solana
    landed: Option<OutputRoot>,
    /// Block of each leaf, in leaf order
    leaf_blocks: Vec<u64>,
    interval: u64,
    sink: Arc<S>,
    relayer: Option<Arc<R>>,
    /// Messages the destination refused; not retried automatically
    abandoned: HashSet<[u8; 32]>,
}

impl<S, R> RegistryHandler<S, R>
where
    S: CheckpointSink,
    R: Relay<ProvenMessage>,
{
    pub fn new(sink: Arc<S>, checkpoint_interval: u64) -> Self {
        Self {
            accumulator: Accumulator::new(),
            nonces: NonceTracker::default(),
            book: MessageBook::new(),
            checkpoints: CheckpointLog::new(),
            landed: None,
            leaf_blocks: Vec::new(),
            interval: checkpoint_interval.max(1),
            sink,
            relayer: None,
            abandoned: HashSet::new(),
        }
    }

    /// Prove and execute covered messages after each checkpoint.
    pub fn with_auto_relay(mut self, relayer: Arc<R>) -> Self {
        self.relayer = Some(relayer);
        self
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn book(&self) -> &MessageBook {
        &self.book
    }

    pub fn checkpoints(&self) -> &CheckpointLog {
        &self.checkpoints
    }

    /// Newest checkpoint messages are proven against
    pub fn landed_checkpoint(&self) -> Option<&OutputRoot> {
        self.landed.as_ref()
    }

    /// Root over every leaf committed at or before `block`, if any.
    pub fn checkpoint_at(&self, block: u64) -> Result<Option<OutputRoot>, HandlerError> {
        let leaves = self.leaf_blocks.partition_point(|b| *b <= block) as u64;
        if leaves == 0 {
            return Ok(None);
        }
        let root = self
            .accumulator
            .root_at(leaves)
            .map_err(|e| HandlerError::Fatal(eyre::Report::new(e)))?;
        Ok(Some(OutputRoot {
            root,
            reference_block_number: block,
            total_leaf_count: leaves,
        }))
    }

    async fn publish_checkpoint(&mut self, height: u64) -> Result<(), HandlerError> {
        let block = aligned_block(height, self.interval);
        let Some(candidate) = self.checkpoint_at(block)? else {
            return Ok(());
        };
        if let Some(latest) = self.checkpoints.latest() {
            if block <= latest.reference_block_number {
                return Ok(());
            }
            if candidate.total_leaf_count == latest.total_leaf_count {
                debug!(block, "No new messages since last checkpoint");
                return Ok(());
            }
        }
        self.checkpoints.check(&candidate)?;

        let present = match self.sink.submit_checkpoint(&candidate).await? {
            CheckpointSubmission::Submitted(signature) => {
                info!(
                    block,
                    root = %candidate.root_hex(),
                    leaves = candidate.total_leaf_count,
                    signature = %signature,
                    "Output root published"
                );
                false
            }
            CheckpointSubmission::AlreadyPresent => {
                info!(block, root = %candidate.root_hex(), "Output root already on Solana");
                true
            }
        };
        self.checkpoints.accept(candidate)?;
        if present {
            self.landed = Some(candidate);
        }
        Ok(())
    }

    /// Move `landed` to the latest accepted checkpoint once Solana has it.
    async fn refresh_landed(&mut self) -> Result<Option<OutputRoot>, HandlerError> {
        let Some(latest) = self.checkpoints.latest().copied() else {
            return Ok(None);
        };
        if self.landed == Some(latest) {
            return Ok(self.landed);
        }
        let block = latest.reference_block_number;
        if self.sink.output_root_exists(block).await? {
            debug!(block, "Output root confirmed on Solana");
            self.landed = Some(latest);
        } else {
            debug!(block, "Output root not on Solana yet, deferring relay");
        }
        Ok(self.landed)
    }

    async fn relay_covered(&mut self) -> Result<(), HandlerError> {
        let Some(relayer) = self.relayer.clone() else {
            return Ok(());
        };
        let Some(checkpoint) = self.refresh_landed().await? else {
            return Ok(());
        };

        for tracked in self.book.pending_within(checkpoint.total_leaf_count) {
            if self.abandoned.contains(&tracked.hash) {
                continue;
            }
            let hash_hex = bytes32_to_hex(&tracked.hash);
            let proof = self
                .accumulator
                .proof_at(tracked.leaf_index, checkpoint.total_leaf_count)
                .map_err(|e| HandlerError::Fatal(eyre::Report::new(e)))?;
            if !mmr::verify(&checkpoint.root, &tracked.hash, &proof) {
                let err = ProtocolError::ProofMismatch(checkpoint.reference_block_number);
                warn!(message_hash = %hash_hex, error = %err, "Not relaying message");
                self.abandoned.insert(tracked.hash);
                continue;
            }

            let proven = ProvenMessage {
                message: tracked.message.clone(),
                hash: tracked.hash,
                proof,
                checkpoint,
            };
            match relayer.relay(&proven).await {
                Ok(receipt) => {
                    self.mark_executed(&tracked.hash);
                    info!(
                        message_hash = %hash_hex,
                        nonce = tracked.message.nonce,
                        tx = %receipt.tx_id,
                        "Message relayed"
                    );
                }
                Err(HandlerError::Protocol(ProtocolError::AlreadyExecuted(_))) => {
                    self.mark_executed(&tracked.hash);
                    debug!(message_hash = %hash_hex, "Message already executed on Solana");
                }
                Err(e) if e.is_settled() => {
                    warn!(message_hash = %hash_hex, error = %e, "Message relay rejected");
                    self.abandoned.insert(tracked.hash);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn mark_executed(&mut self, hash: &[u8; 32]) {
        if self.book.status(hash) == Some(MessageStatus::Registered) {
            let _ = self.book.mark_proven(hash);
        }
        if let Err(e) = self.book.mark_executed(hash) {
            debug!(message_hash = %bytes32_to_hex(hash), error = %e, "Status unchanged");
        }
    }
}

#[async_trait]
impl<S, R> Handler<RegisteredMessage> for RegistryHandler<S, R>
where
    S: CheckpointSink,
    R: Relay<ProvenMessage>,
{
    async fn handle(&mut self, event: &Observed<RegisteredMessage>) -> Result<(), HandlerError> {
        let registered = &event.event;
        let nonce = registered.message.nonce;

        match self.nonces.check(nonce) {
            Ok(NonceCheck::Fresh) => {}
            Ok(NonceCheck::Duplicate) => {
                debug!(nonce, block = event.height, "Message already committed, skipping");
                return Ok(());
            }
            Err(gap) => return Err(HandlerError::Transient(eyre::Report::new(gap))),
        }

        let leaf_index = self
            .accumulator
            .append(&registered.message_hash)
            .map_err(|e| HandlerError::Fatal(eyre::Report::new(e)))?;
        self.leaf_blocks.push(event.height);
        self.nonces.advance();
        let hash = self.book.register(registered.message.clone(), leaf_index);

        let root = self
            .accumulator
            .root()
            .map_err(|e| HandlerError::Fatal(eyre::Report::new(e)))?;
        info!(
            nonce,
            leaf_index,
            block = event.height,
            message_hash = %bytes32_to_hex(&hash),
            root = %bytes32_to_hex(&root),
            "Message committed"
        );
        Ok(())
    }

    async fn on_batch_end(&mut self, height: u64) -> Result<(), HandlerError> {
        self.publish_checkpoint(height).await?;
        self.relay_covered().await
    }
}
