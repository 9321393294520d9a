//! Solana → Base: relay `MessageSent` deposits exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::unix_now;
use crate::dedup::SeenEvents;
use crate::deposit::DepositTx;
use crate::error::HandlerError;
use crate::fees::FeeModel;
use crate::hash::bytes32_to_hex;
use crate::relayers::Relay;
use crate::watchers::{Handler, Observed};

pub struct DepositHandler<R> {
    relayer: Arc<R>,
    seen: SeenEvents,
    fees: Arc<FeeModel>,
    clock: fn() -> i64,
}

impl<R: Relay<DepositTx>> DepositHandler<R> {
    pub fn new(relayer: Arc<R>, seen: SeenEvents, fees: Arc<FeeModel>) -> Self {
        Self {
            relayer,
            seen,
            fees,
            clock: unix_now,
        }
    }

    /// Replace the wall clock used for fee windows.
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn seen(&self) -> &SeenEvents {
        &self.seen
    }
}

#[async_trait]
impl<R: Relay<DepositTx>> Handler<DepositTx> for DepositHandler<R> {
    async fn handle(&mut self, event: &Observed<DepositTx>) -> Result<(), HandlerError> {
        let deposit = &event.event;
        let source_hash = bytes32_to_hex(&event.id);

        if !self.seen.claim(event.id) {
            debug!(
                source_hash = %source_hash,
                slot = event.height,
                "Deposit already handled, skipping"
            );
            return Ok(());
        }

        if let Ok(json) = serde_json::to_string(deposit) {
            debug!(source_hash = %source_hash, deposit = %json, "Deposit decoded");
        }

        let now = (self.clock)();
        let quote = self.fees.quote(deposit.gas, now);
        debug!(
            source_hash = %source_hash,
            slot = event.height,
            gas = deposit.gas,
            base_fee = quote.base_fee,
            fee = quote.fee,
            creation = deposit.is_creation(),
            "Relaying deposit"
        );

        match self.relayer.relay(deposit).await {
            Ok(receipt) => {
                let charged = self.fees.charge(deposit.gas, now);
                info!(
                    source_hash = %source_hash,
                    tx = %receipt.tx_id,
                    fee = charged.fee,
                    base_fee = charged.base_fee,
                    "Deposit relayed"
                );
                Ok(())
            }
            Err(e) if e.is_settled() => {
                warn!(source_hash = %source_hash, error = %e, "Deposit rejected by Base");
                Err(e)
            }
            Err(e) => {
                // Let the retry reach the relayer again.
                self.seen.release(&event.id);
                Err(e)
            }
        }
    }
}
