//! Submits Solana deposits as transactions on Base.
//!
//! The signer's pending nonce, a scaled gas price and the sender's balance are
//! read before signing. Each deposit is signed once: the raw transaction is
//! kept until its receipt arrives, and a retried relay waits on that
//! transaction instead of signing another.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::{Relay, RelayReceipt};
use crate::config::EvmConfig;
use crate::deposit::DepositTx;
use crate::error::{HandlerError, ProtocolError};
use crate::hash::bytes32_to_hex;
use crate::retry::{classify_error, into_handler_error, with_timeout, ErrorClass};

/// Delay between receipt lookups while a transaction is pending
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Gas price after applying the configured multiplier.
pub fn scaled_gas_price(suggested: u128, multiplier_pct: u64) -> u128 {
    suggested.saturating_mul(multiplier_pct as u128) / 100
}

/// Upper bound on what a deposit transaction can spend.
pub fn max_cost(gas: u64, gas_price: u128, value: U256) -> U256 {
    U256::from(gas)
        .saturating_mul(U256::from(gas_price))
        .saturating_add(value)
}

/// Refuse to sign when the sender cannot cover `cost`.
pub fn check_balance(balance: U256, cost: U256) -> Result<(), ProtocolError> {
    if balance < cost {
        return Err(ProtocolError::InsufficientBalance {
            needed: cost.to_string(),
            available: balance.to_string(),
        });
    }
    Ok(())
}

/// A mined receipt's status as a relay outcome.
pub fn receipt_outcome(tx_id: String, success: bool) -> Result<RelayReceipt, ProtocolError> {
    if !success {
        return Err(ProtocolError::Reverted(tx_id));
    }
    Ok(RelayReceipt {
        tx_id,
        confirmed: true,
    })
}

/// Unsigned transaction carrying `deposit`.
pub fn build_request(
    deposit: &DepositTx,
    from: Address,
    nonce: u64,
    gas_price: u128,
    chain_id: u64,
) -> TransactionRequest {
    let input = Bytes::from(deposit.data.clone());
    let request = TransactionRequest::default()
        .with_from(from)
        .with_nonce(nonce)
        .with_gas_limit(deposit.gas)
        .with_gas_price(gas_price)
        .with_chain_id(chain_id)
        .with_value(U256::from(deposit.value));

    match deposit.to {
        Some(to) => request.with_to(Address::from(to)).with_input(input),
        None => request.with_deploy_code(input),
    }
}

/// A signed deposit transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDeposit {
    pub tx_hash: B256,
    pub raw: Bytes,
}

/// Base RPC calls made by the relayer
#[async_trait]
pub trait BaseRpc: Send + Sync {
    async fn pending_nonce(&self, address: Address) -> Result<u64>;

    async fn gas_price(&self) -> Result<u128>;

    async fn balance(&self, address: Address) -> Result<U256>;

    async fn send_raw(&self, raw: &Bytes) -> Result<()>;

    /// Receipt status (`true` on success); `None` until mined.
    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>>;
}

/// JSON-RPC over HTTP
pub struct HttpBaseRpc {
    provider: RootProvider<Http<Client>>,
    rpc_timeout: Duration,
}

impl HttpBaseRpc {
    pub fn new(rpc_url: &str, rpc_timeout: Duration) -> Result<Self> {
        let url = rpc_url.parse().wrap_err("Invalid RPC URL")?;
        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            rpc_timeout,
        })
    }
}

#[async_trait]
impl BaseRpc for HttpBaseRpc {
    async fn pending_nonce(&self, address: Address) -> Result<u64> {
        with_timeout(
            self.rpc_timeout,
            "eth_getTransactionCount",
            self.provider.get_transaction_count(address).pending(),
        )
        .await
    }

    async fn gas_price(&self) -> Result<u128> {
        with_timeout(self.rpc_timeout, "eth_gasPrice", self.provider.get_gas_price()).await
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        with_timeout(self.rpc_timeout, "eth_getBalance", self.provider.get_balance(address)).await
    }

    async fn send_raw(&self, raw: &Bytes) -> Result<()> {
        with_timeout(
            self.rpc_timeout,
            "eth_sendRawTransaction",
            self.provider.send_raw_transaction(raw.as_ref()),
        )
        .await?;
        Ok(())
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>> {
        let receipt = with_timeout(
            self.rpc_timeout,
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(tx_hash),
        )
        .await?;
        Ok(receipt.map(|r| r.status()))
    }
}

/// Base transaction submitter
pub struct EvmRelayer<C = HttpBaseRpc> {
    rpc: C,
    wallet: EthereumWallet,
    address: Address,
    chain_id: u64,
    gas_price_multiplier_pct: u64,
    rpc_timeout: Duration,
    /// Broadcast transactions without a receipt yet, by source hash
    in_flight: Mutex<HashMap<[u8; 32], SignedDeposit>>,
}

impl EvmRelayer<HttpBaseRpc> {
    pub fn new(config: &EvmConfig, rpc_timeout: Duration) -> Result<Self> {
        let signer = PrivateKeySigner::from_str(&config.private_key)
            .wrap_err("Invalid private key")?;
        let rpc = HttpBaseRpc::new(&config.rpc_url, rpc_timeout)?;
        Ok(Self::with_rpc(
            rpc,
            signer,
            config.chain_id,
            config.gas_price_multiplier_pct,
            rpc_timeout,
        ))
    }
}

impl<C: BaseRpc> EvmRelayer<C> {
    pub fn with_rpc(
        rpc: C,
        signer: PrivateKeySigner,
        chain_id: u64,
        gas_price_multiplier_pct: u64,
        rpc_timeout: Duration,
    ) -> Self {
        let address = signer.address();
        info!(relayer_address = %address, chain_id, "EVM relayer initialized");

        Self {
            rpc,
            wallet: EthereumWallet::from(signer),
            address,
            chain_id,
            gas_price_multiplier_pct,
            rpc_timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Deposits broadcast but not yet mined
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<[u8; 32], SignedDeposit>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sign(
        &self,
        deposit: &DepositTx,
        nonce: u64,
        gas_price: u128,
    ) -> Result<SignedDeposit> {
        let request = build_request(deposit, self.address, nonce, gas_price, self.chain_id);
        let envelope = request
            .build(&self.wallet)
            .await
            .wrap_err("Failed to sign deposit transaction")?;
        Ok(SignedDeposit {
            tx_hash: *envelope.tx_hash(),
            raw: Bytes::from(envelope.encoded_2718()),
        })
    }

    async fn poll_receipt(&self, tx_hash: B256) -> Result<bool> {
        loop {
            if let Some(success) = self.rpc.receipt_status(tx_hash).await? {
                return Ok(success);
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn await_receipt(&self, tx_hash: B256) -> Result<bool> {
        tokio::time::timeout(self.rpc_timeout, self.poll_receipt(tx_hash))
            .await
            .map_err(|_| eyre!("Timed out waiting for receipt of {}", tx_hash))?
    }

    async fn broadcast(&self, deposit: &DepositTx) -> Result<Result<SignedDeposit, ProtocolError>> {
        let nonce = self.rpc.pending_nonce(self.address).await?;
        let suggested = self.rpc.gas_price().await?;
        let gas_price = scaled_gas_price(suggested, self.gas_price_multiplier_pct);

        let cost = max_cost(deposit.gas, gas_price, U256::from(deposit.value));
        let balance = self.rpc.balance(self.address).await?;
        if let Err(rejected) = check_balance(balance, cost) {
            return Ok(Err(rejected));
        }

        let signed = self.sign(deposit, nonce, gas_price).await?;
        debug!(
            source_hash = %bytes32_to_hex(&deposit.source_hash),
            tx_hash = %signed.tx_hash,
            nonce,
            gas = deposit.gas,
            gas_price,
            creation = deposit.is_creation(),
            "Submitting deposit transaction"
        );

        // Recorded first: a timed-out send may still have reached the node.
        self.pending().insert(deposit.source_hash, signed.clone());
        if let Err(e) = self.rpc.send_raw(&signed.raw).await {
            if classify_error(&format!("{:#}", e)) == ErrorClass::Permanent {
                self.pending().remove(&deposit.source_hash);
            }
            return Err(e);
        }
        info!(tx_hash = %signed.tx_hash, "Deposit transaction sent");
        Ok(Ok(signed))
    }

    async fn submit(&self, deposit: &DepositTx) -> Result<Result<RelayReceipt, ProtocolError>> {
        let source_hash = deposit.source_hash;
        let earlier = self.pending().get(&source_hash).cloned();

        let signed = match earlier {
            Some(signed) => {
                if let Some(success) = self.rpc.receipt_status(signed.tx_hash).await? {
                    return Ok(self.settle(&source_hash, &signed, success));
                }
                info!(
                    source_hash = %bytes32_to_hex(&source_hash),
                    tx_hash = %signed.tx_hash,
                    "Deposit already broadcast, resending the same transaction"
                );
                if let Err(e) = self.rpc.send_raw(&signed.raw).await {
                    debug!(tx_hash = %signed.tx_hash, error = %e, "Resend not accepted");
                }
                signed
            }
            None => match self.broadcast(deposit).await? {
                Ok(signed) => signed,
                Err(rejected) => return Ok(Err(rejected)),
            },
        };

        let success = self.await_receipt(signed.tx_hash).await?;
        Ok(self.settle(&source_hash, &signed, success))
    }

    fn settle(
        &self,
        source_hash: &[u8; 32],
        signed: &SignedDeposit,
        success: bool,
    ) -> Result<RelayReceipt, ProtocolError> {
        self.pending().remove(source_hash);
        let outcome = receipt_outcome(format!("0x{:x}", signed.tx_hash), success);
        match &outcome {
            Ok(receipt) => info!(
                tx_hash = %receipt.tx_id,
                source_hash = %bytes32_to_hex(source_hash),
                "Deposit transaction confirmed"
            ),
            Err(e) => warn!(
                source_hash = %bytes32_to_hex(source_hash),
                error = %e,
                "Deposit failed on Base"
            ),
        }
        outcome
    }
}

#[async_trait]
impl<C: BaseRpc> Relay<DepositTx> for EvmRelayer<C> {
    async fn relay(&self, deposit: &DepositTx) -> Result<RelayReceipt, HandlerError> {
        match self.submit(deposit).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(rejected)) => Err(HandlerError::Protocol(rejected)),
            Err(e) => Err(into_handler_error(e)),
        }
    }
}
