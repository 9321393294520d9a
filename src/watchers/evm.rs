//! Base watcher for `MessageRegistered` events.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::pubsub::{PubSubFrontend, Subscription};
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use super::{Delivery, Feed, Handler, Mode, Observed, PollSource, PollingWatcher, Undecoded};
use crate::config::{EvmConfig, WatcherConfig};
use crate::error::{DecodeError, FeedError};
use crate::hash::bytes32_to_hex;
use crate::message::OutgoingMessage;
use crate::retry::with_timeout;
use crate::shutdown::Shutdown;

sol! {
    /// Emitted by the Base bridge when an outgoing message is committed
    event MessageRegistered(bytes32 indexed messageHash, uint64 indexed nonce, bytes message);
}

/// A verified outgoing message observed on Base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMessage {
    pub message_hash: [u8; 32],
    pub message: OutgoingMessage,
    pub block_number: u64,
}

/// Decode a `MessageRegistered` log and check its hash and nonce.
pub fn decode_registered(log: &Log) -> Delivery<RegisteredMessage> {
    let height = log.block_number.unwrap_or_default();
    let undecoded = |error: DecodeError| Undecoded { height, error };

    if log.block_number.is_none() {
        return Err(undecoded(DecodeError::Malformed("log without block number".into())));
    }

    let event = MessageRegistered::decode_raw_log(
        log.topics().iter().copied(),
        &log.data().data,
        true,
    )
    .map_err(|e| undecoded(DecodeError::Malformed(e.to_string())))?;

    let message = OutgoingMessage::decode(&event.message).map_err(undecoded)?;
    let computed = message.hash();
    let claimed: [u8; 32] = event.messageHash.0;
    if computed != claimed {
        return Err(undecoded(DecodeError::HashMismatch {
            event: bytes32_to_hex(&claimed),
            computed: bytes32_to_hex(&computed),
        }));
    }
    if message.nonce != event.nonce {
        return Err(undecoded(DecodeError::Malformed(format!(
            "topic nonce {} does not match message nonce {}",
            event.nonce, message.nonce
        ))));
    }

    Ok(Observed {
        height,
        id: claimed,
        event: RegisteredMessage {
            message_hash: claimed,
            message,
            block_number: height,
        },
    })
}

fn registered_filter(bridge: Address) -> Filter {
    Filter::new()
        .address(bridge)
        .event_signature(MessageRegistered::SIGNATURE_HASH)
}

/// Range queries over HTTP, lagging the head by the finality depth
pub struct EvmLogSource {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
    finality_blocks: u64,
    rpc_timeout: Duration,
}

impl EvmLogSource {
    pub fn new(config: &EvmConfig, rpc_timeout: Duration) -> Result<Self> {
        let url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        let bridge_address =
            Address::from_str(&config.bridge_address).wrap_err("Invalid bridge address")?;

        Ok(Self {
            provider,
            bridge_address,
            finality_blocks: config.finality_blocks,
            rpc_timeout,
        })
    }
}

#[async_trait]
impl PollSource for EvmLogSource {
    type Event = RegisteredMessage;

    async fn best_height(&mut self) -> Result<u64> {
        let head = with_timeout(
            self.rpc_timeout,
            "eth_blockNumber",
            self.provider.get_block_number(),
        )
        .await?;
        Ok(head.saturating_sub(self.finality_blocks))
    }

    async fn fetch(&mut self, from: u64, to: u64) -> Result<Vec<Delivery<RegisteredMessage>>> {
        let filter = registered_filter(self.bridge_address)
            .from_block(from)
            .to_block(to);
        let logs = with_timeout(self.rpc_timeout, "eth_getLogs", self.provider.get_logs(&filter))
            .await
            .wrap_err_with(|| format!("Failed to get logs from block {} to {}", from, to))?;

        if !logs.is_empty() {
            debug!(count = logs.len(), from, to, "Found MessageRegistered logs");
        }
        Ok(logs.iter().filter(|l| !l.removed).map(decode_registered).collect())
    }
}

/// Live `eth_subscribe("logs")` feed over a websocket
///
/// Head logs are not final, so deliveries are only used as a wake-up for
/// range queries. Removed logs and lag are therefore harmless.
pub struct EvmLogFeed {
    provider: Option<RootProvider<PubSubFrontend>>,
    subscription: Option<Subscription<Log>>,
}

impl EvmLogFeed {
    pub async fn connect(watch_url: &str, bridge_address: &str) -> Result<Self> {
        let bridge_address = Address::from_str(bridge_address).wrap_err("Invalid bridge address")?;
        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(watch_url))
            .await
            .wrap_err("Failed to connect EVM websocket")?;
        let subscription = provider
            .subscribe_logs(&registered_filter(bridge_address))
            .await
            .wrap_err("Failed to subscribe to MessageRegistered logs")?;

        info!(url = %watch_url, "Subscribed to MessageRegistered logs");
        Ok(Self {
            provider: Some(provider),
            subscription: Some(subscription),
        })
    }
}

#[async_trait]
impl Feed for EvmLogFeed {
    type Event = RegisteredMessage;

    async fn next(&mut self) -> std::result::Result<Option<Delivery<RegisteredMessage>>, FeedError> {
        let subscription = match self.subscription.as_mut() {
            Some(s) => s,
            None => return Ok(None),
        };
        loop {
            match subscription.recv().await {
                Ok(log) if log.removed => {
                    debug!(tx_hash = ?log.transaction_hash, "Ignoring removed log");
                }
                Ok(log) => return Ok(Some(decode_registered(&log))),
                Err(RecvError::Closed) => return Err(FeedError::Closed("log subscription".into())),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Log subscription lagged");
                }
            }
        }
    }

    async fn close(&mut self) {
        self.subscription.take();
        self.provider.take();
    }
}

/// Watch Base in the mode selected by the watch URL.
///
/// Both modes fold only ranges at least `finality_blocks` deep into the
/// accumulator. In subscription mode the log feed triggers those queries
/// instead of supplying events.
pub async fn run<H>(
    evm: &EvmConfig,
    timing: &WatcherConfig,
    handler: H,
    shutdown: Shutdown,
) -> Result<()>
where
    H: Handler<RegisteredMessage> + 'static,
{
    let source = EvmLogSource::new(evm, timing.rpc_timeout())?;
    let poller =
        PollingWatcher::new("evm", source, handler, evm.start_block, timing.poll_interval())
            .with_max_range(evm.max_block_range);

    match Mode::from_url(&evm.watch_url) {
        Mode::Polling => poller.run(shutdown).await,
        Mode::Subscription => {
            let feed = EvmLogFeed::connect(&evm.watch_url, &evm.bridge_address).await?;
            poller.run_triggered(feed, shutdown).await
        }
    }
}

/// Parse a 0x-prefixed EVM address into raw bytes.
pub fn parse_address(s: &str) -> Result<[u8; 20]> {
    let address = Address::from_str(s).map_err(|e| eyre!("Invalid EVM address {}: {}", s, e))?;
    Ok(address.into_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Ix, Payload};
    use alloy::primitives::{Bytes, LogData, B256};

    fn message(nonce: u64) -> OutgoingMessage {
        OutgoingMessage {
            nonce,
            sender: [0x44; 20],
            gas_limit: 150_000,
            payload: Payload::Call(vec![Ix {
                program_id: [1u8; 32],
                accounts: vec![],
                data: vec![9],
            }]),
        }
    }

    fn log_for(hash: [u8; 32], topic_nonce: u64, body: Vec<u8>, block: Option<u64>) -> Log {
        let event = MessageRegistered {
            messageHash: B256::from(hash),
            nonce: topic_nonce,
            message: Bytes::from(body),
        };
        let data: LogData = event.encode_log_data();
        Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data,
            },
            block_number: block,
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_valid_log() {
        let msg = message(4);
        let log = log_for(msg.hash(), 4, msg.encode(), Some(77));
        let observed = decode_registered(&log).unwrap();
        assert_eq!(observed.height, 77);
        assert_eq!(observed.id, msg.hash());
        assert_eq!(observed.event.message, msg);
    }

    #[test]
    fn test_decode_rejects_hash_mismatch() {
        let msg = message(4);
        let log = log_for([0u8; 32], 4, msg.encode(), Some(77));
        let err = decode_registered(&log).unwrap_err();
        assert!(matches!(err.error, DecodeError::HashMismatch { .. }));
        assert_eq!(err.height, 77);
    }

    #[test]
    fn test_decode_rejects_nonce_mismatch_and_garbage() {
        let msg = message(4);
        let log = log_for(msg.hash(), 5, msg.encode(), Some(1));
        assert!(decode_registered(&log).is_err());

        let log = log_for(msg.hash(), 4, vec![1, 2, 3], Some(1));
        assert!(matches!(
            decode_registered(&log).unwrap_err().error,
            DecodeError::Malformed(_)
        ));

        let log = log_for(msg.hash(), 4, msg.encode(), None);
        assert!(decode_registered(&log).is_err());
    }

    #[test]
    fn test_parse_address() {
        let bytes = parse_address("0x0000000000000000000000000000000000000001").unwrap();
        assert_eq!(bytes[19], 1);
        assert!(parse_address("0x12").is_err());
    }
}
