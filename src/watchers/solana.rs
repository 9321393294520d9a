//! Solana watcher for `MessageSent` deposits.
//!
//! Anchor events are emitted as `Program data: <base64>` log lines whose
//! first 8 bytes are `sha256("event:<Name>")[..8]`. Only lines emitted while
//! the bridge program is at the top of the invocation stack are considered;
//! unknown discriminators are skipped.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use eyre::{Result, WrapErr};
use futures::StreamExt;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::{
    RpcTransactionConfig, RpcTransactionLogsConfig, RpcTransactionLogsFilter,
};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::UiTransactionEncoding;
use std::str::FromStr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Delivery, Feed, Handler, Mode, Observed, PollSource, PollingWatcher, SubscriptionWatcher,
    Undecoded,
};
use crate::config::{SolanaConfig, WatcherConfig};
use crate::deposit::{DepositTx, MessageSent};
use crate::error::{DecodeError, FeedError};
use crate::retry::with_timeout;
use crate::shutdown::Shutdown;

const SIGNATURE_PAGE_LIMIT: usize = 1000;

/// Decode every bridge event in one transaction's logs.
pub fn decode_program_logs(
    program_id: &Pubkey,
    signature: &str,
    slot: u64,
    logs: &[String],
) -> Vec<Delivery<DepositTx>> {
    let program = program_id.to_string();
    let signature_bytes = bs58::decode(signature)
        .into_vec()
        .unwrap_or_else(|_| signature.as_bytes().to_vec());

    let mut stack: Vec<&str> = Vec::new();
    let mut event_index = 0u64;
    let mut out = Vec::new();

    for line in logs {
        if let Some(rest) = line.strip_prefix("Program ") {
            let mut parts = rest.split_whitespace();
            let (Some(id), Some(verb)) = (parts.next(), parts.next()) else {
                continue;
            };
            match verb {
                "invoke" => {
                    stack.push(id);
                    continue;
                }
                "success" | "failed:" => {
                    stack.pop();
                    continue;
                }
                _ => {}
            }
        }

        let Some(payload) = line.strip_prefix("Program data: ") else {
            continue;
        };
        if stack.last() != Some(&program.as_str()) {
            continue;
        }

        let index = event_index;
        event_index += 1;

        match decode_event(payload.trim(), &signature_bytes, index) {
            Ok(Some(deposit)) => out.push(Ok(Observed {
                height: slot,
                id: deposit.source_hash,
                event: deposit,
            })),
            Ok(None) => {}
            Err(error) => out.push(Err(Undecoded { height: slot, error })),
        }
    }

    out
}

fn decode_event(
    payload: &str,
    signature: &[u8],
    event_index: u64,
) -> std::result::Result<Option<DepositTx>, DecodeError> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| DecodeError::Malformed(format!("invalid base64: {}", e)))?;
    if bytes.len() < 8 {
        return Err(DecodeError::DiscriminatorLength(bytes.len()));
    }
    if bytes[..8] != MessageSent::discriminator() {
        return Ok(None);
    }
    let event = MessageSent::decode(&bytes[8..])?;
    DepositTx::from_event(&event, signature, event_index).map(Some)
}

/// Slot-range queries over the signature history of the bridge program
pub struct SolanaLogSource {
    rpc: RpcClient,
    program_id: Pubkey,
    commitment: CommitmentConfig,
    rpc_timeout: Duration,
}

impl SolanaLogSource {
    pub fn new(
        rpc_url: &str,
        program_id: Pubkey,
        commitment: CommitmentConfig,
        rpc_timeout: Duration,
    ) -> Self {
        let rpc = RpcClient::new_with_timeout_and_commitment(
            rpc_url.to_string(),
            rpc_timeout,
            commitment,
        );
        Self {
            rpc,
            program_id,
            commitment,
            rpc_timeout,
        }
    }

    /// Signatures with `from <= slot <= to`, oldest first.
    async fn signatures_in_range(&self, from: u64, to: u64) -> Result<Vec<(String, u64)>> {
        let mut collected = Vec::new();
        let mut before: Option<Signature> = None;

        loop {
            let config = GetConfirmedSignaturesForAddress2Config {
                before,
                until: None,
                limit: Some(SIGNATURE_PAGE_LIMIT),
                commitment: Some(self.commitment),
            };
            let page = with_timeout(
                self.rpc_timeout,
                "getSignaturesForAddress",
                self.rpc
                    .get_signatures_for_address_with_config(&self.program_id, config),
            )
            .await?;

            let page_len = page.len();
            let mut reached_start = false;
            for status in page {
                if status.slot < from {
                    reached_start = true;
                    break;
                }
                before = Some(
                    Signature::from_str(&status.signature)
                        .wrap_err("RPC returned an invalid signature")?,
                );
                if status.slot <= to && status.err.is_none() {
                    collected.push((status.signature, status.slot));
                }
            }

            if reached_start || page_len < SIGNATURE_PAGE_LIMIT {
                break;
            }
        }

        collected.reverse();
        Ok(collected)
    }
}

#[async_trait]
impl PollSource for SolanaLogSource {
    type Event = DepositTx;

    async fn best_height(&mut self) -> Result<u64> {
        with_timeout(
            self.rpc_timeout,
            "getSlot",
            self.rpc.get_slot_with_commitment(self.commitment),
        )
        .await
    }

    async fn fetch(&mut self, from: u64, to: u64) -> Result<Vec<Delivery<DepositTx>>> {
        let signatures = self.signatures_in_range(from, to).await?;
        let mut deliveries = Vec::new();

        for (signature, slot) in signatures {
            let parsed = Signature::from_str(&signature).wrap_err("invalid signature")?;
            let config = RpcTransactionConfig {
                encoding: Some(UiTransactionEncoding::Json),
                commitment: Some(self.commitment),
                max_supported_transaction_version: Some(0),
            };
            let tx = with_timeout(
                self.rpc_timeout,
                "getTransaction",
                self.rpc.get_transaction_with_config(&parsed, config),
            )
            .await?;

            let logs: Option<Vec<String>> = tx
                .transaction
                .meta
                .and_then(|meta| Option::<Vec<String>>::from(meta.log_messages));
            let Some(logs) = logs else {
                debug!(%signature, "Transaction has no log messages");
                continue;
            };
            deliveries.extend(decode_program_logs(&self.program_id, &signature, slot, &logs));
        }

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), from, to, "Found bridge events");
        }
        Ok(deliveries)
    }
}

enum FeedItem {
    Logs {
        slot: u64,
        signature: String,
        logs: Vec<String>,
    },
    /// The subscription ended; `Some` carries a transport error
    Ended(Option<String>),
}

/// Live `logsSubscribe` feed.
///
/// The pubsub stream borrows its client, so a dedicated task owns both and
/// forwards notifications over a channel.
pub struct SolanaLogFeed {
    program_id: Pubkey,
    rx: mpsc::Receiver<FeedItem>,
    pending: VecDeque<Delivery<DepositTx>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SolanaLogFeed {
    pub async fn connect(
        watch_url: &str,
        program_id: Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<Self> {
        let client = PubsubClient::new(watch_url)
            .await
            .wrap_err("Failed to connect Solana websocket")?;

        let (tx, rx) = mpsc::channel(256);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let filter = RpcTransactionLogsFilter::Mentions(vec![program_id.to_string()]);
            let config = RpcTransactionLogsConfig {
                commitment: Some(commitment),
            };

            let (mut stream, unsubscribe) = match client.logs_subscribe(filter, config).await {
                Ok(sub) => sub,
                Err(e) => {
                    let _ = tx.send(FeedItem::Ended(Some(e.to_string()))).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        unsubscribe().await;
                        break;
                    }
                    item = stream.next() => match item {
                        Some(response) => {
                            if response.value.err.is_some() {
                                continue;
                            }
                            let item = FeedItem::Logs {
                                slot: response.context.slot,
                                signature: response.value.signature,
                                logs: response.value.logs,
                            };
                            if tx.send(item).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = tx.send(FeedItem::Ended(None)).await;
                            break;
                        }
                    }
                }
            }
            info!(program = %program_id, "Solana log subscription closed");
        });

        info!(url = %watch_url, program = %program_id, "Subscribed to program logs");
        Ok(Self {
            program_id,
            rx,
            pending: VecDeque::new(),
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

#[async_trait]
impl Feed for SolanaLogFeed {
    type Event = DepositTx;

    async fn next(&mut self) -> std::result::Result<Option<Delivery<DepositTx>>, FeedError> {
        loop {
            if let Some(delivery) = self.pending.pop_front() {
                return Ok(Some(delivery));
            }
            match self.rx.recv().await {
                Some(FeedItem::Logs {
                    slot,
                    signature,
                    logs,
                }) => {
                    self.pending
                        .extend(decode_program_logs(&self.program_id, &signature, slot, &logs));
                }
                Some(FeedItem::Ended(None)) => return Ok(None),
                Some(FeedItem::Ended(Some(e))) => return Err(FeedError::Broken(e)),
                None => return Err(FeedError::Closed("forwarding task exited".into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Solana subscription task did not exit cleanly");
            }
        }
    }
}

/// Watch Solana in the mode selected by the watch URL.
pub async fn run<H>(
    solana: &SolanaConfig,
    commitment: CommitmentConfig,
    timing: &WatcherConfig,
    handler: H,
    shutdown: Shutdown,
) -> Result<()>
where
    H: Handler<DepositTx> + 'static,
{
    let program_id = solana.program_id()?;
    let mut source =
        SolanaLogSource::new(&solana.rpc_url, program_id, commitment, timing.rpc_timeout());
    let start = match solana.start_slot {
        Some(slot) => slot,
        None => source.best_height().await.wrap_err("Failed to fetch starting slot")?,
    };
    let poller = PollingWatcher::new("solana", source, handler, start, timing.poll_interval());

    match Mode::from_url(&solana.watch_url) {
        Mode::Polling => poller.run(shutdown).await,
        Mode::Subscription => {
            let feed = SolanaLogFeed::connect(&solana.watch_url, program_id, commitment).await?;
            let mut poller = poller;
            poller.catch_up(&shutdown).await?;
            let (handler, cursor) = poller.into_parts();
            SubscriptionWatcher::new("solana", feed, handler, cursor, timing.recv_timeout())
                .run(shutdown)
                .await
                .map(|_| ())
        }
    }
}
