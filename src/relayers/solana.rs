//! Publishes checkpoints and proves/relays messages on Solana.
//!
//! The oracle keypair pays for every transaction. A fresh blockhash is
//! fetched right before signing; submission returns the signature without
//! waiting for finality.

use std::time::Duration;

use async_trait::async_trait;
use borsh::BorshSerialize;
use eyre::{eyre, Result, WrapErr};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::system_program;
use solana_sdk::transaction::Transaction;
use tracing::{debug, info};

use super::{CheckpointSink, CheckpointSubmission, ProvenMessage, Relay, RelayReceipt};
use crate::checkpoint::OutputRoot;
use crate::error::{HandlerError, ProtocolError};
use crate::hash::{bytes32_to_hex, instruction_discriminator};
use crate::message::{IncomingMessage, OutgoingMessage, Payload, Transfer};
use crate::pda;
use crate::retry::{into_handler_error, with_timeout};

pub const PROVE_MESSAGE: &str = "prove_message";
pub const RELAY_MESSAGE: &str = "relay_message";

/// SPL Token program
pub const TOKEN_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");

#[derive(BorshSerialize)]
struct ProofArgs {
    proof: Vec<[u8; 32]>,
    leaf_index: u64,
    total_leaf_count: u64,
}

#[derive(BorshSerialize)]
struct ProveMessageArgs {
    nonce: u64,
    sender: [u8; 20],
    data: Vec<u8>,
    proof: ProofArgs,
    message_hash: [u8; 32],
}

/// `register_output_root` for `checkpoint`.
pub fn register_output_root_ix(
    program_id: &Pubkey,
    payer: &Pubkey,
    checkpoint: &OutputRoot,
) -> Instruction {
    let accounts = vec![
        AccountMeta::new(*payer, true),
        AccountMeta::new(pda::output_root(program_id, checkpoint.reference_block_number), false),
        AccountMeta::new(pda::bridge(program_id), false),
        AccountMeta::new_readonly(system_program::ID, false),
    ];
    Instruction::new_with_bytes(*program_id, &checkpoint.instruction_data(), accounts)
}

/// `prove_message`, creating the message's `IncomingMessage` account.
pub fn prove_message_ix(
    program_id: &Pubkey,
    payer: &Pubkey,
    proven: &ProvenMessage,
) -> Result<Instruction> {
    let args = ProveMessageArgs {
        nonce: proven.message.nonce,
        sender: proven.message.sender,
        data: proven.message.payload.encode(),
        proof: ProofArgs {
            proof: proven.proof.path.clone(),
            leaf_index: proven.proof.leaf_index,
            total_leaf_count: proven.proof.total_leaf_count,
        },
        message_hash: proven.hash,
    };
    let mut data = instruction_discriminator(PROVE_MESSAGE).to_vec();
    data.extend(args.try_to_vec().wrap_err("Failed to encode prove_message args")?);

    let accounts = vec![
        AccountMeta::new(*payer, true),
        AccountMeta::new(pda::incoming_message(program_id, &proven.hash), false),
        AccountMeta::new_readonly(
            pda::output_root(program_id, proven.checkpoint.reference_block_number),
            false,
        ),
        AccountMeta::new_readonly(system_program::ID, false),
    ];
    Ok(Instruction::new_with_bytes(*program_id, &data, accounts))
}

/// Accounts a transfer touches, in the order the program reads them.
pub fn transfer_accounts(program_id: &Pubkey, transfer: &Transfer) -> Vec<AccountMeta> {
    match transfer {
        Transfer::Sol { to, remote_token, .. } => vec![
            AccountMeta::new(pda::sol_vault(program_id, remote_token), false),
            AccountMeta::new(Pubkey::new_from_array(*to), false),
            AccountMeta::new_readonly(system_program::ID, false),
        ],
        Transfer::Spl {
            to,
            local_token,
            remote_token,
            ..
        } => {
            let mint = Pubkey::new_from_array(*local_token);
            vec![
                AccountMeta::new_readonly(mint, false),
                AccountMeta::new(pda::token_vault(program_id, &mint, remote_token), false),
                AccountMeta::new(Pubkey::new_from_array(*to), false),
                AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
            ]
        }
        Transfer::WrappedToken { to, local_token, .. } => vec![
            AccountMeta::new(Pubkey::new_from_array(*local_token), false),
            AccountMeta::new(Pubkey::new_from_array(*to), false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
        ],
    }
}

/// `relay_message` with every account the payload needs appended.
pub fn relay_message_ix(
    program_id: &Pubkey,
    payer: &Pubkey,
    hash: &[u8; 32],
    message: &OutgoingMessage,
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new(*payer, true),
        AccountMeta::new_readonly(pda::bridge_cpi_authority(program_id, &message.sender), false),
        AccountMeta::new(pda::incoming_message(program_id, hash), false),
    ];

    if let Payload::Transfer { transfer, .. } = &message.payload {
        accounts.extend(transfer_accounts(program_id, transfer));
    }
    for ix in message.payload.instructions() {
        accounts.push(AccountMeta::new_readonly(Pubkey::new_from_array(ix.program_id), false));
        accounts.extend(ix.accounts.iter().map(|a| {
            let key = Pubkey::new_from_array(a.pubkey);
            if a.is_writable {
                AccountMeta::new(key, false)
            } else {
                AccountMeta::new_readonly(key, false)
            }
        }));
    }

    Instruction::new_with_bytes(*program_id, &instruction_discriminator(RELAY_MESSAGE), accounts)
}

/// Instructions that take `proven` from its current Solana state to executed.
///
/// `incoming` is the data of the message's `IncomingMessage` account, if one
/// exists. Proving needs the checkpoint's output root on Solana; until it is
/// readable the relay is deferred as a transient failure.
pub fn plan_relay(
    program_id: &Pubkey,
    payer: &Pubkey,
    proven: &ProvenMessage,
    incoming: Option<&[u8]>,
    output_root_registered: bool,
) -> Result<Vec<Instruction>, HandlerError> {
    let mut instructions = Vec::with_capacity(2);
    match incoming {
        Some(data) => {
            let incoming = IncomingMessage::from_account_data(data)?;
            if incoming.executed {
                return Err(ProtocolError::AlreadyExecuted(bytes32_to_hex(&proven.hash)).into());
            }
        }
        None if !output_root_registered => {
            return Err(HandlerError::Transient(eyre!(
                "output root for block {} is not on Solana yet",
                proven.checkpoint.reference_block_number
            )));
        }
        None => {
            let prove = prove_message_ix(program_id, payer, proven).map_err(HandlerError::Fatal)?;
            instructions.push(prove);
        }
    }
    instructions.push(relay_message_ix(program_id, payer, &proven.hash, &proven.message));
    Ok(instructions)
}

/// Solana transaction submitter
pub struct SolanaRelayer {
    rpc: RpcClient,
    payer: Keypair,
    program_id: Pubkey,
    rpc_timeout: Duration,
}

impl SolanaRelayer {
    pub fn new(
        rpc_url: &str,
        payer: Keypair,
        program_id: Pubkey,
        commitment: CommitmentConfig,
        rpc_timeout: Duration,
    ) -> Self {
        info!(
            payer = %payer.pubkey(),
            program = %program_id,
            "Solana relayer initialized"
        );
        Self {
            rpc: RpcClient::new_with_timeout_and_commitment(
                rpc_url.to_string(),
                rpc_timeout,
                commitment,
            ),
            payer,
            program_id,
            rpc_timeout,
        }
    }

    pub fn payer(&self) -> Pubkey {
        self.payer.pubkey()
    }

    /// Fail unless the bridge program's messenger state is initialized.
    pub async fn check_program(&self) -> Result<()> {
        let state = pda::messenger_state(&self.program_id);
        match self.account_data(&state).await? {
            Some(_) => {
                info!(program = %self.program_id, messenger_state = %state, "Bridge program found");
                Ok(())
            }
            None => Err(eyre!(
                "Bridge program {} has no messenger state at {}",
                self.program_id,
                state
            )),
        }
    }

    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        let response = with_timeout(
            self.rpc_timeout,
            "getAccountInfo",
            self.rpc.get_account_with_commitment(address, self.rpc.commitment()),
        )
        .await?;
        Ok(response.value.map(|account| account.data))
    }

    async fn send(&self, instructions: &[Instruction]) -> Result<String> {
        let blockhash = with_timeout(
            self.rpc_timeout,
            "getLatestBlockhash",
            self.rpc.get_latest_blockhash(),
        )
        .await?;
        let tx = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.payer.pubkey()),
            &[&self.payer],
            blockhash,
        );
        let signature =
            with_timeout(self.rpc_timeout, "sendTransaction", self.rpc.send_transaction(&tx))
                .await?;
        Ok(signature.to_string())
    }
}

#[async_trait]
impl CheckpointSink for SolanaRelayer {
    async fn submit_checkpoint(
        &self,
        checkpoint: &OutputRoot,
    ) -> Result<CheckpointSubmission, HandlerError> {
        let block = checkpoint.reference_block_number;
        if self.output_root_exists(block).await? {
            debug!(block, "Output root already registered");
            return Ok(CheckpointSubmission::AlreadyPresent);
        }

        let ix = register_output_root_ix(&self.program_id, &self.payer.pubkey(), checkpoint);
        let signature = self.send(&[ix]).await.map_err(into_handler_error)?;
        info!(
            signature = %signature,
            block,
            root = %checkpoint.root_hex(),
            leaves = checkpoint.total_leaf_count,
            "Checkpoint submitted"
        );
        Ok(CheckpointSubmission::Submitted(signature))
    }

    async fn output_root_exists(&self, block: u64) -> Result<bool, HandlerError> {
        let address = pda::output_root(&self.program_id, block);
        let existing = self.account_data(&address).await.map_err(into_handler_error)?;
        Ok(existing.is_some())
    }
}

#[async_trait]
impl Relay<ProvenMessage> for SolanaRelayer {
    async fn relay(&self, proven: &ProvenMessage) -> Result<RelayReceipt, HandlerError> {
        let hash_hex = bytes32_to_hex(&proven.hash);
        let address = pda::incoming_message(&self.program_id, &proven.hash);
        let existing = self.account_data(&address).await.map_err(into_handler_error)?;

        let output_root_registered = match existing {
            Some(_) => {
                debug!(message_hash = %hash_hex, "Message already proven");
                true
            }
            None => {
                self.output_root_exists(proven.checkpoint.reference_block_number)
                    .await?
            }
        };
        let payer = self.payer.pubkey();
        let instructions = plan_relay(
            &self.program_id,
            &payer,
            proven,
            existing.as_deref(),
            output_root_registered,
        )?;

        let signature = self.send(&instructions).await.map_err(into_handler_error)?;
        info!(
            signature = %signature,
            message_hash = %hash_hex,
            nonce = proven.message.nonce,
            proved = instructions.len() == 2,
            "Message relay submitted"
        );
        Ok(RelayReceipt {
            tx_id: signature,
            confirmed: false,
        })
    }
}
