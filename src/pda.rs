//! Program-derived addresses of the Solana bridge program's accounts.

use solana_sdk::pubkey::Pubkey;

pub const OUTPUT_ROOT_SEED: &[u8] = b"output_root";
pub const MESSENGER_STATE_SEED: &[u8] = b"messenger_state";
pub const INCOMING_MESSAGE_SEED: &[u8] = b"incoming_message";
pub const BRIDGE_CPI_AUTHORITY_SEED: &[u8] = b"bridge_cpi_authority";
pub const SOL_VAULT_SEED: &[u8] = b"sol_vault";
pub const TOKEN_VAULT_SEED: &[u8] = b"token_vault";
pub const BRIDGE_SEED: &[u8] = b"bridge";

/// Checkpoint account for a Base block
pub fn output_root(program_id: &Pubkey, block_number: u64) -> Pubkey {
    Pubkey::find_program_address(&[OUTPUT_ROOT_SEED, &block_number.to_le_bytes()], program_id).0
}

/// Program-wide messenger state; exists once the program is initialized
pub fn messenger_state(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[MESSENGER_STATE_SEED], program_id).0
}

/// `IncomingMessage` account created by proving `message_hash`
pub fn incoming_message(program_id: &Pubkey, message_hash: &[u8; 32]) -> Pubkey {
    Pubkey::find_program_address(&[INCOMING_MESSAGE_SEED, message_hash], program_id).0
}

/// Signer the program uses when executing a message from `sender`
pub fn bridge_cpi_authority(program_id: &Pubkey, sender: &[u8; 20]) -> Pubkey {
    Pubkey::find_program_address(&[BRIDGE_CPI_AUTHORITY_SEED, sender], program_id).0
}

pub fn sol_vault(program_id: &Pubkey, remote_token: &[u8; 20]) -> Pubkey {
    Pubkey::find_program_address(&[SOL_VAULT_SEED, remote_token], program_id).0
}

pub fn token_vault(program_id: &Pubkey, mint: &Pubkey, remote_token: &[u8; 20]) -> Pubkey {
    Pubkey::find_program_address(&[TOKEN_VAULT_SEED, mint.as_ref(), remote_token], program_id).0
}

pub fn bridge(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[BRIDGE_SEED], program_id).0
}
