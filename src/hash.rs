//! Hash helpers shared by the accumulator, the message protocol and the
//! Solana instruction/event codecs.
//!
//! Keccak256 matches what the Base contracts and the Solana program verify
//! against; Anchor discriminators are sha256-derived and truncated to 8 bytes.

use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Keccak256 of the sorted pair `(a, b)`.
///
/// Equivalent to OpenZeppelin's `standardNodeHash`; the order of the operands
/// does not change the result.
pub fn commutative_keccak256(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let mut hasher = Keccak::v256();
    hasher.update(lo);
    hasher.update(hi);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Anchor discriminator: `sha256("<namespace>:<name>")[..8]`.
pub fn anchor_discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let preimage = format!("{}:{}", namespace, name);
    let digest = solana_sdk::hash::hash(preimage.as_bytes()).to_bytes();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Discriminator prefixed to an emitted event (`event:<Name>`).
pub fn event_discriminator(name: &str) -> [u8; 8] {
    anchor_discriminator("event", name)
}

/// Discriminator prefixed to instruction data (`global:<snake_name>`).
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    anchor_discriminator("global", name)
}

/// Discriminator prefixed to stored account data (`account:<Name>`).
pub fn account_discriminator(name: &str) -> [u8; 8] {
    anchor_discriminator("account", name)
}

/// Format bytes32 as 0x-prefixed hex
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 0x-prefixed (or bare) hex string into bytes32
pub fn hex_to_bytes32(s: &str) -> eyre::Result<[u8; 32]> {
    let raw = hex::decode(s.trim_start_matches("0x"))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| eyre::eyre!("expected 32 bytes, got {}", raw.len()))
}
