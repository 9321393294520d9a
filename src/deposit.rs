//! Solana → Base deposits.
//!
//! The Solana bridge program emits a `MessageSent` event per deposit. Its
//! `opaque_data` is packed as `gas: u64 LE ‖ is_creation: u8 ‖ data`; the
//! oracle reshapes it into a [`DepositTx`] executed on Base.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::Serialize;

use crate::error::DecodeError;
use crate::hash::{event_discriminator, keccak256};

/// Only deposit version understood by this oracle
pub const DEPOSIT_VERSION: u64 = 0;

/// gas (8) + is_creation (1)
const OPAQUE_HEADER_LEN: usize = 9;

/// Anchor event emitted by the Solana bridge program for each deposit
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MessageSent {
    pub from: [u8; 32],
    pub to: [u8; 20],
    pub version: u64,
    pub value: u64,
    pub opaque_data: Vec<u8>,
}

impl MessageSent {
    pub const NAME: &'static str = "MessageSent";

    pub fn discriminator() -> [u8; 8] {
        event_discriminator(Self::NAME)
    }

    /// Decode the Borsh body that follows the discriminator.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = body;
        MessageSent::deserialize(&mut buf).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

/// A deposit reshaped for submission on Base
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositTx {
    /// Unique per source event, used for dedup and tracing
    pub source_hash: [u8; 32],
    /// Solana depositor
    pub from: [u8; 32],
    /// `None` means contract creation
    pub to: Option<[u8; 20]>,
    pub mint: u64,
    pub value: u64,
    pub gas: u64,
    pub is_system_transaction: bool,
    pub data: Vec<u8>,
}

impl DepositTx {
    /// Reshape a decoded event. `signature` is the raw Solana transaction
    /// signature and `event_index` the event's position among that
    /// transaction's logs.
    pub fn from_event(
        event: &MessageSent,
        signature: &[u8],
        event_index: u64,
    ) -> Result<Self, DecodeError> {
        if event.version != DEPOSIT_VERSION {
            return Err(DecodeError::Malformed(format!(
                "unsupported deposit version {}",
                event.version
            )));
        }

        let opaque = &event.opaque_data;
        if opaque.len() < OPAQUE_HEADER_LEN {
            return Err(DecodeError::TooShort {
                expected: OPAQUE_HEADER_LEN,
                got: opaque.len(),
            });
        }

        let mut gas_bytes = [0u8; 8];
        gas_bytes.copy_from_slice(&opaque[..8]);
        let gas = u64::from_le_bytes(gas_bytes);

        let to = match opaque[8] {
            0 => Some(event.to),
            1 if event.to == [0u8; 20] => None,
            1 => return Err(DecodeError::CreationWithTarget),
            other => return Err(DecodeError::InvalidCreationFlag(other)),
        };

        Ok(DepositTx {
            source_hash: source_hash(signature, event_index),
            from: event.from,
            to,
            mint: event.value,
            value: event.value,
            gas,
            is_system_transaction: false,
            data: opaque[OPAQUE_HEADER_LEN..].to_vec(),
        })
    }

    pub fn is_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// `keccak256(signature ‖ event_index LE)`
pub fn source_hash(signature: &[u8], event_index: u64) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(signature.len() + 8);
    preimage.extend_from_slice(signature);
    preimage.extend_from_slice(&event_index.to_le_bytes());
    keccak256(&preimage)
}

/// Pack `opaque_data` the way the Solana program does.
pub fn encode_opaque(gas: u64, is_creation: bool, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OPAQUE_HEADER_LEN + data.len());
    out.extend_from_slice(&gas.to_le_bytes());
    out.push(is_creation as u8);
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(to: [u8; 20], opaque_data: Vec<u8>) -> MessageSent {
        MessageSent {
            from: [9u8; 32],
            to,
            version: DEPOSIT_VERSION,
            value: 500,
            opaque_data,
        }
    }

    #[test]
    fn test_contract_creation_deposit() {
        let data = vec![0x60, 0x80, 0x60, 0x40];
        let ev = event([0u8; 20], encode_opaque(21_000, true, &data));

        let tx = DepositTx::from_event(&ev, &[1u8; 64], 0).unwrap();
        assert_eq!(tx.gas, 21_000);
        assert_eq!(tx.to, None);
        assert!(tx.is_creation());
        assert_eq!(tx.data, data);
        assert_eq!(tx.mint, 500);
        assert_eq!(tx.value, 500);
        assert!(!tx.is_system_transaction);
    }

    #[test]
    fn test_call_deposit_targets_destination() {
        let target = [0xabu8; 20];
        let ev = event(target, encode_opaque(50_000, false, &[0xde, 0xad]));

        let tx = DepositTx::from_event(&ev, &[1u8; 64], 3).unwrap();
        assert_eq!(tx.to, Some(target));
        assert_eq!(tx.gas, 50_000);
        assert_eq!(tx.data, vec![0xde, 0xad]);
    }

    #[test]
    fn test_empty_data_is_allowed() {
        let ev = event([1u8; 20], encode_opaque(1, false, &[]));
        let tx = DepositTx::from_event(&ev, &[0u8; 64], 0).unwrap();
        assert!(tx.data.is_empty());
    }

    #[test]
    fn test_malformed_opaque_data() {
        let short = event([1u8; 20], vec![0u8; 8]);
        assert_eq!(
            DepositTx::from_event(&short, &[0u8; 64], 0),
            Err(DecodeError::TooShort {
                expected: 9,
                got: 8
            })
        );

        let mut bad_flag = encode_opaque(1, false, &[]);
        bad_flag[8] = 2;
        assert_eq!(
            DepositTx::from_event(&event([1u8; 20], bad_flag), &[0u8; 64], 0),
            Err(DecodeError::InvalidCreationFlag(2))
        );

        let creation_with_target = event([1u8; 20], encode_opaque(1, true, &[]));
        assert_eq!(
            DepositTx::from_event(&creation_with_target, &[0u8; 64], 0),
            Err(DecodeError::CreationWithTarget)
        );
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut ev = event([1u8; 20], encode_opaque(1, false, &[]));
        ev.version = 1;
        assert!(matches!(
            DepositTx::from_event(&ev, &[0u8; 64], 0),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_source_hash_unique_per_event() {
        let sig = [7u8; 64];
        assert_ne!(source_hash(&sig, 0), source_hash(&sig, 1));
        assert_ne!(source_hash(&sig, 0), source_hash(&[8u8; 64], 0));
        assert_eq!(source_hash(&sig, 2), source_hash(&sig, 2));
    }

    #[test]
    fn test_event_body_decoding() {
        let ev = event([2u8; 20], encode_opaque(10, false, &[1, 2, 3]));
        let body = ev.try_to_vec().unwrap();
        assert_eq!(MessageSent::decode(&body).unwrap(), ev);
        assert!(MessageSent::decode(&body[..10]).is_err());
    }
}
