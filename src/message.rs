//! Cross-chain message model and lifecycle.
//!
//! Outgoing messages are registered on Base and committed into the
//! accumulator; they become `IncomingMessage` accounts on Solana once proven
//! against a checkpointed root, and are executed at most once.
//!
//! The canonical encoding is Borsh: fixed arrays inline, every `Vec` u32
//! length-prefixed, enum variants tagged. Message identity is the keccak256 of
//! that encoding.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::{DecodeError, ProtocolError};
use crate::hash::{account_discriminator, bytes32_to_hex, keccak256};

/// One account reference of a relayed instruction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct IxAccount {
    pub pubkey: [u8; 32],
    pub is_writable: bool,
    pub is_signer: bool,
}

/// A Solana instruction carried inside a message
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Ix {
    pub program_id: [u8; 32],
    pub accounts: Vec<IxAccount>,
    pub data: Vec<u8>,
}

/// Token movement finalized on Solana
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Transfer {
    /// Native SOL released from the SOL vault
    Sol {
        to: [u8; 32],
        remote_token: [u8; 20],
        amount: u64,
    },
    /// SPL tokens released from the token vault of `local_token`
    Spl {
        to: [u8; 32],
        local_token: [u8; 32],
        remote_token: [u8; 20],
        amount: u64,
    },
    /// Wrapped Base token minted on Solana
    WrappedToken {
        to: [u8; 32],
        local_token: [u8; 32],
        amount: u64,
    },
}

impl Transfer {
    pub fn to(&self) -> [u8; 32] {
        match self {
            Transfer::Sol { to, .. } | Transfer::Spl { to, .. } | Transfer::WrappedToken { to, .. } => *to,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            Transfer::Sol { amount, .. }
            | Transfer::Spl { amount, .. }
            | Transfer::WrappedToken { amount, .. } => *amount,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transfer::Sol { .. } => "sol",
            Transfer::Spl { .. } => "spl",
            Transfer::WrappedToken { .. } => "wrapped_token",
        }
    }
}

/// What the message asks the destination to do
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Payload {
    Call(Vec<Ix>),
    Transfer {
        transfer: Transfer,
        call: Option<Vec<Ix>>,
    },
}

impl Payload {
    /// Instructions executed after any transfer
    pub fn instructions(&self) -> &[Ix] {
        match self {
            Payload::Call(ixs) => ixs,
            Payload::Transfer { call: Some(ixs), .. } => ixs,
            Payload::Transfer { call: None, .. } => &[],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec()
            .expect("serializing into a Vec cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Payload::try_from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

/// A message registered on Base for execution on Solana
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OutgoingMessage {
    /// Chain-assigned, equals the message's accumulator leaf index
    pub nonce: u64,
    pub sender: [u8; 20],
    pub gas_limit: u64,
    pub payload: Payload,
}

impl OutgoingMessage {
    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec()
            .expect("serializing into a Vec cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        OutgoingMessage::try_from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Message identity and accumulator leaf
    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.encode())
    }
}

/// Solana-side record created when a message is proven
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct IncomingMessage {
    pub sender: [u8; 20],
    /// Encoded `Payload`
    pub data: Vec<u8>,
    pub executed: bool,
}

impl IncomingMessage {
    /// Decode account data (8-byte Anchor discriminator + Borsh body).
    pub fn from_account_data(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 8 {
            return Err(DecodeError::TooShort {
                expected: 8,
                got: data.len(),
            });
        }
        if data[..8] != account_discriminator("IncomingMessage") {
            return Err(DecodeError::Malformed(
                "account is not an IncomingMessage".to_string(),
            ));
        }
        // Accounts may be over-allocated; trailing bytes are ignored.
        let mut body = &data[8..];
        IncomingMessage::deserialize(&mut body).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    pub fn payload(&self) -> Result<Payload, DecodeError> {
        Payload::decode(&self.data)
    }
}

/// Lifecycle of a message as seen by the oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageStatus {
    /// Hash included in the accumulator
    Registered,
    /// Proof accepted on Solana, `IncomingMessage` exists
    Proven,
    /// Payload carried out; terminal
    Executed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Registered => "registered",
            MessageStatus::Proven => "proven",
            MessageStatus::Executed => "executed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TrackedMessage {
    pub message: OutgoingMessage,
    pub hash: [u8; 32],
    pub leaf_index: u64,
    pub status: MessageStatus,
}

/// Registered messages and their lifecycle state, keyed by hash.
#[derive(Debug, Default)]
pub struct MessageBook {
    entries: HashMap<[u8; 32], TrackedMessage>,
    by_leaf: BTreeMap<u64, [u8; 32]>,
}

impl MessageBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a message committed at `leaf_index`. Re-registering is a no-op.
    pub fn register(&mut self, message: OutgoingMessage, leaf_index: u64) -> [u8; 32] {
        let hash = message.hash();
        self.entries.entry(hash).or_insert_with(|| TrackedMessage {
            message,
            hash,
            leaf_index,
            status: MessageStatus::Registered,
        });
        self.by_leaf.insert(leaf_index, hash);
        hash
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<&TrackedMessage> {
        self.entries.get(hash)
    }

    pub fn status(&self, hash: &[u8; 32]) -> Option<MessageStatus> {
        self.entries.get(hash).map(|t| t.status)
    }

    pub fn mark_proven(&mut self, hash: &[u8; 32]) -> Result<(), ProtocolError> {
        self.transition(hash, MessageStatus::Proven)
    }

    pub fn mark_executed(&mut self, hash: &[u8; 32]) -> Result<(), ProtocolError> {
        self.transition(hash, MessageStatus::Executed)
    }

    /// Adopt the state stored on the destination chain.
    ///
    /// On-chain state only moves forward, so a lagging local status catches
    /// up and a more advanced local status is kept.
    pub fn observe(&mut self, hash: &[u8; 32], incoming: &IncomingMessage) {
        if let Some(entry) = self.entries.get_mut(hash) {
            let seen = if incoming.executed {
                MessageStatus::Executed
            } else {
                MessageStatus::Proven
            };
            entry.status = entry.status.max(seen);
        }
    }

    /// Messages not yet executed whose leaves are covered by the first
    /// `leaf_count` leaves, in leaf order.
    pub fn pending_within(&self, leaf_count: u64) -> Vec<TrackedMessage> {
        self.by_leaf
            .range(..leaf_count)
            .filter_map(|(_, hash)| self.entries.get(hash))
            .filter(|t| t.status != MessageStatus::Executed)
            .cloned()
            .collect()
    }

    fn transition(&mut self, hash: &[u8; 32], to: MessageStatus) -> Result<(), ProtocolError> {
        let entry = self
            .entries
            .get_mut(hash)
            .ok_or_else(|| ProtocolError::InvalidTransition {
                hash: bytes32_to_hex(hash),
                from: "unknown",
                to: to.as_str(),
            })?;

        let allowed = matches!(
            (entry.status, to),
            (MessageStatus::Registered, MessageStatus::Proven)
                | (MessageStatus::Proven, MessageStatus::Executed)
        );
        if !allowed {
            if entry.status == MessageStatus::Executed {
                return Err(ProtocolError::AlreadyExecuted(bytes32_to_hex(hash)));
            }
            return Err(ProtocolError::InvalidTransition {
                hash: bytes32_to_hex(hash),
                from: entry.status.as_str(),
                to: to.as_str(),
            });
        }
        entry.status = to;
        Ok(())
    }
}

/// Outcome of checking a source nonce against the expected sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    Fresh,
    /// Already folded in; a redelivery
    Duplicate,
}

/// Enforces gap-free, strictly increasing source nonces.
#[derive(Debug, Clone, Default)]
pub struct NonceTracker {
    next: u64,
}

impl NonceTracker {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    /// Check `nonce` without consuming it.
    pub fn check(&self, nonce: u64) -> Result<NonceCheck, ProtocolError> {
        if nonce < self.next {
            Ok(NonceCheck::Duplicate)
        } else if nonce == self.next {
            Ok(NonceCheck::Fresh)
        } else {
            Err(ProtocolError::NonceGap {
                expected: self.next,
                got: nonce,
            })
        }
    }

    /// Consume the expected nonce.
    pub fn advance(&mut self) {
        self.next += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_message(nonce: u64) -> OutgoingMessage {
        OutgoingMessage {
            nonce,
            sender: [0x11; 20],
            gas_limit: 200_000,
            payload: Payload::Call(vec![Ix {
                program_id: [7u8; 32],
                accounts: vec![IxAccount {
                    pubkey: [8u8; 32],
                    is_writable: true,
                    is_signer: false,
                }],
                data: vec![1, 2, 3],
            }]),
        }
    }

    fn sol_transfer(nonce: u64, amount: u64) -> OutgoingMessage {
        OutgoingMessage {
            nonce,
            sender: [0x22; 20],
            gas_limit: 100_000,
            payload: Payload::Transfer {
                transfer: Transfer::Sol {
                    to: [3u8; 32],
                    remote_token: [0xee; 20],
                    amount,
                },
                call: None,
            },
        }
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(call_message(1).hash(), call_message(1).hash());
        let decoded = OutgoingMessage::decode(&call_message(1).encode()).unwrap();
        assert_eq!(decoded.hash(), call_message(1).hash());
    }

    #[test]
    fn test_hash_distinguishes_every_field() {
        let base = sol_transfer(5, 1_000);
        let mut variants = vec![sol_transfer(6, 1_000), sol_transfer(5, 1_001)];

        let mut other_sender = base.clone();
        other_sender.sender[19] ^= 1;
        variants.push(other_sender);

        let mut other_gas = base.clone();
        other_gas.gas_limit += 1;
        variants.push(other_gas);

        let mut with_call = base.clone();
        if let Payload::Transfer { call, .. } = &mut with_call.payload {
            *call = Some(vec![]);
        }
        variants.push(with_call);

        for v in variants {
            assert_ne!(v.hash(), base.hash());
        }
    }

    #[test]
    fn test_length_prefix_prevents_boundary_collisions() {
        // Same concatenated bytes split differently between accounts and data
        let a = Ix {
            program_id: [0u8; 32],
            accounts: vec![],
            data: vec![1, 2],
        };
        let b = Ix {
            program_id: [0u8; 32],
            accounts: vec![],
            data: vec![1],
        };
        let m1 = OutgoingMessage {
            payload: Payload::Call(vec![a]),
            ..call_message(0)
        };
        let m2 = OutgoingMessage {
            payload: Payload::Call(vec![b.clone(), Ix { data: vec![2], ..b }]),
            ..call_message(0)
        };
        assert_ne!(m1.hash(), m2.hash());
    }

    #[test]
    fn test_call_and_transfer_never_collide() {
        let call = OutgoingMessage {
            payload: Payload::Call(vec![]),
            ..sol_transfer(0, 0)
        };
        let transfer = OutgoingMessage {
            payload: Payload::Transfer {
                transfer: Transfer::Sol {
                    to: [0u8; 32],
                    remote_token: [0u8; 20],
                    amount: 0,
                },
                call: None,
            },
            ..sol_transfer(0, 0)
        };
        assert_ne!(call.hash(), transfer.hash());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = call_message(3).encode();
        bytes.push(0);
        assert!(OutgoingMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_incoming_message_account_decoding() {
        let incoming = IncomingMessage {
            sender: [0x33; 20],
            data: call_message(0).payload.encode(),
            executed: true,
        };
        let mut data = account_discriminator("IncomingMessage").to_vec();
        data.extend(incoming.try_to_vec().unwrap());
        data.extend([0u8; 16]);

        let decoded = IncomingMessage::from_account_data(&data).unwrap();
        assert_eq!(decoded, incoming);
        assert_eq!(decoded.payload().unwrap(), call_message(0).payload);

        data[0] ^= 0xff;
        assert!(IncomingMessage::from_account_data(&data).is_err());
        assert!(IncomingMessage::from_account_data(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_lifecycle_moves_forward_only() {
        let mut book = MessageBook::new();
        let hash = book.register(call_message(0), 0);
        assert_eq!(book.status(&hash), Some(MessageStatus::Registered));

        assert!(matches!(
            book.mark_executed(&hash),
            Err(ProtocolError::InvalidTransition { .. })
        ));
        book.mark_proven(&hash).unwrap();
        book.mark_executed(&hash).unwrap();
        assert_eq!(book.status(&hash), Some(MessageStatus::Executed));

        assert!(matches!(
            book.mark_executed(&hash),
            Err(ProtocolError::AlreadyExecuted(_))
        ));
        assert!(matches!(
            book.mark_proven(&hash),
            Err(ProtocolError::AlreadyExecuted(_))
        ));
    }

    #[test]
    fn test_unknown_message_transition_fails() {
        let mut book = MessageBook::new();
        assert!(book.mark_proven(&[9u8; 32]).is_err());
    }

    #[test]
    fn test_observe_never_regresses() {
        let mut book = MessageBook::new();
        let hash = book.register(call_message(0), 0);
        let executed = IncomingMessage {
            sender: [0; 20],
            data: vec![],
            executed: true,
        };
        book.observe(&hash, &executed);
        assert_eq!(book.status(&hash), Some(MessageStatus::Executed));

        let proven = IncomingMessage {
            executed: false,
            ..executed
        };
        book.observe(&hash, &proven);
        assert_eq!(book.status(&hash), Some(MessageStatus::Executed));
    }

    #[test]
    fn test_pending_within_respects_leaf_count() {
        let mut book = MessageBook::new();
        let h0 = book.register(call_message(0), 0);
        let h1 = book.register(call_message(1), 1);
        let h2 = book.register(call_message(2), 2);

        book.mark_proven(&h0).unwrap();
        book.mark_executed(&h0).unwrap();

        let pending: Vec<_> = book.pending_within(2).into_iter().map(|t| t.hash).collect();
        assert_eq!(pending, vec![h1]);

        let pending: Vec<_> = book.pending_within(3).into_iter().map(|t| t.hash).collect();
        assert_eq!(pending, vec![h1, h2]);
    }

    #[test]
    fn test_nonce_sequence() {
        let mut tracker = NonceTracker::default();
        for nonce in 0..5 {
            assert_eq!(tracker.check(nonce), Ok(NonceCheck::Fresh));
            tracker.advance();
        }
        assert_eq!(tracker.check(3), Ok(NonceCheck::Duplicate));
        assert_eq!(
            tracker.check(7),
            Err(ProtocolError::NonceGap {
                expected: 5,
                got: 7
            })
        );
        assert_eq!(tracker.next(), 5);
    }

    #[test]
    fn test_transfer_accessors() {
        let t = Transfer::Spl {
            to: [4u8; 32],
            local_token: [5u8; 32],
            remote_token: [6u8; 20],
            amount: 42,
        };
        assert_eq!(t.to(), [4u8; 32]);
        assert_eq!(t.amount(), 42);
        assert_eq!(t.kind(), "spl");
    }
}
