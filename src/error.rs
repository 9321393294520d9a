//! Error taxonomy shared by the watchers, handlers and relayers.
//!
//! Watchers branch on these variants: decode and protocol failures are logged
//! and the loop continues, transient failures are retried, fatal failures stop
//! the worker and cancel the rest of the process.

use thiserror::Error;

/// A source event could not be decoded. The event is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload too short: need {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("invalid is_creation flag: {0}")]
    InvalidCreationFlag(u8),

    #[error("contract creation must target the zero address")]
    CreationWithTarget,

    #[error("unexpected discriminator length: {0}")]
    DiscriminatorLength(usize),

    #[error("message hash mismatch: event {event}, computed {computed}")]
    HashMismatch { event: String, computed: String },

    #[error("malformed log: {0}")]
    Malformed(String),
}

/// The destination chain would reject (or has already applied) the action.
///
/// Never retried automatically: retrying either no-ops or fails the same way
/// until an external condition changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message {0} already executed")]
    AlreadyExecuted(String),

    #[error("message {0} has not been proven")]
    NotProven(String),

    #[error("message {hash}: invalid transition {from} -> {to}")]
    InvalidTransition {
        hash: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("insufficient balance: need {needed} wei, have {available} wei")]
    InsufficientBalance { needed: String, available: String },

    #[error("transaction {0} reverted")]
    Reverted(String),

    #[error("stale checkpoint: block {submitted} <= latest {latest}")]
    StaleCheckpoint { submitted: u64, latest: u64 },

    #[error("proof does not match checkpoint root at block {0}")]
    ProofMismatch(u64),

    #[error("nonce gap: expected {expected}, got {got}")]
    NonceGap { expected: u64, got: u64 },

    #[error("destination rejected transaction: {0}")]
    Rejected(String),
}

/// Failure reported by a handler for a single event.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// RPC timeouts and other I/O hiccups; the event should be retried.
    #[error("transient error: {0}")]
    Transient(eyre::Report),

    #[error("fatal error: {0}")]
    Fatal(eyre::Report),
}

impl HandlerError {
    /// Whether the event counts as handled for cursor advancement.
    pub fn is_settled(&self) -> bool {
        matches!(self, HandlerError::Decode(_) | HandlerError::Protocol(_))
    }
}

/// Failure of a live subscription feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Bounded receive elapsed with no traffic.
    #[error("receive timed out")]
    Timeout,

    /// The upstream closed the subscription.
    #[error("subscription closed: {0}")]
    Closed(String),

    /// The transport failed mid-stream.
    #[error("subscription broken: {0}")]
    Broken(String),
}
