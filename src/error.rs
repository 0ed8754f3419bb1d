//! Error types of the engine.
//!
//! Rejected input from peers is reported as a value ([IngestError]) and
//! never leaves the store in a half-updated state. Only supervisory failures
//! ([EnsureError]) and misuse of the wallet API ([EngineError]) reach the
//! caller as hard errors.

use crate::{
    channel::{SignatureError, TurnRejection},
    protocols::ObjectiveId,
    types::Hash,
    wire::ConversionError,
};

/// A signed state was not merged into the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    /// Stale, conflicting or out-of-turn states, and transitions rejected by
    /// the application validator.
    #[error("invalid turn transition on channel {channel_id} at turn {turn_num}: {reason}")]
    InvalidTurnTransition {
        channel_id: Hash,
        turn_num: u64,
        reason: TurnRejection,
    },
    #[error("invalid signature for channel {channel_id}: {source}")]
    InvalidSignature {
        channel_id: Hash,
        source: SignatureError,
    },
    #[error("channel {0} already exists")]
    ChannelExists(Hash),
    #[error("unknown channel {0}")]
    UnknownChannel(Hash),
    #[error("we are not a participant of channel {0}")]
    NotAParticipant(Hash),
}

impl IngestError {
    /// Whether an application validator rejected the transition.
    pub fn is_invalid_application_transition(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidTurnTransition {
                reason: TurnRejection::Application(_),
                ..
            }
        )
    }
}

/// Errors returned by the wallet API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("channel {0} not found")]
    ChannelNotFound(Hash),
    #[error("channel {0} is already closing or closed")]
    ChannelAlreadyClosed(Hash),
    #[error("channel {0} is not running")]
    ChannelNotRunning(Hash),
    #[error("it is not our turn on channel {0}")]
    NotMyTurn(Hash),
    #[error("ledger channel {ledger_channel_id} cannot fund channels: {reason}")]
    LedgerUnavailable {
        ledger_channel_id: Hash,
        reason: &'static str,
    },
    #[error("invalid channel: {0}")]
    InvalidChannel(&'static str),
    #[error("objective {0} not found")]
    ObjectiveNotFound(ObjectiveId),
    #[error("message is not addressed to us")]
    WrongRecipient,
    #[error(transparent)]
    Wire(#[from] ConversionError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Failure of [crate::dispatch::Dispatcher::ensure_objectives].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnsureError {
    #[error("unable to ensure objectives after {attempts} attempts: {pending:?}")]
    EnsureObjectiveFailed {
        attempts: u32,
        pending: Vec<ObjectiveId>,
    },
    #[error("objective {id} failed: {reason}")]
    ObjectiveFailed {
        id: ObjectiveId,
        reason: crate::protocols::ObjectiveFailure,
    },
    #[error("objective {0} not found")]
    ObjectiveNotFound(ObjectiveId),
    #[error("cancelled")]
    Cancelled,
}
