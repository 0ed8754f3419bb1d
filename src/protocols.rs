//! Objectives: cross-party tasks (opening, funding and closing channels),
//! each driven by a pure crank function.
//!
//! Cranking looks at the current store contents for the objective's
//! channels and returns the updated objective plus the [Action]s needed to
//! make progress. It never looks at what an earlier crank returned, so
//! cranking again with unchanged inputs returns the same result, and once
//! the actions are applied it returns no actions at all.

mod close_channel;
mod open_channel;

use crate::{
    chain::{ChainRequest, DepositRequest},
    channel::{ChannelEntry, FundingStrategy, Outcome, SignedState, State},
    ledger::LedgerRequest,
    types::{Address, Hash},
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived from the objective type and the target channel, so both sides of
/// a channel agree on it without coordination.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ObjectiveId(String);

impl ObjectiveId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ObjectiveKind {
    OpenChannel {
        channel_id: Hash,
        funding: FundingStrategy,
    },
    /// Like `OpenChannel`, but always funded directly.
    OpenLedgerChannel { channel_id: Hash },
    CloseChannel { channel_id: Hash },
}

impl ObjectiveKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectiveKind::OpenChannel { .. } => "OpenChannel",
            ObjectiveKind::OpenLedgerChannel { .. } => "OpenLedgerChannel",
            ObjectiveKind::CloseChannel { .. } => "CloseChannel",
        }
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId(format!("{}-{}", self.name(), self.channel_id()))
    }

    pub fn channel_id(&self) -> Hash {
        match self {
            ObjectiveKind::OpenChannel { channel_id, .. }
            | ObjectiveKind::OpenLedgerChannel { channel_id }
            | ObjectiveKind::CloseChannel { channel_id } => *channel_id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ObjectiveStatus {
    /// Waiting for the local user to approve.
    Queued,
    Approved,
    Started,
    Succeeded,
    Failed,
}

impl ObjectiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectiveStatus::Succeeded | ObjectiveStatus::Failed)
    }
}

/// The next external input an objective needs.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WaitingFor {
    Approval,
    TheirPreFund,
    Funding,
    TheirPostFund,
    TheirFinalState,
    LedgerDefunding,
    Nothing,
}

/// Why an objective failed. Failed objectives are never retried.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub enum ObjectiveFailure {
    #[error("ledger channel is closing or closed")]
    LedgerClosed,
    #[error("ledger channel is unknown")]
    LedgerNotFound,
    #[error("ledger refused to release the channel's funds")]
    LedgerDefundingRejected,
    #[error("channel is closing or closed")]
    ChannelClosed,
    #[error("channel is unknown")]
    ChannelNotFound,
    #[error("rejected by the user")]
    Rejected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Objective {
    pub id: ObjectiveId,
    pub kind: ObjectiveKind,
    pub status: ObjectiveStatus,
    pub waiting_for: WaitingFor,
    pub failure: Option<ObjectiveFailure>,
    /// Store sequence number at creation, used for ordering.
    pub created_at: u64,
}

impl Objective {
    pub fn new(kind: ObjectiveKind, created_at: u64) -> Self {
        Objective {
            id: kind.id(),
            kind,
            status: ObjectiveStatus::Queued,
            waiting_for: WaitingFor::Approval,
            failure: None,
            created_at,
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.kind.channel_id()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Approving is only possible while queued, anything later is a no-op.
    pub fn approve(&mut self) {
        if self.status == ObjectiveStatus::Queued {
            self.status = ObjectiveStatus::Approved;
        }
    }

    pub fn reject(&mut self) {
        if self.status == ObjectiveStatus::Queued {
            self.status = ObjectiveStatus::Failed;
            self.failure = Some(ObjectiveFailure::Rejected);
            self.waiting_for = WaitingFor::Nothing;
        }
    }
}

/// Side effects requested by a crank. They are applied by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Sign the state and send it to the other participants.
    SignState(State),
    RegisterChannel {
        channel_id: Hash,
        asset_holders: Vec<Address>,
    },
    Deposit(DepositRequest),
    RequestLedgerFunding {
        ledger_channel_id: Hash,
        amounts: Outcome,
    },
    RequestLedgerDefunding {
        ledger_channel_id: Hash,
        amounts: Outcome,
    },
    ConcludeAndWithdraw(SignedState),
}

/// Store contents a crank looks at.
#[derive(Debug, Clone, Copy)]
pub struct CrankInput<'a> {
    pub channel: Option<&'a ChannelEntry>,
    /// The ledger funding the channel, if any.
    pub ledger: Option<&'a ChannelEntry>,
    /// Ledger requests for the channel.
    pub ledger_requests: &'a [LedgerRequest],
    /// Chain requests already made for the channel.
    pub chain_requests: &'a [ChainRequest],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crank {
    pub objective: Objective,
    pub actions: Vec<Action>,
}

impl Crank {
    /// Whether the crank changed the objective's status.
    pub fn status_changed(&self, before: &Objective) -> bool {
        self.objective.status != before.status
    }
}

/// Outcome of one protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Waiting(WaitingFor),
    Succeeded,
    Failed(ObjectiveFailure),
}

/// Advances `objective` as far as the inputs allow.
pub fn crank(objective: &Objective, input: &CrankInput<'_>) -> Crank {
    let mut next = objective.clone();
    if objective.is_terminal() {
        return Crank {
            objective: next,
            actions: Vec::new(),
        };
    }
    if objective.status == ObjectiveStatus::Queued {
        next.waiting_for = WaitingFor::Approval;
        return Crank {
            objective: next,
            actions: Vec::new(),
        };
    }

    let (step, actions) = match objective.kind {
        ObjectiveKind::OpenChannel { funding, .. } => open_channel::crank(input, funding),
        ObjectiveKind::OpenLedgerChannel { .. } => {
            open_channel::crank(input, FundingStrategy::Direct)
        }
        ObjectiveKind::CloseChannel { .. } => close_channel::crank(input),
    };

    match step {
        Step::Waiting(waiting_for) => {
            next.status = ObjectiveStatus::Started;
            next.waiting_for = waiting_for;
        }
        Step::Succeeded => {
            next.status = ObjectiveStatus::Succeeded;
            next.waiting_for = WaitingFor::Nothing;
        }
        Step::Failed(reason) => {
            next.status = ObjectiveStatus::Failed;
            next.waiting_for = WaitingFor::Nothing;
            next.failure = Some(reason);
        }
    }
    Crank {
        objective: next,
        actions,
    }
}
