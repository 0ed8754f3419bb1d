mod entry;
mod params;
mod signed;
mod state;
mod transition;

pub use entry::*;
pub use params::*;
pub use signed::*;
pub use state::*;
pub use transition::*;

use serde::{Deserialize, Serialize};

/// Index of a participant in the channel.
///
/// `0` is usually the proposer of the channel. The mover of turn `t` is the
/// participant with index `t mod n`.
pub type PartIdx = usize;

/// Lifecycle of a channel, derived from its signed-state history.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStatus {
    /// The prefund round is not complete yet.
    Proposed,
    /// Everyone agreed on the initial state, the channel is being funded and
    /// the postfund round is not complete yet.
    Opening,
    Running,
    /// A final state exists but not everyone has signed it.
    Closing,
    Closed,
}

impl ChannelStatus {
    pub fn is_closing_or_closed(&self) -> bool {
        matches!(self, ChannelStatus::Closing | ChannelStatus::Closed)
    }
}

/// How an application channel gets its funds.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum FundingStrategy {
    /// On-chain deposits by every participant, in allocation order.
    Direct,
    /// Carved out of an existing ledger channel without touching the chain.
    Ledger { ledger_channel_id: crate::Hash },
    /// No funding step at all, used for tests and demos.
    Fake,
}
