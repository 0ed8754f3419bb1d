use super::ChannelParams;
use crate::{
    sig::keccak256,
    types::{Address, Amount, Destination, Hash, U256},
    wire::schema,
};
use prost::Message as _;
use serde::{Deserialize, Serialize};

/// One entry of an allocation: `amount` goes to `destination`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AllocationItem {
    pub destination: Destination,
    pub amount: Amount,
}

/// The allocation of a single asset, identified by its asset holder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AssetOutcome {
    pub asset_holder: Address,
    pub allocation: Vec<AllocationItem>,
}

impl AssetOutcome {
    /// Sum of all items, `None` if it does not fit into a U256.
    pub fn total(&self) -> Option<U256> {
        self.allocation
            .iter()
            .try_fold(U256::zero(), |acc, item| acc.checked_add(item.amount))
    }

    pub fn amount_for(&self, destination: &Destination) -> Option<Amount> {
        self.allocation
            .iter()
            .find(|item| &item.destination == destination)
            .map(|item| item.amount)
    }

    /// Sum of the amounts allocated before the first item for `destination`.
    ///
    /// Used for the deposit order during direct funding. `None` if the
    /// destination has no item or the sum overflows.
    pub fn amount_before(&self, destination: &Destination) -> Option<Amount> {
        let mut before = U256::zero();
        for item in &self.allocation {
            if &item.destination == destination {
                return Some(before);
            }
            before = before.checked_add(item.amount)?;
        }
        None
    }
}

/// How the funds of a channel are divided, per asset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct Outcome(pub Vec<AssetOutcome>);

impl Outcome {
    pub fn asset(&self, asset_holder: &Address) -> Option<&AssetOutcome> {
        self.0.iter().find(|a| &a.asset_holder == asset_holder)
    }

    pub fn asset_holders(&self) -> Vec<Address> {
        self.0.iter().map(|a| a.asset_holder).collect()
    }

    /// Total amount per asset, in asset order. `None` if any asset's total
    /// overflows.
    pub fn totals(&self) -> Option<Vec<(Address, U256)>> {
        self.0
            .iter()
            .map(|a| Some((a.asset_holder, a.total()?)))
            .collect()
    }

    /// Number of allocation items across all assets.
    pub fn item_count(&self) -> usize {
        self.0.iter().map(|a| a.allocation.len()).sum()
    }
}

/// Stores the complete state of a channel at one turn.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub params: ChannelParams,
    turn_num: u64,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

impl State {
    /// Initial (prefund) state at turn 0.
    pub fn new(params: ChannelParams, outcome: Outcome, app_data: Vec<u8>) -> Self {
        State {
            params,
            turn_num: 0,
            outcome,
            app_data,
            is_final: false,
        }
    }

    pub(crate) fn with_turn_num(mut self, turn_num: u64) -> Self {
        self.turn_num = turn_num;
        self
    }

    pub fn turn_num(&self) -> u64 {
        self.turn_num
    }

    pub fn channel_id(&self) -> Hash {
        self.params.channel_id()
    }

    /// Create a new state that will replace this state.
    ///
    /// The turn number is private so callers cannot skip or reuse turns by
    /// accident, they have to go through here.
    pub fn make_next_state(&self) -> Self {
        State {
            params: self.params.clone(),
            turn_num: self.turn_num + 1,
            outcome: self.outcome.clone(),
            app_data: self.app_data.clone(),
            is_final: self.is_final,
        }
    }

    /// The state at `turn_num` of a setup round, which is identical to this
    /// one apart from the turn number.
    pub fn setup_state(&self, turn_num: u64) -> Self {
        self.clone().with_turn_num(turn_num)
    }

    /// Whether `other` differs from this state at most in the turn number.
    pub fn same_content(&self, other: &State) -> bool {
        self.params == other.params
            && self.outcome == other.outcome
            && self.app_data == other.app_data
            && self.is_final == other.is_final
    }

    /// Hash of the canonical protobuf encoding of the state. This is what
    /// participants sign.
    pub fn hash(&self) -> Hash {
        let encoded = schema::StateMsg::from(self).encode_to_vec();
        keccak256(&[&encoded])
    }
}
