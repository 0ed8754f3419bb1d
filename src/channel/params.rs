use super::PartIdx;
use crate::{
    sig::keccak256,
    types::{Address, Destination, Hash, U256},
};
use serde::{Deserialize, Serialize};

/// A channel member: the key that signs states and the destination that
/// receives funds.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub signing_address: Address,
    pub destination: Destination,
}

impl Participant {
    /// Participant receiving funds on its own signing address.
    pub fn new(signing_address: Address) -> Self {
        Self {
            signing_address,
            destination: signing_address.into(),
        }
    }
}

/// Fixed parameters of a channel, which also determine its id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ChannelParams {
    pub participants: Vec<Participant>,
    pub channel_nonce: u64,
    pub chain_id: U256,
    /// Zero for channels without an application, e.g. ledger channels.
    pub app_definition: Address,
    pub challenge_duration: u64,
}

impl ChannelParams {
    /// Deterministic channel id: keccak256 over the padded participant
    /// signing addresses, the chain id and the nonce.
    pub fn channel_id(&self) -> Hash {
        let mut encoded = Vec::with_capacity(32 * (self.participants.len() + 2));
        for p in &self.participants {
            encoded.extend_from_slice(&Destination::from(p.signing_address).0);
        }
        encoded.extend_from_slice(&self.chain_id.to_be_bytes());
        encoded.extend_from_slice(&U256::from(self.channel_nonce).to_be_bytes());
        keccak256(&[&encoded])
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    /// Participant whose signature is required for the state at `turn_num`.
    pub fn mover(&self, turn_num: u64) -> PartIdx {
        (turn_num % self.participants.len() as u64) as PartIdx
    }

    pub fn index_of(&self, signing_address: &Address) -> Option<PartIdx> {
        self.participants
            .iter()
            .position(|p| &p.signing_address == signing_address)
    }

    pub fn has_app(&self) -> bool {
        !self.app_definition.is_zero()
    }

    /// Turn of the last state of the prefund round.
    pub fn prefund_turn(&self) -> u64 {
        self.participants.len() as u64 - 1
    }

    /// Turn of the last state of the postfund round.
    pub fn postfund_turn(&self) -> u64 {
        2 * self.participants.len() as u64 - 1
    }

    /// Turns below this are part of the setup rounds.
    pub fn first_running_turn(&self) -> u64 {
        2 * self.participants.len() as u64
    }
}
