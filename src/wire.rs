//! Messages exchanged between wallets, and their protobuf encoding.
//!
//! Everything coming off the wire is converted into domain types here and
//! rejected with a [ConversionError] if it is malformed. Signatures are not
//! checked at this layer, that happens when the states are ingested.

mod encoding;
pub mod schema;

pub use encoding::{decode_frame, encode_frame, FRAME_HEADER_LEN};

use crate::{
    channel::{
        AllocationItem, AssetOutcome, ChannelParams, FundingStrategy, Outcome, Participant,
        SignatureError, SignedState, State,
    },
    protocols::ObjectiveKind,
    types::{Address, Destination, Hash, ParseError, Signature, U256},
};
use schema::{objective_msg, request_msg, FundingKind};

/// Bumped on incompatible schema changes.
pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Bytes(#[from] ParseError),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown funding kind {0}")]
    UnknownFundingKind(i32),
    #[error("malformed protobuf: {0}")]
    Decode(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("message of {0} bytes does not fit into a frame")]
    FrameTooLarge(usize),
    #[error("frame is truncated")]
    Truncated,
}

/// A state with signatures that have not been verified yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireSignedState {
    pub state: State,
    pub signatures: Vec<Signature>,
}

impl WireSignedState {
    /// Recovers every signer, failing on the first signature that does not
    /// belong to a participant.
    pub fn verify(self) -> Result<SignedState, SignatureError> {
        SignedState::from_signatures(self.state, self.signatures)
    }
}

impl From<&SignedState> for WireSignedState {
    fn from(signed: &SignedState) -> Self {
        WireSignedState {
            state: signed.state().clone(),
            signatures: signed.signatures().values().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    GetChannel { channel_id: Hash },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub signed_states: Vec<WireSignedState>,
    pub objectives: Vec<ObjectiveKind>,
    pub requests: Vec<Request>,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.signed_states.is_empty() && self.objectives.is_empty() && self.requests.is_empty()
    }

    /// Appends `other`, skipping exact duplicates.
    pub fn merge(&mut self, other: Payload) {
        for signed in other.signed_states {
            if !self.signed_states.contains(&signed) {
                self.signed_states.push(signed);
            }
        }
        for objective in other.objectives {
            if !self.objectives.contains(&objective) {
                self.objectives.push(objective);
            }
        }
        for request in other.requests {
            if !self.requests.contains(&request) {
                self.requests.push(request);
            }
        }
    }
}

/// Addressed envelope, one per recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: Address,
    pub recipient: Address,
    pub payload: Payload,
}

impl Message {
    /// Length-prefixed protobuf frame.
    pub fn encode(&self) -> Result<Vec<u8>, ConversionError> {
        encode_frame(&schema::MessageMsg::from(self))
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ConversionError> {
        let (msg, _) = decode_frame::<schema::MessageMsg>(frame)?;
        msg.try_into()
    }
}

fn u256_from_wire(bytes: &[u8]) -> Result<U256, ConversionError> {
    Ok(U256::from_be_slice(bytes)?)
}

impl From<&ChannelParams> for schema::ParamsMsg {
    fn from(params: &ChannelParams) -> Self {
        Self {
            participants: params
                .participants
                .iter()
                .map(|p| schema::ParticipantMsg {
                    signing_address: p.signing_address.0.to_vec(),
                    destination: p.destination.0.to_vec(),
                })
                .collect(),
            channel_nonce: params.channel_nonce,
            chain_id: params.chain_id.to_be_bytes().to_vec(),
            app_definition: params.app_definition.0.to_vec(),
            challenge_duration: params.challenge_duration,
        }
    }
}

impl TryFrom<schema::ParamsMsg> for ChannelParams {
    type Error = ConversionError;

    fn try_from(value: schema::ParamsMsg) -> Result<Self, Self::Error> {
        let participants = value
            .participants
            .iter()
            .map(|p| {
                Ok(Participant {
                    signing_address: Address::from_slice(&p.signing_address)?,
                    destination: Destination::from_slice(&p.destination)?,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;
        if participants.is_empty() {
            return Err(ConversionError::MissingField("participants"));
        }
        Ok(ChannelParams {
            participants,
            channel_nonce: value.channel_nonce,
            chain_id: u256_from_wire(&value.chain_id)?,
            app_definition: Address::from_slice(&value.app_definition)?,
            challenge_duration: value.challenge_duration,
        })
    }
}

fn outcome_to_wire(outcome: &Outcome) -> Vec<schema::AssetOutcomeMsg> {
    outcome
        .0
        .iter()
        .map(|asset| schema::AssetOutcomeMsg {
            asset_holder: asset.asset_holder.0.to_vec(),
            allocation: asset
                .allocation
                .iter()
                .map(|item| schema::AllocationItemMsg {
                    destination: item.destination.0.to_vec(),
                    amount: item.amount.to_be_bytes().to_vec(),
                })
                .collect(),
        })
        .collect()
}

fn outcome_from_wire(assets: Vec<schema::AssetOutcomeMsg>) -> Result<Outcome, ConversionError> {
    let assets = assets
        .into_iter()
        .map(|asset| {
            let allocation = asset
                .allocation
                .iter()
                .map(|item| {
                    Ok(AllocationItem {
                        destination: Destination::from_slice(&item.destination)?,
                        amount: u256_from_wire(&item.amount)?,
                    })
                })
                .collect::<Result<Vec<_>, ConversionError>>()?;
            Ok(AssetOutcome {
                asset_holder: Address::from_slice(&asset.asset_holder)?,
                allocation,
            })
        })
        .collect::<Result<Vec<_>, ConversionError>>()?;
    Ok(Outcome(assets))
}

impl From<&State> for schema::StateMsg {
    fn from(state: &State) -> Self {
        Self {
            params: Some((&state.params).into()),
            turn_num: state.turn_num(),
            outcome: outcome_to_wire(&state.outcome),
            app_data: state.app_data.clone(),
            is_final: state.is_final,
        }
    }
}

impl TryFrom<schema::StateMsg> for State {
    type Error = ConversionError;

    fn try_from(value: schema::StateMsg) -> Result<Self, Self::Error> {
        let params = value
            .params
            .ok_or(ConversionError::MissingField("params"))?
            .try_into()?;
        let outcome = outcome_from_wire(value.outcome)?;
        let mut state = State::new(params, outcome, value.app_data).with_turn_num(value.turn_num);
        state.is_final = value.is_final;
        Ok(state)
    }
}

impl From<&WireSignedState> for schema::SignedStateMsg {
    fn from(signed: &WireSignedState) -> Self {
        Self {
            state: Some((&signed.state).into()),
            signatures: signed.signatures.iter().map(|s| s.0.to_vec()).collect(),
        }
    }
}

impl TryFrom<schema::SignedStateMsg> for WireSignedState {
    type Error = ConversionError;

    fn try_from(value: schema::SignedStateMsg) -> Result<Self, Self::Error> {
        Ok(WireSignedState {
            state: value
                .state
                .ok_or(ConversionError::MissingField("state"))?
                .try_into()?,
            signatures: value
                .signatures
                .iter()
                .map(|s| Signature::from_slice(s))
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<FundingStrategy> for schema::FundingMsg {
    fn from(funding: FundingStrategy) -> Self {
        let (kind, ledger_channel_id) = match funding {
            FundingStrategy::Direct => (FundingKind::Direct, Vec::new()),
            FundingStrategy::Ledger { ledger_channel_id } => {
                (FundingKind::Ledger, ledger_channel_id.0.to_vec())
            }
            FundingStrategy::Fake => (FundingKind::Fake, Vec::new()),
        };
        Self {
            kind: kind as i32,
            ledger_channel_id,
        }
    }
}

impl TryFrom<schema::FundingMsg> for FundingStrategy {
    type Error = ConversionError;

    fn try_from(value: schema::FundingMsg) -> Result<Self, Self::Error> {
        match FundingKind::from_i32(value.kind) {
            Some(FundingKind::Direct) => Ok(FundingStrategy::Direct),
            Some(FundingKind::Ledger) => Ok(FundingStrategy::Ledger {
                ledger_channel_id: Hash::from_slice(&value.ledger_channel_id)?,
            }),
            Some(FundingKind::Fake) => Ok(FundingStrategy::Fake),
            None => Err(ConversionError::UnknownFundingKind(value.kind)),
        }
    }
}

impl From<&ObjectiveKind> for schema::ObjectiveMsg {
    fn from(kind: &ObjectiveKind) -> Self {
        let id = |channel_id: &Hash| schema::ChannelIdMsg {
            channel_id: channel_id.0.to_vec(),
        };
        let kind = match kind {
            ObjectiveKind::OpenChannel {
                channel_id,
                funding,
            } => objective_msg::Kind::OpenChannel(schema::OpenChannelMsg {
                channel_id: channel_id.0.to_vec(),
                funding: Some((*funding).into()),
            }),
            ObjectiveKind::OpenLedgerChannel { channel_id } => {
                objective_msg::Kind::OpenLedgerChannel(id(channel_id))
            }
            ObjectiveKind::CloseChannel { channel_id } => {
                objective_msg::Kind::CloseChannel(id(channel_id))
            }
        };
        Self { kind: Some(kind) }
    }
}

impl TryFrom<schema::ObjectiveMsg> for ObjectiveKind {
    type Error = ConversionError;

    fn try_from(value: schema::ObjectiveMsg) -> Result<Self, Self::Error> {
        match value.kind.ok_or(ConversionError::MissingField("objective"))? {
            objective_msg::Kind::OpenChannel(msg) => Ok(ObjectiveKind::OpenChannel {
                channel_id: Hash::from_slice(&msg.channel_id)?,
                funding: msg
                    .funding
                    .ok_or(ConversionError::MissingField("funding"))?
                    .try_into()?,
            }),
            objective_msg::Kind::OpenLedgerChannel(msg) => Ok(ObjectiveKind::OpenLedgerChannel {
                channel_id: Hash::from_slice(&msg.channel_id)?,
            }),
            objective_msg::Kind::CloseChannel(msg) => Ok(ObjectiveKind::CloseChannel {
                channel_id: Hash::from_slice(&msg.channel_id)?,
            }),
        }
    }
}

impl From<&Request> for schema::RequestMsg {
    fn from(request: &Request) -> Self {
        let request = match request {
            Request::GetChannel { channel_id } => {
                request_msg::Request::GetChannel(schema::ChannelIdMsg {
                    channel_id: channel_id.0.to_vec(),
                })
            }
        };
        Self {
            request: Some(request),
        }
    }
}

impl TryFrom<schema::RequestMsg> for Request {
    type Error = ConversionError;

    fn try_from(value: schema::RequestMsg) -> Result<Self, Self::Error> {
        match value.request.ok_or(ConversionError::MissingField("request"))? {
            request_msg::Request::GetChannel(msg) => Ok(Request::GetChannel {
                channel_id: Hash::from_slice(&msg.channel_id)?,
            }),
        }
    }
}

impl From<&Payload> for schema::PayloadMsg {
    fn from(payload: &Payload) -> Self {
        Self {
            signed_states: payload.signed_states.iter().map(Into::into).collect(),
            objectives: payload.objectives.iter().map(Into::into).collect(),
            requests: payload.requests.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<schema::PayloadMsg> for Payload {
    type Error = ConversionError;

    fn try_from(value: schema::PayloadMsg) -> Result<Self, Self::Error> {
        Ok(Payload {
            signed_states: value
                .signed_states
                .into_iter()
                .map(WireSignedState::try_from)
                .collect::<Result<_, _>>()?,
            objectives: value
                .objectives
                .into_iter()
                .map(ObjectiveKind::try_from)
                .collect::<Result<_, _>>()?,
            requests: value
                .requests
                .into_iter()
                .map(Request::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<&Message> for schema::MessageMsg {
    fn from(msg: &Message) -> Self {
        Self {
            version: WIRE_VERSION,
            sender: msg.sender.0.to_vec(),
            recipient: msg.recipient.0.to_vec(),
            payload: Some((&msg.payload).into()),
        }
    }
}

impl TryFrom<schema::MessageMsg> for Message {
    type Error = ConversionError;

    fn try_from(value: schema::MessageMsg) -> Result<Self, Self::Error> {
        if value.version != WIRE_VERSION {
            return Err(ConversionError::UnsupportedVersion(value.version));
        }
        Ok(Message {
            sender: Address::from_slice(&value.sender)?,
            recipient: Address::from_slice(&value.recipient)?,
            payload: value
                .payload
                .ok_or(ConversionError::MissingField("payload"))?
                .try_into()?,
        })
    }
}
