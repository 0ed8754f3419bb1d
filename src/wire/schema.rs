//! Protobuf schema of everything exchanged between wallets.
//!
//! Field numbers are part of the wire format, never reuse them. The state
//! encoding is also what gets hashed and signed, so changing it changes
//! every channel's signatures.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub signing_address: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub destination: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParamsMsg {
    #[prost(message, repeated, tag = "1")]
    pub participants: Vec<ParticipantMsg>,
    #[prost(uint64, tag = "2")]
    pub channel_nonce: u64,
    /// 32 bytes, big-endian.
    #[prost(bytes = "vec", tag = "3")]
    pub chain_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub app_definition: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub challenge_duration: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocationItemMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub destination: Vec<u8>,
    /// 32 bytes, big-endian.
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssetOutcomeMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub asset_holder: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub allocation: Vec<AllocationItemMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateMsg {
    #[prost(message, optional, tag = "1")]
    pub params: Option<ParamsMsg>,
    #[prost(uint64, tag = "2")]
    pub turn_num: u64,
    #[prost(message, repeated, tag = "3")]
    pub outcome: Vec<AssetOutcomeMsg>,
    #[prost(bytes = "vec", tag = "4")]
    pub app_data: Vec<u8>,
    #[prost(bool, tag = "5")]
    pub is_final: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedStateMsg {
    #[prost(message, optional, tag = "1")]
    pub state: Option<StateMsg>,
    /// 65 bytes each, the signer is recovered by the receiver.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub signatures: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FundingKind {
    Direct = 0,
    Ledger = 1,
    Fake = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingMsg {
    #[prost(enumeration = "FundingKind", tag = "1")]
    pub kind: i32,
    /// Only set for [FundingKind::Ledger].
    #[prost(bytes = "vec", tag = "2")]
    pub ledger_channel_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenChannelMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub funding: Option<FundingMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelIdMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectiveMsg {
    #[prost(oneof = "objective_msg::Kind", tags = "1, 2, 3")]
    pub kind: Option<objective_msg::Kind>,
}

pub mod objective_msg {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        OpenChannel(super::OpenChannelMsg),
        #[prost(message, tag = "2")]
        OpenLedgerChannel(super::ChannelIdMsg),
        #[prost(message, tag = "3")]
        CloseChannel(super::ChannelIdMsg),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestMsg {
    #[prost(oneof = "request_msg::Request", tags = "1")]
    pub request: Option<request_msg::Request>,
}

pub mod request_msg {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        /// Asks the recipient for its latest signed states of a channel.
        #[prost(message, tag = "1")]
        GetChannel(super::ChannelIdMsg),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PayloadMsg {
    #[prost(message, repeated, tag = "1")]
    pub signed_states: Vec<SignedStateMsg>,
    #[prost(message, repeated, tag = "2")]
    pub objectives: Vec<ObjectiveMsg>,
    #[prost(message, repeated, tag = "3")]
    pub requests: Vec<RequestMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageMsg {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub recipient: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<PayloadMsg>,
}
