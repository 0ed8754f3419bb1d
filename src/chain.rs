//! Boundary to the on-chain escrow.
//!
//! The engine never submits transactions itself. It hands requests to a
//! [ChainService] and learns about their effect through [DepositedEvent]s,
//! which are fed back with `Wallet::update_funding_for_channels`.

use crate::{
    channel::SignedState,
    types::{Address, Hash, U256},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::Mutex,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Deposit `amount` of an asset into a channel, valid only while the channel
/// holds exactly `expected_held`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub channel_id: Hash,
    pub asset_holder: Address,
    pub expected_held: U256,
    pub amount: U256,
}

/// Requests recorded by the store, so re-cranking never repeats them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ChainRequest {
    Register {
        channel_id: Hash,
        asset_holders: Vec<Address>,
    },
    Deposit(DepositRequest),
    ConcludeAndWithdraw {
        channel_id: Hash,
        turn_num: u64,
    },
}

impl ChainRequest {
    pub fn channel_id(&self) -> Hash {
        match self {
            ChainRequest::Register { channel_id, .. } => *channel_id,
            ChainRequest::Deposit(deposit) => deposit.channel_id,
            ChainRequest::ConcludeAndWithdraw { channel_id, .. } => *channel_id,
        }
    }
}

/// Funds arrived in a channel's escrow.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepositedEvent {
    pub channel_id: Hash,
    pub asset_holder: Address,
    pub amount_deposited: U256,
    /// Total held by the channel for this asset after the deposit.
    pub now_held: U256,
    /// Whether the channel was concluded and paid out.
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("channel {0} is not registered")]
    UnknownChannel(Hash),
    #[error("asset {asset_holder} is not registered for channel {channel_id}")]
    UnknownAsset { channel_id: Hash, asset_holder: Address },
    #[error("channel holds {actual}, deposit expected {expected}")]
    HoldingsMismatch { expected: U256, actual: U256 },
    #[error("channel {0} is already concluded")]
    AlreadyConcluded(Hash),
    #[error("state is not a fully signed final state")]
    NotFinal,
    #[error("deposit overflows the channel holdings")]
    AmountOverflow,
}

/// Submits requests to the chain.
pub trait ChainService: Debug + Send + Sync {
    fn register_channel(&self, channel_id: Hash, asset_holders: &[Address]) -> Result<(), ChainError>;

    fn fund_channel(&self, request: &DepositRequest) -> Result<(), ChainError>;

    fn conclude_and_withdraw(&self, final_state: &SignedState) -> Result<(), ChainError>;
}

#[derive(Debug, Default)]
struct Escrow {
    holdings: BTreeMap<(Hash, Address), U256>,
    concluded: BTreeSet<Hash>,
}

/// In-process chain shared by every wallet of a test or demo. Deposits are
/// credited immediately and announced to all subscribers.
#[derive(Debug)]
pub struct MemoryChain {
    escrow: Mutex<Escrow>,
    events: broadcast::Sender<DepositedEvent>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        MemoryChain {
            escrow: Mutex::new(Escrow::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepositedEvent> {
        self.events.subscribe()
    }

    pub fn holdings(&self, channel_id: Hash, asset_holder: Address) -> U256 {
        self.escrow()
            .holdings
            .get(&(channel_id, asset_holder))
            .copied()
            .unwrap_or_default()
    }

    fn escrow(&self) -> std::sync::MutexGuard<'_, Escrow> {
        match self.escrow.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: DepositedEvent) {
        // Nobody listening is fine, e.g. in unit tests.
        let _ = self.events.send(event);
    }
}

impl ChainService for MemoryChain {
    fn register_channel(&self, channel_id: Hash, asset_holders: &[Address]) -> Result<(), ChainError> {
        let mut escrow = self.escrow();
        for asset_holder in asset_holders {
            escrow
                .holdings
                .entry((channel_id, *asset_holder))
                .or_insert_with(U256::zero);
        }
        debug!(channel = %channel_id, assets = asset_holders.len(), "registered channel");
        Ok(())
    }

    fn fund_channel(&self, request: &DepositRequest) -> Result<(), ChainError> {
        let event = {
            let mut escrow = self.escrow();
            if escrow.concluded.contains(&request.channel_id) {
                return Err(ChainError::AlreadyConcluded(request.channel_id));
            }
            let held = escrow
                .holdings
                .get_mut(&(request.channel_id, request.asset_holder))
                .ok_or(ChainError::UnknownAsset {
                    channel_id: request.channel_id,
                    asset_holder: request.asset_holder,
                })?;
            if *held != request.expected_held {
                let actual = *held;
                warn!(channel = %request.channel_id, expected = %request.expected_held, %actual, "deposit rejected");
                return Err(ChainError::HoldingsMismatch {
                    expected: request.expected_held,
                    actual,
                });
            }
            *held = held
                .checked_add(request.amount)
                .ok_or(ChainError::AmountOverflow)?;
            DepositedEvent {
                channel_id: request.channel_id,
                asset_holder: request.asset_holder,
                amount_deposited: request.amount,
                now_held: *held,
                is_final: false,
            }
        };
        debug!(channel = %event.channel_id, amount = %event.amount_deposited, now_held = %event.now_held, "deposited");
        self.emit(event);
        Ok(())
    }

    fn conclude_and_withdraw(&self, final_state: &SignedState) -> Result<(), ChainError> {
        if !final_state.state().is_final || !final_state.has_quorum() {
            return Err(ChainError::NotFinal);
        }
        let channel_id = final_state.state().channel_id();
        let mut payouts = Vec::new();
        {
            let mut escrow = self.escrow();
            if !escrow.concluded.insert(channel_id) {
                return Err(ChainError::AlreadyConcluded(channel_id));
            }
            for asset in &final_state.state().outcome.0 {
                if let Some(held) = escrow.holdings.get_mut(&(channel_id, asset.asset_holder)) {
                    payouts.push((asset.asset_holder, *held));
                    *held = U256::zero();
                }
            }
        }
        for (asset_holder, paid) in payouts {
            self.emit(DepositedEvent {
                channel_id,
                asset_holder,
                amount_deposited: U256::zero(),
                now_held: U256::zero(),
                is_final: true,
            });
            debug!(channel = %channel_id, %paid, "concluded and withdrew");
        }
        Ok(())
    }
}
