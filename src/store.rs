//! The store: channels, objectives, ledger requests and chain requests.
//!
//! Every method holds the table lock for its whole duration, so readers
//! never observe half-applied changes. Signed states only get in through
//! [Store::ingest_state] and friends, which validate them first.

mod locks;

pub use locks::{ChannelsGuard, LockTable};

use crate::{
    chain::ChainRequest,
    channel::{
        AppValidator, ChannelEntry, FundingStrategy, Ingested, Outcome, SignedState, State,
        TurnRejection,
    },
    error::IngestError,
    ledger::{LedgerRejection, LedgerRequest, LedgerRequestId, LedgerRequestKind, LedgerRequestStatus},
    protocols::{Objective, ObjectiveId, ObjectiveKind},
    sig::Signer,
    types::{Address, Hash, U256},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Tables {
    channels: BTreeMap<Hash, ChannelEntry>,
    objectives: BTreeMap<ObjectiveId, Objective>,
    ledger_requests: BTreeMap<LedgerRequestId, LedgerRequest>,
    chain_requests: Vec<ChainRequest>,
    /// Source of creation timestamps and request ids.
    seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

/// Cheap to clone, all clones share the same tables.
#[derive(Debug, Clone)]
pub struct Store {
    me: Address,
    tables: Arc<RwLock<Tables>>,
    locks: Arc<LockTable>,
}

impl Store {
    pub fn new(me: Address) -> Self {
        Store {
            me,
            tables: Arc::new(RwLock::new(Tables::default())),
            locks: Arc::new(LockTable::new()),
        }
    }

    pub fn me(&self) -> Address {
        self.me
    }

    /// Serializes cranks touching any of `ids`.
    pub fn lock_channels(&self, ids: &[Hash]) -> ChannelsGuard<'_> {
        self.locks.acquire(ids)
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Creates a channel from its initial state, signed by us as our prefund
    /// move.
    pub fn propose_channel(
        &self,
        signer: &Signer,
        state: State,
        funding: FundingStrategy,
        validator: &dyn AppValidator,
    ) -> Result<SignedState, IngestError> {
        let channel_id = state.channel_id();
        let my_index = state
            .params
            .index_of(&self.me)
            .ok_or(IngestError::NotAParticipant(channel_id))?;

        let mut signed = SignedState::new(state.setup_state(my_index as u64));
        signed
            .sign(signer)
            .map_err(|source| IngestError::InvalidSignature { channel_id, source })?;

        let mut tables = self.write();
        if tables.channels.contains_key(&channel_id) {
            return Err(IngestError::ChannelExists(channel_id));
        }
        let (mut entry, _) = ChannelEntry::from_first(my_index, signed.clone(), validator)
            .map_err(|reason| rejection(channel_id, signed.turn_num(), reason))?;
        entry.set_funding(funding);
        tables.channels.insert(channel_id, entry);
        debug!(channel = %channel_id, ?funding, "proposed channel");
        Ok(signed)
    }

    /// Validates `signed` and merges it into its channel, creating the
    /// channel if we have not seen it before. Nothing changes on error.
    pub fn ingest_state(
        &self,
        signed: SignedState,
        validator: &dyn AppValidator,
    ) -> Result<Ingested, IngestError> {
        let channel_id = signed.state().channel_id();
        let turn_num = signed.turn_num();
        let mut tables = self.write();

        let ingested = match tables.channels.get_mut(&channel_id) {
            Some(entry) => entry.ingest(signed, validator),
            None => {
                let my_index = signed
                    .state()
                    .params
                    .index_of(&self.me)
                    .ok_or(IngestError::NotAParticipant(channel_id))?;
                ChannelEntry::from_first(my_index, signed, validator).map(|(entry, ingested)| {
                    tables.channels.insert(channel_id, entry);
                    ingested
                })
            }
        }
        .map_err(|reason| rejection(channel_id, turn_num, reason))?;

        trace!(channel = %channel_id, turn_num, new_signers = ?ingested.new_signers, "ingested state");
        Ok(ingested)
    }

    /// Signs `state` and merges it into its (known) channel. Returns the
    /// stored state with every signature collected for it so far.
    pub fn sign_state(
        &self,
        signer: &Signer,
        state: State,
        validator: &dyn AppValidator,
    ) -> Result<SignedState, IngestError> {
        let channel_id = state.channel_id();
        let turn_num = state.turn_num();
        let mut signed = SignedState::new(state);
        signed
            .sign(signer)
            .map_err(|source| IngestError::InvalidSignature { channel_id, source })?;

        let mut tables = self.write();
        let entry = tables
            .channels
            .get_mut(&channel_id)
            .ok_or(IngestError::UnknownChannel(channel_id))?;
        entry
            .ingest(signed.clone(), validator)
            .map_err(|reason| rejection(channel_id, turn_num, reason))?;
        Ok(entry.state_at(turn_num).cloned().unwrap_or(signed))
    }

    pub fn get_channel(&self, channel_id: &Hash) -> Option<ChannelEntry> {
        self.read().channels.get(channel_id).cloned()
    }

    pub fn get_channels(&self) -> Vec<ChannelEntry> {
        self.read().channels.values().cloned().collect()
    }

    pub fn set_funding(&self, channel_id: &Hash, funding: FundingStrategy) -> Result<(), IngestError> {
        let mut tables = self.write();
        let entry = tables
            .channels
            .get_mut(channel_id)
            .ok_or(IngestError::UnknownChannel(*channel_id))?;
        entry.set_funding(funding);
        Ok(())
    }

    /// Records the on-chain holdings of a channel for one asset.
    pub fn update_holdings(
        &self,
        channel_id: &Hash,
        asset_holder: Address,
        held: U256,
    ) -> Result<(), IngestError> {
        let mut tables = self.write();
        let entry = tables
            .channels
            .get_mut(channel_id)
            .ok_or(IngestError::UnknownChannel(*channel_id))?;
        entry.set_holdings(asset_holder, held);
        Ok(())
    }

    /// Returns the objective for `kind`, creating it if it does not exist.
    /// The flag tells whether it was created.
    pub fn insert_objective(&self, kind: ObjectiveKind) -> (Objective, bool) {
        let mut tables = self.write();
        if let Some(existing) = tables.objectives.get(&kind.id()) {
            return (existing.clone(), false);
        }
        let created_at = tables.next_seq();
        let objective = Objective::new(kind, created_at);
        tables
            .objectives
            .insert(objective.id.clone(), objective.clone());
        (objective, true)
    }

    pub fn get_objective(&self, id: &ObjectiveId) -> Option<Objective> {
        self.read().objectives.get(id).cloned()
    }

    /// Replaces a stored objective. Terminal objectives are never changed.
    pub fn update_objective(&self, objective: Objective) {
        let mut tables = self.write();
        match tables.objectives.get_mut(&objective.id) {
            Some(stored) if stored.is_terminal() => {}
            Some(stored) => *stored = objective,
            None => {
                tables.objectives.insert(objective.id.clone(), objective);
            }
        }
    }

    /// All objectives, oldest first.
    pub fn objectives(&self) -> Vec<Objective> {
        let mut objectives: Vec<_> = self.read().objectives.values().cloned().collect();
        objectives.sort_by_key(|o| o.created_at);
        objectives
    }

    pub fn non_terminal_objectives(&self) -> Vec<Objective> {
        let mut objectives = self.objectives();
        objectives.retain(|o| !o.is_terminal());
        objectives
    }

    /// Objectives targeting `channel_id`, oldest first.
    pub fn objectives_for_channel(&self, channel_id: &Hash) -> Vec<Objective> {
        let mut objectives = self.objectives();
        objectives.retain(|o| &o.channel_id() == channel_id);
        objectives
    }

    pub fn queue_ledger_request(
        &self,
        channel_id: Hash,
        ledger_channel_id: Hash,
        kind: LedgerRequestKind,
        amounts: Outcome,
    ) -> LedgerRequest {
        let mut tables = self.write();
        let request = LedgerRequest {
            id: tables.next_seq(),
            channel_id,
            ledger_channel_id,
            kind,
            amounts,
            status: LedgerRequestStatus::Queued,
            rejection: None,
        };
        tables.ledger_requests.insert(request.id, request.clone());
        debug!(channel = %channel_id, ledger = %ledger_channel_id, ?kind, id = request.id, "queued ledger request");
        request
    }

    /// Requests against `ledger_channel_id`, in submission order.
    pub fn ledger_requests(&self, ledger_channel_id: &Hash) -> Vec<LedgerRequest> {
        self.read()
            .ledger_requests
            .values()
            .filter(|r| &r.ledger_channel_id == ledger_channel_id)
            .cloned()
            .collect()
    }

    /// Requests made for `channel_id`, in submission order.
    pub fn ledger_requests_for_channel(&self, channel_id: &Hash) -> Vec<LedgerRequest> {
        self.read()
            .ledger_requests
            .values()
            .filter(|r| &r.channel_id == channel_id)
            .cloned()
            .collect()
    }

    /// Ledgers with requests waiting to be batched.
    pub fn ledgers_with_queued_requests(&self) -> Vec<Hash> {
        let mut ids: Vec<Hash> = self
            .read()
            .ledger_requests
            .values()
            .filter(|r| r.is_queued())
            .map(|r| r.ledger_channel_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Consumes queued requests. Requests consumed earlier stay as they are.
    pub fn settle_ledger_requests(
        &self,
        approved: &[LedgerRequestId],
        rejected: &[(LedgerRequestId, LedgerRejection)],
    ) {
        let mut tables = self.write();
        for id in approved {
            if let Some(request) = tables.ledger_requests.get_mut(id) {
                if request.is_queued() {
                    request.status = LedgerRequestStatus::Approved;
                }
            }
        }
        for (id, rejection) in rejected {
            if let Some(request) = tables.ledger_requests.get_mut(id) {
                if request.is_queued() {
                    request.status = LedgerRequestStatus::Rejected;
                    request.rejection = Some(*rejection);
                }
            }
        }
    }

    /// Records a chain request. Returns false if it was recorded before.
    pub fn record_chain_request(&self, request: ChainRequest) -> bool {
        let mut tables = self.write();
        if tables.chain_requests.contains(&request) {
            return false;
        }
        tables.chain_requests.push(request);
        true
    }

    pub fn chain_requests(&self, channel_id: &Hash) -> Vec<ChainRequest> {
        self.read()
            .chain_requests
            .iter()
            .filter(|r| &r.channel_id() == channel_id)
            .cloned()
            .collect()
    }
}

fn rejection(channel_id: Hash, turn_num: u64, reason: TurnRejection) -> IngestError {
    IngestError::InvalidTurnTransition {
        channel_id,
        turn_num,
        reason,
    }
}
