//! The wallet: one participant's view of all its channels.
//!
//! Every state-changing call validates its input, records the change in the
//! store and then cranks objectives and ledgers until nothing moves any
//! more. What has to reach other participants is collected in the returned
//! outbox, delivering it is up to the caller (see [crate::dispatch]).

use crate::{
    chain::{ChainError, ChainRequest, ChainService, DepositedEvent},
    channel::{
        ChannelEntry, ChannelParams, ChannelStatus, FundingStrategy, Outcome, Participant,
        SignedState, State, TurnRejection,
    },
    config::EngineConfig,
    error::{EngineError, IngestError},
    ledger::{self, LedgerRequestKind},
    protocols::{
        self, Action, CrankInput, Objective, ObjectiveFailure, ObjectiveId, ObjectiveKind,
        ObjectiveStatus,
    },
    sig::Signer,
    store::Store,
    types::{Address, Hash},
    wire::{Message, Payload, Request, WireSignedState},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Upper bound for crank rounds per call. Every round either changes the
/// store or ends the loop, this only guards against bugs.
const MAX_CRANK_ROUNDS: usize = 64;

/// Caller-facing summary of a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResult {
    pub channel_id: Hash,
    pub participants: Vec<Participant>,
    pub app_definition: Address,
    /// Turn of the supported state, or of the latest one before anything is
    /// supported.
    pub turn_num: u64,
    pub status: ChannelStatus,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
    pub funding: Option<FundingStrategy>,
}

impl From<&ChannelEntry> for ChannelResult {
    fn from(entry: &ChannelEntry) -> Self {
        let signed = entry.supported().unwrap_or_else(|| entry.latest());
        let state = signed.state();
        ChannelResult {
            channel_id: entry.channel_id(),
            participants: state.params.participants.clone(),
            app_definition: state.params.app_definition,
            turn_num: state.turn_num(),
            status: entry.status(),
            outcome: state.outcome.clone(),
            app_data: state.app_data.clone(),
            funding: entry.funding(),
        }
    }
}

/// Result of every state-changing wallet call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipleChannelOutput {
    pub channel_results: Vec<ChannelResult>,
    /// One message per recipient.
    pub outbox: Vec<Message>,
    pub new_objectives: Vec<Objective>,
    /// Peer input that was not accepted. Never fatal.
    pub rejected: Vec<IngestError>,
}

impl MultipleChannelOutput {
    pub fn channel_ids(&self) -> Vec<Hash> {
        self.channel_results.iter().map(|r| r.channel_id).collect()
    }
}

/// Things the wallet reports while working, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ObjectiveStarted(ObjectiveId),
    ObjectiveSucceeded(ObjectiveId),
    ObjectiveFailed {
        id: ObjectiveId,
        reason: ObjectiveFailure,
    },
    ChannelUpdated(ChannelResult),
}

/// Parameters of a new channel. The nonce is chosen by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelParams {
    pub participants: Vec<Participant>,
    pub outcome: Outcome,
    pub app_definition: Address,
    pub app_data: Vec<u8>,
    pub funding: FundingStrategy,
}

/// Payloads per recipient, merged so each recipient gets one message.
#[derive(Debug, Default)]
struct Outbox(BTreeMap<Address, Payload>);

impl Outbox {
    fn to(&mut self, recipient: Address) -> &mut Payload {
        self.0.entry(recipient).or_default()
    }

    fn add_state(&mut self, recipients: &[Address], signed: &SignedState) {
        for recipient in recipients {
            self.to(*recipient).merge(Payload {
                signed_states: vec![signed.into()],
                ..Payload::default()
            });
        }
    }

    fn add_objective(&mut self, recipients: &[Address], kind: ObjectiveKind) {
        for recipient in recipients {
            self.to(*recipient).merge(Payload {
                objectives: vec![kind],
                ..Payload::default()
            });
        }
    }

    fn add_request(&mut self, recipients: &[Address], request: Request) {
        for recipient in recipients {
            self.to(*recipient).merge(Payload {
                requests: vec![request],
                ..Payload::default()
            });
        }
    }

    fn into_messages(self, sender: Address) -> Vec<Message> {
        self.0
            .into_iter()
            .filter(|(_, payload)| !payload.is_empty())
            .map(|(recipient, payload)| Message {
                sender,
                recipient,
                payload,
            })
            .collect()
    }
}

/// Collects what one wallet call produced.
#[derive(Debug, Default)]
struct Output {
    outbox: Outbox,
    channels: Vec<Hash>,
    new_objectives: Vec<Objective>,
    rejected: Vec<IngestError>,
}

impl Output {
    fn touch(&mut self, channel_id: Hash) {
        if !self.channels.contains(&channel_id) {
            self.channels.push(channel_id);
        }
    }
}

/// Participants other than us.
fn others(params: &ChannelParams, me: &Address) -> Vec<Address> {
    params
        .participants
        .iter()
        .map(|p| p.signing_address)
        .filter(|a| a != me)
        .collect()
}

#[derive(Debug)]
pub struct Wallet {
    signer: Signer,
    store: Store,
    chain: Arc<dyn ChainService>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
}

impl Wallet {
    pub fn new(signer: Signer, chain: Arc<dyn ChainService>, config: EngineConfig) -> Self {
        let store = Store::new(signer.address());
        Self::with_store(signer, store, chain, config)
    }

    /// Wallet on top of an existing store, e.g. after a restart. Call
    /// [Wallet::jump_start_objectives] afterwards to resume.
    pub fn with_store(
        signer: Signer,
        store: Store,
        chain: Arc<dyn ChainService>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Wallet {
            signer,
            store,
            chain,
            config,
            events,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // Having no subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn create_channel(
        &self,
        params: CreateChannelParams,
    ) -> Result<MultipleChannelOutput, EngineError> {
        self.create_channels(params, 1)
    }

    /// Creates `count` channels with the same parameters (but different
    /// nonces). Ledger funded ones are funded in as few ledger turns as
    /// possible.
    pub fn create_channels(
        &self,
        params: CreateChannelParams,
        count: usize,
    ) -> Result<MultipleChannelOutput, EngineError> {
        self.check_create(&params)?;
        let mut out = Output::default();
        for _ in 0..count {
            let kind = |channel_id: Hash| ObjectiveKind::OpenChannel {
                channel_id,
                funding: params.funding,
            };
            self.propose(&params, kind, &mut out)?;
        }
        self.crank_until_idle(&mut out);
        Ok(self.finish(out))
    }

    /// Creates a directly funded channel without application, to fund other
    /// channels from. The outcome has to list every participant once, in
    /// participant order.
    pub fn create_ledger_channel(
        &self,
        participants: Vec<Participant>,
        outcome: Outcome,
    ) -> Result<MultipleChannelOutput, EngineError> {
        let destinations: Vec<_> = participants.iter().map(|p| p.destination).collect();
        let canonical = outcome.0.iter().all(|asset| {
            asset
                .allocation
                .iter()
                .map(|item| item.destination)
                .eq(destinations.iter().copied())
        });
        if !canonical {
            return Err(EngineError::InvalidChannel(
                "ledger outcome must list each participant once, in order",
            ));
        }

        let params = CreateChannelParams {
            participants,
            outcome,
            app_definition: Address::default(),
            app_data: Vec::new(),
            funding: FundingStrategy::Direct,
        };
        self.check_create(&params)?;
        let mut out = Output::default();
        let kind = |channel_id: Hash| ObjectiveKind::OpenLedgerChannel { channel_id };
        self.propose(&params, kind, &mut out)?;
        self.crank_until_idle(&mut out);
        Ok(self.finish(out))
    }

    fn check_create(&self, params: &CreateChannelParams) -> Result<(), EngineError> {
        if params.participants.len() < 2 {
            return Err(EngineError::InvalidChannel("need at least two participants"));
        }
        if !params
            .participants
            .iter()
            .any(|p| p.signing_address == self.address())
        {
            return Err(EngineError::InvalidChannel("we are not a participant"));
        }
        if params.outcome.totals().is_none() {
            return Err(EngineError::InvalidChannel("allocated amounts overflow"));
        }

        let ledger_channel_id = match params.funding {
            FundingStrategy::Ledger { ledger_channel_id } => ledger_channel_id,
            _ => return Ok(()),
        };
        let unavailable = |reason| EngineError::LedgerUnavailable {
            ledger_channel_id,
            reason,
        };
        let ledger = self
            .store
            .get_channel(&ledger_channel_id)
            .ok_or_else(|| unavailable("unknown ledger"))?;
        match ledger.status() {
            ChannelStatus::Running => {}
            ChannelStatus::Closing | ChannelStatus::Closed => {
                return Err(unavailable("ledger is closing or closed"))
            }
            ChannelStatus::Proposed | ChannelStatus::Opening => {
                return Err(unavailable("ledger is not running yet"))
            }
        }
        let supported = match ledger.supported() {
            Some(supported) => supported.state(),
            None => return Err(unavailable("ledger is not running yet")),
        };
        let slack = ledger::slack_destinations(supported);
        let served = params.outcome.0.iter().all(|asset| {
            supported.outcome.asset(&asset.asset_holder).is_some()
                && asset
                    .allocation
                    .iter()
                    .all(|item| slack.contains(&item.destination))
        });
        if !served {
            return Err(EngineError::InvalidChannel(
                "ledger does not hold these assets for these participants",
            ));
        }
        Ok(())
    }

    /// Stores a new channel with our prefund signature and an approved
    /// objective for it.
    fn propose(
        &self,
        params: &CreateChannelParams,
        kind: impl Fn(Hash) -> ObjectiveKind,
        out: &mut Output,
    ) -> Result<(), EngineError> {
        let channel_params = ChannelParams {
            participants: params.participants.clone(),
            channel_nonce: rand::random(),
            chain_id: self.config.chain_id,
            app_definition: params.app_definition,
            challenge_duration: self.config.challenge_duration,
        };
        let state = State::new(channel_params, params.outcome.clone(), params.app_data.clone());
        let channel_id = state.channel_id();
        let recipients = others(&state.params, &self.address());

        let signed = self.store.propose_channel(
            &self.signer,
            state,
            params.funding,
            self.config.validator.as_ref(),
        )?;
        let (mut objective, _) = self.store.insert_objective(kind(channel_id));
        objective.approve();
        self.store.update_objective(objective.clone());
        info!(objective = %objective.id, "created channel");

        out.outbox.add_state(&recipients, &signed);
        out.outbox.add_objective(&recipients, objective.kind);
        out.new_objectives.push(objective);
        out.touch(channel_id);
        Ok(())
    }

    pub fn join_channel(&self, channel_id: Hash) -> Result<MultipleChannelOutput, EngineError> {
        self.join_channels(&[channel_id])
    }

    /// Approves the open objectives of channels proposed by others.
    pub fn join_channels(&self, channel_ids: &[Hash]) -> Result<MultipleChannelOutput, EngineError> {
        let mut ids = Vec::with_capacity(channel_ids.len());
        for channel_id in channel_ids {
            if self.store.get_channel(channel_id).is_none() {
                return Err(EngineError::ChannelNotFound(*channel_id));
            }
            let objective = self
                .store
                .objectives_for_channel(channel_id)
                .into_iter()
                .find(|o| !matches!(o.kind, ObjectiveKind::CloseChannel { .. }))
                .ok_or(EngineError::ChannelNotFound(*channel_id))?;
            ids.push(objective.id);
        }
        self.approve_objectives(&ids)
    }

    pub fn approve_objectives(
        &self,
        ids: &[ObjectiveId],
    ) -> Result<MultipleChannelOutput, EngineError> {
        let mut out = Output::default();
        for id in ids {
            let mut objective = self
                .store
                .get_objective(id)
                .ok_or_else(|| EngineError::ObjectiveNotFound(id.clone()))?;
            objective.approve();
            self.store.update_objective(objective.clone());
            out.touch(objective.channel_id());
        }
        self.crank_until_idle(&mut out);
        Ok(self.finish(out))
    }

    /// Declines queued objectives. They fail and are never cranked.
    pub fn reject_objectives(
        &self,
        ids: &[ObjectiveId],
    ) -> Result<MultipleChannelOutput, EngineError> {
        let mut out = Output::default();
        for id in ids {
            let mut objective = self
                .store
                .get_objective(id)
                .ok_or_else(|| EngineError::ObjectiveNotFound(id.clone()))?;
            let before = objective.clone();
            objective.reject();
            self.record_objective(&before, &objective);
            out.touch(objective.channel_id());
        }
        Ok(self.finish(out))
    }

    pub fn close_channel(&self, channel_id: Hash) -> Result<MultipleChannelOutput, EngineError> {
        self.close_channels(&[channel_id])
    }

    /// Closing a channel that is already closing or closed returns the
    /// existing objective instead of failing.
    pub fn close_channels(
        &self,
        channel_ids: &[Hash],
    ) -> Result<MultipleChannelOutput, EngineError> {
        // Check every channel before creating any objective.
        let mut entries = Vec::with_capacity(channel_ids.len());
        for channel_id in channel_ids {
            let entry = self
                .store
                .get_channel(channel_id)
                .ok_or(EngineError::ChannelNotFound(*channel_id))?;
            match entry.status() {
                ChannelStatus::Running | ChannelStatus::Closing | ChannelStatus::Closed => {}
                ChannelStatus::Proposed | ChannelStatus::Opening => {
                    return Err(EngineError::ChannelNotRunning(*channel_id))
                }
            }
            entries.push(entry);
        }

        let mut out = Output::default();
        for (channel_id, entry) in channel_ids.iter().zip(&entries) {
            let kind = ObjectiveKind::CloseChannel {
                channel_id: *channel_id,
            };
            let (mut objective, created) = self.store.insert_objective(kind);
            objective.approve();
            self.store.update_objective(objective.clone());
            out.outbox
                .add_objective(&others(entry.params(), &self.address()), kind);
            if created {
                info!(objective = %objective.id, "closing channel");
                out.new_objectives.push(objective);
            }
            out.touch(*channel_id);
        }
        self.crank_until_idle(&mut out);
        Ok(self.finish(out))
    }

    /// Proposes a new outcome and app data as the next turn.
    ///
    /// Application channels only accept updates on our own turn. Channels
    /// without application accept updates from anyone, but they only take
    /// effect once everyone signed.
    pub fn update_channel(
        &self,
        channel_id: Hash,
        outcome: Outcome,
        app_data: Vec<u8>,
    ) -> Result<MultipleChannelOutput, EngineError> {
        let _guard = self.store.lock_channels(&[channel_id]);
        let entry = self
            .store
            .get_channel(&channel_id)
            .ok_or(EngineError::ChannelNotFound(channel_id))?;
        match entry.status() {
            ChannelStatus::Running => {}
            ChannelStatus::Closing | ChannelStatus::Closed => {
                return Err(EngineError::ChannelAlreadyClosed(channel_id))
            }
            ChannelStatus::Proposed | ChannelStatus::Opening => {
                return Err(EngineError::ChannelNotRunning(channel_id))
            }
        }
        let supported = entry
            .supported()
            .ok_or(EngineError::ChannelNotRunning(channel_id))?;
        let mut next = supported.state().make_next_state();
        let params = entry.params();
        if params.has_app() && params.mover(next.turn_num()) != entry.my_index() {
            return Err(EngineError::NotMyTurn(channel_id));
        }
        next.outcome = outcome;
        next.app_data = app_data;

        let signed = self
            .store
            .sign_state(&self.signer, next, self.config.validator.as_ref())?;
        debug!(channel = %channel_id, turn_num = signed.turn_num(), "updated channel");

        let mut out = Output::default();
        out.outbox
            .add_state(&others(params, &self.address()), &signed);
        out.touch(channel_id);
        Ok(self.finish(out))
    }

    /// Handles a message from another wallet.
    ///
    /// Invalid states are skipped and reported in `rejected`, everything
    /// valid is applied.
    pub fn push_message(&self, msg: Message) -> Result<MultipleChannelOutput, EngineError> {
        if msg.recipient != self.address() {
            return Err(EngineError::WrongRecipient);
        }
        let mut out = Output::default();
        let Payload {
            signed_states,
            objectives,
            requests,
        } = msg.payload;

        for wire in signed_states {
            self.ingest_wire_state(wire, &mut out);
        }

        for kind in objectives {
            self.receive_objective(kind, &mut out);
        }

        for request in requests {
            match request {
                Request::GetChannel { channel_id } => match self.store.get_channel(&channel_id) {
                    Some(entry) if entry.params().index_of(&msg.sender).is_some() => {
                        for signed in sync_states(&entry) {
                            out.outbox.add_state(&[msg.sender], signed);
                        }
                    }
                    _ => debug!(channel = %channel_id, sender = %msg.sender, "ignoring channel request"),
                },
            }
        }

        // Peers may close without telling us about the objective, their final
        // state is enough.
        for channel_id in out.channels.clone() {
            if let Some(entry) = self.store.get_channel(&channel_id) {
                if entry.status().is_closing_or_closed() {
                    self.receive_objective(ObjectiveKind::CloseChannel { channel_id }, &mut out);
                }
            }
        }

        self.crank_until_idle(&mut out);
        Ok(self.finish(out))
    }

    fn ingest_wire_state(&self, wire: WireSignedState, out: &mut Output) {
        let channel_id = wire.state.channel_id();
        if wire.state.params.chain_id != self.config.chain_id {
            debug!(channel = %channel_id, "ignoring state for another chain");
            return;
        }
        let signed = match wire.verify() {
            Ok(signed) => signed,
            Err(source) => {
                warn!(channel = %channel_id, %source, "invalid signature");
                out.rejected
                    .push(IngestError::InvalidSignature { channel_id, source });
                return;
            }
        };
        match self
            .store
            .ingest_state(signed, self.config.validator.as_ref())
        {
            Ok(ingested) => {
                if !ingested.is_duplicate() {
                    out.touch(channel_id);
                }
            }
            Err(err) => {
                match &err {
                    IngestError::InvalidTurnTransition {
                        reason: TurnRejection::Stale { .. } | TurnRejection::Conflict,
                        ..
                    } => debug!(%err, "state not ingested"),
                    _ => warn!(%err, "state rejected"),
                }
                out.rejected.push(err);
            }
        }
    }

    /// Records an objective announced by a peer (or implied by its states).
    fn receive_objective(&self, kind: ObjectiveKind, out: &mut Output) {
        let channel_id = kind.channel_id();
        let entry = match self.store.get_channel(&channel_id) {
            Some(entry) => entry,
            None => {
                debug!(objective = %kind.id(), "objective for unknown channel");
                return;
            }
        };
        if entry.funding().is_none() {
            let funding = match kind {
                ObjectiveKind::OpenChannel { funding, .. } => Some(funding),
                ObjectiveKind::OpenLedgerChannel { .. } => Some(FundingStrategy::Direct),
                ObjectiveKind::CloseChannel { .. } => None,
            };
            if let Some(funding) = funding {
                // The channel is known, this can not fail.
                let _ = self.store.set_funding(&channel_id, funding);
            }
        }

        let (mut objective, created) = self.store.insert_objective(kind);
        if created {
            if let ObjectiveKind::CloseChannel { .. } = kind {
                objective.approve();
                self.store.update_objective(objective.clone());
            }
            info!(objective = %objective.id, status = ?objective.status, "new objective from peer");
            out.new_objectives.push(objective);
        }
        out.touch(channel_id);
    }

    /// Feeds on-chain deposits into the channels they belong to.
    pub fn update_funding_for_channels(
        &self,
        events: &[DepositedEvent],
    ) -> Result<MultipleChannelOutput, EngineError> {
        let mut out = Output::default();
        for event in events {
            match self
                .store
                .update_holdings(&event.channel_id, event.asset_holder, event.now_held)
            {
                Ok(()) => out.touch(event.channel_id),
                Err(_) => debug!(channel = %event.channel_id, "deposit for unknown channel"),
            }
        }
        self.crank_until_idle(&mut out);
        Ok(self.finish(out))
    }

    pub fn get_channels(&self) -> Vec<ChannelResult> {
        self.store.get_channels().iter().map(Into::into).collect()
    }

    pub fn get_state(&self, channel_id: Hash) -> Result<ChannelResult, EngineError> {
        self.store
            .get_channel(&channel_id)
            .map(|entry| (&entry).into())
            .ok_or(EngineError::ChannelNotFound(channel_id))
    }

    pub fn get_objective(&self, id: &ObjectiveId) -> Result<Objective, EngineError> {
        self.store
            .get_objective(id)
            .ok_or_else(|| EngineError::ObjectiveNotFound(id.clone()))
    }

    pub fn get_objectives(&self) -> Vec<Objective> {
        self.store.objectives()
    }

    /// Re-cranks every non-terminal objective and re-sends what peers need
    /// to make progress on them. Safe to call any number of times.
    pub fn jump_start_objectives(&self) -> MultipleChannelOutput {
        let ids: Vec<_> = self
            .store
            .non_terminal_objectives()
            .into_iter()
            .map(|o| o.id)
            .collect();
        self.sync_objectives(&ids)
    }

    /// Re-sends our states, the objective and a request for the peers'
    /// states for each of `ids` that is not terminal yet.
    pub fn sync_objectives(&self, ids: &[ObjectiveId]) -> MultipleChannelOutput {
        let mut out = Output::default();
        self.crank_until_idle(&mut out);

        for id in ids {
            let objective = match self.store.get_objective(id) {
                Some(objective) if !objective.is_terminal() => objective,
                _ => continue,
            };
            let channel_id = objective.channel_id();
            let entry = match self.store.get_channel(&channel_id) {
                Some(entry) => entry,
                None => continue,
            };
            let recipients = others(entry.params(), &self.address());
            for signed in sync_states(&entry) {
                out.outbox.add_state(&recipients, signed);
            }
            out.outbox.add_objective(&recipients, objective.kind);
            out.outbox
                .add_request(&recipients, Request::GetChannel { channel_id });

            if let Some(FundingStrategy::Ledger { ledger_channel_id }) = entry.funding() {
                if let Some(ledger) = self.store.get_channel(&ledger_channel_id) {
                    for signed in sync_states(&ledger) {
                        out.outbox.add_state(&recipients, signed);
                    }
                }
            }
            debug!(objective = %id, waiting_for = ?objective.waiting_for, "syncing objective");
            out.touch(channel_id);
        }
        self.finish(out)
    }

    /// Cranks objectives and ledgers until neither makes progress.
    fn crank_until_idle(&self, out: &mut Output) {
        for _ in 0..MAX_CRANK_ROUNDS {
            let mut progressed = false;
            for objective in self.store.non_terminal_objectives() {
                progressed |= self.crank_objective(&objective.id, out);
            }
            for ledger_channel_id in self.store.ledgers_with_queued_requests() {
                progressed |= self.crank_ledger(ledger_channel_id, out);
            }
            if !progressed {
                return;
            }
        }
        warn!(rounds = MAX_CRANK_ROUNDS, "objectives kept changing, giving up for now");
    }

    fn crank_objective(&self, id: &ObjectiveId, out: &mut Output) -> bool {
        let objective = match self.store.get_objective(id) {
            Some(objective) if !objective.is_terminal() => objective,
            _ => return false,
        };
        let channel_id = objective.channel_id();
        let ledger_channel_id = match objective.kind {
            ObjectiveKind::OpenChannel {
                funding: FundingStrategy::Ledger { ledger_channel_id },
                ..
            } => Some(ledger_channel_id),
            _ => match self.store.get_channel(&channel_id).and_then(|e| e.funding()) {
                Some(FundingStrategy::Ledger { ledger_channel_id }) => Some(ledger_channel_id),
                _ => None,
            },
        };
        let mut locked = vec![channel_id];
        locked.extend(ledger_channel_id);
        let _guard = self.store.lock_channels(&locked);

        let channel = self.store.get_channel(&channel_id);
        let ledger = ledger_channel_id.and_then(|id| self.store.get_channel(&id));
        let ledger_requests = self.store.ledger_requests_for_channel(&channel_id);
        let chain_requests = self.store.chain_requests(&channel_id);
        let crank = protocols::crank(
            &objective,
            &CrankInput {
                channel: channel.as_ref(),
                ledger: ledger.as_ref(),
                ledger_requests: &ledger_requests,
                chain_requests: &chain_requests,
            },
        );

        let mut progressed = false;
        for action in crank.actions {
            progressed |= self.apply(channel_id, action, out);
        }
        if crank.objective != objective {
            self.record_objective(&objective, &crank.objective);
            out.touch(channel_id);
            progressed = true;
        }
        progressed
    }

    /// Stores an objective and reports status changes.
    fn record_objective(&self, before: &Objective, after: &Objective) {
        self.store.update_objective(after.clone());
        if before.status == after.status {
            return;
        }
        info!(
            objective = %after.id,
            from = ?before.status,
            to = ?after.status,
            waiting_for = ?after.waiting_for,
            "objective status changed"
        );
        match after.status {
            ObjectiveStatus::Started => self.emit(EngineEvent::ObjectiveStarted(after.id.clone())),
            ObjectiveStatus::Succeeded => {
                self.emit(EngineEvent::ObjectiveSucceeded(after.id.clone()))
            }
            ObjectiveStatus::Failed => {
                let reason = after.failure.unwrap_or(ObjectiveFailure::Rejected);
                warn!(objective = %after.id, %reason, "objective failed");
                self.emit(EngineEvent::ObjectiveFailed {
                    id: after.id.clone(),
                    reason,
                })
            }
            ObjectiveStatus::Queued | ObjectiveStatus::Approved => {}
        }
    }

    /// Applies one crank action. Returns whether anything changed.
    fn apply(&self, channel_id: Hash, action: Action, out: &mut Output) -> bool {
        match action {
            Action::SignState(state) => self.sign_and_send(state, out),
            Action::RegisterChannel {
                channel_id,
                asset_holders,
            } => self.submit(
                ChainRequest::Register {
                    channel_id,
                    asset_holders: asset_holders.clone(),
                },
                || self.chain.register_channel(channel_id, &asset_holders),
            ),
            Action::Deposit(deposit) => self.submit(ChainRequest::Deposit(deposit), || {
                self.chain.fund_channel(&deposit)
            }),
            Action::ConcludeAndWithdraw(last) => self.submit(
                ChainRequest::ConcludeAndWithdraw {
                    channel_id,
                    turn_num: last.turn_num(),
                },
                || match self.chain.conclude_and_withdraw(&last) {
                    // Somebody else was faster, the funds are out either way.
                    Err(ChainError::AlreadyConcluded(_)) => Ok(()),
                    result => result,
                },
            ),
            Action::RequestLedgerFunding {
                ledger_channel_id,
                amounts,
            } => {
                self.store.queue_ledger_request(
                    channel_id,
                    ledger_channel_id,
                    LedgerRequestKind::Fund,
                    amounts,
                );
                out.touch(ledger_channel_id);
                true
            }
            Action::RequestLedgerDefunding {
                ledger_channel_id,
                amounts,
            } => {
                self.store.queue_ledger_request(
                    channel_id,
                    ledger_channel_id,
                    LedgerRequestKind::Defund,
                    amounts,
                );
                out.touch(ledger_channel_id);
                true
            }
        }
    }

    fn sign_and_send(&self, state: State, out: &mut Output) -> bool {
        let channel_id = state.channel_id();
        let recipients = others(&state.params, &self.address());
        match self
            .store
            .sign_state(&self.signer, state, self.config.validator.as_ref())
        {
            Ok(signed) => {
                debug!(channel = %channel_id, turn_num = signed.turn_num(), "signed state");
                out.outbox.add_state(&recipients, &signed);
                out.touch(channel_id);
                true
            }
            Err(err) => {
                warn!(%err, "could not sign state");
                false
            }
        }
    }

    /// Submits a chain request unless it was submitted before.
    fn submit(
        &self,
        request: ChainRequest,
        send: impl FnOnce() -> Result<(), ChainError>,
    ) -> bool {
        let channel_id = request.channel_id();
        if self.store.chain_requests(&channel_id).contains(&request) {
            return false;
        }
        match send() {
            Ok(()) => {
                debug!(channel = %channel_id, ?request, "submitted chain request");
                self.store.record_chain_request(request)
            }
            Err(err) => {
                warn!(channel = %channel_id, %err, "chain request failed");
                false
            }
        }
    }

    fn crank_ledger(&self, ledger_channel_id: Hash, out: &mut Output) -> bool {
        let _guard = self.store.lock_channels(&[ledger_channel_id]);
        let entry = match self.store.get_channel(&ledger_channel_id) {
            Some(entry) => entry,
            None => return false,
        };
        let requests = self.store.ledger_requests(&ledger_channel_id);
        let crank = ledger::crank_ledger(&entry, &requests);
        if crank.is_empty() {
            return false;
        }

        let settled = !crank.approved.is_empty() || !crank.rejected.is_empty();
        if settled {
            info!(
                ledger = %ledger_channel_id,
                approved = ?crank.approved,
                rejected = ?crank.rejected,
                "settled ledger requests"
            );
            self.store
                .settle_ledger_requests(&crank.approved, &crank.rejected);
            out.touch(ledger_channel_id);
        }
        let signed = match crank.sign {
            Some(state) => self.sign_and_send(state, out),
            None => false,
        };
        settled || signed
    }

    fn finish(&self, out: Output) -> MultipleChannelOutput {
        let channel_results: Vec<ChannelResult> = out
            .channels
            .iter()
            .filter_map(|id| self.store.get_channel(id))
            .map(|entry| ChannelResult::from(&entry))
            .collect();
        for result in &channel_results {
            self.emit(EngineEvent::ChannelUpdated(result.clone()));
        }
        MultipleChannelOutput {
            channel_results,
            outbox: out.outbox.into_messages(self.address()),
            new_objectives: out.new_objectives,
            rejected: out.rejected,
        }
    }
}

/// States a peer needs to catch up: the supported one and everything
/// proposed on top of it.
fn sync_states(entry: &ChannelEntry) -> Vec<&SignedState> {
    match entry.supported() {
        Some(supported) => std::iter::once(supported).chain(entry.pending()).collect(),
        None => entry.states().collect(),
    }
}

#[cfg(test)]
mod tests;
