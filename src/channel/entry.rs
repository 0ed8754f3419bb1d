use super::{
    check_conserving, is_valid_move, AppValidator, ChannelParams, ChannelStatus,
    FundingStrategy, InvalidTransition, PartIdx, SignedState, State,
};
use crate::types::{Address, Hash, U256};
use std::collections::BTreeMap;

/// Why a signed state was not merged into a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TurnRejection {
    #[error("state carries no signatures")]
    NoSignatures,
    #[error("channel parameters do not match")]
    ParamsMismatch,
    #[error("turn {turn_num} is older than the supported turn {supported}")]
    Stale { turn_num: u64, supported: u64 },
    #[error("conflicts with another state for the same turn")]
    Conflict,
    #[error("not signed by the participant whose turn it is")]
    OutOfTurn,
    #[error("channel already has a supported final state")]
    AfterFinal,
    #[error("setup states must not change the channel content")]
    SetupMismatch,
    #[error("allocated amounts overflow")]
    AmountOverflow,
    #[error("invalid transition: {0}")]
    Application(InvalidTransition),
}

/// What merging a state changed in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub channel_id: Hash,
    pub turn_num: u64,
    /// Participants whose signature on this state was not known before. Empty
    /// for duplicates.
    pub new_signers: Vec<PartIdx>,
    pub support_changed: bool,
}

impl Ingested {
    pub fn is_duplicate(&self) -> bool {
        self.new_signers.is_empty()
    }
}

/// Everything we know about one channel: the signed-state history, which
/// participant we are, and how it is funded.
///
/// The history holds at most one state per turn. A state is supported if
/// all participants signed it, or if it ends a run of `n` consecutive states
/// each signed by its mover and each a valid move from the one before.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    my_index: PartIdx,
    history: BTreeMap<u64, SignedState>,
    supported_turn: Option<u64>,
    funding: Option<FundingStrategy>,
    holdings: BTreeMap<Address, U256>,
}

impl ChannelEntry {
    pub(crate) fn new(my_index: PartIdx, first: SignedState) -> Self {
        let mut history = BTreeMap::new();
        history.insert(first.turn_num(), first);
        ChannelEntry {
            my_index,
            history,
            supported_turn: None,
            funding: None,
            holdings: BTreeMap::new(),
        }
    }

    /// Creates the entry for a channel we learn about through `first`.
    pub(crate) fn from_first(
        my_index: PartIdx,
        first: SignedState,
        validator: &dyn AppValidator,
    ) -> Result<(Self, Ingested), TurnRejection> {
        let params = &first.state().params;
        let turn_num = first.turn_num();
        if first.signatures().is_empty() {
            return Err(TurnRejection::NoSignatures);
        }
        if first.state().outcome.totals().is_none() {
            return Err(TurnRejection::AmountOverflow);
        }
        let free_turn = first.state().is_final
            || (turn_num >= params.first_running_turn() && !params.has_app());
        if !free_turn && !first.is_signed_by(params.mover(turn_num)) {
            return Err(TurnRejection::OutOfTurn);
        }

        let ingested = Ingested {
            channel_id: params.channel_id(),
            turn_num,
            new_signers: first.signers().collect(),
            support_changed: false,
        };
        let mut entry = ChannelEntry::new(my_index, first);
        entry.recompute_support(validator);
        let ingested = Ingested {
            support_changed: entry.supported_turn.is_some(),
            ..ingested
        };
        Ok((entry, ingested))
    }

    pub fn channel_id(&self) -> Hash {
        self.params().channel_id()
    }

    pub fn params(&self) -> &ChannelParams {
        &self.latest().state().params
    }

    pub fn my_index(&self) -> PartIdx {
        self.my_index
    }

    pub fn latest(&self) -> &SignedState {
        // The history is never empty, it starts with the first state seen.
        self.history
            .values()
            .next_back()
            .expect("channel history is never empty")
    }

    pub fn turn_num(&self) -> u64 {
        self.latest().turn_num()
    }

    pub fn supported(&self) -> Option<&SignedState> {
        self.supported_turn.and_then(|t| self.history.get(&t))
    }

    pub fn state_at(&self, turn_num: u64) -> Option<&SignedState> {
        self.history.get(&turn_num)
    }

    /// States above the supported one, i.e. proposals waiting for signatures.
    pub fn pending(&self) -> impl Iterator<Item = &SignedState> {
        let above = self.supported_turn.map(|t| t + 1).unwrap_or(0);
        self.history.range(above..).map(|(_, s)| s)
    }

    pub fn states(&self) -> impl Iterator<Item = &SignedState> {
        self.history.values()
    }

    pub fn signed_by_me(&self, turn_num: u64) -> bool {
        self.history
            .get(&turn_num)
            .map(|s| s.is_signed_by(self.my_index))
            .unwrap_or(false)
    }

    /// Whether everyone agreed on the initial state.
    pub fn prefund_complete(&self) -> bool {
        self.supported()
            .map(|s| s.turn_num() >= self.params().prefund_turn() || s.has_quorum())
            .unwrap_or(false)
    }

    pub fn postfund_complete(&self) -> bool {
        self.supported()
            .map(|s| s.turn_num() >= self.params().postfund_turn())
            .unwrap_or(false)
    }

    pub fn status(&self) -> ChannelStatus {
        if let Some(supported) = self.supported() {
            if supported.state().is_final {
                return ChannelStatus::Closed;
            }
        }
        if self.pending().any(|s| s.state().is_final) {
            ChannelStatus::Closing
        } else if self.postfund_complete() {
            ChannelStatus::Running
        } else if self.prefund_complete() {
            ChannelStatus::Opening
        } else {
            ChannelStatus::Proposed
        }
    }

    pub fn funding(&self) -> Option<FundingStrategy> {
        self.funding
    }

    pub(crate) fn set_funding(&mut self, funding: FundingStrategy) {
        self.funding = Some(funding);
    }

    /// On-chain holdings for an asset, as last reported by the chain.
    pub fn holdings(&self, asset_holder: &Address) -> U256 {
        self.holdings
            .get(asset_holder)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn set_holdings(&mut self, asset_holder: Address, amount: U256) {
        self.holdings.insert(asset_holder, amount);
    }

    /// Whether on-chain holdings cover the full allocation of every asset.
    pub fn directly_funded(&self) -> bool {
        let state = match self.supported() {
            Some(s) => s.state(),
            None => self.latest().state(),
        };
        state
            .outcome
            .0
            .iter()
            .all(|asset| match asset.total() {
                Some(total) => self.holdings(&asset.asset_holder) >= total,
                None => false,
            })
    }

    /// Validates `incoming` against the history and merges it.
    ///
    /// The entry is left untouched when an error is returned.
    pub(crate) fn ingest(
        &mut self,
        incoming: SignedState,
        validator: &dyn AppValidator,
    ) -> Result<Ingested, TurnRejection> {
        let turn_num = incoming.turn_num();
        let channel_id = self.channel_id();
        self.check_incoming(&incoming, validator)?;

        let new_signers = match self.history.get_mut(&turn_num) {
            Some(existing) if existing.hash() == incoming.hash() => existing.merge(&incoming),
            Some(existing) => {
                // Competing proposals for a turn nobody has supported yet: a
                // fully signed state always wins, otherwise the proposal
                // signed by the lowest participant index does.
                let wins = incoming.has_quorum()
                    || incoming.lowest_signer() < existing.lowest_signer();
                if !wins {
                    return Err(TurnRejection::Conflict);
                }
                let signers = incoming.signers().collect();
                *existing = incoming;
                signers
            }
            None => {
                let signers = incoming.signers().collect();
                self.history.insert(turn_num, incoming);
                signers
            }
        };

        let before = self.supported_turn;
        self.recompute_support(validator);
        self.prune();

        Ok(Ingested {
            channel_id,
            turn_num,
            new_signers,
            support_changed: before != self.supported_turn,
        })
    }

    fn check_incoming(
        &self,
        incoming: &SignedState,
        validator: &dyn AppValidator,
    ) -> Result<(), TurnRejection> {
        let state = incoming.state();
        let params = self.params();
        let turn_num = state.turn_num();

        if incoming.signatures().is_empty() {
            return Err(TurnRejection::NoSignatures);
        }
        if &state.params != params {
            return Err(TurnRejection::ParamsMismatch);
        }
        if state.outcome.totals().is_none() {
            return Err(TurnRejection::AmountOverflow);
        }

        let running = turn_num >= params.first_running_turn();
        // Anyone may propose final states and ledger updates, everything else
        // has to come from the participant whose turn it is.
        let free_turn = state.is_final || (running && !params.has_app());
        if !free_turn && !incoming.is_signed_by(params.mover(turn_num)) {
            return Err(TurnRejection::OutOfTurn);
        }

        if let Some(supported) = self.supported() {
            if turn_num < supported.turn_num()
                || (turn_num == supported.turn_num() && supported.hash() != incoming.hash())
            {
                return Err(TurnRejection::Stale {
                    turn_num,
                    supported: supported.turn_num(),
                });
            }
            if supported.state().is_final && turn_num > supported.turn_num() {
                return Err(TurnRejection::AfterFinal);
            }
        }

        if let Some(existing) = self.history.get(&turn_num) {
            if existing.hash() == incoming.hash() {
                // Only new signatures, the state was checked when it first
                // came in.
                return Ok(());
            }
        }

        if !running {
            if !self.latest().state().same_content(state) {
                return Err(TurnRejection::SetupMismatch);
            }
            return Ok(());
        }

        let previous = self
            .history
            .get(&(turn_num - 1))
            .or_else(|| self.supported());
        if let Some(previous) = previous {
            let checked = if params.has_app()
                && !state.is_final
                && previous.turn_num() + 1 == turn_num
                && previous.turn_num() >= params.postfund_turn()
            {
                validator.validate_transition(previous.state(), state)
            } else {
                check_conserving(previous.state(), state)
            };
            checked.map_err(TurnRejection::Application)?;
        }
        Ok(())
    }

    fn recompute_support(&mut self, validator: &dyn AppValidator) {
        let n = self.params().num_participants() as u64;
        self.supported_turn = self
            .history
            .iter()
            .rev()
            .find(|(turn, signed)| {
                if signed.has_quorum() {
                    return true;
                }
                if signed.state().is_final || **turn + 1 < n {
                    return false;
                }
                self.supported_by_moves(**turn + 1 - n, **turn, validator)
            })
            .map(|(turn, _)| *turn);
    }

    /// Whether the turns `first..=last` are all present, each signed by its
    /// mover and each a valid move from the previous one.
    fn supported_by_moves(&self, first: u64, last: u64, validator: &dyn AppValidator) -> bool {
        let mut previous: Option<&State> = None;
        for turn in first..=last {
            let signed = match self.history.get(&turn) {
                Some(s) => s,
                None => return false,
            };
            if !signed.is_signed_by(signed.state().params.mover(turn)) {
                return false;
            }
            if let Some(previous) = previous {
                if !is_valid_move(previous, signed.state(), validator) {
                    return false;
                }
            }
            previous = Some(signed.state());
        }
        true
    }

    /// Drops everything no longer needed to prove support of the supported
    /// state.
    fn prune(&mut self) {
        if let Some(supported) = self.supported_turn {
            let n = self.params().num_participants() as u64;
            let keep_from = (supported + 1).saturating_sub(n);
            self.history = self.history.split_off(&keep_from);
        }
    }
}
