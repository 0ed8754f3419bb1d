//! Carving the funds of a ledger channel into application channels.
//!
//! A ledger outcome lists, per asset, one item per ledger participant (the
//! unallocated "slack", present even at zero) followed by one item per
//! funded application channel, sorted by channel id. Requests are turned
//! into a new outcome in batches, so many application channels are funded
//! (or released) with a single ledger turn.

use crate::{
    channel::{AllocationItem, ChannelEntry, ChannelStatus, Outcome, PartIdx, State},
    types::{Address, Destination, Hash, U256},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub type LedgerRequestId = u64;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LedgerRequestKind {
    /// Move funds from the participants' slack to the application channel.
    Fund,
    /// Return the funds of a closed application channel to the slack.
    Defund,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LedgerRequestStatus {
    Queued,
    Approved,
    Rejected,
}

/// Why a request can not be applied to a ledger outcome.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub enum LedgerRejection {
    #[error("insufficient ledger funds")]
    InsufficientLedgerFunds,
    #[error("ledger does not hold asset {0}")]
    UnknownAsset(Address),
    #[error("{0} is not a ledger participant")]
    UnknownDestination(Destination),
    #[error("requested amount does not match the ledger allocation")]
    AmountMismatch,
    #[error("ledger channel is closing or closed")]
    LedgerClosed,
    #[error("allocated amounts overflow")]
    AmountOverflow,
}

/// Links an application channel to the ledger channel funding it.
///
/// Queued until the ledger's consensus outcome either reflects it
/// (approved) or can no longer satisfy it (rejected). Consumed requests
/// never change again.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRequest {
    pub id: LedgerRequestId,
    pub channel_id: Hash,
    pub ledger_channel_id: Hash,
    pub kind: LedgerRequestKind,
    /// Fund: the application's initial outcome, i.e. how much each ledger
    /// participant contributes. Defund: the final outcome, i.e. how much
    /// each participant gets back.
    pub amounts: Outcome,
    pub status: LedgerRequestStatus,
    pub rejection: Option<LedgerRejection>,
}

impl LedgerRequest {
    pub fn is_queued(&self) -> bool {
        self.status == LedgerRequestStatus::Queued
    }

    fn target(&self) -> Destination {
        self.channel_id.into()
    }
}

/// Result of allocating a batch of requests on top of a ledger outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub outcome: Outcome,
    /// Requests reflected in `outcome`.
    pub included: Vec<LedgerRequestId>,
    /// Requests that fit on their own but not together with the included
    /// ones. They stay queued for the next batch.
    pub deferred: Vec<LedgerRequestId>,
    /// Requests that can not be satisfied by the current outcome at all.
    pub rejected: Vec<(LedgerRequestId, LedgerRejection)>,
}

/// Slack destinations of a ledger, in participant order.
pub fn slack_destinations(ledger: &State) -> Vec<Destination> {
    ledger
        .params
        .participants
        .iter()
        .map(|p| p.destination)
        .collect()
}

/// Applies a single request to `outcome`.
pub fn apply(
    outcome: &Outcome,
    slack: &[Destination],
    request: &LedgerRequest,
) -> Result<Outcome, LedgerRejection> {
    let mut result = outcome.clone();
    let target = request.target();

    for requested in &request.amounts.0 {
        let total = requested.total().ok_or(LedgerRejection::AmountOverflow)?;
        let asset = result
            .0
            .iter_mut()
            .find(|a| a.asset_holder == requested.asset_holder)
            .ok_or(LedgerRejection::UnknownAsset(requested.asset_holder))?;
        let existing = asset
            .allocation
            .iter()
            .position(|item| item.destination == target);

        match request.kind {
            LedgerRequestKind::Fund => {
                if let Some(pos) = existing {
                    // Already funded, e.g. a replayed request.
                    if asset.allocation[pos].amount != total {
                        return Err(LedgerRejection::AmountMismatch);
                    }
                    continue;
                }
                for item in &requested.allocation {
                    if !slack.contains(&item.destination) {
                        return Err(LedgerRejection::UnknownDestination(item.destination));
                    }
                    let slot = asset
                        .allocation
                        .iter_mut()
                        .find(|i| i.destination == item.destination)
                        .ok_or(LedgerRejection::UnknownDestination(item.destination))?;
                    if slot.amount < item.amount {
                        return Err(LedgerRejection::InsufficientLedgerFunds);
                    }
                    slot.amount -= item.amount;
                }
                asset.allocation.push(AllocationItem {
                    destination: target,
                    amount: total,
                });
            }
            LedgerRequestKind::Defund => {
                let pos = match existing {
                    Some(pos) => pos,
                    // Already released.
                    None => continue,
                };
                if asset.allocation[pos].amount != total {
                    return Err(LedgerRejection::AmountMismatch);
                }
                asset.allocation.remove(pos);
                for item in &requested.allocation {
                    let slot = asset
                        .allocation
                        .iter_mut()
                        .find(|i| i.destination == item.destination && slack.contains(&i.destination))
                        .ok_or(LedgerRejection::UnknownDestination(item.destination))?;
                    slot.amount = slot
                        .amount
                        .checked_add(item.amount)
                        .ok_or(LedgerRejection::AmountOverflow)?;
                }
            }
        }
    }

    canonicalize(&mut result, slack);
    Ok(result)
}

/// Participant items first (in participant order), then application items
/// sorted by channel id. Both sides of a ledger therefore compute the same
/// outcome for the same set of requests, whatever order they arrived in.
fn canonicalize(outcome: &mut Outcome, slack: &[Destination]) {
    for asset in &mut outcome.0 {
        asset.allocation.sort_by_key(|item| {
            let rank = slack
                .iter()
                .position(|d| d == &item.destination)
                .unwrap_or(slack.len());
            (rank, item.destination)
        });
    }
}

/// Whether the ledger outcome already reflects the request.
pub fn is_reflected(outcome: &Outcome, request: &LedgerRequest) -> bool {
    let target = request.target();
    request.amounts.0.iter().all(|requested| {
        let held = outcome
            .asset(&requested.asset_holder)
            .and_then(|a| a.amount_for(&target));
        match request.kind {
            LedgerRequestKind::Fund => held.is_some() && held == requested.total(),
            LedgerRequestKind::Defund => held.is_none(),
        }
    })
}

/// Whether funding `channel_id` with `amounts` could be applied to the
/// ledger outcome right now.
pub fn fits(ledger: &State, channel_id: Hash, amounts: &Outcome) -> bool {
    let probe = LedgerRequest {
        id: 0,
        channel_id,
        ledger_channel_id: ledger.channel_id(),
        kind: LedgerRequestKind::Fund,
        amounts: amounts.clone(),
        status: LedgerRequestStatus::Queued,
        rejection: None,
    };
    apply(&ledger.outcome, &slack_destinations(ledger), &probe).is_ok()
}

/// Allocates queued requests, in submission order, on top of `ledger`.
pub fn allocate_batch(ledger: &State, requests: &[&LedgerRequest]) -> Batch {
    let slack = slack_destinations(ledger);
    let mut batch = Batch {
        outcome: ledger.outcome.clone(),
        included: Vec::new(),
        deferred: Vec::new(),
        rejected: Vec::new(),
    };

    let mut ordered: Vec<&LedgerRequest> = requests.iter().copied().filter(|r| r.is_queued()).collect();
    ordered.sort_by_key(|r| r.id);

    for request in ordered {
        if let Err(rejection) = apply(&ledger.outcome, &slack, request) {
            trace!(request = request.id, %rejection, "ledger request does not fit");
            batch.rejected.push((request.id, rejection));
            continue;
        }
        match apply(&batch.outcome, &slack, request) {
            Ok(outcome) => {
                batch.outcome = outcome;
                batch.included.push(request.id);
            }
            Err(_) => batch.deferred.push(request.id),
        }
    }

    debug_assert_eq!(batch.outcome.totals(), ledger.outcome.totals());
    batch
}

/// Why we do not countersign a ledger proposal (yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProposalRejection {
    #[error("proposal changes more than the allocation")]
    NotAnAllocationUpdate,
    #[error("no queued request for {0}")]
    UnknownRequest(Destination),
    #[error("request cannot be applied: {0}")]
    Invalid(LedgerRejection),
    #[error("proposal does not match the requested changes")]
    OutcomeMismatch,
}

/// Checks a ledger proposal against the requests we know about.
///
/// Every changed application item has to be backed by one of our queued
/// requests, and applying exactly those requests to the supported state has
/// to give the proposed outcome. Returns the ids of the matched requests.
pub fn check_proposal(
    supported: &State,
    proposal: &State,
    queued: &[&LedgerRequest],
) -> Result<Vec<LedgerRequestId>, ProposalRejection> {
    if proposal.is_final
        || proposal.params != supported.params
        || proposal.app_data != supported.app_data
        || proposal.outcome.asset_holders() != supported.outcome.asset_holders()
    {
        return Err(ProposalRejection::NotAnAllocationUpdate);
    }

    let slack = slack_destinations(supported);
    let mut changed: Vec<Destination> = Vec::new();
    for (before, after) in supported.outcome.0.iter().zip(&proposal.outcome.0) {
        let targets = before
            .allocation
            .iter()
            .chain(&after.allocation)
            .map(|item| item.destination)
            .filter(|d| !slack.contains(d));
        for target in targets {
            if before.amount_for(&target) != after.amount_for(&target) && !changed.contains(&target)
            {
                changed.push(target);
            }
        }
    }

    let mut outcome = supported.outcome.clone();
    let mut matched = Vec::new();
    for target in changed {
        let request = queued
            .iter()
            .filter(|r| r.is_queued() && r.target() == target)
            .min_by_key(|r| r.id)
            .ok_or(ProposalRejection::UnknownRequest(target))?;
        outcome = apply(&outcome, &slack, request).map_err(ProposalRejection::Invalid)?;
        matched.push(request.id);
    }

    if outcome != proposal.outcome {
        return Err(ProposalRejection::OutcomeMismatch);
    }
    Ok(matched)
}

/// What the ledger manager wants to do after looking at a ledger channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerCrank {
    /// A state to sign: our own proposal or a countersignature.
    pub sign: Option<State>,
    pub approved: Vec<LedgerRequestId>,
    pub rejected: Vec<(LedgerRequestId, LedgerRejection)>,
}

impl LedgerCrank {
    pub fn is_empty(&self) -> bool {
        self.sign.is_none() && self.approved.is_empty() && self.rejected.is_empty()
    }
}

/// Decides the next step for one ledger channel. Pure, the caller applies
/// the result to the store.
///
/// Requests reflected by the supported outcome are approved. If a proposal
/// is in flight we either wait for its countersignatures (ours) or
/// countersign it when our queued requests back it (theirs). Otherwise the
/// remaining requests are batched into a proposal for the next turn.
pub fn crank_ledger(ledger: &ChannelEntry, requests: &[LedgerRequest]) -> LedgerCrank {
    let mut result = LedgerCrank::default();
    let mut queued: Vec<&LedgerRequest> = requests.iter().filter(|r| r.is_queued()).collect();
    if queued.is_empty() {
        return result;
    }

    match ledger.status() {
        ChannelStatus::Running => {}
        ChannelStatus::Closing | ChannelStatus::Closed => {
            // Releasing is still possible while the ledger closes, funding
            // is not.
            result.rejected = queued
                .iter()
                .filter(|r| r.kind == LedgerRequestKind::Fund)
                .map(|r| (r.id, LedgerRejection::LedgerClosed))
                .collect();
            return result;
        }
        ChannelStatus::Proposed | ChannelStatus::Opening => return result,
    }
    let supported = match ledger.supported() {
        Some(s) => s.state(),
        None => return result,
    };

    queued.retain(|r| {
        if is_reflected(&supported.outcome, r) {
            result.approved.push(r.id);
            false
        } else {
            true
        }
    });

    let me: PartIdx = ledger.my_index();
    if let Some(pending) = ledger.pending().find(|s| !s.state().is_final) {
        if !pending.is_signed_by(me) {
            match check_proposal(supported, pending.state(), &queued) {
                Ok(ids) => {
                    debug!(ledger = %ledger.channel_id(), turn = pending.turn_num(), requests = ?ids, "countersigning ledger proposal");
                    result.sign = Some(pending.state().clone());
                }
                Err(reason) => {
                    debug!(ledger = %ledger.channel_id(), turn = pending.turn_num(), %reason, "not countersigning ledger proposal yet");
                }
            }
        }
        return result;
    }

    let batch = allocate_batch(supported, &queued);
    result.rejected = batch.rejected;
    if !batch.included.is_empty() && batch.outcome != supported.outcome {
        let mut next = supported.make_next_state();
        next.outcome = batch.outcome;
        debug!(
            ledger = %ledger.channel_id(),
            turn = next.turn_num(),
            included = ?batch.included,
            deferred = ?batch.deferred,
            "proposing ledger update"
        );
        result.sign = Some(next);
    }
    result
}

/// Sum of all slack items of a ledger outcome for one asset, `None` on
/// overflow.
pub fn slack_total(ledger: &State, asset_holder: &Address) -> Option<U256> {
    let slack = slack_destinations(ledger);
    match ledger.outcome.asset(asset_holder) {
        Some(asset) => asset
            .allocation
            .iter()
            .filter(|i| slack.contains(&i.destination))
            .try_fold(U256::zero(), |acc, i| acc.checked_add(i.amount)),
        None => Some(U256::zero()),
    }
}

#[cfg(test)]
mod tests;
