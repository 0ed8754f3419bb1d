use super::{Action, CrankInput, ObjectiveFailure, Step, WaitingFor};
use crate::{
    chain::{ChainRequest, DepositRequest},
    channel::{ChannelEntry, ChannelStatus, FundingStrategy},
    ledger::{self, LedgerRequestKind, LedgerRequestStatus},
    types::{Destination, Hash},
};

/// Prefund round, funding, postfund round.
pub(super) fn crank(input: &CrankInput<'_>, funding: FundingStrategy) -> (Step, Vec<Action>) {
    let mut actions = Vec::new();
    let channel = match input.channel {
        Some(channel) => channel,
        None => return (Step::Failed(ObjectiveFailure::ChannelNotFound), actions),
    };

    if channel.status().is_closing_or_closed() {
        return (Step::Failed(ObjectiveFailure::ChannelClosed), actions);
    }
    if channel.postfund_complete() {
        return (Step::Succeeded, actions);
    }
    if let FundingStrategy::Ledger { .. } = funding {
        match input.ledger {
            None => return (Step::Failed(ObjectiveFailure::LedgerNotFound), actions),
            Some(ledger) if ledger.status().is_closing_or_closed() => {
                return (Step::Failed(ObjectiveFailure::LedgerClosed), actions)
            }
            Some(_) => {}
        }
    }

    let me = channel.my_index() as u64;
    let params = channel.params();
    if !channel.prefund_complete() {
        if !channel.signed_by_me(me) {
            let prefund = channel.latest().state().setup_state(me);
            actions.push(Action::SignState(prefund));
        }
        return (Step::Waiting(WaitingFor::TheirPreFund), actions);
    }

    let funded = match funding {
        FundingStrategy::Fake => true,
        FundingStrategy::Direct => direct_funding(channel, input, &mut actions),
        FundingStrategy::Ledger { ledger_channel_id } => {
            ledger_funding(channel, ledger_channel_id, input, &mut actions)
        }
    };
    if !funded {
        return (Step::Waiting(WaitingFor::Funding), actions);
    }

    let postfund_turn = params.num_participants() as u64 + me;
    if !channel.signed_by_me(postfund_turn) {
        // Every setup state has the same content, any of them will do.
        let postfund = channel.latest().state().setup_state(postfund_turn);
        actions.push(Action::SignState(postfund));
    }
    (Step::Waiting(WaitingFor::TheirPostFund), actions)
}

/// Participants deposit in allocation order: we deposit once the channel
/// holds everything allocated before us, topping it up to include our own
/// allocation.
fn direct_funding(
    channel: &ChannelEntry,
    input: &CrankInput<'_>,
    actions: &mut Vec<Action>,
) -> bool {
    if channel.directly_funded() {
        return true;
    }
    let channel_id = channel.channel_id();
    let state = match channel.supported() {
        Some(supported) => supported.state(),
        None => return false,
    };

    let registered = input
        .chain_requests
        .iter()
        .any(|r| matches!(r, ChainRequest::Register { .. }));
    if !registered {
        actions.push(Action::RegisterChannel {
            channel_id,
            asset_holders: state.outcome.asset_holders(),
        });
    }

    let my_destination = channel.params().participants[channel.my_index()].destination;
    for asset in &state.outcome.0 {
        let (before, mine) = match (
            asset.amount_before(&my_destination),
            asset.amount_for(&my_destination),
        ) {
            (Some(before), Some(mine)) => (before, mine),
            _ => continue,
        };
        let held = channel.holdings(&asset.asset_holder);
        let target = match before.checked_add(mine) {
            Some(target) => target,
            None => continue,
        };
        if mine.is_zero() || held < before || held >= target {
            continue;
        }
        let requested = input.chain_requests.iter().any(|r| {
            matches!(r, ChainRequest::Deposit(d) if d.asset_holder == asset.asset_holder)
        });
        if requested {
            continue;
        }
        actions.push(Action::Deposit(DepositRequest {
            channel_id,
            asset_holder: asset.asset_holder,
            expected_held: held,
            amount: target - held,
        }));
    }
    false
}

/// The channel is funded once the ledger's supported outcome holds an item
/// for it with the channel's full total, for every asset.
fn ledger_funding(
    channel: &ChannelEntry,
    ledger_channel_id: Hash,
    input: &CrankInput<'_>,
    actions: &mut Vec<Action>,
) -> bool {
    let (ledger, initial) = match (input.ledger, channel.supported()) {
        (Some(ledger), Some(initial)) => (ledger, initial.state()),
        _ => return false,
    };
    let supported = match ledger.supported() {
        Some(supported) if ledger.status() == ChannelStatus::Running => supported.state(),
        _ => return false,
    };

    let target = Destination::from(channel.channel_id());
    let funded = initial.outcome.0.iter().all(|asset| {
        supported
            .outcome
            .asset(&asset.asset_holder)
            .and_then(|a| a.amount_for(&target))
            .zip(asset.total())
            .map_or(false, |(held, total)| held == total)
    });
    if funded {
        return true;
    }

    let mut requests = input
        .ledger_requests
        .iter()
        .filter(|r| r.kind == LedgerRequestKind::Fund)
        .peekable();
    let first = requests.peek().is_none();
    let in_flight = requests.any(|r| r.status != LedgerRequestStatus::Rejected);
    if in_flight {
        return false;
    }
    // After a rejection, only ask again once the ledger could satisfy us.
    if first || ledger::fits(supported, channel.channel_id(), &initial.outcome) {
        actions.push(Action::RequestLedgerFunding {
            ledger_channel_id,
            amounts: initial.outcome.clone(),
        });
    }
    false
}
