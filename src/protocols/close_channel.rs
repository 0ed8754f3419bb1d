use super::{Action, CrankInput, ObjectiveFailure, Step, WaitingFor};
use crate::{
    chain::ChainRequest,
    channel::{ChannelEntry, ChannelStatus, FundingStrategy},
    ledger::{self, LedgerRequestKind, LedgerRequestStatus},
    types::Destination,
};

/// Final state, quorum on it, then releasing the funds.
pub(super) fn crank(input: &CrankInput<'_>) -> (Step, Vec<Action>) {
    let mut actions = Vec::new();
    let channel = match input.channel {
        Some(channel) => channel,
        None => return (Step::Failed(ObjectiveFailure::ChannelNotFound), actions),
    };
    let me = channel.my_index();

    match channel.status() {
        ChannelStatus::Proposed | ChannelStatus::Opening => {
            (Step::Waiting(WaitingFor::TheirPostFund), actions)
        }
        ChannelStatus::Running => {
            let supported = match channel.supported() {
                Some(supported) => supported,
                None => return (Step::Waiting(WaitingFor::TheirPostFund), actions),
            };
            // Let proposals in flight settle first.
            if channel.pending().next().is_some() {
                return (Step::Waiting(WaitingFor::TheirFinalState), actions);
            }
            if funds_applications(channel) {
                return (Step::Waiting(WaitingFor::LedgerDefunding), actions);
            }
            let mut last = supported.state().make_next_state();
            last.is_final = true;
            actions.push(Action::SignState(last));
            (Step::Waiting(WaitingFor::TheirFinalState), actions)
        }
        ChannelStatus::Closing => {
            if let Some(last) = channel.pending().find(|s| s.state().is_final) {
                if !last.is_signed_by(me) {
                    actions.push(Action::SignState(last.state().clone()));
                }
            }
            (Step::Waiting(WaitingFor::TheirFinalState), actions)
        }
        ChannelStatus::Closed => release_funds(channel, input, actions),
    }
}

/// Whether `channel` is a ledger still holding items for application
/// channels.
fn funds_applications(channel: &ChannelEntry) -> bool {
    if channel.params().has_app() {
        return false;
    }
    let state = match channel.supported() {
        Some(supported) => supported.state(),
        None => return false,
    };
    let slack = ledger::slack_destinations(state);
    state
        .outcome
        .0
        .iter()
        .flat_map(|a| &a.allocation)
        .any(|item| !slack.contains(&item.destination))
}

fn release_funds(
    channel: &ChannelEntry,
    input: &CrankInput<'_>,
    mut actions: Vec<Action>,
) -> (Step, Vec<Action>) {
    let last = match channel.supported() {
        Some(last) => last,
        None => return (Step::Waiting(WaitingFor::TheirFinalState), actions),
    };

    match channel.funding() {
        Some(FundingStrategy::Ledger { ledger_channel_id }) => {
            let ledger = match input.ledger.and_then(|l| l.supported()) {
                Some(ledger) => ledger.state(),
                None => return (Step::Succeeded, actions),
            };
            let target = Destination::from(channel.channel_id());
            let still_funded = ledger
                .outcome
                .0
                .iter()
                .any(|a| a.amount_for(&target).is_some());
            if !still_funded {
                return (Step::Succeeded, actions);
            }

            let defunds: Vec<_> = input
                .ledger_requests
                .iter()
                .filter(|r| r.kind == LedgerRequestKind::Defund)
                .collect();
            if defunds
                .iter()
                .any(|r| r.status == LedgerRequestStatus::Rejected)
            {
                return (Step::Failed(ObjectiveFailure::LedgerDefundingRejected), actions);
            }
            if defunds.is_empty() {
                actions.push(Action::RequestLedgerDefunding {
                    ledger_channel_id,
                    amounts: last.state().outcome.clone(),
                });
            }
            (Step::Waiting(WaitingFor::LedgerDefunding), actions)
        }
        Some(FundingStrategy::Fake) => (Step::Succeeded, actions),
        Some(FundingStrategy::Direct) | None => {
            let concluded = input
                .chain_requests
                .iter()
                .any(|r| matches!(r, ChainRequest::ConcludeAndWithdraw { .. }));
            if !concluded {
                actions.push(Action::ConcludeAndWithdraw(last.clone()));
            }
            (Step::Succeeded, actions)
        }
    }
}
