use super::*;
use crate::{
    channel::{ChannelEntry, ConservingValidator, Outcome, SignedState},
    sig::Signer,
    testing::*,
    types::Hash,
};

fn ledger_state(amounts: &[u64]) -> State {
    let (a, b) = (alice(), bob());
    State::new(params(&[&a, &b], 7, Address::default()), split(&[&a, &b], amounts), vec![])
        .with_turn_num(3)
}

fn request(id: LedgerRequestId, kind: LedgerRequestKind, amounts: &[u64]) -> LedgerRequest {
    let (a, b) = (alice(), bob());
    LedgerRequest {
        id,
        channel_id: Hash([id as u8 + 1; 32]),
        ledger_channel_id: ledger_state(&[0, 0]).channel_id(),
        kind,
        amounts: split(&[&a, &b], amounts),
        status: LedgerRequestStatus::Queued,
        rejection: None,
    }
}

fn app_items(outcome: &Outcome) -> Vec<(Destination, U256)> {
    outcome.0[0]
        .allocation
        .iter()
        .skip(2)
        .map(|i| (i.destination, i.amount))
        .collect()
}

#[test]
fn batch_funds_every_request_that_fits() {
    let ledger = ledger_state(&[10, 10]);
    let requests: Vec<_> = (0..4)
        .map(|id| request(id, LedgerRequestKind::Fund, &[1, 1]))
        .collect();
    let refs: Vec<_> = requests.iter().collect();

    let batch = allocate_batch(&ledger, &refs);
    assert_eq!(batch.included, vec![0, 1, 2, 3]);
    assert!(batch.deferred.is_empty() && batch.rejected.is_empty());

    let asset = &batch.outcome.0[0];
    assert_eq!(asset.allocation[0].amount, U256::from(6));
    assert_eq!(asset.allocation[1].amount, U256::from(6));
    assert_eq!(app_items(&batch.outcome).len(), 4);
    assert!(app_items(&batch.outcome)
        .iter()
        .all(|(_, amount)| *amount == U256::from(2)));
    assert_eq!(batch.outcome.totals(), ledger.outcome.totals());
}

#[test]
fn batch_defers_what_only_fits_alone_and_rejects_the_rest() {
    let ledger = ledger_state(&[2, 2]);
    let requests: Vec<_> = (0..4)
        .map(|id| request(id, LedgerRequestKind::Fund, &[1, 1]))
        .chain(Some(request(4, LedgerRequestKind::Fund, &[3, 0])))
        .collect();
    let refs: Vec<_> = requests.iter().collect();

    let batch = allocate_batch(&ledger, &refs);
    assert_eq!(batch.included, vec![0, 1]);
    assert_eq!(batch.deferred, vec![2, 3]);
    assert_eq!(
        batch.rejected,
        vec![(4, LedgerRejection::InsufficientLedgerFunds)]
    );
    assert_eq!(slack_total(&ledger.with_turn_num(4), &ASSET), Some(U256::from(4)));
}

#[test]
fn app_items_are_sorted_whatever_the_request_order() {
    let ledger = ledger_state(&[5, 5]);
    let r0 = request(0, LedgerRequestKind::Fund, &[1, 0]);
    let r1 = request(1, LedgerRequestKind::Fund, &[0, 1]);

    let forward = allocate_batch(&ledger, &[&r1, &r0]);
    let mut swapped = (r0.clone(), r1.clone());
    swapped.0.id = 1;
    swapped.1.id = 0;
    let backward = allocate_batch(&ledger, &[&swapped.0, &swapped.1]);

    assert_eq!(forward.outcome, backward.outcome);
    let items = app_items(&forward.outcome);
    assert!(items[0].0 < items[1].0);
}

#[test]
fn defunding_returns_funds_to_slack() {
    let ledger = ledger_state(&[10, 10]);
    let fund = request(0, LedgerRequestKind::Fund, &[3, 1]);
    let mut funded = ledger.clone();
    funded.outcome = allocate_batch(&ledger, &[&fund]).outcome;
    assert!(is_reflected(&funded.outcome, &fund));

    // The app ended with bob owning everything.
    let defund = request(0, LedgerRequestKind::Defund, &[0, 4]);
    assert!(!is_reflected(&funded.outcome, &defund));
    let batch = allocate_batch(&funded, &[&defund]);
    assert_eq!(batch.included, vec![0]);
    assert!(app_items(&batch.outcome).is_empty());
    assert_eq!(batch.outcome.0[0].allocation[0].amount, U256::from(7));
    assert_eq!(batch.outcome.0[0].allocation[1].amount, U256::from(13));

    let wrong_total = request(0, LedgerRequestKind::Defund, &[1, 1]);
    assert_eq!(
        apply(&funded.outcome, &slack_destinations(&funded), &wrong_total),
        Err(LedgerRejection::AmountMismatch)
    );
}

#[test]
fn overflowing_requests_are_rejected() {
    let ledger = ledger_state(&[10, 10]);
    let mut huge = request(0, LedgerRequestKind::Fund, &[1, 1]);
    huge.amounts.0[0].allocation[0].amount = U256::MAX;
    assert_eq!(
        apply(&ledger.outcome, &slack_destinations(&ledger), &huge),
        Err(LedgerRejection::AmountOverflow)
    );
    assert!(!is_reflected(&ledger.outcome, &huge));

    let batch = allocate_batch(&ledger, &[&huge]);
    assert_eq!(batch.rejected, vec![(0, LedgerRejection::AmountOverflow)]);
    assert_eq!(batch.outcome, ledger.outcome);
}

#[test]
fn unknown_assets_and_destinations_are_rejected() {
    let ledger = ledger_state(&[10, 10]);
    let slack = slack_destinations(&ledger);

    let mut other_asset = request(0, LedgerRequestKind::Fund, &[1, 1]);
    other_asset.amounts.0[0].asset_holder = Address([1; 20]);
    assert_eq!(
        apply(&ledger.outcome, &slack, &other_asset),
        Err(LedgerRejection::UnknownAsset(Address([1; 20])))
    );

    let stranger = Destination::from(signer(9).address());
    let mut foreign = request(0, LedgerRequestKind::Fund, &[1, 1]);
    foreign.amounts = outcome(&[(stranger, 1)]);
    assert_eq!(
        apply(&ledger.outcome, &slack, &foreign),
        Err(LedgerRejection::UnknownDestination(stranger))
    );
}

#[test]
fn proposals_are_checked_against_known_requests() {
    let supported = ledger_state(&[10, 10]);
    let r0 = request(0, LedgerRequestKind::Fund, &[1, 1]);
    let r1 = request(1, LedgerRequestKind::Fund, &[2, 2]);

    let mut proposal = supported.make_next_state();
    proposal.outcome = allocate_batch(&supported, &[&r0, &r1]).outcome;

    assert_eq!(
        check_proposal(&supported, &proposal, &[&r1, &r0]),
        Ok(vec![0, 1])
    );
    assert_eq!(
        check_proposal(&supported, &proposal, &[&r0]),
        Err(ProposalRejection::UnknownRequest(r1.channel_id.into()))
    );

    let mut skewed = r1.clone();
    skewed.amounts = split(&[&alice(), &bob()], &[3, 1]);
    assert_eq!(
        check_proposal(&supported, &proposal, &[&r0, &skewed]),
        Err(ProposalRejection::OutcomeMismatch)
    );

    let mut closing = proposal.clone();
    closing.is_final = true;
    assert_eq!(
        check_proposal(&supported, &closing, &[&r0, &r1]),
        Err(ProposalRejection::NotAnAllocationUpdate)
    );
}

fn running_ledger(amounts: &[u64], me: &Signer) -> ChannelEntry {
    let (a, b) = (alice(), bob());
    let postfund = signed(&ledger_state(amounts), &[&a, &b]);
    let my_index = if me.address() == a.address() { 0 } else { 1 };
    let (entry, _) = ChannelEntry::from_first(my_index, postfund, &ConservingValidator).unwrap();
    entry
}

#[test]
fn crank_proposes_then_countersigns() {
    let (a, b) = (alice(), bob());
    let requests: Vec<_> = (0..2)
        .map(|id| request(id, LedgerRequestKind::Fund, &[1, 1]))
        .collect();

    let mut at_alice = running_ledger(&[10, 10], &a);
    let crank = crank_ledger(&at_alice, &requests);
    let proposal = crank.sign.expect("alice proposes");
    assert_eq!(proposal.turn_num(), 4);

    let mut from_alice = SignedState::new(proposal.clone());
    from_alice.sign(&a).unwrap();
    at_alice.ingest(from_alice.clone(), &ConservingValidator).unwrap();
    // Waiting for bob.
    assert!(crank_ledger(&at_alice, &requests).is_empty());

    let mut at_bob = running_ledger(&[10, 10], &b);
    at_bob.ingest(from_alice, &ConservingValidator).unwrap();
    let crank = crank_ledger(&at_bob, &requests);
    assert_eq!(crank.sign, Some(proposal.clone()));

    // Once supported, both requests are consumed.
    let both = signed(&proposal, &[&a, &b]);
    at_bob.ingest(both, &ConservingValidator).unwrap();
    let crank = crank_ledger(&at_bob, &requests);
    assert_eq!(crank.approved, vec![0, 1]);
    assert!(crank.sign.is_none());
}

#[test]
fn crank_waits_for_unknown_requests_before_countersigning() {
    let (a, b) = (alice(), bob());
    let r0 = request(0, LedgerRequestKind::Fund, &[1, 1]);
    let mut at_alice = running_ledger(&[10, 10], &a);
    let proposal = crank_ledger(&at_alice, &[r0.clone()]).sign.unwrap();
    at_alice
        .ingest(signed(&proposal, &[&a]), &ConservingValidator)
        .unwrap();

    let mut at_bob = running_ledger(&[10, 10], &b);
    at_bob
        .ingest(signed(&proposal, &[&a]), &ConservingValidator)
        .unwrap();
    assert!(crank_ledger(&at_bob, &[]).is_empty());
    assert_eq!(crank_ledger(&at_bob, &[r0]).sign, Some(proposal));
}

#[test]
fn closed_ledgers_reject_funding() {
    let (a, b) = (alice(), bob());
    let mut entry = running_ledger(&[10, 10], &a);
    let mut fin = entry.supported().unwrap().state().make_next_state();
    fin.is_final = true;
    entry
        .ingest(signed(&fin, &[&a, &b]), &ConservingValidator)
        .unwrap();

    let requests = vec![
        request(0, LedgerRequestKind::Fund, &[1, 1]),
        request(1, LedgerRequestKind::Defund, &[1, 1]),
    ];
    let crank = crank_ledger(&entry, &requests);
    assert_eq!(crank.rejected, vec![(0, LedgerRejection::LedgerClosed)]);
    assert!(crank.sign.is_none());
}
