use super::*;
use crate::{
    chain::MemoryChain,
    channel::Participant,
    protocols::WaitingFor,
    testing::*,
    types::{Destination, U256},
};
use tokio::sync::broadcast::error::TryRecvError;

/// Two or more wallets sharing one in-memory chain. Messages are delivered
/// through their wire encoding.
struct Net {
    chain: Arc<MemoryChain>,
    deposits: broadcast::Receiver<DepositedEvent>,
    wallets: Vec<Wallet>,
}

impl Net {
    fn new(seeds: &[u8]) -> Self {
        init_tracing();
        let chain = Arc::new(MemoryChain::new());
        let deposits = chain.subscribe();
        let wallets = seeds
            .iter()
            .map(|seed| Wallet::new(signer(*seed), chain.clone(), EngineConfig::default()))
            .collect();
        Net {
            chain,
            deposits,
            wallets,
        }
    }

    fn alice(&self) -> &Wallet {
        &self.wallets[0]
    }

    fn bob(&self) -> &Wallet {
        &self.wallets[1]
    }

    fn participants(&self) -> Vec<Participant> {
        self.wallets
            .iter()
            .map(|w| Participant::new(w.address()))
            .collect()
    }

    fn split(&self, amounts: &[u64]) -> Outcome {
        let items: Vec<_> = self
            .wallets
            .iter()
            .zip(amounts)
            .map(|(w, amount)| (Destination::from(w.address()), *amount))
            .collect();
        outcome(&items)
    }

    fn wallet(&self, address: Address) -> &Wallet {
        self.wallets
            .iter()
            .find(|w| w.address() == address)
            .unwrap()
    }

    /// Delivers messages and chain events until everything is quiet.
    fn settle(&mut self, mut pending: Vec<Message>) {
        for _ in 0..200 {
            let mut next = Vec::new();
            for msg in pending.drain(..) {
                let frame = msg.encode().unwrap();
                let msg = Message::decode(&frame).unwrap();
                let out = self.wallet(msg.recipient).push_message(msg).unwrap();
                next.extend(out.outbox);
            }

            let mut events = Vec::new();
            loop {
                match self.deposits.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Empty) => break,
                    Err(err) => panic!("lost chain events: {err}"),
                }
            }
            if !events.is_empty() {
                for wallet in &self.wallets {
                    next.extend(wallet.update_funding_for_channels(&events).unwrap().outbox);
                }
            }

            // Deposits made while handling events show up next round.
            if next.is_empty() && events.is_empty() {
                return;
            }
            pending = next;
        }
        panic!("wallets kept talking");
    }

    /// Alice proposes, everyone else joins.
    fn open(&mut self, params: CreateChannelParams, count: usize) -> Vec<Hash> {
        let out = self.alice().create_channels(params, count).unwrap();
        let ids = out.channel_ids();
        self.settle(out.outbox);
        let mut joined = Vec::new();
        for wallet in &self.wallets[1..] {
            joined.extend(wallet.join_channels(&ids).unwrap().outbox);
        }
        self.settle(joined);
        ids
    }

    fn open_ledger(&mut self, amounts: &[u64]) -> Hash {
        let out = self
            .alice()
            .create_ledger_channel(self.participants(), self.split(amounts))
            .unwrap();
        let ledger_id = out.channel_ids()[0];
        self.settle(out.outbox);
        let joined = self.bob().join_channel(ledger_id).unwrap();
        self.settle(joined.outbox);
        ledger_id
    }

    fn app_params(&self, amounts: &[u64], funding: FundingStrategy) -> CreateChannelParams {
        CreateChannelParams {
            participants: self.participants(),
            outcome: self.split(amounts),
            app_definition: APP,
            app_data: vec![],
            funding,
        }
    }
}

fn objective_status(wallet: &Wallet, kind: ObjectiveKind) -> ObjectiveStatus {
    wallet.get_objective(&kind.id()).unwrap().status
}

#[test]
fn direct_funding_deposits_in_order_and_closes() {
    let mut net = Net::new(&[1, 2]);
    let ids = net.open(net.app_params(&[3, 2], FundingStrategy::Direct), 1);
    let channel_id = ids[0];

    for wallet in &net.wallets {
        let result = wallet.get_state(channel_id).unwrap();
        assert_eq!(result.status, ChannelStatus::Running);
        assert_eq!(result.turn_num, 3);
    }
    assert_eq!(net.chain.holdings(channel_id, ASSET), U256::from(5));
    let open = ObjectiveKind::OpenChannel {
        channel_id,
        funding: FundingStrategy::Direct,
    };
    assert_eq!(objective_status(net.alice(), open), ObjectiveStatus::Succeeded);
    assert_eq!(objective_status(net.bob(), open), ObjectiveStatus::Succeeded);

    let out = net.alice().close_channel(channel_id).unwrap();
    assert_eq!(out.new_objectives.len(), 1);
    net.settle(out.outbox);

    let close = ObjectiveKind::CloseChannel { channel_id };
    for wallet in &net.wallets {
        let result = wallet.get_state(channel_id).unwrap();
        assert_eq!(result.status, ChannelStatus::Closed);
        assert_eq!(result.turn_num, 4);
        assert_eq!(objective_status(wallet, close), ObjectiveStatus::Succeeded);
    }
    assert_eq!(net.chain.holdings(channel_id, ASSET), U256::zero());
}

#[test]
fn ledger_funds_a_batch_of_channels() {
    let mut net = Net::new(&[1, 2]);
    let ledger_id = net.open_ledger(&[10, 10]);
    assert_eq!(
        net.alice().get_state(ledger_id).unwrap().status,
        ChannelStatus::Running
    );

    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger_id,
    };
    let ids = net.open(net.app_params(&[1, 1], funding), 4);
    assert_eq!(ids.len(), 4);

    for wallet in &net.wallets {
        for id in &ids {
            assert_eq!(
                wallet.get_state(*id).unwrap().status,
                ChannelStatus::Running
            );
        }
        let ledger = wallet.store().get_channel(&ledger_id).unwrap();
        let supported = ledger.supported().unwrap().state();
        assert_eq!(ledger::slack_total(supported, &ASSET), Some(U256::from(12)));
        let asset = supported.outcome.asset(&ASSET).unwrap();
        assert_eq!(asset.allocation.len(), 2 + 4);
        for id in &ids {
            assert_eq!(
                asset.amount_for(&Destination::from(*id)),
                Some(U256::from(2))
            );
        }
        assert_eq!(asset.total(), Some(U256::from(20)));
    }
}

#[test]
fn concurrent_ledger_proposals_settle_on_both_sides() {
    let mut net = Net::new(&[1, 2]);
    let ledger_id = net.open_ledger(&[10, 10]);
    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger_id,
    };

    let by_alice = net
        .alice()
        .create_channel(net.app_params(&[1, 1], funding))
        .unwrap();
    let by_bob = net
        .bob()
        .create_channel(net.app_params(&[1, 1], funding))
        .unwrap();
    let ids = [by_alice.channel_ids()[0], by_bob.channel_ids()[0]];
    let mut proposals = by_alice.outbox;
    proposals.extend(by_bob.outbox);
    net.settle(proposals);

    // Each joins the other's channel, both ledger proposals cross.
    let mut joined = net.alice().join_channel(ids[1]).unwrap().outbox;
    joined.extend(net.bob().join_channel(ids[0]).unwrap().outbox);
    net.settle(joined);

    for wallet in &net.wallets {
        for id in &ids {
            assert_eq!(
                wallet.get_state(*id).unwrap().status,
                ChannelStatus::Running
            );
        }
        let ledger = wallet.store().get_channel(&ledger_id).unwrap();
        let supported = ledger.supported().unwrap();
        assert_eq!(supported.turn_num(), 5);
        assert_eq!(
            ledger::slack_total(supported.state(), &ASSET),
            Some(U256::from(16))
        );
    }
}

#[test]
fn overflowing_peer_states_are_rejected() {
    let mut net = Net::new(&[1, 2]);
    let ledger_id = net.open_ledger(&[10, 10]);
    let ledger = net.alice().store().get_channel(&ledger_id).unwrap();
    let mut update = ledger.supported().unwrap().state().make_next_state();
    update.outcome.0[0].allocation[0].amount = U256::MAX;
    let (a, b) = (alice(), bob());
    let msg = Message {
        sender: b.address(),
        recipient: a.address(),
        payload: Payload {
            signed_states: vec![(&signed(&update, &[&b])).into()],
            ..Payload::default()
        },
    };

    let out = net.alice().push_message(msg).unwrap();
    assert!(matches!(
        out.rejected.as_slice(),
        [IngestError::InvalidTurnTransition {
            reason: TurnRejection::AmountOverflow,
            ..
        }]
    ));
    assert_eq!(net.alice().get_state(ledger_id).unwrap().turn_num, 3);

    // The ledger keeps working.
    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger_id,
    };
    let ids = net.open(net.app_params(&[1, 1], funding), 1);
    assert_eq!(
        net.bob().get_state(ids[0]).unwrap().status,
        ChannelStatus::Running
    );
}

#[test]
fn ledger_only_funds_what_it_holds() {
    let mut net = Net::new(&[1, 2]);
    let ledger_id = net.open_ledger(&[2, 2]);
    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger_id,
    };
    let ids = net.open(net.app_params(&[1, 1], funding), 4);

    let statuses: Vec<_> = ids
        .iter()
        .map(|id| net.alice().get_state(*id).unwrap().status)
        .collect();
    let running = statuses
        .iter()
        .filter(|s| **s == ChannelStatus::Running)
        .count();
    let opening = statuses
        .iter()
        .filter(|s| **s == ChannelStatus::Opening)
        .count();
    assert_eq!((running, opening), (2, 2));

    let ledger = net.bob().store().get_channel(&ledger_id).unwrap();
    let supported = ledger.supported().unwrap().state();
    assert_eq!(supported.outcome.item_count(), 2 + 2);
    assert_eq!(ledger::slack_total(supported, &ASSET), Some(U256::zero()));

    // The unfunded ones keep waiting, they did not fail.
    for id in &ids {
        if net.alice().get_state(*id).unwrap().status == ChannelStatus::Opening {
            let open = ObjectiveKind::OpenChannel {
                channel_id: *id,
                funding,
            };
            let objective = net.alice().get_objective(&open.id()).unwrap();
            assert!(!objective.is_terminal());
            assert_eq!(objective.waiting_for, WaitingFor::Funding);
        }
    }
}

#[test]
fn closing_a_ledger_funded_channel_returns_funds_to_slack() {
    let mut net = Net::new(&[1, 2]);
    let ledger_id = net.open_ledger(&[10, 10]);
    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger_id,
    };
    let ids = net.open(net.app_params(&[3, 1], funding), 1);

    let out = net.bob().close_channel(ids[0]).unwrap();
    net.settle(out.outbox);

    for wallet in &net.wallets {
        assert_eq!(
            wallet.get_state(ids[0]).unwrap().status,
            ChannelStatus::Closed
        );
        let ledger = wallet.store().get_channel(&ledger_id).unwrap();
        let supported = ledger.supported().unwrap().state();
        let asset = supported.outcome.asset(&ASSET).unwrap();
        assert_eq!(asset.allocation.len(), 2);
        assert_eq!(asset.allocation[0].amount, U256::from(10));
        assert_eq!(asset.allocation[1].amount, U256::from(10));
        let close = ObjectiveKind::CloseChannel { channel_id: ids[0] };
        assert_eq!(objective_status(wallet, close), ObjectiveStatus::Succeeded);
    }
}

#[test]
fn closing_twice_returns_the_existing_objective() {
    let mut net = Net::new(&[1, 2]);
    let ids = net.open(net.app_params(&[3, 2], FundingStrategy::Fake), 1);

    let first = net.alice().close_channel(ids[0]).unwrap();
    let again = net.alice().close_channel(ids[0]).unwrap();
    assert_eq!(first.new_objectives.len(), 1);
    assert!(again.new_objectives.is_empty());
    net.settle(first.outbox);
    net.settle(again.outbox);

    let after = net.alice().close_channel(ids[0]).unwrap();
    assert!(after.new_objectives.is_empty());
    assert_eq!(after.channel_results[0].status, ChannelStatus::Closed);
}

#[test]
fn channels_must_be_running_to_close_or_update() {
    let net = Net::new(&[1, 2]);
    let out = net
        .alice()
        .create_channel(net.app_params(&[3, 2], FundingStrategy::Fake))
        .unwrap();
    let channel_id = out.channel_ids()[0];

    assert_eq!(
        net.alice().close_channel(channel_id),
        Err(EngineError::ChannelNotRunning(channel_id))
    );
    assert_eq!(
        net.alice()
            .update_channel(channel_id, net.split(&[2, 3]), vec![]),
        Err(EngineError::ChannelNotRunning(channel_id))
    );
    let unknown = Hash([9; 32]);
    assert_eq!(
        net.alice().close_channel(unknown),
        Err(EngineError::ChannelNotFound(unknown))
    );
}

#[test]
fn closing_several_channels_checks_all_of_them_first() {
    let mut net = Net::new(&[1, 2]);
    let running = net.open(net.app_params(&[3, 2], FundingStrategy::Fake), 1)[0];
    let proposed = net
        .alice()
        .create_channel(net.app_params(&[3, 2], FundingStrategy::Fake))
        .unwrap()
        .channel_ids()[0];

    assert_eq!(
        net.alice().close_channels(&[running, proposed]),
        Err(EngineError::ChannelNotRunning(proposed))
    );
    let close = ObjectiveKind::CloseChannel {
        channel_id: running,
    };
    assert!(net.alice().get_objective(&close.id()).is_err());

    let out = net.alice().close_channels(&[running]).unwrap();
    assert_eq!(out.new_objectives.len(), 1);
    net.settle(out.outbox);
    assert_eq!(
        net.bob().get_state(running).unwrap().status,
        ChannelStatus::Closed
    );
}

#[test]
fn updates_follow_the_turn_order() {
    let mut net = Net::new(&[1, 2]);
    let ids = net.open(net.app_params(&[3, 2], FundingStrategy::Fake), 1);
    let channel_id = ids[0];

    // Turn 4 belongs to alice.
    assert_eq!(
        net.bob().update_channel(channel_id, net.split(&[2, 3]), vec![]),
        Err(EngineError::NotMyTurn(channel_id))
    );
    let out = net
        .alice()
        .update_channel(channel_id, net.split(&[2, 3]), vec![1])
        .unwrap();
    net.settle(out.outbox);

    let at_bob = net.bob().get_state(channel_id).unwrap();
    assert_eq!(at_bob.turn_num, 4);
    assert_eq!(at_bob.outcome, net.split(&[2, 3]));
    assert_eq!(at_bob.app_data, vec![1]);

    let out = net
        .bob()
        .update_channel(channel_id, net.split(&[1, 4]), vec![2])
        .unwrap();
    net.settle(out.outbox);
    assert_eq!(net.alice().get_state(channel_id).unwrap().turn_num, 5);

    // Moves must not change the total.
    assert!(matches!(
        net.alice()
            .update_channel(channel_id, net.split(&[9, 9]), vec![]),
        Err(EngineError::Ingest(IngestError::InvalidTurnTransition { .. }))
    ));
}

#[test]
fn creating_channels_on_a_closed_ledger_fails_fast() {
    let mut net = Net::new(&[1, 2]);
    let ledger_id = net.open_ledger(&[10, 10]);
    let out = net.alice().close_channel(ledger_id).unwrap();
    net.settle(out.outbox);
    assert_eq!(
        net.bob().get_state(ledger_id).unwrap().status,
        ChannelStatus::Closed
    );

    let funding = FundingStrategy::Ledger {
        ledger_channel_id: ledger_id,
    };
    let err = net
        .alice()
        .create_channel(net.app_params(&[1, 1], funding))
        .unwrap_err();
    assert!(matches!(err, EngineError::LedgerUnavailable { .. }));
    assert!(net
        .alice()
        .get_channels()
        .iter()
        .all(|c| c.channel_id == ledger_id));
}

#[test]
fn ledger_outcomes_must_be_canonical() {
    let net = Net::new(&[1, 2]);
    let mut participants = net.participants();
    participants.reverse();
    assert!(matches!(
        net.alice()
            .create_ledger_channel(participants, net.split(&[1, 1])),
        Err(EngineError::InvalidChannel(_))
    ));
}

#[test]
fn duplicate_messages_are_harmless() {
    let mut net = Net::new(&[1, 2]);
    let out = net
        .alice()
        .create_channel(net.app_params(&[3, 2], FundingStrategy::Fake))
        .unwrap();
    let msg = out.outbox[0].clone();

    let first = net.bob().push_message(msg.clone()).unwrap();
    assert_eq!(first.new_objectives.len(), 1);
    assert_eq!(first.new_objectives[0].status, ObjectiveStatus::Queued);

    let second = net.bob().push_message(msg).unwrap();
    assert!(second.new_objectives.is_empty());
    assert!(second.outbox.is_empty());
    assert!(second.rejected.is_empty());

    let joined = net.bob().join_channel(out.channel_ids()[0]).unwrap();
    net.settle(joined.outbox);
    assert_eq!(
        net.alice().get_state(out.channel_ids()[0]).unwrap().status,
        ChannelStatus::Running
    );
}

#[test]
fn messages_for_someone_else_are_refused() {
    let net = Net::new(&[1, 2]);
    let out = net
        .alice()
        .create_channel(net.app_params(&[3, 2], FundingStrategy::Fake))
        .unwrap();
    let msg = out.outbox[0].clone();
    assert_eq!(net.alice().push_message(msg), Err(EngineError::WrongRecipient));
}

#[test]
fn invalid_states_are_reported_not_fatal() {
    let net = Net::new(&[1, 2]);
    let (a, b) = (alice(), bob());
    let state = State::new(params(&[&a, &b], 5, APP), split(&[&a, &b], &[3, 2]), vec![]);
    // Turn 0 must be signed by alice.
    let signed_by_bob = signed(&state, &[&b]);
    let msg = Message {
        sender: b.address(),
        recipient: a.address(),
        payload: Payload {
            signed_states: vec![(&signed_by_bob).into()],
            ..Payload::default()
        },
    };
    let out = net.alice().push_message(msg).unwrap();
    assert_eq!(out.rejected.len(), 1);
    assert!(net.alice().get_channels().is_empty());
}

#[test]
fn rejected_objectives_never_start() {
    let mut net = Net::new(&[1, 2]);
    let out = net
        .alice()
        .create_channel(net.app_params(&[3, 2], FundingStrategy::Fake))
        .unwrap();
    let channel_id = out.channel_ids()[0];
    net.settle(out.outbox);

    let open = ObjectiveKind::OpenChannel {
        channel_id,
        funding: FundingStrategy::Fake,
    };
    let mut events = net.bob().subscribe();
    let out = net.bob().reject_objectives(&[open.id()]).unwrap();
    assert!(out.outbox.is_empty());
    assert_eq!(objective_status(net.bob(), open), ObjectiveStatus::Failed);
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::ObjectiveFailed {
            id: open.id(),
            reason: ObjectiveFailure::Rejected
        }
    );

    // Approving afterwards does not revive it.
    let out = net.bob().approve_objectives(&[open.id()]).unwrap();
    assert!(out.outbox.is_empty());
    assert_eq!(objective_status(net.bob(), open), ObjectiveStatus::Failed);
}

#[test]
fn jump_start_recovers_lost_messages() {
    let mut net = Net::new(&[1, 2]);
    assert!(net.alice().jump_start_objectives().outbox.is_empty());
    let out = net
        .alice()
        .create_channel(net.app_params(&[3, 2], FundingStrategy::Fake))
        .unwrap();
    let channel_id = out.channel_ids()[0];
    net.settle(out.outbox);
    // Bob's prefund signature gets lost.
    let lost = net.bob().join_channel(channel_id).unwrap();
    assert!(!lost.outbox.is_empty());

    // Bob restarts on the same store.
    let restarted = Wallet::with_store(
        bob(),
        net.bob().store().clone(),
        net.chain.clone(),
        EngineConfig::default(),
    );
    net.wallets[1] = restarted;

    let resent = net.bob().jump_start_objectives();
    assert_eq!(resent.outbox.len(), 1);
    let payload = &resent.outbox[0].payload;
    assert!(!payload.signed_states.is_empty());
    assert_eq!(
        payload.requests,
        vec![Request::GetChannel { channel_id }]
    );
    net.settle(resent.outbox);

    for wallet in &net.wallets {
        assert_eq!(
            wallet.get_state(channel_id).unwrap().status,
            ChannelStatus::Running
        );
    }
    // Nothing left to do.
    assert!(net.alice().jump_start_objectives().outbox.is_empty());
    assert!(net.bob().jump_start_objectives().outbox.is_empty());
}

#[test]
fn events_report_objective_progress() {
    let mut net = Net::new(&[1, 2]);
    let mut events = net.alice().subscribe();
    let ids = net.open(net.app_params(&[3, 2], FundingStrategy::Fake), 1);
    let open = ObjectiveKind::OpenChannel {
        channel_id: ids[0],
        funding: FundingStrategy::Fake,
    };

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, EngineEvent::ChannelUpdated(_)) {
            seen.push(event);
        }
    }
    assert_eq!(
        seen,
        vec![
            EngineEvent::ObjectiveStarted(open.id()),
            EngineEvent::ObjectiveSucceeded(open.id()),
        ]
    );
}

#[test]
fn channel_results_serialize_in_camel_case() {
    let mut net = Net::new(&[1, 2]);
    let ids = net.open(net.app_params(&[3, 2], FundingStrategy::Fake), 1);
    let result = net.alice().get_state(ids[0]).unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "running");
    assert_eq!(json["turnNum"], 3);
    assert_eq!(json["funding"]["type"], "fake");
    assert_eq!(json["outcome"][0]["allocation"][0]["amount"], "0x3");
}
