//! Fixtures shared by the unit tests.

use crate::{
    channel::{
        AllocationItem, AssetOutcome, ChannelParams, Outcome, Participant, SignedState, State,
    },
    sig::Signer,
    types::{Address, Destination, U256},
};

/// Asset holder used by all fixtures.
pub const ASSET: Address = Address([0xee; 20]);

/// Application used for channels that run an app.
pub const APP: Address = Address([0xaa; 20]);

pub const CHAIN_ID: u64 = 1337;

/// Deterministic signer. Do not use these keys anywhere else.
pub fn signer(seed: u8) -> Signer {
    Signer::from_secret(&[seed; 32]).unwrap()
}

pub fn alice() -> Signer {
    signer(1)
}

pub fn bob() -> Signer {
    signer(2)
}

pub fn params(signers: &[&Signer], nonce: u64, app: Address) -> ChannelParams {
    ChannelParams {
        participants: signers
            .iter()
            .map(|s| Participant::new(s.address()))
            .collect(),
        channel_nonce: nonce,
        chain_id: U256::from(CHAIN_ID),
        app_definition: app,
        challenge_duration: 86400,
    }
}

pub fn outcome(items: &[(Destination, u64)]) -> Outcome {
    Outcome(vec![AssetOutcome {
        asset_holder: ASSET,
        allocation: items
            .iter()
            .map(|(destination, amount)| AllocationItem {
                destination: *destination,
                amount: U256::from(*amount),
            })
            .collect(),
    }])
}

/// Outcome giving each signer the corresponding amount.
pub fn split(signers: &[&Signer], amounts: &[u64]) -> Outcome {
    let items: Vec<_> = signers
        .iter()
        .zip(amounts)
        .map(|(s, a)| (Destination::from(s.address()), *a))
        .collect();
    outcome(&items)
}

pub fn signed(state: &State, signers: &[&Signer]) -> SignedState {
    let mut signed = SignedState::new(state.clone());
    for s in signers {
        signed.sign(s).unwrap();
    }
    signed
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
