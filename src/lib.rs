//! State-channel wallet: opens, funds, updates and closes channels together
//! with remote participants.
//!
//! A [Wallet] holds one participant's channels and drives objectives
//! (opening, ledger funding, closing) forward whenever input arrives. The
//! [dispatch::Dispatcher] connects wallets over a [dispatch::MessageService]
//! and re-sends messages of objectives that got stuck.

pub mod types;
pub mod sig;

pub mod channel;
pub mod ledger;
pub mod protocols;
pub mod store;

pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod wallet;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, EnsureConfig};
pub use error::{EngineError, EnsureError, IngestError};
pub use types::{Address, Amount, Destination, Hash, Signature, U256};
pub use wallet::{ChannelResult, CreateChannelParams, EngineEvent, MultipleChannelOutput, Wallet};
