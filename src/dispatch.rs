//! Moves wallet output between participants and keeps objectives alive.
//!
//! The [Wallet] is synchronous and never talks to the network itself. The
//! [Dispatcher] sits in front of it: it sends the outbox of every wallet call
//! as length-prefixed frames through a [MessageService], feeds inbound frames
//! and chain events back into the wallet, and re-sends the messages of
//! objectives that do not make progress (see [Dispatcher::ensure_objectives]).

mod ensure;
mod memory;

pub use memory::MemoryNetwork;

use crate::{
    chain::DepositedEvent,
    error::EngineError,
    types::Address,
    wallet::{MultipleChannelOutput, Wallet},
    wire::Message,
};
use std::{fmt::Debug, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Transport for encoded messages. Delivery is best effort, lost frames are
/// recovered by re-sending.
pub trait MessageService: Debug + Send + Sync {
    fn send(&self, recipient: Address, frame: Vec<u8>);
}

#[derive(Debug)]
pub struct Dispatcher {
    wallet: Arc<Wallet>,
    messages: Arc<dyn MessageService>,
}

impl Dispatcher {
    pub fn new(wallet: Arc<Wallet>, messages: Arc<dyn MessageService>) -> Self {
        Dispatcher { wallet, messages }
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    /// Sends the outbox of a wallet call.
    pub fn send(&self, output: &MultipleChannelOutput) {
        self.send_messages(&output.outbox);
    }

    fn send_messages(&self, messages: &[Message]) {
        for msg in messages {
            match msg.encode() {
                Ok(frame) => {
                    trace!(recipient = %msg.recipient, len = frame.len(), "sending frame");
                    self.messages.send(msg.recipient, frame);
                }
                // Only happens for payloads above the frame limit. The
                // objectives stay pending and are re-synced later.
                Err(err) => warn!(recipient = %msg.recipient, %err, "could not encode message"),
            }
        }
    }

    /// Decodes one inbound frame, hands it to the wallet and sends the
    /// replies.
    pub fn handle_inbound(&self, frame: &[u8]) -> Result<MultipleChannelOutput, EngineError> {
        let msg = Message::decode(frame)?;
        debug!(sender = %msg.sender, "received message");
        let output = self.wallet.push_message(msg)?;
        self.send(&output);
        Ok(output)
    }

    /// Handles inbound frames until `inbox` closes or `cancel` fires.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = inbox.recv() => match frame {
                        Some(frame) => {
                            if let Err(err) = dispatcher.handle_inbound(&frame) {
                                warn!(%err, "dropping inbound message");
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(wallet = %dispatcher.wallet.address(), "inbound loop stopped");
        })
    }

    /// Feeds chain events into the wallet until the chain goes away or
    /// `cancel` fires.
    pub fn spawn_chain_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<DepositedEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            match dispatcher.wallet.update_funding_for_channels(&[event]) {
                                Ok(output) => dispatcher.send(&output),
                                Err(err) => warn!(%err, "could not apply chain event"),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Holdings are absolute, the next event fixes it.
                            warn!(missed, "chain listener lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Resumes every unfinished objective, e.g. after a restart.
    pub fn jump_start(&self) -> MultipleChannelOutput {
        let output = self.wallet.jump_start_objectives();
        debug!(messages = output.outbox.len(), "jump started objectives");
        self.send(&output);
        output
    }
}
