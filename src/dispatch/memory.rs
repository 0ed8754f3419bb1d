use super::MessageService;
use crate::types::Address;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug)]
struct Links {
    inboxes: BTreeMap<Address, mpsc::UnboundedSender<Vec<u8>>>,
    drop_rate: f64,
    rng: StdRng,
}

/// In-process network with one inbox per address. Can drop a share of all
/// frames to exercise recovery.
#[derive(Debug)]
pub struct MemoryNetwork {
    links: Mutex<Links>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_drop_rate(0.0, 0)
    }

    /// Drops each frame with probability `drop_rate`, decided by an rng
    /// seeded with `seed`.
    pub fn with_drop_rate(drop_rate: f64, seed: u64) -> Self {
        MemoryNetwork {
            links: Mutex::new(Links {
                inboxes: BTreeMap::new(),
                drop_rate: drop_rate.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    pub fn set_drop_rate(&self, drop_rate: f64) {
        self.links().drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    /// Registers `address` and returns its inbox. Connecting again replaces
    /// the previous inbox.
    pub fn connect(&self, address: Address) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links().inboxes.insert(address, tx);
        rx
    }

    fn links(&self) -> MutexGuard<'_, Links> {
        match self.links.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MessageService for MemoryNetwork {
    fn send(&self, recipient: Address, frame: Vec<u8>) {
        let mut links = self.links();
        let drop_rate = links.drop_rate;
        if drop_rate > 0.0 && links.rng.gen_bool(drop_rate) {
            trace!(%recipient, "dropped frame");
            return;
        }
        match links.inboxes.get(&recipient) {
            Some(inbox) => {
                if inbox.send(frame).is_err() {
                    debug!(%recipient, "inbox closed");
                }
            }
            None => debug!(%recipient, "no such recipient"),
        }
    }
}
