//! Explicit configuration handed to each wallet at construction.

use crate::{
    channel::{AppValidator, ConservingValidator},
    types::U256,
};
use std::{sync::Arc, time::Duration};

/// Retry schedule of `Dispatcher::ensure_objectives`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureConfig {
    /// Attempt windows before giving up. The first window only waits, every
    /// later one re-sends the pending objectives' messages first.
    pub max_attempts: u32,

    /// Length of the first attempt window.
    pub initial_delay: Duration,

    /// Growth of the window per attempt (exponential backoff).
    pub multiplier: f64,

    /// Upper bound for a single window.
    pub max_delay: Duration,
}

impl Default for EnsureConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl EnsureConfig {
    /// Window length of attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chain of all channels created by the wallet. Incoming channels on
    /// other chains are ignored.
    pub chain_id: U256,
    pub ensure: EnsureConfig,
    /// Decides which moves are valid in running application channels.
    pub validator: Arc<dyn AppValidator>,
    /// Challenge duration of newly created channels, in seconds.
    pub challenge_duration: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_id: U256::from(1337),
            ensure: EnsureConfig::default(),
            validator: Arc::new(ConservingValidator),
            challenge_duration: 86400,
        }
    }
}

impl EngineConfig {
    pub fn with_chain_id(mut self, chain_id: U256) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_ensure(mut self, ensure: EnsureConfig) -> Self {
        self.ensure = ensure;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn AppValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_challenge_duration(mut self, seconds: u64) -> Self {
        self.challenge_duration = seconds;
        self
    }
}
