use super::Dispatcher;
use crate::{
    error::EnsureError,
    protocols::{ObjectiveFailure, ObjectiveId, ObjectiveStatus},
    wallet::EngineEvent,
};
use std::collections::BTreeSet;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Dispatcher {
    /// Waits until all `ids` succeeded, re-sending their messages with
    /// exponential backoff while they do not.
    ///
    /// The first attempt window only waits. Every later one starts by
    /// syncing the pending objectives with the other participants. Fails as
    /// soon as one of the objectives fails, and after
    /// [crate::config::EnsureConfig::max_attempts] windows without success.
    pub async fn ensure_objectives(
        &self,
        ids: &[ObjectiveId],
        cancel: &CancellationToken,
    ) -> Result<(), EnsureError> {
        // Subscribe before looking at the store so no transition is missed.
        let mut events = self.wallet.subscribe();
        let config = self.wallet.config().ensure.clone();
        let mut pending: BTreeSet<ObjectiveId> = ids.iter().cloned().collect();

        for attempt in 0..config.max_attempts {
            self.check_pending(&mut pending)?;
            if pending.is_empty() {
                return Ok(());
            }
            if attempt > 0 {
                let ids: Vec<_> = pending.iter().cloned().collect();
                debug!(attempt, pending = ?ids, "re-syncing objectives");
                let output = self.wallet.sync_objectives(&ids);
                self.send(&output);
            }

            let window = tokio::time::sleep(config.delay(attempt));
            tokio::pin!(window);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(EnsureError::Cancelled),
                    _ = &mut window => break,
                    event = events.recv() => match event {
                        Ok(EngineEvent::ObjectiveSucceeded(id)) => {
                            pending.remove(&id);
                            if pending.is_empty() {
                                info!(attempt, "objectives ensured");
                                return Ok(());
                            }
                        }
                        Ok(EngineEvent::ObjectiveFailed { id, reason }) if pending.contains(&id) => {
                            return Err(EnsureError::ObjectiveFailed { id, reason });
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => self.check_pending(&mut pending)?,
                        Err(RecvError::Closed) => {
                            (&mut window).await;
                            break;
                        }
                    },
                }
            }
        }

        self.check_pending(&mut pending)?;
        if pending.is_empty() {
            return Ok(());
        }
        let pending: Vec<_> = pending.into_iter().collect();
        warn!(attempts = config.max_attempts, ?pending, "giving up on objectives");
        Err(EnsureError::EnsureObjectiveFailed {
            attempts: config.max_attempts,
            pending,
        })
    }

    /// Drops succeeded objectives from `pending`, fails on failed or unknown
    /// ones.
    fn check_pending(&self, pending: &mut BTreeSet<ObjectiveId>) -> Result<(), EnsureError> {
        let mut done = Vec::new();
        for id in pending.iter() {
            let objective = self
                .wallet
                .store()
                .get_objective(id)
                .ok_or_else(|| EnsureError::ObjectiveNotFound(id.clone()))?;
            match objective.status {
                ObjectiveStatus::Succeeded => done.push(id.clone()),
                ObjectiveStatus::Failed => {
                    return Err(EnsureError::ObjectiveFailed {
                        id: id.clone(),
                        reason: objective.failure.unwrap_or(ObjectiveFailure::Rejected),
                    })
                }
                ObjectiveStatus::Queued | ObjectiveStatus::Approved | ObjectiveStatus::Started => {}
            }
        }
        for id in done {
            pending.remove(&id);
        }
        Ok(())
    }
}
