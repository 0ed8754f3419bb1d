use super::State;
use core::fmt::Debug;

/// Reasons a transition between two consecutive states is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTransition {
    #[error("states belong to different channels")]
    InvalidChannelID,
    #[error("turn number does not follow the previous state")]
    InvalidTurnNumber,
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("assets do not match")]
    AssetsMismatch,
    #[error("total allocated amount changed")]
    TotalAllocationAmountMismatch,
    #[error("allocated amounts overflow")]
    AmountOverflow,
    #[error("state content must not change without unanimous consent")]
    ContentChanged,
    #[error("rejected by the application: {0}")]
    Application(&'static str),
}

/// Business rules for state transitions of application channels.
///
/// Called for every running-phase transition of a channel with a non-zero
/// `app_definition`. Setup rounds and channels without an application never
/// reach the validator.
pub trait AppValidator: Debug + Send + Sync {
    fn validate_transition(&self, from: &State, to: &State) -> Result<(), InvalidTransition>;
}

/// Accepts any redistribution of the locked funds, as long as no asset is
/// added or removed and the totals stay the same.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConservingValidator;

impl AppValidator for ConservingValidator {
    fn validate_transition(&self, from: &State, to: &State) -> Result<(), InvalidTransition> {
        check_conserving(from, to)
    }
}

/// Checks shared by every transition: same channel, no moving on from a
/// final state, same assets and the same total per asset.
pub fn check_conserving(from: &State, to: &State) -> Result<(), InvalidTransition> {
    if from.channel_id() != to.channel_id() {
        Err(InvalidTransition::InvalidChannelID)
    } else if to.turn_num() <= from.turn_num() {
        Err(InvalidTransition::InvalidTurnNumber)
    } else if from.is_final {
        Err(InvalidTransition::CurrentStateIsFinal)
    } else if from.outcome.asset_holders() != to.outcome.asset_holders() {
        Err(InvalidTransition::AssetsMismatch)
    } else {
        match (from.outcome.totals(), to.outcome.totals()) {
            (Some(before), Some(after)) if before == after => Ok(()),
            (Some(_), Some(_)) => Err(InvalidTransition::TotalAllocationAmountMismatch),
            _ => Err(InvalidTransition::AmountOverflow),
        }
    }
}

/// Whether `to` may follow `from` as a move by a single participant.
///
/// During setup and for channels without an application nothing may change
/// apart from the turn number, changes to those need all signatures on one
/// state instead.
pub fn is_valid_move(from: &State, to: &State, validator: &dyn AppValidator) -> bool {
    if to.turn_num() != from.turn_num() + 1 {
        return false;
    }
    if to.turn_num() < to.params.first_running_turn() || !to.params.has_app() {
        return from.same_content(to);
    }
    validator.validate_transition(from, to).is_ok()
}
