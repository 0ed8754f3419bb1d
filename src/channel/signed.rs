use super::{PartIdx, State};
use crate::{
    sig::{self, Signer},
    types::{Hash, Signature},
};
use std::collections::BTreeMap;

/// Why a signature could not be added to a [SignedState].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("signer {0} is not a participant")]
    NotAParticipant(crate::Address),
    #[error("signing key does not belong to a participant")]
    SignerNotAParticipant,
    #[error("signing failed")]
    SigningFailed,
}

/// A state together with the signatures collected for it so far, keyed by
/// participant index.
///
/// Signatures are always verified before they end up in here, so everything
/// in `signatures` recovers to the participant it is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    state: State,
    hash: Hash,
    signatures: BTreeMap<PartIdx, Signature>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        let hash = state.hash();
        SignedState {
            state,
            hash,
            signatures: BTreeMap::new(),
        }
    }

    /// Verifies each signature and keys it by the recovered participant.
    pub fn from_signatures(
        state: State,
        signatures: impl IntoIterator<Item = Signature>,
    ) -> Result<Self, SignatureError> {
        let mut signed = SignedState::new(state);
        for sig in signatures {
            signed.add_signature(sig)?;
        }
        Ok(signed)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn turn_num(&self) -> u64 {
        self.state.turn_num()
    }

    pub fn signatures(&self) -> &BTreeMap<PartIdx, Signature> {
        &self.signatures
    }

    pub fn signers(&self) -> impl Iterator<Item = PartIdx> + '_ {
        self.signatures.keys().copied()
    }

    pub fn is_signed_by(&self, idx: PartIdx) -> bool {
        self.signatures.contains_key(&idx)
    }

    pub fn has_quorum(&self) -> bool {
        self.signatures.len() == self.state.params.num_participants()
    }

    /// Lowest index among the signers, used to break ties between competing
    /// proposals for the same turn.
    pub fn lowest_signer(&self) -> Option<PartIdx> {
        self.signatures.keys().next().copied()
    }

    /// Adds a signature after recovering its signer. Returns the index of the
    /// participant that signed.
    pub fn add_signature(&mut self, sig: Signature) -> Result<PartIdx, SignatureError> {
        let signer =
            sig::recover_signer(self.hash, sig).map_err(|_| SignatureError::RecoveryFailed)?;
        let idx = self
            .state
            .params
            .index_of(&signer)
            .ok_or(SignatureError::NotAParticipant(signer))?;
        self.signatures.insert(idx, sig);
        Ok(idx)
    }

    /// Signs the state with our own key.
    pub fn sign(&mut self, signer: &Signer) -> Result<PartIdx, SignatureError> {
        let idx = self
            .state
            .params
            .index_of(&signer.address())
            .ok_or(SignatureError::SignerNotAParticipant)?;
        let sig = signer
            .sign_eth(self.hash)
            .map_err(|_| SignatureError::SigningFailed)?;
        self.signatures.insert(idx, sig);
        Ok(idx)
    }

    /// Moves the signatures of `other` (for the same state) into this one.
    /// Returns the participants that had not signed before.
    pub(crate) fn merge(&mut self, other: &SignedState) -> Vec<PartIdx> {
        debug_assert_eq!(self.hash, other.hash);
        let mut added = Vec::new();
        for (idx, sig) in &other.signatures {
            if self.signatures.insert(*idx, *sig).is_none() {
                added.push(*idx);
            }
        }
        added
    }
}
