//! Handles the creation and verification of (Ethereum) Signatures.
//!
//! The engine only needs two capabilities from this module: sign a state
//! hash and recover the signing address from a signature. Everything else
//! (which participant must sign which turn) lives in [crate::channel].

use crate::types::Hash;
use sha3::{Digest, Keccak256};

mod k256;
pub use self::k256::{recover_signer, Error, Signer};

#[cfg(test)]
mod tests;

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Keccak256 over the concatenation of all given slices.
pub fn keccak256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}
