use super::{keccak256, recover_signer, Signer};
use crate::types::Signature;
use rand::{rngs::StdRng, SeedableRng};

#[test]
fn sign_then_recover() {
    // Do not use that on any real device, this is just for testing.
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);
    let msg = keccak256(&[&[0xa1, 0xa2, 0xa3, 0xa4]]);
    let sig = signer.sign_eth(msg).unwrap();

    assert!(sig.0[64] == 27 || sig.0[64] == 28);
    assert_eq!(recover_signer(msg, sig).unwrap(), signer.address());
}

#[test]
fn different_signers_have_different_addresses() {
    let mut rng = StdRng::seed_from_u64(1);
    let alice = Signer::new(&mut rng);
    let bob = Signer::new(&mut rng);
    assert_ne!(alice.address(), bob.address());

    let msg = keccak256(&[b"state"]);
    let sig = bob.sign_eth(msg).unwrap();
    assert_eq!(recover_signer(msg, sig).unwrap(), bob.address());
    assert_ne!(recover_signer(msg, sig).unwrap(), alice.address());
}

#[test]
fn signature_over_other_message_recovers_other_address() {
    let signer = Signer::from_secret(&[7u8; 32]).unwrap();
    let sig = signer.sign_eth(keccak256(&[b"a"])).unwrap();
    let recovered = recover_signer(keccak256(&[b"b"]), sig);
    assert!(recovered.map(|a| a != signer.address()).unwrap_or(true));
}

#[test]
fn malformed_signature_is_an_error() {
    let msg = keccak256(&[b"state"]);
    // v below 27 cannot come from sign_eth.
    assert!(recover_signer(msg, Signature::default()).is_err());
}
