//! The artifact codec doesn't need a live tracee to test: these exercise
//! corruption handling directly against hand-built byte buffers.

use rdcheckpoint::codec;
use rdcheckpoint::error::RdError;

#[test]
fn truncated_artifact_is_corrupted_not_a_panic() {
    let bytes = vec![0u8; 3];
    assert!(matches!(codec::decode(&bytes), Err(RdError::Corrupted(_))));
}

#[test]
fn empty_artifact_is_corrupted() {
    assert!(matches!(codec::decode(&[]), Err(RdError::Corrupted(_))));
}

#[test]
fn random_bytes_fail_magic_check() {
    let bytes = vec![0x41u8; 64];
    assert!(matches!(codec::decode(&bytes), Err(RdError::Corrupted(_))));
}
