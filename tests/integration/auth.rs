use datamode_core::crypto::{compute_proof, SharedSecret, SECRET_LEN};
use datamode_core::message::{decode_nonce, AuthProve, BeginRequest};
use datamode_core::{MsgType, NakCode};

use crate::*;

fn prove(secret: &SharedSecret, nonce: &[u8]) -> Vec<u8> {
    let nonce = decode_nonce(nonce).unwrap();
    AuthProve {
        token: TOKEN.to_vec(),
        proof: compute_proof(secret, TOKEN, &nonce).to_vec(),
    }
    .encode()
    .unwrap()
    .to_vec()
}

#[test]
fn test_transfer_requires_auth() {
    let mut rig = rig();
    let begin = BeginRequest {
        size: 1,
        crc: None,
        path: "x.bin".into(),
    };
    let err = rig.host.call(MsgType::FsBegin, &begin.encode()).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::NotAuthenticated));
    assert!(!rig.host.info().unwrap().authenticated);
}

#[test]
fn test_peripherals_require_auth() {
    let mut rig = rig();
    let err = rig.host.sd_free().unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::NotAuthenticated));
}

#[test]
fn test_nonce_is_single_use() {
    let mut rig = rig();
    let nonce = rig.host.call(MsgType::AuthInit, &[]).unwrap();
    let proof = prove(&secret(), &nonce);

    rig.host.call(MsgType::AuthProve, &proof).unwrap();
    assert!(rig.host.info().unwrap().authenticated);

    // Replaying the same proof finds no outstanding nonce.
    let err = rig.host.call(MsgType::AuthProve, &proof).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::AuthFailed));
    assert!(!rig.host.info().unwrap().authenticated);
}

#[test]
fn test_new_challenge_invalidates_the_old_one() {
    let mut rig = rig();
    let first = rig.host.call(MsgType::AuthInit, &[]).unwrap();
    let second = rig.host.call(MsgType::AuthInit, &[]).unwrap();
    assert_ne!(first, second);

    let err = rig
        .host
        .call(MsgType::AuthProve, &prove(&secret(), &first))
        .unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::AuthFailed));

    // The failed attempt consumed the second nonce too.
    let err = rig
        .host
        .call(MsgType::AuthProve, &prove(&secret(), &second))
        .unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::AuthFailed));
}

#[test]
fn test_wrong_secret_is_refused() {
    let mut rig = rig();
    let other = SharedSecret::from_bytes([0x24; SECRET_LEN]);
    let err = rig.host.authenticate(&other, TOKEN).unwrap_err();
    assert_eq!(nak_code(&err), Some(NakCode::AuthFailed));

    rig.host.authenticate(&secret(), TOKEN).unwrap();
    assert!(rig.host.info().unwrap().authenticated);
}
