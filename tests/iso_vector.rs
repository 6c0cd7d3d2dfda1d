mod common;

use anyhow::Result;

use isomdl_proximity::definitions::helpers::{NonEmptyVec, Tag24};
use isomdl_proximity::definitions::session::{build_session_transcript, EphemeralKeyPair};
use isomdl_proximity::definitions::{DeviceEngagement, DeviceRetrievalMethod, Handover};
use isomdl_proximity::session::SessionEncryption;

use crate::common::ANNEX_D_QR_CODE;

#[test]
fn annex_d_engagement_has_one_ble_method() -> Result<()> {
    let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(ANNEX_D_QR_CODE)?;
    let methods = device_engagement
        .as_ref()
        .device_retrieval_methods
        .as_ref()
        .expect("the engagement has connection methods");
    assert_eq!(device_engagement.as_ref().version, "1.0");
    assert_eq!(methods.len(), 1);
    let DeviceRetrievalMethod::BLE(ble) = methods.first() else {
        panic!("expected BLE, got {:?}", methods.first());
    };
    assert!(ble.central_client_mode.is_some());
    assert!(ble.peripheral_server_mode.is_none());

    // The bytes hashed into the transcript are the ones that were scanned.
    let scanned = base64::decode(ANNEX_D_QR_CODE.trim_start_matches("mdoc:"))?;
    assert_eq!(device_engagement.inner_bytes, scanned);
    // map(3), 0: "1.0"
    assert_eq!(hex::encode(&scanned[..6]), "a30063312e30");
    Ok(())
}

#[test]
fn transcript_over_annex_d_is_deterministic() -> Result<()> {
    let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(ANNEX_D_QR_CODE)?;
    let e_reader_key = Tag24::new(EphemeralKeyPair::generate().public_cose_key())?;
    let first = build_session_transcript(
        &device_engagement.inner_bytes,
        &e_reader_key.inner_bytes,
        Handover::QR,
    )?;
    let second = build_session_transcript(
        &device_engagement.inner_bytes,
        &e_reader_key.inner_bytes,
        Handover::QR,
    )?;
    assert_eq!(first, second);
    assert_eq!(first[..2], [0xd8, 0x18]);
    Ok(())
}

#[test]
fn annex_d_device_key_is_not_usable() -> Result<()> {
    // The example key printed in the standard does not decode, so no session can be set up.
    let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(ANNEX_D_QR_CODE)?;
    assert!(SessionEncryption::reader(
        EphemeralKeyPair::generate(),
        &device_engagement,
        Handover::QR
    )
    .is_err());
    Ok(())
}

#[test]
fn engagement_roundtrips_through_a_qr_code() -> Result<()> {
    let key = EphemeralKeyPair::generate();
    let device_engagement = DeviceEngagement::generate(
        &key.public_cose_key(),
        DeviceEngagement::VERSION,
        NonEmptyVec::new(DeviceRetrievalMethod::NFC(Default::default())),
    )?;
    let scanned = Tag24::<DeviceEngagement>::from_qr_code_uri(&device_engagement.to_qr_code_uri())?;
    assert_eq!(scanned.as_ref(), device_engagement.as_ref());
    assert_eq!(scanned.inner_bytes, device_engagement.inner_bytes);
    assert_eq!(scanned.as_ref().security.e_device_key()?, key.public_cose_key());
    Ok(())
}
