mod common;

use anyhow::Result;

use isomdl_proximity::cbor;
use isomdl_proximity::definitions::helpers::NonEmptyVec;
use isomdl_proximity::definitions::session::EphemeralKeyPair;
use isomdl_proximity::definitions::{
    DeviceEngagement, Handover, SessionData, SessionEstablishment,
};
use isomdl_proximity::presentation::harness::{EchoResponder, MediumKind, ScriptedReader, REQUEST};
use isomdl_proximity::presentation::device::DevicePresentment;
use isomdl_proximity::presentation::reader::ReaderPresentment;
use isomdl_proximity::presentation::{Outcome, PresentmentConfig};
use isomdl_proximity::session::{encode_status, SessionEncryption, Status};
use isomdl_proximity::transport::{LoopbackMedium, MdocTransport, Role};

use crate::common::{e_device_key_bytes, prepare_holder, raw_transport};

/// A holder serving follow-up requests, a reader transport connected to it and the session the
/// reader would use.
async fn connect_to_holder(
    medium: &LoopbackMedium,
) -> Result<(
    tokio::task::JoinHandle<Outcome>,
    Box<dyn MdocTransport>,
    SessionEncryption,
)> {
    let method = MediumKind::WifiAware.connection_method();
    let config = PresentmentConfig {
        auto_close: false,
        ..PresentmentConfig::default()
    };
    let holder: DevicePresentment = prepare_holder(&method, medium, config).await?;
    let session = SessionEncryption::reader(
        EphemeralKeyPair::generate(),
        holder.device_engagement(),
        Handover::QR,
    )?;
    let e_device_key_bytes = e_device_key_bytes(&holder);
    let holder_task = tokio::spawn(async move {
        let mut responder = EchoResponder::default();
        holder.run(&mut responder).await
    });

    let mut reader = raw_transport(&method, Role::MdocReader, medium);
    reader.open(&e_device_key_bytes).await?;
    Ok((holder_task, reader, session))
}

async fn next_status(reader: &mut Box<dyn MdocTransport>) -> Result<Option<Status>> {
    let reply: SessionData = cbor::from_slice(&reader.wait_for_message().await?)?;
    assert!(reply.data.is_none());
    Ok(reply.status)
}

#[tokio::test]
async fn tampered_request_is_reported_as_an_encryption_error() -> Result<()> {
    let medium = LoopbackMedium::new();
    let (holder_task, mut reader, mut session) = connect_to_holder(&medium).await?;

    let mut establishment: SessionEstablishment =
        cbor::from_slice(&session.encrypt_message(Some(REQUEST), None)?)?;
    let mut data: Vec<u8> = establishment.data.into();
    data[0] ^= 0x01;
    establishment.data = data.into();
    reader.send_message(&cbor::to_vec(&establishment)?).await?;

    assert_eq!(
        next_status(&mut reader).await?,
        Some(Status::SessionEncryptionError)
    );
    assert!(matches!(holder_task.await?, Outcome::Failed(_)));
    reader.close().await;
    Ok(())
}

#[tokio::test]
async fn replayed_request_is_reported_as_an_encryption_error() -> Result<()> {
    let medium = LoopbackMedium::new();
    let (holder_task, mut reader, mut session) = connect_to_holder(&medium).await?;

    let request = session.encrypt_message(Some(REQUEST), None)?;
    reader.send_message(&request).await?;
    let (response, status) = session.decrypt_message(&reader.wait_for_message().await?)?;
    assert_eq!(response, Some([b"response to ".as_slice(), REQUEST].concat()));
    assert_eq!(status, None);

    reader.send_message(&request).await?;
    assert_eq!(
        next_status(&mut reader).await?,
        Some(Status::SessionEncryptionError)
    );
    assert!(matches!(holder_task.await?, Outcome::Failed(_)));
    reader.close().await;
    Ok(())
}

#[tokio::test]
async fn error_status_from_the_reader_fails_the_holder() -> Result<()> {
    let medium = LoopbackMedium::new();
    let (holder_task, mut reader, mut session) = connect_to_holder(&medium).await?;

    reader
        .send_message(&session.encrypt_message(Some(REQUEST), None)?)
        .await?;
    session.decrypt_message(&reader.wait_for_message().await?)?;
    reader
        .send_message(&session.encrypt_message(None, Some(Status::CborDecodingError))?)
        .await?;

    assert!(matches!(holder_task.await?, Outcome::Failed(_)));
    reader.close().await;
    Ok(())
}

#[tokio::test]
async fn error_status_from_the_holder_fails_the_reader() -> Result<()> {
    let medium = LoopbackMedium::new();
    let method = MediumKind::WifiAware.connection_method();
    let device_engagement = DeviceEngagement::generate(
        &EphemeralKeyPair::generate().public_cose_key(),
        DeviceEngagement::VERSION,
        NonEmptyVec::new(method.clone()),
    )?;
    let e_device_key_bytes = device_engagement.as_ref().security.e_device_key_bytes.clone();
    let reader = ReaderPresentment::from_engagement(
        device_engagement,
        Handover::QR,
        medium.clone(),
        PresentmentConfig::default(),
    )?;
    let reader_task = tokio::spawn(async move {
        let mut user = ScriptedReader::default();
        let outcome = reader.run(REQUEST, &mut user).await;
        (outcome, user)
    });

    // A holder that cannot make sense of the request.
    let mut holder = raw_transport(&method, Role::Mdoc, &medium);
    holder.open(&e_device_key_bytes).await?;
    assert!(!holder.wait_for_message().await?.is_empty());
    holder
        .send_message(&encode_status(Status::SessionEncryptionError)?)
        .await?;

    let (outcome, user) = reader_task.await?;
    assert!(matches!(outcome, Outcome::Failed(_)), "{outcome:?}");
    assert!(user.responses.is_empty());
    holder.close().await;
    Ok(())
}
