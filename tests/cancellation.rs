mod common;

use std::time::Duration;

use anyhow::Result;

use isomdl_proximity::definitions::device_engagement::{EDeviceKeyBytes, WifiOptions};
use isomdl_proximity::definitions::session::EphemeralKeyPair;
use isomdl_proximity::definitions::DeviceRetrievalMethod;
use isomdl_proximity::presentation::harness::{EchoResponder, MediumKind};
use isomdl_proximity::presentation::{Outcome, PresentmentConfig};
use isomdl_proximity::transport::{LoopbackMedium, Role, State, TransportError};

use crate::common::{e_device_key_bytes, prepare_holder, raw_transport};

const PROMPTLY: Duration = Duration::from_secs(1);

#[tokio::test]
async fn close_handle_unblocks_a_waiting_transport() -> Result<()> {
    let medium = LoopbackMedium::new();
    let method = DeviceRetrievalMethod::WIFI(WifiOptions::default());
    let e_device_key_bytes = EDeviceKeyBytes::new(&EphemeralKeyPair::generate().public_cose_key())?;
    let mut holder = raw_transport(&method, Role::Mdoc, &medium);
    let mut reader = raw_transport(&method, Role::MdocReader, &medium);
    let (opened_holder, opened_reader) = tokio::join!(
        holder.open(&e_device_key_bytes),
        reader.open(&e_device_key_bytes)
    );
    opened_holder?;
    opened_reader?;

    let close = reader.close_handle();
    let waiter = tokio::spawn(async move {
        let result = reader.wait_for_message().await;
        (result, reader.state())
    });
    tokio::task::yield_now().await;
    close.close();

    let (result, state) = tokio::time::timeout(PROMPTLY, waiter).await??;
    assert_eq!(result, Err(TransportError::Closed));
    assert_eq!(state, State::Disconnected);

    // Closing twice is harmless, and a closed transport sends nothing.
    holder.close().await;
    holder.close().await;
    assert_eq!(holder.send_message(b"late").await, Err(TransportError::Closed));
    Ok(())
}

#[tokio::test]
async fn holder_waiting_for_a_request_is_cancelled() -> Result<()> {
    let medium = LoopbackMedium::new();
    let method = MediumKind::Nfc.connection_method();
    let holder = prepare_holder(&method, &medium, PresentmentConfig::default()).await?;
    let e_device_key_bytes = e_device_key_bytes(&holder);
    let close = holder.close_handle();
    let mut state = holder.watch_state();
    let holder_task = tokio::spawn(async move {
        let mut responder = EchoResponder::default();
        holder.run(&mut responder).await
    });

    // A reader that connects and never sends anything.
    let mut reader = raw_transport(&method, Role::MdocReader, &medium);
    reader.open(&e_device_key_bytes).await?;
    state.wait_for(|state| *state == State::Connected).await?;
    close.close();

    let outcome = tokio::time::timeout(PROMPTLY, holder_task).await??;
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(*state.borrow(), State::Disconnected);
    reader.close().await;
    Ok(())
}

#[tokio::test]
async fn holder_waiting_for_a_reader_is_cancelled() -> Result<()> {
    let medium = LoopbackMedium::new();
    let holder = prepare_holder(
        &MediumKind::BlePeripheralServer.connection_method(),
        &medium,
        PresentmentConfig::default(),
    )
    .await?;
    let close = holder.close_handle();
    let holder_task = tokio::spawn(async move {
        let mut responder = EchoResponder::default();
        holder.run(&mut responder).await
    });
    tokio::task::yield_now().await;
    close.close();

    let outcome = tokio::time::timeout(PROMPTLY, holder_task).await??;
    assert_eq!(outcome, Outcome::Cancelled);
    Ok(())
}
