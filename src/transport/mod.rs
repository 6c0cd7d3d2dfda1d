//! Transports that carry session messages between a holder and a reader.
//!
//! Every medium is driven through the [MdocTransport] trait. A transport is owned by the task
//! running the presentment; other tasks observe it through [MdocTransport::watch_state] and stop
//! it through a [CloseHandle].
//!
//! The media themselves are simulated by a [LoopbackMedium], which lets holders and readers in
//! one process find each other the same way they would over the air.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::definitions::device_engagement::{
    DeviceEngagement, DeviceRetrievalMethod, EDeviceKeyBytes,
};

pub use ble::BleTransport;
pub use medium::{LoopbackMedium, Rendezvous};
pub use nfc::NfcTransport;
pub use wifi_aware::WifiAwareTransport;

pub mod ble;
mod link;
pub mod medium;
pub mod nfc;
pub mod wifi_aware;

/// Which end of the session a transport belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum Role {
    /// The holder presenting its documents.
    Mdoc,
    /// The reader requesting them.
    MdocReader,
}

/// Connection state of a transport.
///
/// `Idle -> Advertising | Scanning -> Connecting -> Connected -> DataTransfer -> Disconnected`;
/// every state can reach `Disconnected` through a close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
pub enum State {
    Idle,
    Advertising,
    Scanning,
    Connecting,
    Connected,
    DataTransfer,
    Disconnected,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timed out waiting for the peer")]
    ConnectionTimeout,
    #[error("the peer disconnected")]
    PeerDisconnected,
    /// The transport was closed, possibly by another task. This is how a blocked waiter is
    /// cancelled and is not a failure.
    #[error("the transport was closed")]
    Closed,
    #[error("malformed data received: {0}")]
    Malformed(String),
    #[error("operation not valid while {0}")]
    InvalidState(State),
}

/// Tunables for the transports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportOptions {
    /// ATT MTU negotiated on BLE GATT links.
    pub ble_mtu: usize,
    /// Whether a holder offers an L2CAP channel alongside GATT.
    pub ble_use_l2cap: bool,
    /// Announce the L2CAP PSM as text on the medium's side channel, keyed by the BLE service
    /// UUID, instead of putting it in the engagement.
    pub ble_psm_side_channel: bool,
    /// Largest command data field a holder accepts over NFC.
    pub nfc_command_data_length: u16,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "scan_interval_ms", with = "millis")]
    pub scan_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            ble_mtu: 515,
            ble_use_l2cap: false,
            ble_psm_side_channel: false,
            nfc_command_data_length: 255,
            connect_timeout: Duration::from_secs(10),
            scan_interval: Duration::from_millis(20),
        }
    }
}

/// Serde helpers for durations written as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Closes a transport from any task.
///
/// A task blocked in [MdocTransport::open] or [MdocTransport::wait_for_message] returns
/// [TransportError::Closed] as soon as the handle is used.
#[derive(Clone, Debug)]
pub struct CloseHandle {
    closed: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<State>>,
}

impl CloseHandle {
    pub(crate) fn new(state: Arc<watch::Sender<State>>) -> Self {
        Self {
            closed: Arc::new(watch::Sender::new(false)),
            state,
        }
    }

    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!("transport close requested");
        }
        self.state.send_replace(State::Disconnected);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// A connection to the peer over one medium.
#[async_trait]
pub trait MdocTransport: Send {
    fn role(&self) -> Role;

    /// The connection method this transport is reachable through, as put in the engagement.
    fn connection_method(&self) -> DeviceRetrievalMethod;

    fn state(&self) -> State;

    fn watch_state(&self) -> watch::Receiver<State>;

    /// Time spent looking for the peer before the link came up, if this side scanned.
    fn scanning_time(&self) -> Option<Duration>;

    fn close_handle(&self) -> CloseHandle;

    /// Make the holder discoverable ahead of [MdocTransport::open]. Optional.
    async fn advertise(&mut self) -> Result<(), TransportError>;

    /// Connect to the peer. Both sides pass the holder's `EDeviceKeyBytes`, from which media
    /// without a UUID derive the identifier the holder is found by.
    async fn open(&mut self, e_device_key_bytes: &EDeviceKeyBytes) -> Result<(), TransportError>;

    /// Send one message. An empty message terminates the session at the transport level.
    async fn send_message(&mut self, message: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next complete message. An empty message means the peer ended the session
    /// at the transport level or went away.
    async fn wait_for_message(&mut self) -> Result<Vec<u8>, TransportError>;

    /// A message the peer has already sent, without waiting for one. Empty messages mean the
    /// same as for [MdocTransport::wait_for_message].
    fn try_take_message(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the link. Safe to call any number of times.
    async fn close(&mut self);
}

/// Build the transport for one connection method.
pub fn for_connection_method(
    method: &DeviceRetrievalMethod,
    role: Role,
    medium: LoopbackMedium,
    options: TransportOptions,
) -> Box<dyn MdocTransport> {
    match method {
        DeviceRetrievalMethod::BLE(ble) => {
            Box::new(BleTransport::ble(ble.clone(), role, medium, options))
        }
        DeviceRetrievalMethod::NFC(nfc) => {
            Box::new(NfcTransport::nfc(nfc.clone(), role, medium, options))
        }
        DeviceRetrievalMethod::WIFI(wifi) => Box::new(WifiAwareTransport::wifi_aware(
            wifi.clone(),
            role,
            medium,
            options,
        )),
    }
}

/// Build the reader's transport for a scanned engagement.
///
/// Only the first connection method is considered, even when the holder offers several.
pub fn for_engagement(
    device_engagement: &DeviceEngagement,
    medium: LoopbackMedium,
    options: TransportOptions,
) -> Result<Box<dyn MdocTransport>, TransportError> {
    let method = device_engagement.first_retrieval_method().ok_or_else(|| {
        TransportError::ConnectionFailed("the engagement offers no connection method".into())
    })?;
    if device_engagement
        .device_retrieval_methods
        .as_ref()
        .map_or(0, |m| m.len())
        > 1
    {
        tracing::debug!("using the first of several connection methods");
    }
    Ok(for_connection_method(
        method,
        Role::MdocReader,
        medium,
        options,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_from_json() {
        let options: TransportOptions =
            serde_json::from_str(r#"{"ble_mtu": 23, "connect_timeout_ms": 500}"#).unwrap();
        assert_eq!(options.ble_mtu, 23);
        assert_eq!(options.connect_timeout, Duration::from_millis(500));
        assert_eq!(options.scan_interval, Duration::from_millis(20));
        assert!(serde_json::from_str::<TransportOptions>(r#"{"mtu": 23}"#).is_err());
    }

    #[test]
    fn close_handle_is_shared() {
        let (state, _) = watch::channel(State::Connected);
        let handle = CloseHandle::new(Arc::new(state));
        let other = handle.clone();
        let mut closed = handle.subscribe();
        other.close();
        assert!(handle.is_closed());
        assert!(*closed.borrow_and_update());
        assert_eq!(*handle.state.borrow(), State::Disconnected);
    }
}
