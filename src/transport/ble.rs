//! Bluetooth Low Energy, as a GATT link in either mode or as an L2CAP channel.
//!
//! In peripheral server mode the holder hosts the GATT service and the reader scans for it; in
//! central client mode the roles are swapped. Messages are written to the `Client2Server` and
//! `Server2Client` characteristics in chunks of at most `mtu - 3` bytes, the first of which
//! says whether more chunks follow. An L2CAP channel carries whole messages.
//!
//! The holder's L2CAP PSM reaches the reader either in the engagement or, before engagement, as
//! a text note on the medium's side channel under the BLE service UUID.
use uuid::Uuid;

use super::link::{Framing, LinkProfile, LinkTransport, Side};
use super::medium::{LoopbackMedium, Rendezvous};
use super::{Role, TransportError, TransportOptions};
use crate::definitions::device_engagement::{BleOptions, DeviceRetrievalMethod};

pub type BleTransport = LinkTransport<BleProfile>;

/// ATT header size subtracted from the MTU of every write or notification.
const ATT_HEADER: usize = 3;
/// The smallest MTU BLE allows.
const MIN_MTU: usize = 23;

const MORE_DATA: u8 = 0x01;
const LAST_CHUNK: u8 = 0x00;

/// Which of the ways offered in [BleOptions] a link uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BleMode {
    PeripheralServer,
    CentralClient,
    L2cap(u16),
}

pub struct BleProfile {
    options: BleOptions,
    mtu: usize,
    use_l2cap: bool,
    psm_side_channel: bool,
    /// A PSM the holder announced on the side channel and so kept out of its engagement.
    announced_psm: Option<u16>,
}

impl BleTransport {
    pub fn ble(
        options: BleOptions,
        role: Role,
        medium: LoopbackMedium,
        transport_options: TransportOptions,
    ) -> Self {
        let profile = BleProfile {
            options,
            mtu: transport_options.ble_mtu.max(MIN_MTU),
            use_l2cap: transport_options.ble_use_l2cap,
            psm_side_channel: transport_options.ble_psm_side_channel,
            announced_psm: None,
        };
        LinkTransport::new(profile, role, medium, transport_options)
    }
}

impl BleProfile {
    /// An L2CAP PSM wins over GATT, and central client mode over peripheral server mode.
    pub fn mode(&self) -> Result<BleMode, TransportError> {
        if let Some(psm) = self.options.psm.or(self.announced_psm) {
            return Ok(BleMode::L2cap(psm));
        }
        if self.options.central_client_mode.is_some() {
            return Ok(BleMode::CentralClient);
        }
        if self.options.peripheral_server_mode.is_some() {
            return Ok(BleMode::PeripheralServer);
        }
        Err(TransportError::ConnectionFailed(
            "the BLE options offer no usable mode".into(),
        ))
    }

    fn service_uuid(&self) -> Result<Uuid, TransportError> {
        self.options
            .central_client_mode
            .as_ref()
            .map(|mode| mode.uuid)
            .or_else(|| {
                self.options
                    .peripheral_server_mode
                    .as_ref()
                    .map(|mode| mode.uuid)
            })
            .ok_or_else(|| TransportError::ConnectionFailed("missing UUID".into()))
    }

    fn set_psm(&mut self, psm: u16) -> Result<(), TransportError> {
        self.options
            .set_psm(psm)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }
}

impl LinkProfile for BleProfile {
    type Framing = BleFraming;

    fn connection_method(&self) -> DeviceRetrievalMethod {
        DeviceRetrievalMethod::BLE(self.options.clone())
    }

    fn prepare(&mut self, role: Role, medium: &LoopbackMedium) -> Result<(), TransportError> {
        let has_psm = self.options.psm.or(self.announced_psm).is_some();
        match role {
            Role::Mdoc if self.use_l2cap && !has_psm => {
                let psm = medium.allocate_psm();
                if self.psm_side_channel {
                    medium.post_text(self.service_uuid()?, psm.to_string());
                    self.announced_psm = Some(psm);
                    tracing::debug!(psm, "L2CAP channel reserved and announced");
                } else {
                    self.set_psm(psm)?;
                    tracing::debug!(psm, "L2CAP channel reserved");
                }
            }
            Role::MdocReader if self.psm_side_channel && !has_psm => {
                if let Some(text) = medium.read_text(&self.service_uuid()?) {
                    let psm = text.trim().parse::<u16>().map_err(|_| {
                        TransportError::Malformed(format!("{text:?} is not a PSM"))
                    })?;
                    self.set_psm(psm)?;
                    tracing::debug!(psm, "L2CAP PSM read from the side channel");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn rendezvous(
        &self,
        role: Role,
        _ble_ident: &[u8; 16],
    ) -> Result<(Rendezvous, Side), TransportError> {
        let holder_listens = match role {
            Role::Mdoc => Side::Listen,
            Role::MdocReader => Side::Connect,
        };
        match self.mode()? {
            BleMode::L2cap(psm) => Ok((Rendezvous::L2cap(psm), holder_listens)),
            BleMode::PeripheralServer => {
                let uuid = self
                    .options
                    .peripheral_server_mode
                    .as_ref()
                    .map(|mode| mode.uuid)
                    .ok_or_else(|| TransportError::ConnectionFailed("missing UUID".into()))?;
                Ok((Rendezvous::Gatt(uuid), holder_listens))
            }
            BleMode::CentralClient => {
                let uuid = self
                    .options
                    .central_client_mode
                    .as_ref()
                    .map(|mode| mode.uuid)
                    .ok_or_else(|| TransportError::ConnectionFailed("missing UUID".into()))?;
                let reader_listens = match role {
                    Role::Mdoc => Side::Connect,
                    Role::MdocReader => Side::Listen,
                };
                Ok((Rendezvous::Gatt(uuid), reader_listens))
            }
        }
    }

    fn framing(&self, _role: Role) -> BleFraming {
        match self.mode() {
            Ok(BleMode::L2cap(_)) => BleFraming::L2cap,
            _ => BleFraming::Gatt(GattFraming::new(self.mtu)),
        }
    }
}

pub enum BleFraming {
    Gatt(GattFraming),
    L2cap,
}

/// Chunking over GATT characteristic writes.
pub struct GattFraming {
    mtu: usize,
    buffer: Vec<u8>,
}

impl GattFraming {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            buffer: Vec::new(),
        }
    }

    fn max_chunk_size(&self) -> usize {
        (self.mtu.saturating_sub(ATT_HEADER + 1)).max(1)
    }
}

impl Framing for GattFraming {
    fn frame(&self, message: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        let chunks: Vec<&[u8]> = message.chunks(self.max_chunk_size()).collect();
        let last = chunks.len().saturating_sub(1);
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut packet = Vec::with_capacity(chunk.len() + 1);
                packet.push(if i == last { LAST_CHUNK } else { MORE_DATA });
                packet.extend_from_slice(chunk);
                packet
            })
            .collect())
    }

    fn reassemble(&mut self, packet: Vec<u8>) -> Result<Option<Vec<u8>>, TransportError> {
        let Some((&header, chunk)) = packet.split_first() else {
            return Err(TransportError::Malformed("empty GATT write".into()));
        };
        if packet.len() > self.mtu.saturating_sub(ATT_HEADER) {
            return Err(TransportError::Malformed(format!(
                "GATT write of {} bytes exceeds the MTU of {}",
                packet.len(),
                self.mtu
            )));
        }
        self.buffer.extend_from_slice(chunk);
        match header {
            MORE_DATA => Ok(None),
            LAST_CHUNK => Ok(Some(std::mem::take(&mut self.buffer))),
            other => {
                self.buffer.clear();
                Err(TransportError::Malformed(format!(
                    "unexpected GATT chunk header {other:#04x}"
                )))
            }
        }
    }
}

impl Framing for BleFraming {
    fn frame(&self, message: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        match self {
            BleFraming::Gatt(gatt) => gatt.frame(message),
            BleFraming::L2cap => Ok(vec![message.to_vec()]),
        }
    }

    fn reassemble(&mut self, packet: Vec<u8>) -> Result<Option<Vec<u8>>, TransportError> {
        match self {
            BleFraming::Gatt(gatt) => gatt.reassemble(packet),
            BleFraming::L2cap => Ok(Some(packet)),
        }
    }
}
