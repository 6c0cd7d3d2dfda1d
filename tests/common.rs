use anyhow::{Context, Result};

use isomdl_proximity::definitions::device_engagement::{DeviceRetrievalMethod, EDeviceKeyBytes};
use isomdl_proximity::definitions::Handover;
use isomdl_proximity::presentation::device::DevicePresentment;
use isomdl_proximity::presentation::PresentmentConfig;
use isomdl_proximity::transport::{self, LoopbackMedium, MdocTransport, Role};

/// The ISO/IEC 18013-5:2021 Annex D engagement, as printed in the standard.
#[allow(dead_code)]
pub const ANNEX_D_QR_CODE: &str = "mdoc:owBjMS4wAYIB2BhYS6QBAiABIVggWojRgrzl9C76WZQ/MzWdAuipaP8onZPl+kRLYkNDFn/iJYILFujPhY3cdpBAe6YdTDOCNwqM/PPeaqZy/GClV6oy/GcCgYMCAaMA9AH1C1BF7+90KyxIN6kKOw4dBaaRBw==";

#[allow(dead_code)]
fn main() {}

/// A holder advertising `method`, ready to run.
#[allow(dead_code)]
pub async fn prepare_holder(
    method: &DeviceRetrievalMethod,
    medium: &LoopbackMedium,
    config: PresentmentConfig,
) -> Result<DevicePresentment> {
    let transport = transport::for_connection_method(
        method,
        Role::Mdoc,
        medium.clone(),
        config.transport.clone(),
    );
    DevicePresentment::prepare(transport, Handover::QR, config)
        .await
        .context("failed to prepare the holder")
}

/// The key bytes a holder's peers connect with.
#[allow(dead_code)]
pub fn e_device_key_bytes(holder: &DevicePresentment) -> EDeviceKeyBytes {
    holder
        .device_engagement()
        .as_ref()
        .security
        .e_device_key_bytes
        .clone()
}

/// A bare transport, for playing a peer that does not follow the protocol.
#[allow(dead_code)]
pub fn raw_transport(
    method: &DeviceRetrievalMethod,
    role: Role,
    medium: &LoopbackMedium,
) -> Box<dyn MdocTransport> {
    transport::for_connection_method(
        method,
        role,
        medium.clone(),
        PresentmentConfig::default().transport,
    )
}
