//! Runs a holder and a reader against each other over a [LoopbackMedium], through every way a
//! session can end, and keeps score.
use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::Instrument;
use uuid::Uuid;

use super::device::DevicePresentment;
use super::reader::ReaderPresentment;
use super::{
    Outcome, PresentmentConfig, RequestHandler, ResponseHandler, Termination, TerminationMethod,
};
use crate::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod, NfcOptions, PeripheralServerMode,
    WifiOptions,
};
use crate::definitions::session::Handover;
use crate::transport::{self, LoopbackMedium, Role};

/// The four ways a session is brought to an end.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum TerminationVariant {
    /// The holder puts status 20 on its response.
    EmbeddedStatus,
    /// The holder sends status 20 after its response.
    SeparateMessage,
    /// The holder ends the session at the transport level after its response.
    TransportSpecific,
    /// The reader ends the session while the holder waits for another request.
    PeerInitiated,
}

/// The media a scenario can run over.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum MediumKind {
    BleCentralClient,
    BlePeripheralServer,
    BleL2cap,
    /// L2CAP with the PSM passed on the side channel rather than in the engagement.
    BleL2capSideChannel,
    Nfc,
    WifiAware,
}

/// What each side should report once a scenario is over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expectation {
    pub holder: Outcome,
    pub reader: Outcome,
}

fn completed(termination: Termination, messages_sent: u64, messages_received: u64) -> Outcome {
    Outcome::Completed {
        termination,
        messages_sent,
        messages_received,
    }
}

impl TerminationVariant {
    pub fn holder_config(self, base: &PresentmentConfig) -> PresentmentConfig {
        let (auto_close, termination) = match self {
            TerminationVariant::EmbeddedStatus => (true, TerminationMethod::EmbeddedStatus),
            TerminationVariant::SeparateMessage => (true, TerminationMethod::SeparateMessage),
            TerminationVariant::TransportSpecific => (true, TerminationMethod::TransportSpecific),
            TerminationVariant::PeerInitiated => (false, base.termination),
        };
        PresentmentConfig {
            auto_close,
            termination,
            ..base.clone()
        }
    }

    pub fn reader_config(self, base: &PresentmentConfig) -> PresentmentConfig {
        let (auto_close, termination) = match self {
            TerminationVariant::PeerInitiated => (true, TerminationMethod::SeparateMessage),
            TerminationVariant::EmbeddedStatus
            | TerminationVariant::SeparateMessage
            | TerminationVariant::TransportSpecific => (false, base.termination),
        };
        PresentmentConfig {
            auto_close,
            termination,
            ..base.clone()
        }
    }

    pub fn expectation(self) -> Expectation {
        use Termination::*;
        match self {
            TerminationVariant::EmbeddedStatus => Expectation {
                holder: completed(Initiated(TerminationMethod::EmbeddedStatus), 1, 1),
                reader: completed(PeerStatus, 1, 1),
            },
            TerminationVariant::SeparateMessage => Expectation {
                holder: completed(Initiated(TerminationMethod::SeparateMessage), 2, 1),
                reader: completed(PeerStatus, 1, 2),
            },
            TerminationVariant::TransportSpecific => Expectation {
                holder: completed(Initiated(TerminationMethod::TransportSpecific), 1, 1),
                reader: completed(PeerTransport, 1, 1),
            },
            TerminationVariant::PeerInitiated => Expectation {
                holder: completed(PeerStatus, 1, 2),
                reader: completed(Initiated(TerminationMethod::SeparateMessage), 2, 1),
            },
        }
    }
}

impl MediumKind {
    /// The connection method a holder offers for this medium. Every call yields fresh UUIDs.
    pub fn connection_method(self) -> DeviceRetrievalMethod {
        match self {
            MediumKind::BleCentralClient => DeviceRetrievalMethod::BLE(BleOptions {
                peripheral_server_mode: None,
                central_client_mode: Some(CentralClientMode {
                    uuid: Uuid::new_v4(),
                }),
                psm: None,
            }),
            MediumKind::BlePeripheralServer
            | MediumKind::BleL2cap
            | MediumKind::BleL2capSideChannel => {
                DeviceRetrievalMethod::BLE(BleOptions {
                    peripheral_server_mode: Some(PeripheralServerMode {
                        uuid: Uuid::new_v4(),
                        ble_device_address: None,
                    }),
                    central_client_mode: None,
                    psm: None,
                })
            }
            MediumKind::Nfc => DeviceRetrievalMethod::NFC(NfcOptions::default()),
            MediumKind::WifiAware => DeviceRetrievalMethod::WIFI(WifiOptions::default()),
        }
    }

    fn configure(self, config: PresentmentConfig) -> PresentmentConfig {
        let mut config = config;
        config.transport.ble_use_l2cap =
            matches!(self, MediumKind::BleL2cap | MediumKind::BleL2capSideChannel);
        config.transport.ble_psm_side_channel = self == MediumKind::BleL2capSideChannel;
        config
    }
}

/// A holder that answers every request with a canned response.
#[derive(Debug, Default)]
pub struct EchoResponder {
    pub requests: Vec<Vec<u8>>,
}

#[async_trait]
impl RequestHandler for EchoResponder {
    async fn on_request(&mut self, request: Vec<u8>) -> Vec<u8> {
        let response = [b"response to ".as_slice(), &request].concat();
        self.requests.push(request);
        response
    }
}

/// A reader user who sends a fixed list of follow-up requests, each once the previous response
/// has arrived.
#[derive(Debug, Default)]
pub struct ScriptedReader {
    pub responses: Vec<Vec<u8>>,
    pub follow_ups: VecDeque<Vec<u8>>,
    /// Close once the follow-ups run out, rather than waiting for the holder to.
    pub close_when_done: bool,
    awaiting_response: bool,
}

impl ScriptedReader {
    pub fn new(follow_ups: impl IntoIterator<Item = Vec<u8>>, close_when_done: bool) -> Self {
        Self {
            follow_ups: follow_ups.into_iter().collect(),
            close_when_done,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ResponseHandler for ScriptedReader {
    async fn on_response(&mut self, response: Vec<u8>) {
        self.awaiting_response = false;
        self.responses.push(response);
    }

    async fn next_request(&mut self) -> Option<Vec<u8>> {
        if !self.awaiting_response {
            if let Some(request) = self.follow_ups.pop_front() {
                self.awaiting_response = true;
                return Some(request);
            }
            if self.close_when_done {
                return None;
            }
        }
        std::future::pending().await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioReport {
    pub variant: TerminationVariant,
    pub medium: MediumKind,
    pub holder: Outcome,
    pub reader: Outcome,
}

impl ScenarioReport {
    pub fn succeeded(&self) -> bool {
        let expected = self.variant.expectation();
        self.holder == expected.holder && self.reader == expected.reader
    }
}

pub const REQUEST: &[u8] = b"DeviceRequest";

/// Run one holder and one reader to the end of a session.
pub async fn run_scenario(
    variant: TerminationVariant,
    medium_kind: MediumKind,
    config: &PresentmentConfig,
) -> ScenarioReport {
    let span = tracing::info_span!("scenario", %variant, medium = %medium_kind);
    scenario(variant, medium_kind, config).instrument(span).await
}

async fn scenario(
    variant: TerminationVariant,
    medium_kind: MediumKind,
    config: &PresentmentConfig,
) -> ScenarioReport {
    let medium = LoopbackMedium::new();
    let holder_config = medium_kind.configure(variant.holder_config(config));
    let reader_config = medium_kind.configure(variant.reader_config(config));

    let failed = |e: &dyn std::fmt::Display| ScenarioReport {
        variant,
        medium: medium_kind,
        holder: Outcome::Failed(e.to_string()),
        reader: Outcome::Failed(e.to_string()),
    };

    let holder_transport = transport::for_connection_method(
        &medium_kind.connection_method(),
        Role::Mdoc,
        medium.clone(),
        holder_config.transport.clone(),
    );
    let holder =
        match DevicePresentment::prepare(holder_transport, Handover::QR, holder_config).await {
            Ok(holder) => holder,
            Err(e) => return failed(&e),
        };
    let reader = match ReaderPresentment::from_qr_code(&holder.qr_code_uri(), medium, reader_config)
    {
        Ok(reader) => reader,
        Err(e) => return failed(&e),
    };

    let holder_task = tokio::spawn(
        async move {
            let mut responder = EchoResponder::default();
            holder.run(&mut responder).await
        }
        .in_current_span(),
    );
    let reader_task = tokio::spawn(
        async move {
            let mut user = ScriptedReader::default();
            reader.run(REQUEST, &mut user).await
        }
        .in_current_span(),
    );
    let (holder, reader) = tokio::join!(holder_task, reader_task);
    let report = ScenarioReport {
        variant,
        medium: medium_kind,
        holder: holder.unwrap_or_else(|e| Outcome::Failed(e.to_string())),
        reader: reader.unwrap_or_else(|e| Outcome::Failed(e.to_string())),
    };
    if !report.succeeded() {
        tracing::warn!(?report, "scenario did not end as expected");
    }
    report
}

/// Aggregate results over many scenarios.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancellations: u64,
}

impl Statistics {
    pub fn record(&mut self, report: &ScenarioReport) {
        self.attempts += 1;
        let outcomes = [&report.holder, &report.reader];
        if report.succeeded() {
            self.successes += 1;
        } else if outcomes.contains(&&Outcome::TimedOut) {
            self.timeouts += 1;
        } else if outcomes.contains(&&Outcome::Cancelled) {
            self.cancellations += 1;
        } else {
            self.failures += 1;
        }
    }
}

/// Run every termination variant over every given medium, `iterations` times.
pub async fn run_matrix(
    iterations: usize,
    media: &[MediumKind],
    config: &PresentmentConfig,
) -> Statistics {
    let mut statistics = Statistics::default();
    for _ in 0..iterations {
        for medium in media {
            for variant in TerminationVariant::iter() {
                let report = run_scenario(variant, *medium, config).await;
                statistics.record(&report);
            }
        }
    }
    tracing::info!(?statistics, "matrix finished");
    statistics
}
