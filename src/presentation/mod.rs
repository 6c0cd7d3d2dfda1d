//! The holder and reader sides of a proximity presentment.
//!
//! Both sides are driven by a single task that owns the transport and the session encryption.
//! The application plugs in through [RequestHandler] (holder) and [ResponseHandler] (reader), and
//! learns how the presentment ended from the returned [Outcome]. Other tasks can stop a running
//! presentment through its [CloseHandle](crate::transport::CloseHandle).
pub mod device;
pub mod harness;
pub mod reader;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::definitions::device_engagement;
use crate::session::{SessionError, Status};
use crate::transport::{millis, MdocTransport, TransportError, TransportOptions};

/// How a party that decides to end the session tells its peer.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum TerminationMethod {
    /// Status 20 rides along with the last message that carries data.
    EmbeddedStatus,
    /// Status 20 is sent as a message of its own.
    SeparateMessage,
    /// The medium's own end of session, with nothing encrypted.
    TransportSpecific,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresentmentConfig {
    /// End the session after one request and response instead of waiting for more.
    pub auto_close: bool,
    pub termination: TerminationMethod,
    /// Bound on opening the transport plus the first request and response.
    #[serde(rename = "exchange_timeout_ms", with = "millis")]
    pub exchange_timeout: Duration,
    pub transport: TransportOptions,
}

impl Default for PresentmentConfig {
    fn default() -> Self {
        Self {
            auto_close: true,
            termination: TerminationMethod::EmbeddedStatus,
            exchange_timeout: Duration::from_secs(15),
            transport: TransportOptions::default(),
        }
    }
}

impl PresentmentConfig {
    pub fn from_json(json: &str) -> Result<Self, PresentmentError> {
        serde_json::from_str(json).map_err(|e| PresentmentError::Config(e.to_string()))
    }
}

/// Who ended the session, and how.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Termination {
    /// This side ended it.
    Initiated(TerminationMethod),
    /// The peer sent status 20.
    PeerStatus,
    /// The peer ended it at the transport level, or went away.
    PeerTransport,
}

/// How a presentment ended. Whatever the outcome, the transport is closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Completed {
        termination: Termination,
        messages_sent: u64,
        messages_received: u64,
    },
    /// The transport was closed from another task.
    Cancelled,
    /// The exchange did not complete within [PresentmentConfig::exchange_timeout].
    TimedOut,
    Failed(String),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresentmentError {
    #[error("invalid engagement: {0}")]
    Engagement(#[from] device_engagement::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("the peer reported: {0}")]
    PeerError(Status),
    #[error("the peer sent a message with no data")]
    MissingData,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("the exchange timed out")]
    TimedOut,
}

/// The holder's application: consent and response generation.
#[async_trait]
pub trait RequestHandler: Send {
    /// Answer one request. Returning an empty response declines it.
    async fn on_request(&mut self, request: Vec<u8>) -> Vec<u8>;
}

/// The reader's application.
#[async_trait]
pub trait ResponseHandler: Send {
    async fn on_response(&mut self, response: Vec<u8>);

    /// The next request the user wants to send, or `None` once they close the session.
    ///
    /// Only consulted when the session is not closed automatically. It may wait indefinitely;
    /// it is dropped whenever the peer speaks first, so it must be cancel safe.
    async fn next_request(&mut self) -> Option<Vec<u8>>;
}

/// Turn the result of an exchange into an [Outcome], closing the transport whatever happened.
async fn conclude(
    transport: &mut dyn MdocTransport,
    result: Result<(Termination, u64, u64), PresentmentError>,
) -> Outcome {
    let role = transport.role();
    transport.close().await;
    match result {
        Ok((termination, messages_sent, messages_received)) => {
            tracing::info!(%role, ?termination, messages_sent, messages_received, "session ended");
            Outcome::Completed {
                termination,
                messages_sent,
                messages_received,
            }
        }
        Err(PresentmentError::Transport(TransportError::Closed)) => {
            tracing::debug!(%role, "presentment cancelled");
            Outcome::Cancelled
        }
        Err(PresentmentError::TimedOut) => {
            tracing::warn!(%role, "presentment timed out");
            Outcome::TimedOut
        }
        Err(e) => {
            tracing::error!(%role, "presentment failed: {e}");
            Outcome::Failed(e.to_string())
        }
    }
}

/// Tell the peer why its message was refused, before giving up on the session.
async fn report_session_error(transport: &mut dyn MdocTransport, error: &SessionError) {
    let status = match error {
        SessionError::MalformedEnvelope(_) | SessionError::MissingReaderKey => {
            Status::CborDecodingError
        }
        _ => Status::SessionEncryptionError,
    };
    match crate::session::encode_status(status) {
        Ok(message) => {
            if let Err(e) = transport.send_message(&message).await {
                tracing::debug!("unable to report {status} to the peer: {e}");
            }
        }
        Err(e) => tracing::debug!("unable to encode {status}: {e}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_from_json() {
        let config = PresentmentConfig::from_json(
            r#"{
                "auto_close": false,
                "termination": "TransportSpecific",
                "exchange_timeout_ms": 2500,
                "transport": {"ble_use_l2cap": true}
            }"#,
        )
        .unwrap();
        assert!(!config.auto_close);
        assert_eq!(config.termination, TerminationMethod::TransportSpecific);
        assert_eq!(config.exchange_timeout, Duration::from_millis(2500));
        assert!(config.transport.ble_use_l2cap);
        assert_eq!(config.transport.ble_mtu, 515);
    }

    #[test]
    fn config_defaults() {
        let config = PresentmentConfig::from_json("{}").unwrap();
        assert_eq!(config, PresentmentConfig::default());
        assert_eq!(config.exchange_timeout, Duration::from_secs(15));
        assert!(matches!(
            PresentmentConfig::from_json(r#"{"timeout": 1}"#),
            Err(PresentmentError::Config(_))
        ));
    }
}
