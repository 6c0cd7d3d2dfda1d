//! The reader's side of a presentment.
//!
//! The reader knows both ephemeral keys as soon as it has scanned the engagement, so its session
//! is ready before the transport is even open.
use tokio::sync::watch;

use super::{
    conclude, report_session_error, Outcome, PresentmentConfig, PresentmentError,
    ResponseHandler, Termination, TerminationMethod,
};
use crate::definitions::device_engagement::DeviceEngagement;
use crate::definitions::helpers::Tag24;
use crate::definitions::session::{DeviceEngagementBytes, EphemeralKeyPair, Handover};
use crate::session::{SessionEncryption, Status};
use crate::transport::{self, CloseHandle, LoopbackMedium, MdocTransport, State, TransportError};

pub struct ReaderPresentment {
    transport: Box<dyn MdocTransport>,
    config: PresentmentConfig,
    device_engagement: DeviceEngagementBytes,
    session: SessionEncryption,
}

enum Event {
    Message(Vec<u8>),
    UserRequest(Option<Vec<u8>>),
}

impl ReaderPresentment {
    /// Start from a scanned `mdoc:` URI.
    pub fn from_qr_code(
        qr_code_uri: &str,
        medium: LoopbackMedium,
        config: PresentmentConfig,
    ) -> Result<Self, PresentmentError> {
        let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(qr_code_uri)?;
        Self::from_engagement(device_engagement, Handover::QR, medium, config)
    }

    /// Start from an engagement received some other way, e.g. an NFC handover.
    pub fn from_engagement(
        device_engagement: DeviceEngagementBytes,
        handover: Handover,
        medium: LoopbackMedium,
        config: PresentmentConfig,
    ) -> Result<Self, PresentmentError> {
        let transport = transport::for_engagement(
            device_engagement.as_ref(),
            medium,
            config.transport.clone(),
        )?;
        let session =
            SessionEncryption::reader(EphemeralKeyPair::generate(), &device_engagement, handover)?;
        Ok(Self {
            transport,
            config,
            device_engagement,
            session,
        })
    }

    pub fn device_engagement(&self) -> &DeviceEngagementBytes {
        &self.device_engagement
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.transport.close_handle()
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.transport.watch_state()
    }

    /// Send `initial_request` and keep the session going until one of the two ends it. The
    /// transport is closed when this returns.
    pub async fn run(
        mut self,
        initial_request: &[u8],
        handler: &mut impl ResponseHandler,
    ) -> Outcome {
        let result = self
            .exchange(initial_request, handler)
            .await
            .map(|termination| {
                (
                    termination,
                    self.session.messages_encrypted(),
                    self.session.messages_decrypted(),
                )
            });
        conclude(self.transport.as_mut(), result).await
    }

    async fn exchange(
        &mut self,
        initial_request: &[u8],
        handler: &mut impl ResponseHandler,
    ) -> Result<Termination, PresentmentError> {
        let first = tokio::time::timeout(
            self.config.exchange_timeout,
            self.first_exchange(initial_request, handler),
        )
        .await
        .map_err(|_| PresentmentError::TimedOut)??;
        if let Some(termination) = first {
            return Ok(termination);
        }

        loop {
            let event = tokio::select! {
                message = self.transport.wait_for_message() => Event::Message(message?),
                request = handler.next_request() => Event::UserRequest(request),
            };
            match event {
                Event::Message(message) => {
                    if let Some(termination) = self.handle_message(message, handler).await? {
                        return Ok(termination);
                    }
                }
                Event::UserRequest(Some(request)) => {
                    let message = self.session.encrypt_message(Some(&request), None)?;
                    self.transport.send_message(&message).await?;
                    tracing::debug!(len = request.len(), "follow-up request sent");
                }
                Event::UserRequest(None) => return self.terminate(handler).await,
            }
        }
    }

    async fn first_exchange(
        &mut self,
        initial_request: &[u8],
        handler: &mut impl ResponseHandler,
    ) -> Result<Option<Termination>, PresentmentError> {
        let e_device_key_bytes = self
            .device_engagement
            .as_ref()
            .security
            .e_device_key_bytes
            .clone();
        self.transport.open(&e_device_key_bytes).await?;
        let session_establishment = self.session.encrypt_message(Some(initial_request), None)?;
        self.transport.send_message(&session_establishment).await?;
        tracing::debug!(len = initial_request.len(), "request sent");
        let message = self.transport.wait_for_message().await?;
        self.handle_message(message, handler).await
    }

    async fn handle_message(
        &mut self,
        message: Vec<u8>,
        handler: &mut impl ResponseHandler,
    ) -> Result<Option<Termination>, PresentmentError> {
        if let Some(termination) = self.receive(message, handler).await? {
            return Ok(Some(termination));
        }
        if self.config.auto_close {
            return self.terminate(handler).await.map(Some);
        }
        Ok(None)
    }

    async fn receive(
        &mut self,
        message: Vec<u8>,
        handler: &mut impl ResponseHandler,
    ) -> Result<Option<Termination>, PresentmentError> {
        if message.is_empty() {
            tracing::info!("the holder ended the session at the transport level");
            return Ok(Some(Termination::PeerTransport));
        }
        let (response, status) = match self.session.decrypt_message(&message) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                report_session_error(self.transport.as_mut(), &e).await;
                return Err(e.into());
            }
        };
        if let Some(response) = response {
            tracing::debug!(len = response.len(), "response received");
            handler.on_response(response).await;
        }
        match status {
            Some(Status::SessionTermination) => {
                tracing::info!("the holder terminated the session");
                Ok(Some(Termination::PeerStatus))
            }
            Some(status) => Err(PresentmentError::PeerError(status)),
            None => Ok(None),
        }
    }

    /// Messages the holder sent before the reader chose to end the session, up to the first
    /// that ends it.
    async fn pending_termination(
        &mut self,
        handler: &mut impl ResponseHandler,
    ) -> Result<Option<Termination>, PresentmentError> {
        while let Some(message) = self.transport.try_take_message()? {
            if let Some(termination) = self.receive(message, handler).await? {
                return Ok(Some(termination));
            }
        }
        Ok(None)
    }

    /// The reader has no data left to send, so an embedded status goes out on its own too.
    ///
    /// A holder that already ended the session has its termination honoured instead, including
    /// one that left the link after sending it.
    async fn terminate(
        &mut self,
        handler: &mut impl ResponseHandler,
    ) -> Result<Termination, PresentmentError> {
        if let Some(termination) = self.pending_termination(handler).await? {
            return Ok(termination);
        }
        let method = self.config.termination;
        let sent = match method {
            TerminationMethod::EmbeddedStatus | TerminationMethod::SeparateMessage => {
                let message = self
                    .session
                    .encrypt_message(None, Some(Status::SessionTermination))?;
                self.transport.send_message(&message).await
            }
            TerminationMethod::TransportSpecific => self.transport.send_message(&[]).await,
        };
        if let Err(TransportError::PeerDisconnected) = sent {
            if let Some(termination) = self.pending_termination(handler).await? {
                return Ok(termination);
            }
        }
        sent?;
        Ok(Termination::Initiated(method))
    }
}
