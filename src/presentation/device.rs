//! The holder's side of a presentment.
//!
//! ```ignore
//! let transport = transport::for_connection_method(&method, Role::Mdoc, medium, options);
//! let holder = DevicePresentment::prepare(transport, Handover::QR, config).await?;
//! show_qr_code(holder.qr_code_uri());
//! let outcome = holder.run(&mut wallet).await;
//! ```
use tokio::sync::watch;

use super::{
    conclude, report_session_error, Outcome, PresentmentConfig, PresentmentError,
    RequestHandler, Termination, TerminationMethod,
};
use crate::definitions::device_engagement::DeviceEngagement;
use crate::definitions::helpers::NonEmptyVec;
use crate::definitions::session::{
    build_session_transcript, DeviceEngagementBytes, EphemeralKeyPair, Handover,
};
use crate::session::{get_e_reader_key, SessionEncryption, SessionError, Status};
use crate::transport::{CloseHandle, MdocTransport, State, TransportError};

/// A holder that has advertised its engagement and is waiting for a reader.
pub struct DevicePresentment {
    transport: Box<dyn MdocTransport>,
    config: PresentmentConfig,
    handover: Handover,
    device_engagement: DeviceEngagementBytes,
    /// Consumed once the reader's key arrives.
    e_device_key: Option<EphemeralKeyPair>,
    session: Option<SessionEncryption>,
}

impl DevicePresentment {
    /// Generate the ephemeral key, start advertising and build the engagement around the
    /// transport's connection method.
    pub async fn prepare(
        mut transport: Box<dyn MdocTransport>,
        handover: Handover,
        config: PresentmentConfig,
    ) -> Result<Self, PresentmentError> {
        let e_device_key = EphemeralKeyPair::generate();
        if let Err(e) = transport.advertise().await {
            tracing::error!("unable to advertise: {e}");
            transport.close().await;
            return Err(e.into());
        }
        let device_engagement = match DeviceEngagement::generate(
            &e_device_key.public_cose_key(),
            DeviceEngagement::VERSION,
            NonEmptyVec::new(transport.connection_method()),
        ) {
            Ok(device_engagement) => device_engagement,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };
        tracing::debug!(
            method = ?transport.connection_method(),
            "device engagement generated"
        );
        Ok(Self {
            transport,
            config,
            handover,
            device_engagement,
            e_device_key: Some(e_device_key),
            session: None,
        })
    }

    pub fn qr_code_uri(&self) -> String {
        self.device_engagement.to_qr_code_uri()
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

    /// Serve the reader until one of the two ends the session. The transport is closed when this
    /// returns.
    pub async fn run(mut self, handler: &mut impl RequestHandler) -> Outcome {
        let result = self.exchange(handler).await.map(|termination| {
            let (sent, received) = self.session.as_ref().map_or((0, 0), |session| {
                (session.messages_encrypted(), session.messages_decrypted())
            });
            (termination, sent, received)
        });
        conclude(self.transport.as_mut(), result).await
    }

    async fn exchange(
        &mut self,
        handler: &mut impl RequestHandler,
    ) -> Result<Termination, PresentmentError> {
        let first = tokio::time::timeout(
            self.config.exchange_timeout,
            self.first_exchange(handler),
        )
        .await
        .map_err(|_| PresentmentError::TimedOut)??;
        if let Some(termination) = first {
            return Ok(termination);
        }
        loop {
            let message = self.transport.wait_for_message().await?;
            if let Some(termination) = self.handle_message(message, handler).await? {
                return Ok(termination);
            }
        }
    }

    async fn first_exchange(
        &mut self,
        handler: &mut impl RequestHandler,
    ) -> Result<Option<Termination>, PresentmentError> {
        let e_device_key_bytes = self
            .device_engagement
            .as_ref()
            .security
            .e_device_key_bytes
            .clone();
        self.transport.open(&e_device_key_bytes).await?;
        let message = self.transport.wait_for_message().await?;
        self.handle_message(message, handler).await
    }

    async fn handle_message(
        &mut self,
        message: Vec<u8>,
        handler: &mut impl RequestHandler,
    ) -> Result<Option<Termination>, PresentmentError> {
        if message.is_empty() {
            tracing::info!("the reader ended the session at the transport level");
            return Ok(Some(Termination::PeerTransport));
        }
        let (request, status) = match self.decrypt(&message) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                report_session_error(self.transport.as_mut(), &e).await;
                return Err(e.into());
            }
        };
        match status {
            Some(Status::SessionTermination) => {
                tracing::info!("the reader terminated the session");
                return Ok(Some(Termination::PeerStatus));
            }
            Some(status) => return Err(PresentmentError::PeerError(status)),
            None => {}
        }
        let request = request.ok_or(PresentmentError::MissingData)?;
        tracing::debug!(len = request.len(), "request received");
        let response = handler.on_request(request).await;
        self.respond(&response).await
    }

    /// Decrypt a message from the reader, setting up the session from its first one.
    fn decrypt(
        &mut self,
        message: &[u8],
    ) -> Result<(Option<Vec<u8>>, Option<Status>), SessionError> {
        if self.session.is_none() {
            let e_reader_key = get_e_reader_key(message)?;
            let session_transcript_bytes = build_session_transcript(
                &self.device_engagement.inner_bytes,
                &e_reader_key.inner_bytes,
                self.handover.clone(),
            )?;
            let e_device_key = self
                .e_device_key
                .take()
                .ok_or(SessionError::EncryptionNotReady)?;
            self.session = Some(SessionEncryption::device(
                e_device_key,
                &e_reader_key,
                &session_transcript_bytes,
            )?);
        }
        let session = self
            .session
            .as_mut()
            .ok_or(SessionError::EncryptionNotReady)?;
        session.decrypt_message(message)
    }

    async fn respond(&mut self, response: &[u8]) -> Result<Option<Termination>, PresentmentError> {
        let session = self
            .session
            .as_mut()
            .ok_or(SessionError::EncryptionNotReady)?;
        if !self.config.auto_close {
            let message = session.encrypt_message(Some(response), None)?;
            self.transport.send_message(&message).await?;
            return Ok(None);
        }

        let method = self.config.termination;
        match method {
            TerminationMethod::EmbeddedStatus => {
                let message =
                    session.encrypt_message(Some(response), Some(Status::SessionTermination))?;
                self.transport.send_message(&message).await?;
            }
            TerminationMethod::SeparateMessage => {
                let message = session.encrypt_message(Some(response), None)?;
                let termination = session.encrypt_message(None, Some(Status::SessionTermination))?;
                self.transport.send_message(&message).await?;
                let sent = self.transport.send_message(&termination).await;
                if let Err(TransportError::PeerDisconnected) = sent {
                    // The reader may have ended the session as soon as it had the response.
                    if let Some(termination) = self.pending_termination()? {
                        return Ok(Some(termination));
                    }
                }
                sent?;
            }
            TerminationMethod::TransportSpecific => {
                let message = session.encrypt_message(Some(response), None)?;
                self.transport.send_message(&message).await?;
                self.transport.send_message(&[]).await?;
            }
        }
        Ok(Some(Termination::Initiated(method)))
    }

    /// How the reader ended the session, if it already has.
    fn pending_termination(&mut self) -> Result<Option<Termination>, PresentmentError> {
        let session = self
            .session
            .as_mut()
            .ok_or(SessionError::EncryptionNotReady)?;
        while let Some(message) = self.transport.try_take_message()? {
            if message.is_empty() {
                return Ok(Some(Termination::PeerTransport));
            }
            match session.decrypt_message(&message)? {
                (_, Some(Status::SessionTermination)) => return Ok(Some(Termination::PeerStatus)),
                (_, Some(status)) => return Err(PresentmentError::PeerError(status)),
                (_, None) => tracing::debug!("request after the final response dropped"),
            }
        }
        Ok(None)
    }
}
