use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tokio::time::Instant;

use super::medium::{LinkEndpoint, LinkEvent, LoopbackMedium, Rendezvous};
use super::{CloseHandle, MdocTransport, Role, State, TransportError, TransportOptions};
use crate::definitions::device_engagement::{DeviceRetrievalMethod, EDeviceKeyBytes};
use crate::definitions::session::calculate_ble_ident;

/// Splits messages into the packets a medium carries, and puts them back together.
pub trait Framing: Send {
    fn frame(&self, message: &[u8]) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Feed one packet; yields a message once its last packet has arrived.
    fn reassemble(&mut self, packet: Vec<u8>) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Resolves once the transport is closed, including when that happened before the call.
async fn until_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Whether a party waits to be found or goes looking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Listen,
    Connect,
}

/// Everything that differs between media.
pub trait LinkProfile: Send + 'static {
    type Framing: Framing;

    fn connection_method(&self) -> DeviceRetrievalMethod;

    /// Called before the link is opened, for anything a holder must reserve up front.
    fn prepare(&mut self, _role: Role, _medium: &LoopbackMedium) -> Result<(), TransportError> {
        Ok(())
    }

    fn rendezvous(
        &self,
        role: Role,
        ble_ident: &[u8; 16],
    ) -> Result<(Rendezvous, Side), TransportError>;

    fn framing(&self, role: Role) -> Self::Framing;
}

/// A [MdocTransport] over the [LoopbackMedium], specialised by a [LinkProfile].
pub struct LinkTransport<P: LinkProfile> {
    role: Role,
    profile: P,
    medium: LoopbackMedium,
    options: TransportOptions,
    state: Arc<watch::Sender<State>>,
    close_handle: CloseHandle,
    listening: Option<Rendezvous>,
    link: Option<LinkEndpoint>,
    framing: Option<P::Framing>,
    scanning_time: Option<Duration>,
}

impl<P: LinkProfile> LinkTransport<P> {
    pub(crate) fn new(
        profile: P,
        role: Role,
        medium: LoopbackMedium,
        options: TransportOptions,
    ) -> Self {
        let state = Arc::new(watch::Sender::new(State::Idle));
        let close_handle = CloseHandle::new(state.clone());
        Self {
            role,
            profile,
            medium,
            options,
            state,
            close_handle,
            listening: None,
            link: None,
            framing: None,
            scanning_time: None,
        }
    }

    /// Once closed, the only state a transport publishes is `Disconnected`.
    fn set_state(&self, state: State) {
        self.state.send_if_modified(|current| {
            if *current == state || (self.close_handle.is_closed() && state != State::Disconnected)
            {
                return false;
            }
            tracing::debug!(role = %self.role, "transport {current} -> {state}");
            *current = state;
            true
        });
    }

    fn check_not_closed(&self) -> Result<(), TransportError> {
        if self.close_handle.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn accept(&mut self, at: Rendezvous) -> Result<LinkEndpoint, TransportError> {
        self.set_state(State::Advertising);
        let incoming = self.medium.listen(at.clone())?;
        self.listening = Some(at.clone());
        let closed = self.close_handle.subscribe();

        let result = tokio::select! {
            accepted = tokio::time::timeout(self.options.connect_timeout, incoming) => match accepted {
                Ok(Ok(endpoint)) => Ok(endpoint),
                Ok(Err(_)) => Err(TransportError::ConnectionFailed("the medium went away".into())),
                Err(_) => Err(TransportError::ConnectionTimeout),
            },
            _ = until_closed(closed) => Err(TransportError::Closed),
        };
        self.medium.stop_listening(&at);
        self.listening = None;
        result
    }

    async fn connect(&mut self, at: Rendezvous) -> Result<LinkEndpoint, TransportError> {
        self.set_state(State::Scanning);
        let started = Instant::now();
        loop {
            if let Some(endpoint) = self.medium.try_connect(&at) {
                self.scanning_time = Some(started.elapsed());
                return Ok(endpoint);
            }
            if started.elapsed() >= self.options.connect_timeout {
                return Err(TransportError::ConnectionTimeout);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.scan_interval) => {}
                _ = until_closed(self.close_handle.subscribe()) => return Err(TransportError::Closed),
            }
        }
    }
}

#[async_trait]
impl<P: LinkProfile> MdocTransport for LinkTransport<P> {
    fn role(&self) -> Role {
        self.role
    }

    fn connection_method(&self) -> DeviceRetrievalMethod {
        self.profile.connection_method()
    }

    fn state(&self) -> State {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    fn scanning_time(&self) -> Option<Duration> {
        self.scanning_time
    }

    fn close_handle(&self) -> CloseHandle {
        self.close_handle.clone()
    }

    async fn advertise(&mut self) -> Result<(), TransportError> {
        self.check_not_closed()?;
        match self.state() {
            State::Idle => {}
            State::Advertising => return Ok(()),
            state => return Err(TransportError::InvalidState(state)),
        }
        self.profile.prepare(self.role, &self.medium)?;
        self.set_state(State::Advertising);
        Ok(())
    }

    async fn open(&mut self, e_device_key_bytes: &EDeviceKeyBytes) -> Result<(), TransportError> {
        self.check_not_closed()?;
        match self.state() {
            State::Idle | State::Advertising => {}
            state => return Err(TransportError::InvalidState(state)),
        }
        self.profile.prepare(self.role, &self.medium)?;
        let ble_ident = calculate_ble_ident(e_device_key_bytes)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (at, side) = self.profile.rendezvous(self.role, &ble_ident)?;

        let endpoint = match side {
            Side::Listen => self.accept(at).await?,
            Side::Connect => self.connect(at).await?,
        };
        self.set_state(State::Connecting);
        self.framing = Some(self.profile.framing(self.role));
        self.link = Some(endpoint);
        self.set_state(State::Connected);
        Ok(())
    }

    async fn send_message(&mut self, message: &[u8]) -> Result<(), TransportError> {
        self.check_not_closed()?;
        let (Some(link), Some(framing)) = (self.link.as_ref(), self.framing.as_ref()) else {
            return Err(TransportError::InvalidState(self.state()));
        };
        if message.is_empty() {
            tracing::debug!(role = %self.role, "sending transport-specific termination");
            // The peer may already be gone, in which case it has nothing left to terminate.
            let _ = link.tx.send(LinkEvent::Terminate);
            return Ok(());
        }
        for packet in framing.frame(message)? {
            link.tx
                .send(LinkEvent::Packet(packet))
                .map_err(|_| TransportError::PeerDisconnected)?;
        }
        self.set_state(State::DataTransfer);
        Ok(())
    }

    async fn wait_for_message(&mut self) -> Result<Vec<u8>, TransportError> {
        self.check_not_closed()?;
        loop {
            let state = self.state();
            let (Some(link), Some(framing)) = (self.link.as_mut(), self.framing.as_mut()) else {
                return Err(TransportError::InvalidState(state));
            };
            let event = tokio::select! {
                event = link.rx.recv() => event,
                _ = until_closed(self.close_handle.subscribe()) => return Err(TransportError::Closed),
            };
            match event {
                Some(LinkEvent::Packet(packet)) => {
                    if let Some(message) = framing.reassemble(packet)? {
                        self.set_state(State::DataTransfer);
                        return Ok(message);
                    }
                }
                Some(LinkEvent::Terminate) => {
                    tracing::debug!(role = %self.role, "peer terminated the transport");
                    return Ok(vec![]);
                }
                None => {
                    tracing::debug!(role = %self.role, "peer disconnected");
                    return Ok(vec![]);
                }
            }
        }
    }

    fn try_take_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.check_not_closed()?;
        loop {
            let state = self.state();
            let (Some(link), Some(framing)) = (self.link.as_mut(), self.framing.as_mut()) else {
                return Err(TransportError::InvalidState(state));
            };
            match link.rx.try_recv() {
                Ok(LinkEvent::Packet(packet)) => {
                    if let Some(message) = framing.reassemble(packet)? {
                        self.set_state(State::DataTransfer);
                        return Ok(Some(message));
                    }
                }
                Ok(LinkEvent::Terminate) | Err(TryRecvError::Disconnected) => {
                    tracing::debug!(role = %self.role, "peer already ended the transport");
                    return Ok(Some(vec![]));
                }
                Err(TryRecvError::Empty) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.close_handle.close();
        if let Some(at) = self.listening.take() {
            self.medium.stop_listening(&at);
        }
        if self.link.take().is_some() {
            tracing::debug!(role = %self.role, "link released");
        }
        self.framing = None;
        self.set_state(State::Disconnected);
    }
}
