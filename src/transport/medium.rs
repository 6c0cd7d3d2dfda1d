//! An in-process stand-in for the radio stacks.
//!
//! One side of a link listens at a [Rendezvous] (a GATT service UUID, an L2CAP PSM or an
//! identifier derived from the holder's key), the other side scans for it. When they meet, the
//! medium hands each of them one end of a bidirectional packet pipe.
//!
//! Beside the links, the medium carries short text notes under a UUID, standing in for the
//! side channel two devices can share before engagement.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::TransportError;

/// Where a listener waits to be found.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Rendezvous {
    /// A GATT service UUID.
    Gatt(Uuid),
    /// An L2CAP connection-oriented channel.
    L2cap(u16),
    /// An NFC tag presenting the given identifier.
    Nfc([u8; 16]),
    /// A Wi-Fi Aware service published under the given identifier.
    WifiAware([u8; 16]),
}

/// What travels over a link.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Packet(Vec<u8>),
    /// The transport-specific end of session: a GATT state write, an NFC deselect, a
    /// disconnect request.
    Terminate,
}

/// One end of an established link.
#[derive(Debug)]
pub(crate) struct LinkEndpoint {
    pub(crate) tx: mpsc::UnboundedSender<LinkEvent>,
    pub(crate) rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkEndpoint {
    fn pair() -> (LinkEndpoint, LinkEndpoint) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            LinkEndpoint { tx: a_tx, rx: b_rx },
            LinkEndpoint { tx: b_tx, rx: a_rx },
        )
    }
}

/// L2CAP LE dynamic PSMs start at 0x80.
const FIRST_DYNAMIC_PSM: u16 = 0x0080;

#[derive(Debug)]
struct MediumState {
    listeners: HashMap<Rendezvous, oneshot::Sender<LinkEndpoint>>,
    notes: HashMap<Uuid, String>,
    next_psm: u16,
}

/// A medium shared by every transport in the process. Cloning it shares the medium.
#[derive(Clone, Debug)]
pub struct LoopbackMedium {
    inner: Arc<Mutex<MediumState>>,
}

impl Default for LoopbackMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MediumState {
                listeners: HashMap::new(),
                notes: HashMap::new(),
                next_psm: FIRST_DYNAMIC_PSM,
            })),
        }
    }

    /// Start listening. The receiver resolves once a peer connects.
    pub(crate) fn listen(
        &self,
        at: Rendezvous,
    ) -> Result<oneshot::Receiver<LinkEndpoint>, TransportError> {
        let mut state = self.inner.lock();
        if let Some(existing) = state.listeners.get(&at) {
            if !existing.is_closed() {
                return Err(TransportError::ConnectionFailed(format!(
                    "{at:?} is already in use"
                )));
            }
        }
        let (tx, rx) = oneshot::channel();
        tracing::debug!(rendezvous = ?at, "listening");
        state.listeners.insert(at, tx);
        Ok(rx)
    }

    /// Connect to a listener, if one is there.
    pub(crate) fn try_connect(&self, at: &Rendezvous) -> Option<LinkEndpoint> {
        let listener = self.inner.lock().listeners.remove(at)?;
        let (listener_end, connector_end) = LinkEndpoint::pair();
        match listener.send(listener_end) {
            Ok(()) => {
                tracing::debug!(rendezvous = ?at, "peer found");
                Some(connector_end)
            }
            // The listener gave up before we arrived.
            Err(_) => None,
        }
    }

    pub(crate) fn stop_listening(&self, at: &Rendezvous) {
        self.inner.lock().listeners.remove(at);
    }

    pub(crate) fn allocate_psm(&self) -> u16 {
        let mut state = self.inner.lock();
        let psm = state.next_psm;
        state.next_psm = match psm.checked_add(1) {
            Some(next) => next,
            None => FIRST_DYNAMIC_PSM,
        };
        psm
    }

    /// Leave a note on the side channel, replacing any earlier one under `topic`.
    pub fn post_text(&self, topic: Uuid, text: String) {
        tracing::debug!(%topic, text = %text, "side channel note posted");
        self.inner.lock().notes.insert(topic, text);
    }

    pub fn read_text(&self, topic: &Uuid) -> Option<String> {
        self.inner.lock().notes.get(topic).cloned()
    }

    /// Whether anyone is listening at `at`.
    pub fn is_listening(&self, at: &Rendezvous) -> bool {
        self.inner
            .lock()
            .listeners
            .get(at)
            .map_or(false, |l| !l.is_closed())
    }
}
