//! Wi-Fi Aware: the holder publishes a service named after the identifier derived from its key,
//! the reader subscribes to it and opens a stream. Messages on the stream are prefixed with
//! their length as a 4-byte big-endian integer.
use super::link::{Framing, LinkProfile, LinkTransport, Side};
use super::medium::{LoopbackMedium, Rendezvous};
use super::{Role, TransportError, TransportOptions};
use crate::definitions::device_engagement::{DeviceRetrievalMethod, WifiOptions};

pub type WifiAwareTransport = LinkTransport<WifiAwareProfile>;

const LENGTH_PREFIX: usize = 4;

pub struct WifiAwareProfile {
    options: WifiOptions,
}

impl WifiAwareTransport {
    pub fn wifi_aware(
        options: WifiOptions,
        role: Role,
        medium: LoopbackMedium,
        transport_options: TransportOptions,
    ) -> Self {
        LinkTransport::new(WifiAwareProfile { options }, role, medium, transport_options)
    }
}

impl LinkProfile for WifiAwareProfile {
    type Framing = LengthPrefixed;

    fn connection_method(&self) -> DeviceRetrievalMethod {
        DeviceRetrievalMethod::WIFI(self.options.clone())
    }

    fn rendezvous(
        &self,
        role: Role,
        ble_ident: &[u8; 16],
    ) -> Result<(Rendezvous, Side), TransportError> {
        let side = match role {
            Role::Mdoc => Side::Listen,
            Role::MdocReader => Side::Connect,
        };
        Ok((Rendezvous::WifiAware(*ble_ident), side))
    }

    fn framing(&self, _role: Role) -> LengthPrefixed {
        LengthPrefixed::default()
    }
}

/// A byte stream cut into messages by length prefixes. A message may arrive split over several
/// packets.
#[derive(Default)]
pub struct LengthPrefixed {
    buffer: Vec<u8>,
}

impl Framing for LengthPrefixed {
    fn frame(&self, message: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        let len = u32::try_from(message.len())
            .map_err(|_| TransportError::Malformed("message too large".into()))?;
        Ok(vec![[len.to_be_bytes().as_slice(), message].concat()])
    }

    fn reassemble(&mut self, packet: Vec<u8>) -> Result<Option<Vec<u8>>, TransportError> {
        self.buffer.extend_from_slice(&packet);
        let Some(prefix) = self.buffer.first_chunk::<LENGTH_PREFIX>() else {
            return Ok(None);
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        let message = self.buffer[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec();
        self.buffer.drain(..LENGTH_PREFIX + len);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_is_big_endian() {
        let framing = LengthPrefixed::default();
        assert_eq!(
            framing.frame(&[0xaa; 3]).unwrap(),
            vec![vec![0, 0, 0, 3, 0xaa, 0xaa, 0xaa]]
        );
    }

    #[test]
    fn split_packets_are_joined() {
        let mut framing = LengthPrefixed::default();
        assert_eq!(framing.reassemble(vec![0, 0]).unwrap(), None);
        assert_eq!(framing.reassemble(vec![0, 2, 1]).unwrap(), None);
        assert_eq!(framing.reassemble(vec![2]).unwrap(), Some(vec![1, 2]));
        assert!(framing.buffer.is_empty());
    }
}
