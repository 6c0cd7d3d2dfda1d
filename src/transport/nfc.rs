//! NFC data transfer with ENVELOPE commands (ISO/IEC 7816-4, INS `0xC3`).
//!
//! The reader is always the NFC poller: it sends every message as a chain of ENVELOPE command
//! APDUs, and the holder answers with response APDUs chained by `61xx` status words. The tag
//! is found by the identifier derived from the holder's key.
use super::link::{Framing, LinkProfile, LinkTransport, Side};
use super::medium::{LoopbackMedium, Rendezvous};
use super::{Role, TransportError, TransportOptions};
use crate::definitions::device_engagement::{DeviceRetrievalMethod, NfcOptions};

pub type NfcTransport = LinkTransport<NfcProfile>;

const INS_ENVELOPE: u8 = 0xC3;
const CLA_LAST: u8 = 0x00;
const CLA_CHAINING: u8 = 0x10;

const SW_OK: [u8; 2] = [0x90, 0x00];
const SW1_MORE_DATA: u8 = 0x61;

pub struct NfcProfile {
    options: NfcOptions,
    command_data_length: usize,
}

impl NfcTransport {
    pub fn nfc(
        options: NfcOptions,
        role: Role,
        medium: LoopbackMedium,
        transport_options: TransportOptions,
    ) -> Self {
        let command_data_length = usize::from(
            options
                .max_len_command_data_field
                .get()
                .min(transport_options.nfc_command_data_length),
        )
        .max(1);
        LinkTransport::new(
            NfcProfile {
                options,
                command_data_length,
            },
            role,
            medium,
            transport_options,
        )
    }
}

impl LinkProfile for NfcProfile {
    type Framing = ApduFraming;

    fn connection_method(&self) -> DeviceRetrievalMethod {
        DeviceRetrievalMethod::NFC(self.options.clone())
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
        Ok((Rendezvous::Nfc(*ble_ident), side))
    }

    fn framing(&self, role: Role) -> ApduFraming {
        ApduFraming {
            role,
            command_data_length: self.command_data_length,
            response_data_length: self.options.max_len_response_data_field.get() as usize,
            buffer: Vec::new(),
        }
    }
}

/// Commands out and responses in for a reader, the other way around for a holder.
pub struct ApduFraming {
    role: Role,
    command_data_length: usize,
    response_data_length: usize,
    buffer: Vec<u8>,
}

fn serialize_l_c_len(len: usize) -> Vec<u8> {
    if len < 256 {
        (len as u8).to_be_bytes().to_vec()
    } else {
        [&[0x00], (len as u16).to_be_bytes().as_slice()].concat()
    }
}

impl ApduFraming {
    fn envelope(&self, chunk: &[u8], last: bool) -> Vec<u8> {
        let cla = if last { CLA_LAST } else { CLA_CHAINING };
        let l_c = serialize_l_c_len(chunk.len());
        // Le of zero: as much response data as the holder has.
        let l_e = if l_c.len() == 1 { vec![0x00] } else { vec![0x00, 0x00] };
        [vec![cla, INS_ENVELOPE, 0x00, 0x00], l_c, chunk.to_vec(), l_e].concat()
    }

    fn response(chunk: &[u8], remaining: usize) -> Vec<u8> {
        let sw = if remaining == 0 {
            SW_OK
        } else {
            [SW1_MORE_DATA, remaining.min(0xFF) as u8]
        };
        [chunk, sw.as_slice()].concat()
    }

    fn parse_envelope(command: &[u8]) -> Result<(bool, &[u8]), TransportError> {
        tracing::trace!("APDU: {command:02x?}");
        if command.len() < 5 {
            return Err(TransportError::Malformed("APDU is too short".into()));
        }
        let (cla, ins) = (command[0], command[1]);
        if ins != INS_ENVELOPE {
            return Err(TransportError::Malformed(format!(
                "expected ENVELOPE, got INS {ins:#04x}"
            )));
        }
        let (payload_len, l_c_len) = if command[4] == 0x00 && command.len() > 6 {
            // 3 byte L_c (first byte is 0x00)
            (usize::from(u16::from_be_bytes([command[5], command[6]])), 3)
        } else {
            (usize::from(command[4]), 1)
        };
        let payload = command
            .get(4 + l_c_len..4 + l_c_len + payload_len)
            .ok_or_else(|| TransportError::Malformed("APDU shorter than its Lc".into()))?;
        Ok((cla & CLA_CHAINING != 0, payload))
    }

    fn parse_response(response: &[u8]) -> Result<(bool, &[u8]), TransportError> {
        let Some((payload, sw)) = response.split_last_chunk::<2>() else {
            return Err(TransportError::Malformed("response APDU is too short".into()));
        };
        match *sw {
            SW_OK => Ok((false, payload)),
            [SW1_MORE_DATA, _] => Ok((true, payload)),
            [sw1, sw2] => Err(TransportError::Malformed(format!(
                "unexpected status word {sw1:02x}{sw2:02x}"
            ))),
        }
    }
}

impl Framing for ApduFraming {
    fn frame(&self, message: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        match self.role {
            Role::MdocReader => {
                let chunks: Vec<&[u8]> = message.chunks(self.command_data_length).collect();
                let last = chunks.len().saturating_sub(1);
                Ok(chunks
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| self.envelope(chunk, i == last))
                    .collect())
            }
            Role::Mdoc => {
                let chunk_size = self.response_data_length.max(1);
                let mut sent = 0;
                Ok(message
                    .chunks(chunk_size)
                    .map(|chunk| {
                        sent += chunk.len();
                        Self::response(chunk, message.len() - sent)
                    })
                    .collect())
            }
        }
    }

    fn reassemble(&mut self, packet: Vec<u8>) -> Result<Option<Vec<u8>>, TransportError> {
        let parsed = match self.role {
            Role::Mdoc => Self::parse_envelope(&packet),
            Role::MdocReader => Self::parse_response(&packet),
        };
        let (more, payload) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.buffer.clear();
                return Err(e);
            }
        };
        self.buffer.extend_from_slice(payload);
        if more {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }
}
