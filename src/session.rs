//! The session encryption envelope.
//!
//! A [SessionEncryption] owns one side of an established session: the two directional keys and
//! the two message counters. The reader can build one as soon as it has scanned the engagement;
//! the holder has to wait for the reader's first message, see [get_e_reader_key].
use serde::Deserialize;

use crate::cbor;
use crate::definitions::helpers::{ByteStr, Tag24};
use crate::definitions::session::{
    self, build_session_transcript, derive_session_key, peer_public_key, DeviceEngagementBytes,
    Direction, EReaderKeyBytes, EphemeralKeyPair, Handover, SessionData, SessionEstablishment,
    SessionKey,
};
use crate::definitions::CoseKey;
use crate::transport::Role;

pub use crate::definitions::session::Status;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("the peer's ephemeral key and the session transcript have not been set")]
    EncryptionNotReady,
    #[error("a message needs data, a status, or both")]
    EmptyMessage,
    #[error("the reader's first message must carry data and no status")]
    InvalidEstablishment,
    #[error("the message does not carry the reader's ephemeral key")]
    MissingReaderKey,
    #[error("malformed session message: {0}")]
    MalformedEnvelope(String),
    #[error("unable to decrypt the session message")]
    DecryptionFailed,
    #[error("message counter exhausted")]
    CounterExhausted,
    #[error(transparent)]
    Crypto(session::Error),
}

impl From<session::Error> for SessionError {
    fn from(e: session::Error) -> Self {
        match e {
            session::Error::DecryptionFailed => SessionError::DecryptionFailed,
            e => SessionError::Crypto(e),
        }
    }
}

impl From<cbor::CborError> for SessionError {
    fn from(e: cbor::CborError) -> Self {
        SessionError::MalformedEnvelope(e.to_string())
    }
}

struct SessionKeys {
    send: SessionKey,
    receive: SessionKey,
}

pub struct SessionEncryption {
    role: Role,
    e_self_key: EphemeralKeyPair,
    e_self_key_bytes: Tag24<CoseKey>,
    keys: Option<SessionKeys>,
    send_counter: u32,
    receive_counter: u32,
    messages_encrypted: u64,
    messages_decrypted: u64,
}

impl SessionEncryption {
    /// One side of a session whose peer is not known yet.
    pub fn new(role: Role, e_self_key: EphemeralKeyPair) -> Result<Self, SessionError> {
        let e_self_key_bytes = Tag24::new(e_self_key.public_cose_key())
            .map_err(|e| SessionError::Crypto(e.into()))?;
        Ok(Self {
            role,
            e_self_key,
            e_self_key_bytes,
            keys: None,
            send_counter: 1,
            receive_counter: 1,
            messages_encrypted: 0,
            messages_decrypted: 0,
        })
    }

    /// The reader's side, ready as soon as the holder's engagement has been scanned.
    pub fn reader(
        e_reader_key: EphemeralKeyPair,
        device_engagement: &DeviceEngagementBytes,
        handover: Handover,
    ) -> Result<Self, SessionError> {
        let mut this = Self::new(Role::MdocReader, e_reader_key)?;
        let session_transcript_bytes = build_session_transcript(
            &device_engagement.inner_bytes,
            &this.e_self_key_bytes.inner_bytes,
            handover,
        )?;
        let e_device_key = device_engagement
            .as_ref()
            .security
            .e_device_key()
            .map_err(|e| SessionError::Crypto(e.into()))?;
        this.establish(&e_device_key, &session_transcript_bytes)?;
        Ok(this)
    }

    /// The holder's side, once the reader's key has been read from its first message.
    pub fn device(
        e_device_key: EphemeralKeyPair,
        e_reader_key: &EReaderKeyBytes,
        session_transcript_bytes: &[u8],
    ) -> Result<Self, SessionError> {
        let mut this = Self::new(Role::Mdoc, e_device_key)?;
        this.establish(e_reader_key.as_ref(), session_transcript_bytes)?;
        Ok(this)
    }

    /// Derive both session keys from the peer's key and the transcript.
    pub fn establish(
        &mut self,
        e_peer_key: &CoseKey,
        session_transcript_bytes: &[u8],
    ) -> Result<(), SessionError> {
        let peer = peer_public_key(e_peer_key)?;
        let shared_secret = self.e_self_key.diffie_hellman(&peer);
        let send = derive_session_key(&shared_secret, session_transcript_bytes, self.sending())?;
        let receive =
            derive_session_key(&shared_secret, session_transcript_bytes, self.receiving())?;
        self.keys = Some(SessionKeys { send, receive });
        tracing::debug!(role = ?self.role, "session keys derived");
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.keys.is_some()
    }

    /// This side's ephemeral key, tag-24 encoded. For a reader these are the `EReaderKeyBytes`.
    pub fn e_self_key_bytes(&self) -> &Tag24<CoseKey> {
        &self.e_self_key_bytes
    }

    pub fn messages_encrypted(&self) -> u64 {
        self.messages_encrypted
    }

    pub fn messages_decrypted(&self) -> u64 {
        self.messages_decrypted
    }

    fn sending(&self) -> Direction {
        match self.role {
            Role::Mdoc => Direction::DeviceToReader,
            Role::MdocReader => Direction::ReaderToDevice,
        }
    }

    fn receiving(&self) -> Direction {
        match self.role {
            Role::Mdoc => Direction::ReaderToDevice,
            Role::MdocReader => Direction::DeviceToReader,
        }
    }

    /// Encrypt `data` and attach `status`.
    ///
    /// `None` data with a status makes a status-only message, while `Some(&[])` encrypts an empty
    /// plaintext. The reader's first message is a [SessionEstablishment].
    pub fn encrypt_message(
        &mut self,
        data: Option<&[u8]>,
        status: Option<Status>,
    ) -> Result<Vec<u8>, SessionError> {
        let keys = self.keys.as_ref().ok_or(SessionError::EncryptionNotReady)?;
        if data.is_none() && status.is_none() {
            return Err(SessionError::EmptyMessage);
        }
        let establishment = self.role == Role::MdocReader && self.messages_encrypted == 0;
        if establishment && (data.is_none() || status.is_some()) {
            return Err(SessionError::InvalidEstablishment);
        }

        let ciphertext = match data {
            Some(plaintext) => Some(session::encrypt(
                &keys.send,
                self.sending(),
                self.send_counter,
                plaintext,
            )?),
            None => None,
        };

        let message = match (establishment, ciphertext) {
            (true, Some(ciphertext)) => cbor::to_vec(&SessionEstablishment {
                e_reader_key: self.e_self_key_bytes.clone(),
                data: ByteStr::from(ciphertext),
            })?,
            (_, ciphertext) => cbor::to_vec(&SessionData {
                data: ciphertext.map(ByteStr::from),
                status,
            })?,
        };

        if data.is_some() {
            self.send_counter = self
                .send_counter
                .checked_add(1)
                .ok_or(SessionError::CounterExhausted)?;
        }
        self.messages_encrypted += 1;
        Ok(message)
    }

    /// Decrypt a message from the peer, returning its plaintext and its status.
    ///
    /// The receive counter only advances when decryption succeeds, so a replayed, reordered or
    /// reflected message fails with [SessionError::DecryptionFailed].
    pub fn decrypt_message(
        &mut self,
        message: &[u8],
    ) -> Result<(Option<Vec<u8>>, Option<Status>), SessionError> {
        let keys = self.keys.as_ref().ok_or(SessionError::EncryptionNotReady)?;
        // A SessionEstablishment decodes as SessionData with its eReaderKey ignored.
        let SessionData { data, status } = cbor::from_slice(message)?;
        if data.is_none() && status.is_none() {
            return Err(SessionError::MalformedEnvelope(
                "neither data nor status present".into(),
            ));
        }

        let plaintext = match data {
            Some(ciphertext) => {
                let plaintext = session::decrypt(
                    &keys.receive,
                    self.receiving(),
                    self.receive_counter,
                    ciphertext.as_ref(),
                )?;
                self.receive_counter = self
                    .receive_counter
                    .checked_add(1)
                    .ok_or(SessionError::CounterExhausted)?;
                Some(plaintext)
            }
            None => None,
        };
        self.messages_decrypted += 1;
        Ok((plaintext, status))
    }
}

impl std::fmt::Debug for SessionEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEncryption")
            .field("role", &self.role)
            .field("established", &self.is_established())
            .field("send_counter", &self.send_counter)
            .field("receive_counter", &self.receive_counter)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct EReaderKeyOnly {
    #[serde(rename = "eReaderKey")]
    e_reader_key: Option<EReaderKeyBytes>,
}

/// Read the reader's ephemeral key from its first message, before any decryption is possible.
pub fn get_e_reader_key(session_establishment: &[u8]) -> Result<EReaderKeyBytes, SessionError> {
    let header: EReaderKeyOnly = cbor::from_slice(session_establishment)?;
    header.e_reader_key.ok_or(SessionError::MissingReaderKey)
}

/// A status-only message, for when there is no session to encrypt with.
pub fn encode_status(status: Status) -> Result<Vec<u8>, SessionError> {
    Ok(cbor::to_vec(&SessionData {
        data: None,
        status: Some(status),
    })?)
}

#[cfg(test)]
mod test {
    use uuid::Uuid;

    use super::*;
    use crate::definitions::device_engagement::{
        BleOptions, DeviceEngagement, DeviceRetrievalMethod, PeripheralServerMode,
    };
    use crate::definitions::helpers::NonEmptyVec;

    fn session_pair() -> (SessionEncryption, SessionEncryption) {
        let device_key = EphemeralKeyPair::generate();
        let device_engagement = DeviceEngagement::generate(
            &device_key.public_cose_key(),
            DeviceEngagement::VERSION,
            NonEmptyVec::new(DeviceRetrievalMethod::BLE(BleOptions {
                peripheral_server_mode: Some(PeripheralServerMode {
                    uuid: Uuid::new_v4(),
                    ble_device_address: None,
                }),
                central_client_mode: None,
                psm: None,
            })),
        )
        .unwrap();

        let reader =
            SessionEncryption::reader(EphemeralKeyPair::generate(), &device_engagement, Handover::QR)
                .unwrap();
        let transcript = build_session_transcript(
            &device_engagement.inner_bytes,
            &reader.e_self_key_bytes().inner_bytes,
            Handover::QR,
        )
        .unwrap();
        let device =
            SessionEncryption::device(device_key, reader.e_self_key_bytes(), &transcript).unwrap();
        (reader, device)
    }

    #[test]
    fn request_and_response_roundtrip() {
        let (mut reader, mut device) = session_pair();

        let request = reader.encrypt_message(Some(b"request"), None).unwrap();
        assert_eq!(
            get_e_reader_key(&request).unwrap(),
            *reader.e_self_key_bytes()
        );
        assert_eq!(
            device.decrypt_message(&request).unwrap(),
            (Some(b"request".to_vec()), None)
        );

        let response = device
            .encrypt_message(Some(b"response"), Some(Status::SessionTermination))
            .unwrap();
        assert_eq!(
            reader.decrypt_message(&response).unwrap(),
            (Some(b"response".to_vec()), Some(Status::SessionTermination))
        );
        assert_eq!(device.messages_encrypted(), 1);
        assert_eq!(device.messages_decrypted(), 1);
    }

    #[test]
    fn empty_plaintext_is_not_status_only() {
        let (mut reader, mut device) = session_pair();
        let request = reader.encrypt_message(Some(b"request"), None).unwrap();
        device.decrypt_message(&request).unwrap();

        let declined = device.encrypt_message(Some(&[]), None).unwrap();
        assert_eq!(
            reader.decrypt_message(&declined).unwrap(),
            (Some(vec![]), None)
        );
    }

    #[test]
    fn replayed_message_is_rejected() {
        let (mut reader, mut device) = session_pair();
        let request = reader.encrypt_message(Some(b"request"), None).unwrap();
        device.decrypt_message(&request).unwrap();
        assert!(matches!(
            device.decrypt_message(&request),
            Err(SessionError::DecryptionFailed)
        ));

        // A failed attempt leaves the counter where it was.
        let second = reader.encrypt_message(Some(b"second"), None).unwrap();
        assert_eq!(
            device.decrypt_message(&second).unwrap().0.unwrap(),
            b"second"
        );
    }

    #[test]
    fn reflected_message_is_rejected() {
        let (mut reader, mut device) = session_pair();
        let request = reader.encrypt_message(Some(b"request"), None).unwrap();
        device.decrypt_message(&request).unwrap();

        let response = device.encrypt_message(Some(b"response"), None).unwrap();
        assert!(matches!(
            device.decrypt_message(&response),
            Err(SessionError::DecryptionFailed)
        ));
    }

    #[test]
    fn status_only_message() {
        let (mut reader, mut device) = session_pair();
        let request = reader.encrypt_message(Some(b"request"), None).unwrap();
        device.decrypt_message(&request).unwrap();

        let termination = reader
            .encrypt_message(None, Some(Status::SessionTermination))
            .unwrap();
        assert_eq!(termination, encode_status(Status::SessionTermination).unwrap());
        assert_eq!(
            device.decrypt_message(&termination).unwrap(),
            (None, Some(Status::SessionTermination))
        );
    }

    #[test]
    fn misuse_is_reported() {
        let mut pending = SessionEncryption::new(Role::Mdoc, EphemeralKeyPair::generate()).unwrap();
        assert!(matches!(
            pending.encrypt_message(Some(b"x"), None),
            Err(SessionError::EncryptionNotReady)
        ));

        let (mut reader, _) = session_pair();
        assert!(matches!(
            reader.encrypt_message(None, None),
            Err(SessionError::EmptyMessage)
        ));
        assert!(matches!(
            reader.encrypt_message(None, Some(Status::SessionTermination)),
            Err(SessionError::InvalidEstablishment)
        ));
    }

    #[test]
    fn reader_key_must_be_present() {
        let data = encode_status(Status::SessionTermination).unwrap();
        assert!(matches!(
            get_e_reader_key(&data),
            Err(SessionError::MissingReaderKey)
        ));
        assert!(matches!(
            get_e_reader_key(&[0xff]),
            Err(SessionError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let (mut reader, _) = session_pair();
        assert!(matches!(
            reader.decrypt_message(&[0x01, 0x02]),
            Err(SessionError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            reader.decrypt_message(&[0xa0]),
            Err(SessionError::MalformedEnvelope(_))
        ));
    }
}
