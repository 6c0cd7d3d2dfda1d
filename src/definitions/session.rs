//! Session establishment wire types and the cryptographic primitives behind them.
//!
//! A proximity session is bound to its [SessionTranscript180135]: the device engagement, the
//! reader's ephemeral key and the handover, all exactly as exchanged. Both parties hash the
//! transcript into the salt of the HKDF that turns the ECDH secret into the two directional
//! AES-256-GCM keys.
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ciborium::Value;
use hkdf::Hkdf;
use p256::ecdh::SharedSecret;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cbor::{self, CborError};
use crate::definitions::cose_key::{self, CoseKey};
use crate::definitions::device_engagement::{self, DeviceEngagement, EDeviceKeyBytes};
use crate::definitions::helpers::{ByteStr, Tag24};

pub type EReaderKeyBytes = Tag24<CoseKey>;
pub type DeviceEngagementBytes = Tag24<DeviceEngagement>;

/// A derived AES-256 session key.
pub type SessionKey = Zeroizing<[u8; 32]>;

/// The first message of a session, sent by the reader.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEstablishment {
    pub e_reader_key: EReaderKeyBytes,
    pub data: ByteStr,
}

/// Every message after [SessionEstablishment], in either direction.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// Status codes carried in [SessionData].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum Status {
    SessionEncryptionError,
    CborDecodingError,
    SessionTermination,
}

/// The `Handover` element of the session transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Handover {
    /// Engagement by QR code.
    QR,
    /// NFC static handover (no request message) or negotiated handover.
    NFC(ByteStr, Option<ByteStr>),
    /// Any other handover, passed through verbatim.
    Other(Value),
}

/// `SessionTranscript = [DeviceEngagementBytes, EReaderKeyBytes, Handover]`, as defined in
/// ISO/IEC 18013-5 section 9.1.5.1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionTranscript180135(
    pub DeviceEngagementBytes,
    pub EReaderKeyBytes,
    pub Handover,
);

/// The two directions of a session, each with its own key and message counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ReaderToDevice,
    DeviceToReader,
}

/// An ephemeral P-256 key pair, used for one session only.
pub struct EphemeralKeyPair {
    secret: SecretKey,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Curve not supported for DH exchange")]
    UnsupportedCurve,
    #[error("unable to use the peer's ephemeral key: {0}")]
    CoseKey(#[from] cose_key::Error),
    #[error("unable to read the device key from the engagement: {0}")]
    DeviceEngagement(#[from] device_engagement::Error),
    #[error("unable to encode session data: {0}")]
    Encoding(String),
    #[error("unable to perform HKDF")]
    KeyDerivation,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: wrong key, tampered data or unexpected message counter")]
    DecryptionFailed,
    #[error("unknown session status code {0}")]
    UnknownStatus(u64),
}

impl From<CborError> for Error {
    fn from(e: CborError) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<crate::definitions::helpers::tag24::Error> for Error {
    fn from(e: crate::definitions::helpers::tag24::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl Status {
    pub fn code(self) -> u64 {
        match self {
            Status::SessionEncryptionError => 10,
            Status::CborDecodingError => 11,
            Status::SessionTermination => 20,
        }
    }
}

impl From<Status> for u64 {
    fn from(s: Status) -> u64 {
        s.code()
    }
}

impl TryFrom<u64> for Status {
    type Error = Error;

    fn try_from(code: u64) -> Result<Self, Error> {
        match code {
            10 => Ok(Status::SessionEncryptionError),
            11 => Ok(Status::CborDecodingError),
            20 => Ok(Status::SessionTermination),
            _ => Err(Error::UnknownStatus(code)),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::SessionEncryptionError => write!(f, "session encryption error (10)"),
            Status::CborDecodingError => write!(f, "CBOR decoding error (11)"),
            Status::SessionTermination => write!(f, "session termination (20)"),
        }
    }
}

impl From<Handover> for Value {
    fn from(h: Handover) -> Value {
        match h {
            Handover::QR => Value::Null,
            Handover::NFC(hs, hr) => Value::Array(vec![
                hs.into(),
                hr.map(Value::from).unwrap_or(Value::Null),
            ]),
            Handover::Other(v) => v,
        }
    }
}

impl TryFrom<Value> for Handover {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Null => Ok(Handover::QR),
            Value::Array(items) => match items.as_slice() {
                [Value::Bytes(hs), Value::Bytes(hr)] => Ok(Handover::NFC(
                    hs.clone().into(),
                    Some(hr.clone().into()),
                )),
                [Value::Bytes(hs), Value::Null] => Ok(Handover::NFC(hs.clone().into(), None)),
                _ => Ok(Handover::Other(Value::Array(items))),
            },
            other => Ok(Handover::Other(other)),
        }
    }
}

/// Build the `SessionTranscriptBytes` from the byte strings both parties exchanged.
///
/// The engagement and key bytes are embedded verbatim, so the result only depends on what was
/// sent over the wire and never on how either side would re-encode it.
pub fn build_session_transcript(
    device_engagement_bytes: &[u8],
    e_reader_key_bytes: &[u8],
    handover: Handover,
) -> Result<Vec<u8>, Error> {
    let transcript = Value::Array(vec![
        Value::Tag(24, Box::new(Value::Bytes(device_engagement_bytes.to_vec()))),
        Value::Tag(24, Box::new(Value::Bytes(e_reader_key_bytes.to_vec()))),
        handover.into(),
    ]);
    let transcript_bytes = cbor::to_vec(&transcript)?;
    Ok(cbor::to_vec(&Value::Tag(
        24,
        Box::new(Value::Bytes(transcript_bytes)),
    ))?)
}

impl SessionTranscript180135 {
    /// The tag-24 wrapped encoding that is hashed into the HKDF salt.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        build_session_transcript(&self.0.inner_bytes, &self.1.inner_bytes, self.2.clone())
    }
}

impl Direction {
    /// The 8-byte identifier at the start of every IV in this direction.
    pub fn identifier(self) -> [u8; 8] {
        match self {
            Direction::ReaderToDevice => [0, 0, 0, 0, 0, 0, 0, 0],
            Direction::DeviceToReader => [0, 0, 0, 0, 0, 0, 0, 1],
        }
    }

    fn info(self) -> &'static [u8] {
        match self {
            Direction::ReaderToDevice => b"SKReader",
            Direction::DeviceToReader => b"SKDevice",
        }
    }
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn public_cose_key(&self) -> CoseKey {
        CoseKey::from(&self.public_key())
    }

    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine())
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Decode a peer's COSE key into a point on P-256.
pub fn peer_public_key(key: &CoseKey) -> Result<PublicKey, Error> {
    match PublicKey::try_from(key) {
        Err(cose_key::Error::UnsupportedCurve) => Err(Error::UnsupportedCurve),
        other => Ok(other?),
    }
}

/// Derive the key for one direction of the session.
pub fn derive_session_key(
    shared_secret: &SharedSecret,
    session_transcript_bytes: &[u8],
    direction: Direction,
) -> Result<SessionKey, Error> {
    let salt = Sha256::digest(session_transcript_bytes);
    let mut okm = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(Some(salt.as_slice()), shared_secret.raw_secret_bytes())
        .expand(direction.info(), &mut okm[..])
        .map_err(|_| Error::KeyDerivation)?;
    Ok(okm)
}

fn iv(direction: Direction, counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&direction.identifier());
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

pub fn encrypt(
    key: &SessionKey,
    direction: Direction,
    counter: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| Error::EncryptionFailed)?;
    let iv = iv(direction, counter);
    cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::EncryptionFailed)
}

pub fn decrypt(
    key: &SessionKey,
    direction: Direction,
    counter: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| Error::DecryptionFailed)?;
    let iv = iv(direction, counter);
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

/// The identifier a holder's BLE service, NFC tag or Wi-Fi Aware service is found by.
pub fn calculate_ble_ident(e_device_key_bytes: &EDeviceKeyBytes) -> Result<[u8; 16], Error> {
    let e_device_key_bytes = e_device_key_bytes.to_tagged_bytes()?;
    let mut ble_ident = [0u8; 16];

    Hkdf::<Sha256>::new(None, &e_device_key_bytes)
        .expand("BLEIdent".as_bytes(), &mut ble_ident)
        .map_err(|_| Error::KeyDerivation)?;

    Ok(ble_ident)
}
