use crate::definitions::cose_key::Error as CoseKeyError;
use crate::definitions::helpers::tag24::Error as Tag24Error;

/// Errors that can occur when deserialising a DeviceEngagement.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Expected isomdl version 1.0")]
    UnsupportedVersion,
    #[error("Unsupported device retrieval method")]
    UnsupportedDRM,
    #[error("Invalid DeviceEngagment found")]
    InvalidDeviceEngagement,
    #[error("Invalid WifiOptions found")]
    InvalidWifiOptions,
    #[error("Invalid NfcOptions found")]
    InvalidNfcOptions,
    #[error("Malformed object not recognised")]
    Malformed,
    #[error("Something went wrong parsing a cose key: {0}")]
    CoseKeyError(#[from] CoseKeyError),
    #[error("Something went wrong parsing a tag24")]
    Tag24Error,
    #[error("Could not deserialize from cbor")]
    CborError,
    #[error("NFC Command Data Length must be between 255 and 65535")]
    InvalidNfcCommandDataLengthError,
    #[error("NFC Response Data Length must be between 256 and 65536")]
    InvalidNfcResponseDataLengthError,
    #[error("the L2CAP PSM has already been set to {0}")]
    PsmAlreadySet(u16),
    #[error("the qr code had the wrong prefix or the contained data could not be decoded")]
    InvalidQrCode,
}

impl From<Tag24Error> for Error {
    fn from(_: Tag24Error) -> Self {
        Error::Tag24Error
    }
}

impl From<crate::cbor::CborError> for Error {
    fn from(_: crate::cbor::CborError) -> Self {
        Error::CborError
    }
}

impl Error {
    /// Whether this error means the bytes were not an engagement at all, as opposed to a
    /// well-formed engagement of a version this crate does not speak.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Error::UnsupportedVersion)
    }
}
