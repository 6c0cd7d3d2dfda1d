use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::definitions::device_engagement::error::Error;

/// The maximum length of the NFC command, as specified in ISO_18013-5 2021 Section 8.3.3.1.2
/// Values of this type must lie between 255 and 65,535 inclusive, as specified in Note 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandDataLength(u16);

/// The maximum length of the NFC response data, as specified in ISO_18013-5 2021 Section 8.3.3.1.2
/// Values of this type must lie between 256 and 65,536 inclusive, as specified in Note 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseDataLength(u32);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "Value", into = "Value")]
pub struct NfcOptions {
    pub max_len_command_data_field: CommandDataLength,
    pub max_len_response_data_field: ResponseDataLength,
}

impl TryFrom<Value> for NfcOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidNfcOptions);
        };
        let lookup = |key: u64| -> Result<u64, Error> {
            map.iter()
                .find(|(k, _)| matches!(k, Value::Integer(i) if u64::try_from(*i) == Ok(key)))
                .and_then(|(_, v)| v.as_integer())
                .and_then(|i| u64::try_from(i).ok())
                .ok_or(Error::InvalidNfcOptions)
        };
        Ok(NfcOptions {
            max_len_command_data_field: CommandDataLength::try_from(lookup(0)?)?,
            max_len_response_data_field: ResponseDataLength::try_from(lookup(1)?)?,
        })
    }
}

impl From<NfcOptions> for Value {
    fn from(o: NfcOptions) -> Value {
        Value::Map(vec![
            (
                Value::Integer(0.into()),
                Value::Integer(o.max_len_command_data_field.get().into()),
            ),
            (
                Value::Integer(1.into()),
                Value::Integer(o.max_len_response_data_field.get().into()),
            ),
        ])
    }
}

impl CommandDataLength {
    pub const MIN: CommandDataLength = CommandDataLength(255);
    pub const MAX: CommandDataLength = CommandDataLength(65535);

    pub const fn new(v: u16) -> Option<CommandDataLength> {
        match v >= Self::MIN.get() {
            true => Some(CommandDataLength(v)),
            false => None,
        }
    }

    pub const fn get(&self) -> u16 {
        self.0
    }
}

/// ISO_18013-5 2021 does not specify a default value for the Command Data Length, so we make
/// a safe assumption here and specify the minimum value, which is 255.
impl Default for CommandDataLength {
    fn default() -> Self {
        Self::MIN
    }
}

impl TryFrom<u64> for CommandDataLength {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        u16::try_from(v)
            .ok()
            .and_then(CommandDataLength::new)
            .ok_or(Error::InvalidNfcCommandDataLengthError)
    }
}

impl ResponseDataLength {
    pub const MIN: ResponseDataLength = ResponseDataLength(256);
    pub const MAX: ResponseDataLength = ResponseDataLength(65536);

    pub const fn new(v: u32) -> Option<ResponseDataLength> {
        match v >= Self::MIN.get() && v <= Self::MAX.get() {
            true => Some(ResponseDataLength(v)),
            false => None,
        }
    }

    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl Default for ResponseDataLength {
    fn default() -> Self {
        Self::MIN
    }
}

impl TryFrom<u64> for ResponseDataLength {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        u32::try_from(v)
            .ok()
            .and_then(ResponseDataLength::new)
            .ok_or(Error::InvalidNfcResponseDataLengthError)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_data_length_bounds() {
        assert!(CommandDataLength::try_from(254).is_err());
        assert!(CommandDataLength::try_from(255).is_ok());
        assert!(CommandDataLength::try_from(65535).is_ok());
        assert!(CommandDataLength::try_from(65536).is_err());
    }

    #[test]
    fn response_data_length_bounds() {
        assert!(ResponseDataLength::try_from(255).is_err());
        assert!(ResponseDataLength::try_from(256).is_ok());
        assert!(ResponseDataLength::try_from(65536).is_ok());
        assert!(ResponseDataLength::try_from(65537).is_err());
    }

    #[test]
    fn nfc_options_cbor_roundtrip() {
        let options = NfcOptions {
            max_len_command_data_field: CommandDataLength::new(1024).unwrap(),
            max_len_response_data_field: ResponseDataLength::new(4096).unwrap(),
        };
        let bytes = crate::cbor::to_vec(&options).unwrap();
        let parsed: NfcOptions = crate::cbor::from_slice(&bytes).unwrap();
        assert_eq!(options, parsed);
    }
}
