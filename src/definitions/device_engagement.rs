//! This module contains the definitions for the [DeviceEngagement] struct and related types.
//!
//! The [DeviceEngagement] is the structure a holder hands to a reader out-of-band (QR code or
//! NFC) to bootstrap a proximity session. It carries the `version`, the holder's ephemeral
//! public key (`security`) and the ordered list of connection methods the holder listens on.
//!
//! The module also provides conversions between [DeviceEngagement] and [ciborium::Value], and
//! the `mdoc:` QR code carrier.
use std::collections::BTreeMap;

use ciborium::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::Error;
pub use nfc_options::NfcOptions;

use crate::cbor;
use crate::definitions::cose_key::CoseKey;
use crate::definitions::helpers::{ByteStr, NonEmptyVec, Tag24};

pub mod error;
pub mod nfc_options;

pub type DeviceRetrievalMethods = NonEmptyVec<DeviceRetrievalMethod>;
pub type ProtocolInfo = Value;

/// Key of the L2CAP PSM in the BLE options map. The 2021 edition of the standard has no
/// assigned key for it, so a value from the private range is used.
pub const BLE_OPTION_L2CAP_PSM: i128 = 2023;

/// Represents a device engagement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Value", into = "Value")]
pub struct DeviceEngagement {
    /// The version of the device engagement.
    pub version: String,

    /// The cipher suite and the holder's ephemeral public key.
    pub security: Security,

    /// The optional device retrieval methods for the device engagement.
    pub device_retrieval_methods: Option<DeviceRetrievalMethods>,

    /// Server retrieval information, kept verbatim. Server retrieval is not implemented.
    pub server_retrieval_methods: Option<Value>,

    /// The optional protocol information for the device engagement.
    pub protocol_info: Option<ProtocolInfo>,
}

/// The tag-24 wrapped `EDeviceKey`, exactly as it was received.
///
/// The key is decoded on demand: the engagement has to be parseable, and its bytes hashed into
/// the session transcript, before anyone needs the key itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EDeviceKeyBytes(Vec<u8>);

/// The cipher suite identifier and the bytes of the EDevice key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Security {
    pub cipher_suite_identifier: u64,
    pub e_device_key_bytes: EDeviceKeyBytes,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum DeviceRetrievalMethod {
    /// Represents the options for a Wi-Fi Aware connection.
    WIFI(WifiOptions),

    /// Represents the BLE options for device engagement.
    ///
    /// Either or both of the GATT modes may be offered, optionally with an L2CAP PSM.
    BLE(BleOptions),

    /// Represents the options for NFC engagement.
    NFC(NfcOptions),
}

/// Represents the options for `Bluetooth Low Energy` (BLE) device engagement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "Value", into = "Value")]
pub struct BleOptions {
    /// The peripheral server mode for `BLE` device engagement.
    pub peripheral_server_mode: Option<PeripheralServerMode>,

    /// The central client mode for `BLE` device engagement.
    pub central_client_mode: Option<CentralClientMode>,

    /// The L2CAP channel PSM offered by the peripheral, if any.
    pub psm: Option<u16>,
}

/// Represents a peripheral server mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralServerMode {
    /// The 'UUID' of the peripheral server.
    pub uuid: Uuid,

    /// The 'BLE' device address of the peripheral server, if available.
    pub ble_device_address: Option<ByteStr>,
}

/// Represents the central client mode for device engagement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CentralClientMode {
    pub uuid: Uuid,
}

/// Represents the options for a `Wi-Fi Aware` device engagement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "Value", into = "Value")]
pub struct WifiOptions {
    /// The passphrase for the `Wi-Fi connection. If [None], no passphrase is required.
    pub pass_phrase: Option<String>,

    /// The operating class of the `Wi-Fi` channel. If [None], the operating class is not specified.
    pub channel_info_operating_class: Option<u64>,

    /// The channel number of the `Wi-Fi` channel. If [None], the channel number is not specified.
    pub channel_info_channel_number: Option<u64>,

    /// The band information of the `Wi-Fi channel. If [None], the band information is not specified.
    pub band_info: Option<ByteStr>,
}

impl DeviceEngagement {
    pub const VERSION: &'static str = "1.0";

    /// Build and encode the engagement a holder advertises.
    pub fn generate(
        e_device_key: &CoseKey,
        version: &str,
        device_retrieval_methods: DeviceRetrievalMethods,
    ) -> Result<Tag24<DeviceEngagement>, Error> {
        if version != Self::VERSION {
            return Err(Error::UnsupportedVersion);
        }
        let device_engagement = DeviceEngagement {
            version: version.to_string(),
            security: Security {
                cipher_suite_identifier: 1,
                e_device_key_bytes: EDeviceKeyBytes::new(e_device_key)?,
            },
            device_retrieval_methods: Some(device_retrieval_methods),
            //server_retrieval is not implemented
            server_retrieval_methods: None,
            //protocol_info is not implemented
            protocol_info: None,
        };
        Tag24::new(device_engagement).map_err(Into::into)
    }

    /// Parse engagement bytes received out-of-band, keeping them verbatim for the transcript.
    pub fn parse(bytes: &[u8]) -> Result<Tag24<DeviceEngagement>, Error> {
        let value: Value = cbor::from_slice(bytes).map_err(|_| Error::Malformed)?;
        let device_engagement = DeviceEngagement::try_from(value)?;
        Ok(Tag24::from_parts(device_engagement, bytes.to_vec()))
    }

    /// The connection method a reader uses: always the first one advertised.
    pub fn first_retrieval_method(&self) -> Option<&DeviceRetrievalMethod> {
        self.device_retrieval_methods.as_ref().map(|m| m.first())
    }
}

impl EDeviceKeyBytes {
    pub fn new(e_device_key: &CoseKey) -> Result<Self, Error> {
        Ok(Self(cbor::to_vec(e_device_key)?))
    }

    /// The CBOR encoding of the key, without the tag-24 wrapping.
    pub fn inner_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The full `#6.24(bstr .cbor EDeviceKey)` encoding.
    pub fn to_tagged_bytes(&self) -> Result<Vec<u8>, Error> {
        cbor::to_vec(&Value::from(self.clone())).map_err(Into::into)
    }

    pub fn decode(&self) -> Result<CoseKey, Error> {
        let value: Value = cbor::from_slice(&self.0)?;
        Ok(CoseKey::try_from(value)?)
    }
}

impl From<EDeviceKeyBytes> for Value {
    fn from(EDeviceKeyBytes(bytes): EDeviceKeyBytes) -> Value {
        Value::Tag(24, Box::new(Value::Bytes(bytes)))
    }
}

impl TryFrom<Value> for EDeviceKeyBytes {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Tag(24, inner) => match *inner {
                Value::Bytes(bytes) => Ok(EDeviceKeyBytes(bytes)),
                _ => Err(Error::Tag24Error),
            },
            _ => Err(Error::Tag24Error),
        }
    }
}

impl Security {
    pub fn e_device_key(&self) -> Result<CoseKey, Error> {
        self.e_device_key_bytes.decode()
    }
}

impl From<Security> for Value {
    fn from(s: Security) -> Value {
        Value::Array(vec![
            Value::Integer(s.cipher_suite_identifier.into()),
            s.e_device_key_bytes.into(),
        ])
    }
}

impl TryFrom<Value> for Security {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Array(items) = v else {
            return Err(Error::Malformed);
        };
        let [Value::Integer(suite), key] = <[Value; 2]>::try_from(items).map_err(|_| Error::Malformed)?
        else {
            return Err(Error::Malformed);
        };
        Ok(Security {
            cipher_suite_identifier: u64::try_from(suite).map_err(|_| Error::Malformed)?,
            e_device_key_bytes: EDeviceKeyBytes::try_from(key)?,
        })
    }
}

fn int_keyed(map: Vec<(Value, Value)>) -> Result<BTreeMap<i128, Value>, Error> {
    map.into_iter()
        .map(|(k, v)| Ok((k.into_integer().map_err(|_| Error::CborError)?.into(), v)))
        .collect()
}

impl From<DeviceEngagement> for Value {
    fn from(device_engagement: DeviceEngagement) -> Value {
        let mut map = vec![
            (
                Value::Integer(0.into()),
                Value::Text(device_engagement.version),
            ),
            (Value::Integer(1.into()), device_engagement.security.into()),
        ];
        if let Some(methods) = device_engagement.device_retrieval_methods {
            let methods = methods.into_inner().into_iter().map(Value::from).collect();
            map.push((Value::Integer(2.into()), Value::Array(methods)));
        }
        if let Some(methods) = device_engagement.server_retrieval_methods {
            map.push((Value::Integer(3.into()), methods));
        }
        if let Some(_info) = device_engagement.protocol_info {
            // Usage of protocolinfo is RFU and should for now be none
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for DeviceEngagement {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidDeviceEngagement);
        };
        let mut map = int_keyed(map)?;
        match map.remove(&0) {
            Some(Value::Text(v)) if v == DeviceEngagement::VERSION => {}
            Some(Value::Text(v)) => {
                tracing::debug!("rejecting device engagement version {v}");
                return Err(Error::UnsupportedVersion);
            }
            _ => return Err(Error::Malformed),
        }
        let security = Security::try_from(map.remove(&1).ok_or(Error::Malformed)?)?;

        let device_retrieval_methods = match map.remove(&2) {
            None => None,
            Some(Value::Array(methods)) => {
                let methods = methods
                    .into_iter()
                    .map(DeviceRetrievalMethod::try_from)
                    .collect::<Result<Vec<_>, Error>>()?;
                Some(NonEmptyVec::try_from(methods).map_err(|_| Error::Malformed)?)
            }
            Some(_) => return Err(Error::Malformed),
        };

        let server_retrieval_methods = map.remove(&3);
        if server_retrieval_methods.is_some() {
            tracing::warn!("server_retrieval is unimplemented.")
        }
        let protocol_info = map.remove(&4);
        if protocol_info.is_some() {
            tracing::warn!("protocol_info is RFU and has been ignored in deserialization.")
        }

        Ok(DeviceEngagement {
            version: DeviceEngagement::VERSION.into(),
            security,
            device_retrieval_methods,
            server_retrieval_methods,
            protocol_info: None,
        })
    }
}

impl Tag24<DeviceEngagement> {
    const BASE64_CONFIG: base64::Config = base64::URL_SAFE_NO_PAD;
    const QR_CODE_PREFIX: &'static str = "mdoc:";

    pub fn to_qr_code_uri(&self) -> String {
        let mut qr_code_uri = String::from(Self::QR_CODE_PREFIX);
        base64::encode_config_buf(&self.inner_bytes, Self::BASE64_CONFIG, &mut qr_code_uri);
        qr_code_uri
    }

    /// Decode an `mdoc:` URI.
    ///
    /// The payload is base64url, but URIs written with the standard alphabet and padding are
    /// accepted too.
    pub fn from_qr_code_uri(qr_code_uri: &str) -> Result<Self, Error> {
        let encoded_de = qr_code_uri
            .strip_prefix(Self::QR_CODE_PREFIX)
            .ok_or(Error::InvalidQrCode)?;
        let normalised: String = encoded_de
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                c => c,
            })
            .collect();
        let decoded_de = base64::decode_config(normalised, Self::BASE64_CONFIG)
            .map_err(|_| Error::InvalidQrCode)?;
        DeviceEngagement::parse(&decoded_de)
    }
}

impl DeviceRetrievalMethod {
    pub fn version(&self) -> u64 {
        1
    }

    pub fn transport_type(&self) -> u64 {
        match self {
            Self::NFC(_) => 1,
            Self::BLE(_) => 2,
            Self::WIFI(_) => 3,
        }
    }
}

impl TryFrom<Value> for DeviceRetrievalMethod {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(list) = value else {
            return Err(Error::Malformed);
        };
        let [Value::Integer(transport_type), Value::Integer(version), options] =
            <[Value; 3]>::try_from(list).map_err(|_| Error::Malformed)?
        else {
            return Err(Error::Malformed);
        };
        if i128::from(version) != 1 {
            return Err(Error::UnsupportedDRM);
        }
        match i128::from(transport_type) {
            1 => Ok(DeviceRetrievalMethod::NFC(NfcOptions::try_from(options)?)),
            2 => Ok(DeviceRetrievalMethod::BLE(BleOptions::try_from(options)?)),
            3 => Ok(DeviceRetrievalMethod::WIFI(WifiOptions::try_from(options)?)),
            _ => Err(Error::UnsupportedDRM),
        }
    }
}

impl From<DeviceRetrievalMethod> for Value {
    fn from(drm: DeviceRetrievalMethod) -> Self {
        let transport_type = Value::Integer(drm.transport_type().into());
        let version = Value::Integer(drm.version().into());
        let retrieval_method = match drm {
            DeviceRetrievalMethod::NFC(opts) => opts.into(),
            DeviceRetrievalMethod::BLE(opts) => opts.into(),
            DeviceRetrievalMethod::WIFI(opts) => opts.into(),
        };
        Value::Array(vec![transport_type, version, retrieval_method])
    }
}

impl BleOptions {
    /// Record the PSM of an L2CAP channel that was set up after the options were created.
    ///
    /// A PSM can be set at most once; setting the same value again is a no-op.
    pub fn set_psm(&mut self, psm: u16) -> Result<(), Error> {
        match self.psm {
            Some(existing) if existing != psm => Err(Error::PsmAlreadySet(existing)),
            _ => {
                self.psm = Some(psm);
                Ok(())
            }
        }
    }
}

fn uuid_from(value: Value) -> Result<Uuid, Error> {
    match value {
        Value::Bytes(uuid) => {
            let uuid_bytes: [u8; 16] = uuid.try_into().map_err(|_| Error::Malformed)?;
            Ok(Uuid::from_bytes(uuid_bytes))
        }
        _ => Err(Error::Malformed),
    }
}

impl TryFrom<Value> for BleOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::Malformed);
        };
        let mut map = int_keyed(map)?;

        let central_client_mode = match (map.remove(&1), map.remove(&11)) {
            (Some(Value::Bool(true)), Some(uuid)) => Some(CentralClientMode {
                uuid: uuid_from(uuid)?,
            }),
            (Some(Value::Bool(false)), _) => None,
            _ => return Err(Error::Malformed),
        };

        let peripheral_server_mode = match (map.remove(&0), map.remove(&10)) {
            (Some(Value::Bool(true)), Some(uuid)) => {
                let ble_device_address = match map.remove(&20) {
                    Some(value) => Some(value.try_into().map_err(|_| Error::Malformed)?),
                    None => None,
                };
                Some(PeripheralServerMode {
                    uuid: uuid_from(uuid)?,
                    ble_device_address,
                })
            }
            (Some(Value::Bool(false)), _) => None,
            _ => return Err(Error::Malformed),
        };

        let psm = match map.remove(&BLE_OPTION_L2CAP_PSM) {
            Some(Value::Integer(psm)) => Some(u16::try_from(psm).map_err(|_| Error::Malformed)?),
            Some(_) => return Err(Error::Malformed),
            None => None,
        };

        Ok(BleOptions {
            peripheral_server_mode,
            central_client_mode,
            psm,
        })
    }
}

impl From<BleOptions> for Value {
    fn from(o: BleOptions) -> Value {
        let mut map = BTreeMap::<i128, Value>::new();

        match o.peripheral_server_mode {
            Some(PeripheralServerMode {
                uuid,
                ble_device_address,
            }) => {
                map.insert(0, Value::Bool(true));
                map.insert(10, Value::Bytes(uuid.as_bytes().to_vec()));
                if let Some(address) = ble_device_address {
                    map.insert(20, address.into());
                }
            }
            None => {
                map.insert(0, Value::Bool(false));
            }
        }

        match o.central_client_mode {
            Some(CentralClientMode { uuid }) => {
                map.insert(1, Value::Bool(true));
                map.insert(11, Value::Bytes(uuid.as_bytes().to_vec()));
            }
            None => {
                map.insert(1, Value::Bool(false));
            }
        }

        if let Some(psm) = o.psm {
            map.insert(BLE_OPTION_L2CAP_PSM, Value::Integer(psm.into()));
        }

        // Ascending integer keys are also the canonical CBOR order for these small keys.
        Value::Map(
            map.into_iter()
                .map(|(k, v)| (Value::Integer((k as i64).into()), v))
                .collect(),
        )
    }
}

impl TryFrom<Value> for WifiOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        fn lookup_opt_string(map: &BTreeMap<i128, Value>, idx: i128) -> Result<Option<String>, Error> {
            match map.get(&idx) {
                None => Ok(None),
                Some(Value::Text(text)) => Ok(Some(text.to_string())),
                _ => Err(Error::InvalidWifiOptions),
            }
        }

        fn lookup_opt_u64(map: &BTreeMap<i128, Value>, idx: i128) -> Result<Option<u64>, Error> {
            match map.get(&idx) {
                None => Ok(None),
                Some(Value::Integer(int_val)) => {
                    let uint_val = u64::try_from(*int_val).map_err(|_| Error::InvalidWifiOptions)?;
                    Ok(Some(uint_val))
                }
                _ => Err(Error::InvalidWifiOptions),
            }
        }

        fn lookup_opt_bytestr(
            map: &BTreeMap<i128, Value>,
            idx: i128,
        ) -> Result<Option<ByteStr>, Error> {
            match map.get(&idx) {
                None => Ok(None),
                Some(cbor_val) => {
                    let byte_str = ByteStr::try_from(cbor_val.clone())
                        .map_err(|_| Error::InvalidWifiOptions)?;
                    Ok(Some(byte_str))
                }
            }
        }

        let map = match v {
            Value::Map(map) => int_keyed(map).map_err(|_| Error::InvalidWifiOptions)?,
            _ => return Err(Error::InvalidWifiOptions),
        };

        Ok(WifiOptions {
            pass_phrase: lookup_opt_string(&map, 0)?,
            channel_info_operating_class: lookup_opt_u64(&map, 1)?,
            channel_info_channel_number: lookup_opt_u64(&map, 2)?,
            band_info: lookup_opt_bytestr(&map, 3)?,
        })
    }
}

impl From<WifiOptions> for Value {
    fn from(o: WifiOptions) -> Value {
        let mut map = vec![];
        if let Some(v) = o.pass_phrase {
            map.push((Value::Integer(0.into()), Value::Text(v)));
        }
        if let Some(v) = o.channel_info_operating_class {
            map.push((Value::Integer(1.into()), Value::Integer(v.into())));
        }
        if let Some(v) = o.channel_info_channel_number {
            map.push((Value::Integer(2.into()), Value::Integer(v.into())));
        }
        if let Some(v) = o.band_info {
            map.push((Value::Integer(3.into()), v.into()));
        }

        Value::Map(map)
    }
}
