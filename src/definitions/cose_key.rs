use ciborium::Value;
use coset::iana::{self, EnumI64};
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey};
use serde::{Deserialize, Serialize};

/// An implementation of RFC-8152 [COSE_Key](https://datatracker.ietf.org/doc/html/rfc8152#section-13)
/// restricted to the EC2 ephemeral keys exchanged during ISO/IEC 18013-5 session establishment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum CoseKey {
    EC2 { crv: EC2Curve, x: Vec<u8>, y: EC2Y },
}

/// The sign bit or value of the y-coordinate for the EC point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EC2Y {
    Value(Vec<u8>),
    SignBit(bool),
}

/// The RFC-8152 identifier of the curve, for EC2 key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EC2Curve {
    P256,
    P384,
    P521,
}

/// Errors that can occur when deserialising a COSE_Key.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("COSE_Key of kty 'EC2' missing x coordinate")]
    EC2MissingX,
    #[error("COSE_Key of kty 'EC2' missing y coordinate")]
    EC2MissingY,
    #[error("Expected to parse a CBOR bool or bstr for y-coordinate")]
    InvalidTypeY,
    #[error("Expected to parse a CBOR map")]
    NotAMap,
    #[error("Unable to discern the elliptic curve")]
    UnknownCurve,
    #[error("Only P-256 keys can be used for session establishment")]
    UnsupportedCurve,
    #[error("This implementation of COSE_Key only supports EC2 keys")]
    UnsupportedKeyType,
    #[error("Could not reconstruct coordinates from the provided COSE_Key")]
    InvalidCoseKey,
}

fn label(l: i64) -> Value {
    Value::Integer(l.into())
}

impl From<EC2Curve> for i64 {
    fn from(crv: EC2Curve) -> i64 {
        match crv {
            EC2Curve::P256 => iana::EllipticCurve::P_256.to_i64(),
            EC2Curve::P384 => iana::EllipticCurve::P_384.to_i64(),
            EC2Curve::P521 => iana::EllipticCurve::P_521.to_i64(),
        }
    }
}

impl TryFrom<i64> for EC2Curve {
    type Error = Error;

    fn try_from(crv: i64) -> Result<Self, Error> {
        match iana::EllipticCurve::from_i64(crv) {
            Some(iana::EllipticCurve::P_256) => Ok(EC2Curve::P256),
            Some(iana::EllipticCurve::P_384) => Ok(EC2Curve::P384),
            Some(iana::EllipticCurve::P_521) => Ok(EC2Curve::P521),
            Some(_) => Err(Error::UnsupportedCurve),
            None => Err(Error::UnknownCurve),
        }
    }
}

impl From<CoseKey> for Value {
    fn from(key: CoseKey) -> Value {
        let CoseKey::EC2 { crv, x, y } = key;
        // Entries are written in canonical order: 1, -1, -2, -3.
        Value::Map(vec![
            (
                label(iana::KeyParameter::Kty.to_i64()),
                Value::Integer(iana::KeyType::EC2.to_i64().into()),
            ),
            (
                label(iana::Ec2KeyParameter::Crv.to_i64()),
                Value::Integer(i64::from(crv).into()),
            ),
            (label(iana::Ec2KeyParameter::X.to_i64()), Value::Bytes(x)),
            (
                label(iana::Ec2KeyParameter::Y.to_i64()),
                match y {
                    EC2Y::Value(v) => Value::Bytes(v),
                    EC2Y::SignBit(b) => Value::Bool(b),
                },
            ),
        ])
    }
}

impl TryFrom<Value> for CoseKey {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(entries) = v else {
            return Err(Error::NotAMap);
        };
        let mut kty = None;
        let mut crv = None;
        let mut x = None;
        let mut y = None;
        for (k, v) in entries {
            let Value::Integer(k) = k else {
                // Text labels are permitted by COSE but carry nothing we need.
                continue;
            };
            match i64::try_from(k).map_err(|_| Error::InvalidCoseKey)? {
                1 => kty = Some(v),
                -1 => crv = Some(v),
                -2 => x = Some(v),
                -3 => y = Some(v),
                _ => {}
            }
        }
        match kty {
            Some(Value::Integer(i)) if i64::try_from(i) == Ok(iana::KeyType::EC2.to_i64()) => {}
            _ => return Err(Error::UnsupportedKeyType),
        }
        let crv = match crv {
            Some(Value::Integer(i)) => {
                EC2Curve::try_from(i64::try_from(i).map_err(|_| Error::UnknownCurve)?)?
            }
            _ => return Err(Error::UnknownCurve),
        };
        let x = match x {
            Some(Value::Bytes(x)) => x,
            Some(_) => return Err(Error::InvalidCoseKey),
            None => return Err(Error::EC2MissingX),
        };
        let y = match y {
            Some(Value::Bytes(y)) => EC2Y::Value(y),
            Some(Value::Bool(b)) => EC2Y::SignBit(b),
            Some(_) => return Err(Error::InvalidTypeY),
            None => return Err(Error::EC2MissingY),
        };
        Ok(CoseKey::EC2 { crv, x, y })
    }
}

impl From<&PublicKey> for CoseKey {
    fn from(public_key: &PublicKey) -> CoseKey {
        let point = public_key.to_encoded_point(false);
        // An uncompressed, non-identity point always carries both coordinates.
        let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
        let y = point.y().map(|y| y.to_vec()).unwrap_or_default();
        CoseKey::EC2 {
            crv: EC2Curve::P256,
            x,
            y: EC2Y::Value(y),
        }
    }
}

impl TryFrom<&CoseKey> for EncodedPoint {
    type Error = Error;

    fn try_from(value: &CoseKey) -> Result<EncodedPoint, Self::Error> {
        let CoseKey::EC2 { crv, x, y } = value;
        if *crv != EC2Curve::P256 {
            return Err(Error::UnsupportedCurve);
        }
        if x.len() != 32 {
            return Err(Error::InvalidCoseKey);
        }
        match y {
            EC2Y::Value(y) => {
                if y.len() != 32 {
                    return Err(Error::InvalidCoseKey);
                }
                Ok(EncodedPoint::from_affine_coordinates(
                    x.as_slice().into(),
                    y.as_slice().into(),
                    false,
                ))
            }
            EC2Y::SignBit(sign) => {
                let mut bytes = Vec::with_capacity(33);
                bytes.push(if *sign { 0x03 } else { 0x02 });
                bytes.extend_from_slice(x);
                EncodedPoint::from_bytes(bytes).map_err(|_| Error::InvalidCoseKey)
            }
        }
    }
}

impl TryFrom<&CoseKey> for PublicKey {
    type Error = Error;

    fn try_from(value: &CoseKey) -> Result<PublicKey, Self::Error> {
        let point = EncodedPoint::try_from(value)?;
        Option::from(PublicKey::from_encoded_point(&point)).ok_or(Error::InvalidCoseKey)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ec_p256_encoding_is_canonical() {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let key = CoseKey::from(&secret.public_key());
        let bytes = crate::cbor::to_vec(&key).unwrap();
        assert_eq!(
            bytes[..8],
            [0xa4, 0x01, 0x02, 0x20, 0x01, 0x21, 0x58, 0x20]
        );
        assert_eq!(bytes[40..43], [0x22, 0x58, 0x20]);
        let parsed: CoseKey = crate::cbor::from_slice(&bytes).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn public_key_conversion_roundtrip() {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        let cose = CoseKey::from(&public);
        let back = PublicKey::try_from(&cose).unwrap();
        assert_eq!(public, back);
    }

    #[test]
    fn compressed_point_is_accepted() {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        let point = public.to_encoded_point(true);
        let sign = point.as_bytes()[0] == 0x03;
        let cose = CoseKey::EC2 {
            crv: EC2Curve::P256,
            x: point.as_bytes()[1..].to_vec(),
            y: EC2Y::SignBit(sign),
        };
        assert_eq!(PublicKey::try_from(&cose).unwrap(), public);
    }

    #[test]
    fn p384_is_parsed_but_not_usable() {
        let key = CoseKey::EC2 {
            crv: EC2Curve::P384,
            x: vec![0; 48],
            y: EC2Y::Value(vec![0; 48]),
        };
        let bytes = crate::cbor::to_vec(&key).unwrap();
        let parsed: CoseKey = crate::cbor::from_slice(&bytes).unwrap();
        assert_eq!(PublicKey::try_from(&parsed), Err(Error::UnsupportedCurve));
    }
}
