pub mod cose_key;
pub mod device_engagement;
pub mod helpers;
pub mod session;

pub use cose_key::CoseKey;
pub use device_engagement::{
    BleOptions, DeviceEngagement, DeviceRetrievalMethod, NfcOptions, Security, WifiOptions,
};
pub use session::{Handover, SessionData, SessionEstablishment, SessionTranscript180135, Status};
