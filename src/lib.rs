//! ISO/IEC 18013-5 proximity presentment.
//!
//! A holder advertises a [DeviceEngagement](definitions::DeviceEngagement), usually as an
//! `mdoc:` QR code. A reader scans it, connects over the medium it names and opens an encrypted
//! session; request and response then travel inside [SessionEncryption](session::SessionEncryption)
//! envelopes until either side ends the session.
//!
//! - [definitions]: the CBOR wire types, the session transcript and the cryptographic primitives.
//! - [session]: the stateful session encryption envelope.
//! - [transport]: BLE, NFC and Wi-Fi Aware transports over an in-process medium.
//! - [presentation]: the holder and reader state machines, and a harness running both.
pub mod cbor;
pub mod definitions;
pub mod logging;
pub mod presentation;
pub mod session;
pub mod transport;
