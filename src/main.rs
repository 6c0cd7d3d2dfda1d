use std::path::PathBuf;

use anyhow::{Context, Error};
use clap::Parser;
use clap_stdin::MaybeStdin;
use serde_json::{json, Value};
use strum::IntoEnumIterator;

use isomdl_proximity::definitions::helpers::Tag24;
use isomdl_proximity::definitions::session::calculate_ble_ident;
use isomdl_proximity::definitions::{DeviceEngagement, DeviceRetrievalMethod};
use isomdl_proximity::logging::{init_logging, LogFormat};
use isomdl_proximity::presentation::harness::{run_matrix, MediumKind};
use isomdl_proximity::presentation::PresentmentConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "warn")]
    log_level: String,
    #[arg(long, value_enum, default_value_t)]
    log_format: LogFormat,
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Print the device engagement in an `mdoc:` QR code URI.
    ParseEngagement {
        /// The URI, or `-` to read it from stdin.
        qr_code_uri: MaybeStdin<String>,
    },
    /// Run holders and readers against each other through every termination variant.
    Simulate {
        #[arg(long, default_value_t = 1)]
        iterations: usize,
        /// Media to run over. Defaults to all of them.
        #[arg(long, value_enum)]
        medium: Vec<MediumKind>,
        /// A JSON presentment configuration.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format);
    match args.action {
        Action::ParseEngagement { qr_code_uri } => parse_engagement(qr_code_uri.trim()),
        Action::Simulate {
            iterations,
            medium,
            config,
        } => simulate(iterations, medium, config).await,
    }
}

fn parse_engagement(qr_code_uri: &str) -> Result<(), Error> {
    let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(qr_code_uri)
        .context("could not parse the QR code")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&describe_engagement(&device_engagement))?
    );
    Ok(())
}

fn describe_engagement(device_engagement: &Tag24<DeviceEngagement>) -> Value {
    let security = &device_engagement.as_ref().security;
    let e_device_key_bytes = &security.e_device_key_bytes;
    let methods: Vec<Value> = device_engagement
        .as_ref()
        .device_retrieval_methods
        .iter()
        .flat_map(|methods| methods.iter())
        .map(describe_method)
        .collect();
    json!({
        "version": device_engagement.as_ref().version,
        "cipher_suite_identifier": security.cipher_suite_identifier,
        "e_device_key_bytes": base64::encode_config(e_device_key_bytes.inner_bytes(), base64::URL_SAFE_NO_PAD),
        "e_device_key_valid": e_device_key_bytes.decode().is_ok(),
        "ble_ident": calculate_ble_ident(e_device_key_bytes)
            .ok()
            .map(|ident| base64::encode_config(ident, base64::URL_SAFE_NO_PAD)),
        "device_retrieval_methods": methods,
    })
}

fn describe_method(method: &DeviceRetrievalMethod) -> Value {
    match method {
        DeviceRetrievalMethod::BLE(ble) => json!({
            "type": "BLE",
            "peripheral_server_uuid": ble.peripheral_server_mode.as_ref().map(|mode| mode.uuid),
            "central_client_uuid": ble.central_client_mode.as_ref().map(|mode| mode.uuid),
            "l2cap_psm": ble.psm,
        }),
        DeviceRetrievalMethod::NFC(nfc) => json!({
            "type": "NFC",
            "max_len_command_data_field": nfc.max_len_command_data_field.get(),
            "max_len_response_data_field": nfc.max_len_response_data_field.get(),
        }),
        DeviceRetrievalMethod::WIFI(wifi) => json!({
            "type": "WIFI",
            "pass_phrase": wifi.pass_phrase,
            "channel_info_operating_class": wifi.channel_info_operating_class,
            "channel_info_channel_number": wifi.channel_info_channel_number,
        }),
    }
}

async fn simulate(
    iterations: usize,
    media: Vec<MediumKind>,
    config: Option<PathBuf>,
) -> Result<(), Error> {
    let config = match config {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read {}", path.display()))?;
            PresentmentConfig::from_json(&json)?
        }
        None => PresentmentConfig::default(),
    };
    let media = if media.is_empty() {
        MediumKind::iter().collect()
    } else {
        media
    };
    let statistics = run_matrix(iterations, &media, &config).await;
    println!("{}", serde_json::to_string_pretty(&statistics)?);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const ANNEX_D: &str = "mdoc:owBjMS4wAYIB2BhYS6QBAiABIVggWojRgrzl9C76WZQ/MzWdAuipaP8onZPl+kRLYkNDFn/iJYILFujPhY3cdpBAe6YdTDOCNwqM/PPeaqZy/GClV6oy/GcCgYMCAaMA9AH1C1BF7+90KyxIN6kKOw4dBaaRBw==";

    #[test]
    fn describes_the_annex_d_engagement() {
        let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(ANNEX_D).unwrap();
        let description = describe_engagement(&device_engagement);
        assert_eq!(description["version"], "1.0");
        assert_eq!(description["device_retrieval_methods"][0]["type"], "BLE");
        assert_eq!(
            description["device_retrieval_methods"][0]["central_client_uuid"],
            "45efef74-2b2c-4837-a90a-3b0e1d05a691"
        );
    }
}
