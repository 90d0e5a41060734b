//! Platform message envelope (spec §3 invariants, §4.G, §9).
//!
//! A tagged union `{type, meta, params}` where `params`' shape depends on
//! `type` (spec §9 "Dynamic-typed message envelope"). `Envelope` models
//! this as a Rust enum with one variant per `type` value, serialized with
//! `#[serde(tag = "type")]` so the wire shape matches exactly.

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::codec::radio::{Rxpk, Txpk};
use crate::directory::Device;
use crate::lorawan::crypto;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Meta {
    pub device: String,
    pub device_addr: String,
    pub application: String,
    pub gateway: String,
    pub packet_hash: String,
    pub packet_id: String,
    pub time: f64,
    pub version: u8,
    pub outdated: bool,
    pub history: bool,
    pub network: String,
}

impl Meta {
    fn for_device(device: &Device, gateway_id: &str, packet_id: String, packet_hash: String) -> Self {
        Self {
            device: device.dev_eui.clone(),
            device_addr: device.dev_addr.clone(),
            application: device.app_eui.clone(),
            gateway: gateway_id.to_string(),
            packet_hash,
            packet_id,
            time: unix_seconds_now(),
            version: 1,
            outdated: false,
            history: false,
            network: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Hardware {
    pub status: i32,
    pub chain: u8,
    pub tmst: u64,
    pub snr: f64,
    pub rssi: f64,
    pub channel: u8,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RadioModulation {
    pub bandwidth: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub coderate: String,
    pub spreading: u8,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Radio {
    pub freq: f64,
    pub datarate: u32,
    pub time: f64,
    pub hardware: Hardware,
    pub modulation: RadioModulation,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoraHeader {
    pub class_b: bool,
    pub confirmed: bool,
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub version: u8,
    pub lora_type: u8,
}

impl Default for LoraHeader {
    fn default() -> Self {
        Self {
            class_b: false,
            confirmed: false,
            adr: false,
            adr_ack_req: false,
            ack: false,
            version: 1,
            lora_type: 2,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ParamsLora {
    pub header: LoraHeader,
    pub mac_commands: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParamsUplink {
    pub port: u8,
    pub rx_time: u64,
    pub counter_up: u64,
    pub payload: String,
    pub encrypted_payload: String,
    pub duplicate: bool,
    pub radio: Radio,
    pub lora: ParamsLora,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParamsDownlinkResponse {
    pub counter_down: u32,
    pub port: u8,
    pub payload: String,
    pub confirmed: bool,
    pub queue_if_late: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParamsError {
    pub message: String,
    pub code: i32,
}

/// Telemetry for a downlink actually handed to the gateway, as opposed to
/// `ParamsDownlinkResponse`'s acknowledgement that a request was accepted.
/// Mirrors `ParamsDownlink` from original_source/lkt_lns/messages.py.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ParamsDownlink {
    pub freq: f64,
    pub datarate: String,
    pub time: f64,
    pub payload: String,
    pub encrypted_payload: String,
    pub port: u8,
    pub counter_down: u32,
}

/// Inbound platform request for a downlink (spec §6 Subscriber, §9 open
/// question 1). Mirrors `ParamsDownlinkRequest`/`ParamsDownlinkResponse`
/// from original_source/lkt_lns/messages.py.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DownlinkRequest {
    pub dev_addr: String,
    pub counter_down: u32,
    pub port: u8,
    /// Base64-encoded plaintext application payload.
    pub payload: String,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub queue_if_late: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "uplink")]
    Uplink { meta: Meta, params: ParamsUplink },
    #[serde(rename = "downlink_response")]
    DownlinkResponse { meta: Meta, params: ParamsDownlinkResponse },
    #[serde(rename = "downlink")]
    Downlink { meta: Meta, params: ParamsDownlink },
    #[serde(rename = "error")]
    Error { meta: Meta, params: ParamsError },
}

/// `packet_id = first 16 hex chars of SHA-256(canonical JSON(rxpk))` (spec
/// §3 invariant, §4.G, invariant 5 of §8).
pub fn packet_id(rxpk: &Rxpk) -> String {
    let canonical = serde_json::to_string(rxpk).expect("Rxpk always serializes");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// `packet_hash = 16 random bytes, hex` (spec §4.G).
pub fn random_packet_hash() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

fn unix_seconds_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Build the uplink envelope (spec §4.G). `plaintext`/`ciphertext` are
/// base64-encoded; `ciphertext` is `rxpk.data` as received.
pub fn build_uplink(
    rxpk: &Rxpk,
    gateway_id_hex: &str,
    device: &Device,
    fport: u8,
    counter_up: u64,
    plaintext_b64: String,
) -> Envelope {
    let (spreading, bandwidth) = crypto::parse_datarate(&rxpk.datr).unwrap_or((0, 0));

    let params = ParamsUplink {
        port: fport,
        rx_time: rxpk.tmst,
        counter_up,
        payload: plaintext_b64,
        encrypted_payload: rxpk.data.clone(),
        duplicate: false,
        radio: Radio {
            freq: rxpk.freq,
            datarate: 0,
            time: 0.0,
            hardware: Hardware {
                status: 1,
                chain: rxpk.rfch.unwrap_or(0),
                tmst: rxpk.tmst,
                snr: rxpk.lsnr.unwrap_or(0.0),
                rssi: rxpk.rssi,
                channel: rxpk.chan.unwrap_or(0),
            },
            modulation: RadioModulation {
                bandwidth,
                kind: rxpk.modu.clone().unwrap_or_else(|| "LORA".to_string()),
                coderate: rxpk.codr.clone().unwrap_or_default(),
                spreading,
            },
        },
        lora: ParamsLora::default(),
    };

    let meta = Meta::for_device(device, gateway_id_hex, packet_id(rxpk), random_packet_hash());

    Envelope::Uplink { meta, params }
}

/// Build the downlink-response envelope (spec §9 open question 1): mirror
/// the inbound request's `counter_down`/`port`/`payload`, echo `packet_hash`.
pub fn build_downlink_response(
    device: &Device,
    gateway_id_hex: &str,
    request: &DownlinkRequest,
    inbound_packet_hash: &str,
) -> Envelope {
    let meta = Meta::for_device(
        device,
        gateway_id_hex,
        random_packet_hash(),
        inbound_packet_hash.to_string(),
    );

    let params = ParamsDownlinkResponse {
        counter_down: request.counter_down,
        port: request.port,
        payload: request.payload.clone(),
        confirmed: request.confirmed,
        queue_if_late: request.queue_if_late,
    };

    Envelope::DownlinkResponse { meta, params }
}

/// Build the envelope for a downlink that was actually handed to the
/// gateway (spec §9's `ParamsDownlink`), published once the scheduler sends
/// the `PULL_RESP`, distinct from `build_downlink_response`'s acceptance ack.
pub fn build_downlink(
    device: &Device,
    gateway_id_hex: &str,
    txpk: &Txpk,
    port: u8,
    counter_down: u32,
    plaintext_b64: String,
) -> Envelope {
    let meta = Meta::for_device(device, gateway_id_hex, random_packet_hash(), random_packet_hash());
    let params = ParamsDownlink {
        freq: txpk.freq,
        datarate: txpk.datr.clone(),
        time: unix_seconds_now(),
        payload: plaintext_b64,
        encrypted_payload: txpk.data.clone(),
        port,
        counter_down,
    };
    Envelope::Downlink { meta, params }
}

/// Radio context of the most recent LoRaWAN uplink from a device, kept so
/// a later platform-supplied `DownlinkRequest` can be timed against the
/// gateway's own clock (RX1 is relative to the uplink that opened it, not
/// to the bridge's own wall clock).
#[derive(Debug, Clone)]
pub struct UplinkContext {
    pub tmst: u64,
    pub tmms: Option<u64>,
    pub freq: f64,
    pub gateway_id_hex: String,
}

impl UplinkContext {
    pub fn from_rxpk(rxpk: &Rxpk, gateway_id_hex: &str) -> Self {
        Self {
            tmst: rxpk.tmst,
            tmms: rxpk.tmms,
            freq: rxpk.freq,
            gateway_id_hex: gateway_id_hex.to_string(),
        }
    }
}

/// Build the RX1-window `Txpk` for a LoRaWAN downlink answering `rxpk`
/// (spec §4.G): `tmst += 5_000_000`, `tmms = (tmms or 0) + 5_000`,
/// `freq = downlink_of(rxpk.freq)`, `datr = "SF10BW500"`, `ipol = true`.
#[allow(clippy::too_many_arguments)]
pub fn build_rx1_txpk(
    rxpk: &Rxpk,
    dev_addr: u32,
    nwk_skey: &[u8; 16],
    app_skey: &[u8; 16],
    plaintext: &[u8],
    fcnt: u32,
    fport: u8,
    confirmed: bool,
) -> Option<Txpk> {
    let freq = crypto::downlink_of(rxpk.freq)?;
    let (b64, size) = crate::lorawan::build_downlink(dev_addr, nwk_skey, app_skey, plaintext, fcnt, fport, confirmed);

    Some(Txpk {
        imme: None,
        tmst: Some(rxpk.tmst + 5_000_000),
        tmms: Some(rxpk.tmms.unwrap_or(0) + 5_000),
        freq,
        rfch: Some(0),
        powe: Some(14),
        modu: Some("LORA".to_string()),
        datr: "SF10BW500".to_string(),
        codr: Some("4/5".to_string()),
        ipol: Some(true),
        size: size as u16,
        data: b64,
    })
}

/// As `build_rx1_txpk`, but timed against a remembered `UplinkContext`
/// rather than a freshly received `Rxpk` — used when translating a
/// platform `DownlinkRequest` that arrives asynchronously, after the
/// triggering uplink has already been published (spec §4.G, §6).
#[allow(clippy::too_many_arguments)]
pub fn build_rx1_txpk_from_context(
    ctx: &UplinkContext,
    dev_addr: u32,
    nwk_skey: &[u8; 16],
    app_skey: &[u8; 16],
    plaintext: &[u8],
    fcnt: u32,
    fport: u8,
    confirmed: bool,
) -> Option<Txpk> {
    let freq = crypto::downlink_of(ctx.freq)?;
    let (b64, size) = crate::lorawan::build_downlink(dev_addr, nwk_skey, app_skey, plaintext, fcnt, fport, confirmed);

    Some(Txpk {
        imme: None,
        tmst: Some(ctx.tmst + 5_000_000),
        tmms: Some(ctx.tmms.unwrap_or(0) + 5_000),
        freq,
        rfch: Some(0),
        powe: Some(14),
        modu: Some("LORA".to_string()),
        datr: "SF10BW500".to_string(),
        codr: Some("4/5".to_string()),
        ipol: Some(true),
        size: size as u16,
        data: b64,
    })
}

/// Build the default P2P downlink `Txpk` (spec §4.G): `tmst +=
/// 1_000_000`, `tmms += 1`, `ipol = false`, `datr = "SF11BW500"`.
pub fn build_p2p_txpk(rxpk: &Rxpk, data_b64: String, size: u16) -> Txpk {
    Txpk {
        imme: None,
        tmst: Some(rxpk.tmst + 1_000_000),
        tmms: Some(rxpk.tmms.unwrap_or(0) + 1),
        freq: rxpk.freq,
        rfch: Some(0),
        powe: Some(14),
        modu: Some("LORA".to_string()),
        datr: "SF11BW500".to_string(),
        codr: Some("4/5".to_string()),
        ipol: Some(false),
        size,
        data: data_b64,
    }
}

/// Build an error envelope for a downlink-request that couldn't be
/// translated (spec §9 `ParamsError`). Unlike `build_uplink`/
/// `build_downlink_response` this has no `Device` to key `Meta` off of, so
/// `device_addr` is the only identifying field populated.
pub fn build_error(device_addr: &str, message: &str) -> Envelope {
    let meta = Meta {
        device: String::new(),
        device_addr: device_addr.to_string(),
        application: String::new(),
        gateway: String::new(),
        packet_hash: random_packet_hash(),
        packet_id: String::new(),
        time: unix_seconds_now(),
        version: 1,
        outdated: false,
        history: false,
        network: String::new(),
    };
    let params = ParamsError {
        message: message.to_string(),
        code: 1,
    };
    Envelope::Error { meta, params }
}

/// Verify the uplink MIC; a mismatch is logged but never drops the packet
/// (spec §9 open question 3).
pub fn check_mic(nwk_skey: &[u8; 16], dev_addr: u32, fcnt: u32, msg: &[u8], received: [u8; 4]) {
    let expected = crypto::mic(nwk_skey, dev_addr, fcnt, crypto::Direction::Up, msg);
    if expected != received {
        let err = crate::error::BridgeError::MicMismatch {
            dev_addr: format!("{dev_addr:08X}"),
        };
        warn!("{err} (expected {}, got {})", hex::encode(expected), hex::encode(received));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rxpk() -> Rxpk {
        Rxpk {
            time: None,
            tmst: 1_000_000,
            tmms: None,
            chan: Some(2),
            rfch: Some(0),
            freq: 915.2,
            modu: Some("LORA".into()),
            datr: "SF7BW125".into(),
            codr: Some("4/5".into()),
            rssi: -80.0,
            lsnr: Some(7.5),
            size: 4,
            data: "AQIDBA==".into(),
        }
    }

    fn sample_device() -> Device {
        Device {
            dev_eui: "dev-1".into(),
            app_eui: "app-1".into(),
            dev_addr: "26011BDA".into(),
            nwk_skey: [0u8; 16],
            app_skey: [1u8; 16],
        }
    }

    /// Invariant 5: identical rxpk ⇒ identical packet_id; a field change
    /// changes it.
    #[test]
    fn packet_id_is_idempotent_and_sensitive() {
        let a = sample_rxpk();
        let mut b = sample_rxpk();
        assert_eq!(packet_id(&a), packet_id(&a));
        assert_eq!(packet_id(&a), packet_id(&b));

        b.rssi = -81.0;
        assert_ne!(packet_id(&a), packet_id(&b));
    }

    #[test]
    fn packet_id_is_16_hex_chars() {
        let id = packet_id(&sample_rxpk());
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn build_uplink_envelope_carries_fields() {
        let rxpk = sample_rxpk();
        let device = sample_device();
        let env = build_uplink(&rxpk, "0102030405060708", &device, 57, 42, "AQIDBA==".to_string());
        match env {
            Envelope::Uplink { meta, params } => {
                assert_eq!(meta.device_addr, "26011BDA");
                assert_eq!(params.port, 57);
                assert_eq!(params.counter_up, 42);
                assert_eq!(params.payload, "AQIDBA==");
                assert_eq!(params.radio.modulation.spreading, 7);
                assert_eq!(params.radio.modulation.bandwidth, 125_000);
            }
            _ => panic!("expected Uplink"),
        }
    }

    #[test]
    fn uplink_envelope_serializes_to_tagged_shape() {
        let rxpk = sample_rxpk();
        let device = sample_device();
        let env = build_uplink(&rxpk, "gw", &device, 1, 1, "AA==".to_string());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "uplink");
        assert!(json["meta"].is_object());
        assert!(json["params"].is_object());
    }

    #[test]
    fn rx1_txpk_applies_spec_offsets() {
        let rxpk = sample_rxpk();
        let nwk = [0u8; 16];
        let app = [1u8; 16];
        let txpk = build_rx1_txpk(&rxpk, 0x26011BDA, &nwk, &app, b"hi", 3, 10, false).unwrap();
        assert_eq!(txpk.tmst, Some(rxpk.tmst + 5_000_000));
        assert_eq!(txpk.tmms, Some(5_000));
        assert_eq!(txpk.freq, 923.3);
        assert_eq!(txpk.datr, "SF10BW500");
        assert_eq!(txpk.ipol, Some(true));
    }

    #[test]
    fn p2p_txpk_applies_spec_offsets() {
        let rxpk = sample_rxpk();
        let txpk = build_p2p_txpk(&rxpk, "AA==".into(), 1);
        assert_eq!(txpk.tmst, Some(rxpk.tmst + 1_000_000));
        assert_eq!(txpk.tmms, Some(1));
        assert_eq!(txpk.datr, "SF11BW500");
        assert_eq!(txpk.ipol, Some(false));
    }

    #[test]
    fn rx1_txpk_from_context_matches_direct() {
        let rxpk = sample_rxpk();
        let ctx = UplinkContext::from_rxpk(&rxpk, "gw");
        let nwk = [0u8; 16];
        let app = [1u8; 16];
        let direct = build_rx1_txpk(&rxpk, 0x26011BDA, &nwk, &app, b"hi", 3, 10, false).unwrap();
        let via_ctx = build_rx1_txpk_from_context(&ctx, 0x26011BDA, &nwk, &app, b"hi", 3, 10, false).unwrap();
        assert_eq!(direct.tmst, via_ctx.tmst);
        assert_eq!(direct.tmms, via_ctx.tmms);
        assert_eq!(direct.freq, via_ctx.freq);
        assert_eq!(direct.data, via_ctx.data);
    }

    #[test]
    fn downlink_response_mirrors_request() {
        let device = sample_device();
        let req = DownlinkRequest {
            dev_addr: "26011BDA".into(),
            counter_down: 9,
            port: 5,
            payload: "AQ==".into(),
            confirmed: true,
            queue_if_late: false,
        };
        let env = build_downlink_response(&device, "gw", &req, "abc123");
        match env {
            Envelope::DownlinkResponse { meta, params } => {
                assert_eq!(meta.packet_hash, "abc123");
                assert_eq!(params.counter_down, 9);
                assert_eq!(params.port, 5);
                assert_eq!(params.payload, "AQ==");
                assert!(params.confirmed);
            }
            _ => panic!("expected DownlinkResponse"),
        }
    }

    #[test]
    fn downlink_envelope_carries_txpk_fields() {
        let device = sample_device();
        let txpk = build_rx1_txpk(&sample_rxpk(), 0x26011BDA, &[0u8; 16], &[1u8; 16], b"hi", 3, 10, false).unwrap();
        let env = build_downlink(&device, "gw", &txpk, 10, 3, "aGk=".to_string());
        match env {
            Envelope::Downlink { meta, params } => {
                assert_eq!(meta.device_addr, "26011BDA");
                assert_eq!(params.freq, txpk.freq);
                assert_eq!(params.datarate, "SF10BW500");
                assert_eq!(params.port, 10);
                assert_eq!(params.counter_down, 3);
                assert_eq!(params.payload, "aGk=");
            }
            _ => panic!("expected Downlink"),
        }
    }

    #[test]
    fn error_envelope_carries_device_addr_and_message() {
        let env = build_error("26011BDA", "unknown device");
        match env {
            Envelope::Error { meta, params } => {
                assert_eq!(meta.device_addr, "26011BDA");
                assert_eq!(params.message, "unknown device");
            }
            _ => panic!("expected Error"),
        }
    }
}
