//! Radio JSON model (spec §3, §4.B) — `rxpk` / `txpk` schemas.
//!
//! Unknown fields are tolerated on input (`serde(default)` on optional
//! fields) and omitted on output. `tmms` is optional on both.

use serde::{Deserialize, Serialize};

/// Radio reception descriptor produced by the gateway.
///
/// Invariant: `size == len(base64-decode(data))` — callers validate this
/// at the point `data` is decoded (`codec::base64_decode`), not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Internal concentrator timestamp, microseconds.
    pub tmst: u64,
    /// GPS time, milliseconds since GPS epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// RF channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chan: Option<u8>,
    /// Concentrator RF chain used for RX.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u8>,
    /// RX central frequency, MHz.
    pub freq: f64,
    /// Modulation, "LORA" or "FSK".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    /// Datarate identifier, e.g. "SF7BW125".
    pub datr: String,
    /// Coding rate, e.g. "4/5".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// RSSI in dBm.
    pub rssi: f64,
    /// Signal-to-noise ratio in dB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    /// RF packet payload size, bytes.
    pub size: u16,
    /// Base64-encoded PHY payload.
    pub data: String,
}

/// Radio transmission instruction.
///
/// Invariants (spec §3): exactly one of `imme=true` or `tmst` set; `datr`
/// of the form `SF{7..12}BW{125|500}`; `data` base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    pub freq: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powe: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    pub datr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    pub size: u16,
    pub data: String,
}

/// Wrapper matching the `{"rxpk": [...]}` uplink JSON batch (spec §4.B).
#[derive(Debug, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Option<Vec<Rxpk>>,
    pub stat: Option<serde_json::Value>,
}

/// Wrapper matching the single-key `{"txpk": {...}}` downlink JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

pub fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input)
}

pub fn base64_encode(input: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(input)
}
