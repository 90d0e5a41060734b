//! Error kinds for the bridge core (spec §7).
//!
//! Pipeline loops catch these at the datagram boundary, log at the level
//! the table in spec §7 prescribes, and continue — no per-packet error is
//! fatal to a running pipeline. Fatal errors (bind, directory misconfig,
//! publisher connect) propagate out of `Supervisor::run` as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed GWMP frame: {0}")]
    MalformedFrame(String),

    #[error("unknown GWMP packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("invalid LoRaWAN PHY payload: {0}")]
    InvalidPhy(String),

    #[error("unknown device for DevAddr {0}")]
    UnknownDevice(String),

    #[error("MIC mismatch for DevAddr {dev_addr} (processed anyway)")]
    MicMismatch { dev_addr: String },

    #[error("device directory unavailable: {0}")]
    DirectoryUnavailable(#[source] anyhow::Error),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("downlink window missed (deadline {deadline_ms}, now {now_ms})")]
    DownlinkWindowMissed { deadline_ms: i64, now_ms: i64 },

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}
