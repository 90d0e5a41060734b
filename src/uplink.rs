//! Uplink pipeline (spec §4.E): UDP receive → decode → ACK → classify
//! (LoRaWAN vs P2P) → crypto → envelope → publish.
//!
//! Grounded on the teacher's `src/udp/mod.rs::run_server`/`handle_packet`
//! for the recv-loop/ACK-first structure; the P2P/LoRaWAN frequency split
//! and the observability-only `fcnt` counter are grounded on
//! original_source/lkt_lns/upstream.py's `upstream_thread`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::codec::{gwmp, radio};
use crate::directory::DirectoryCache;
use crate::envelope::{self, UplinkContext};
use crate::error::BridgeError;
use crate::lorawan;
use crate::publisher::Publisher;

/// P2P/LoRaWAN uplink-band split (spec §4.E).
pub const P2P_FREQ_THRESHOLD: f64 = 903.5;

/// Recv timeout; also the floor on refresh-cadence progress (spec §4.E, §5).
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared map of `dev_addr_hex -> UplinkContext`, written here and read by
/// the downlink-request translation step (spec §4.G, §6).
pub type SharedUplinkContexts = Arc<RwLock<HashMap<String, UplinkContext>>>;

/// Decryption/MIC-verification toggles (spec §6 `[lorawan]`). Both default
/// to on; an operator can disable either for a cleartext test network.
#[derive(Debug, Clone, Copy)]
pub struct LorawanOptions {
    pub decrypt_payload: bool,
    pub verify_mic: bool,
}

pub async fn run(
    bind_addr: &str,
    directory: Arc<DirectoryCache>,
    publisher: Arc<dyn Publisher>,
    publish_topic: String,
    contexts: SharedUplinkContexts,
    options: LorawanOptions,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    info!("uplink socket listening on {bind_addr}");

    directory.refresh_all().await;
    let mut last_refresh = Instant::now();
    let mut fcnt: u64 = 0;

    let mut buf = vec![0u8; 4096];
    loop {
        let recv = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await;
        let (len, src) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!("uplink socket error: {e}");
                continue;
            }
            Err(_) => {
                // Timeout: no traffic, still a chance to refresh (spec §4.E/§5).
                if last_refresh.elapsed() >= crate::directory::REFRESH_INTERVAL {
                    directory.refresh_all().await;
                    last_refresh = Instant::now();
                }
                continue;
            }
        };

        if last_refresh.elapsed() >= crate::directory::REFRESH_INTERVAL {
            directory.refresh_all().await;
            last_refresh = Instant::now();
        }

        let frame = match gwmp::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame from {src}: {e}");
                continue;
            }
        };

        if frame.packet_type != gwmp::PacketType::PushData {
            continue;
        }

        let ack = gwmp::encode_ack(frame.token, gwmp::PacketType::PushAck, frame.gateway_id);
        if let Err(e) = socket.send_to(&ack, src).await {
            error!("failed to send PUSH_ACK to {src}: {e}");
        }

        let payload: radio::PushDataPayload = match serde_json::from_slice(&frame.body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to parse PUSH_DATA JSON from {src}: {e}");
                continue;
            }
        };

        let Some(rxpk) = payload.rxpk.and_then(|mut v| v.pop()) else {
            continue;
        };

        let gateway_id_hex = hex::encode(frame.gateway_id);

        if rxpk.freq < P2P_FREQ_THRESHOLD {
            handle_p2p(&rxpk);
            continue;
        }

        if let Err(e) = handle_lorawan(&rxpk, &gateway_id_hex, &directory, &publisher, &publish_topic, &contexts, &mut fcnt, options).await {
            warn!("uplink dropped: {e}");
        }
    }
}

/// Proprietary P2P frame: `cnt(1) || lora_id(3) || payload(rest)`. Decoded
/// only for logging; no publish in this core (spec §4.E).
fn handle_p2p(rxpk: &radio::Rxpk) {
    let raw = match radio::base64_decode(&rxpk.data) {
        Ok(raw) => raw,
        Err(e) => {
            error!("invalid P2P base64: {e}");
            return;
        }
    };
    if raw.len() < 4 {
        error!("invalid P2P frame: {} bytes (minimum 4)", raw.len());
        return;
    }
    let cnt = raw[0];
    let lora_id = hex::encode(&raw[1..4]);
    debug!("P2P: cnt={cnt}, lora_id={lora_id}, payload={}", hex::encode(&raw[4..]));
}

#[allow(clippy::too_many_arguments)]
async fn handle_lorawan(
    rxpk: &radio::Rxpk,
    gateway_id_hex: &str,
    directory: &DirectoryCache,
    publisher: &Arc<dyn Publisher>,
    publish_topic: &str,
    contexts: &SharedUplinkContexts,
    fcnt: &mut u64,
    options: LorawanOptions,
) -> Result<(), BridgeError> {
    let phy_raw = radio::base64_decode(&rxpk.data).map_err(|e| BridgeError::InvalidPhy(e.to_string()))?;
    let phy = lorawan::parse_uplink_phy(&phy_raw)?;

    if phy.fport == 0 || phy.frm_payload.is_empty() {
        debug!("no application payload (FPort 0 or empty FRMPayload)");
        return Ok(());
    }

    let dev_addr_hex = format!("{:08X}", phy.dev_addr);
    let device = directory
        .lookup_or_fetch(&dev_addr_hex)
        .await
        .ok_or_else(|| BridgeError::UnknownDevice(dev_addr_hex.clone()))?;

    let fcnt32 = phy.fcnt16 as u32;
    if options.verify_mic {
        envelope::check_mic(&device.nwk_skey, phy.dev_addr, fcnt32, &phy.mic_covered(), phy.mic);
    }

    let plaintext = if options.decrypt_payload {
        lorawan::crypto::crypt_payload(&device.app_skey, phy.dev_addr, fcnt32, lorawan::Direction::Up, &phy.frm_payload)
    } else {
        phy.frm_payload.clone()
    };

    *fcnt += 1;
    let env = envelope::build_uplink(rxpk, gateway_id_hex, &device, phy.fport, *fcnt, radio::base64_encode(&plaintext));

    let payload = serde_json::to_vec(&env).expect("envelope always serializes");
    if let Err(e) = publisher.publish(publish_topic, &payload, 0).await {
        error!("publish failed: {e:#}");
        return Err(BridgeError::PublishFailed(e.to_string()));
    }

    let ctx = UplinkContext::from_rxpk(rxpk, gateway_id_hex);
    contexts.write().await.insert(dev_addr_hex, ctx);

    Ok(())
}
