//! Semtech Gateway Message Protocol (GWMP) codec (spec §4.A).
//!
//! Reference: <https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT>
//!
//! ```text
//! byte 0     : protocol version = 0x02
//! bytes 1-2  : random token (echoed in ACK)
//! byte 3     : packet type
//! bytes 4-11 : gateway identifier (8 bytes)
//! bytes 12+  : optional JSON payload
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::BridgeError;

pub const PROTOCOL_VERSION: u8 = 0x02;

/// 8-byte gateway identifier, opaque to the core.
pub type GatewayId = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            other => Err(BridgeError::UnknownPacketType(other)),
        }
    }
}

/// A decoded GWMP frame header plus its raw trailing payload bytes.
#[derive(Debug, Clone)]
pub struct GwmpFrame {
    pub version: u8,
    pub token: u16,
    pub packet_type: PacketType,
    pub gateway_id: GatewayId,
    pub body: Vec<u8>,
}

/// Decode a raw UDP datagram into `(version, token, type, gateway_id, body)`.
///
/// Fails with `MalformedFrame` if shorter than 12 bytes; fails with
/// `UnknownPacketType` if the type byte is unrecognized.
pub fn decode(data: &[u8]) -> Result<GwmpFrame, BridgeError> {
    if data.len() < 12 {
        return Err(BridgeError::MalformedFrame(format!(
            "frame too short: {} bytes (minimum 12)",
            data.len()
        )));
    }

    let mut buf = data;
    let version = buf.get_u8();
    let token = buf.get_u16();
    let packet_type = PacketType::try_from(buf.get_u8())?;
    let mut gateway_id = [0u8; 8];
    buf.copy_to_slice(&mut gateway_id);
    let body = buf.to_vec();

    Ok(GwmpFrame {
        version,
        token,
        packet_type,
        gateway_id,
        body,
    })
}

/// Encode just the 12-byte header (no JSON body).
pub fn encode_header(version: u8, token: u16, packet_type: PacketType, gateway_id: GatewayId) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(version);
    buf.put_u16(token);
    buf.put_u8(packet_type as u8);
    buf.put_slice(&gateway_id);
    buf.to_vec()
}

/// Build a `PUSH_ACK`/`PULL_ACK` for the given original token+gateway id.
///
/// `ack_type` must be `PacketType::PushAck` or `PacketType::PullAck`.
pub fn encode_ack(original_token: u16, ack_type: PacketType, gateway_id: GatewayId) -> Vec<u8> {
    encode_header(PROTOCOL_VERSION, original_token, ack_type, gateway_id)
}

/// Build a `PULL_RESP`: header (version=2, type=PULL_RESP) followed by a
/// compact `{"txpk": {...}}` JSON body with whitespace stripped.
pub fn encode_pull_resp(
    token: u16,
    gateway_id: GatewayId,
    txpk: &crate::codec::radio::Txpk,
) -> Result<Vec<u8>, serde_json::Error> {
    let payload = crate::codec::radio::PullRespPayload { txpk: txpk.clone() };
    let json = serde_json::to_string(&payload)?;
    let mut out = encode_header(PROTOCOL_VERSION, token, PacketType::PullResp, gateway_id);
    out.extend_from_slice(json.as_bytes());
    Ok(out)
}
