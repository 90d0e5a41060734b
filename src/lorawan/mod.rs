//! LoRaWAN 1.0.x PHY codec (spec §3, §4.C).
//!
//! `PHYPayload = MHDR(1) || DevAddr(4 LE) || FCtrl(1) || FCnt(2 LE) ||
//! [FOpts] || FPort(1) || FRMPayload || MIC(4)`. This core assumes
//! `FOptsLen = 0` (spec §3).

pub mod crypto;

use crate::error::BridgeError;
pub use crypto::Direction;

/// Minimum accepted PHYPayload length (spec §3).
pub const MIN_PHY_LEN: usize = 12;

/// MHDR byte for unconfirmed/confirmed data-down frames (spec §4.C).
const MHDR_UNCONFIRMED_DOWN: u8 = 0x60;
const MHDR_CONFIRMED_DOWN: u8 = 0xA0;

/// Fields extracted from an uplink PHYPayload under the `FOptsLen = 0`
/// assumption (spec §4.C "Uplink PHY parse" table).
#[derive(Debug, Clone)]
pub struct UplinkPhy {
    pub mhdr: u8,
    pub dev_addr: u32,
    pub fctrl: u8,
    pub fcnt16: u16,
    pub fport: u8,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

impl UplinkPhy {
    /// Bytes of the message covered by the MIC: `MHDR || MACPayload`.
    pub fn mic_covered(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.frm_payload.len());
        out.push(self.mhdr);
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(self.fctrl);
        out.extend_from_slice(&self.fcnt16.to_le_bytes());
        out.push(self.fport);
        out.extend_from_slice(&self.frm_payload);
        out
    }
}

/// Parse a PHYPayload under the `FOptsLen = 0` assumption.
///
/// Rejects PHY shorter than 12 bytes. Does not itself special-case
/// `FPort == 0` / empty `FRMPayload` — callers check those (spec §4.E).
pub fn parse_uplink_phy(data: &[u8]) -> Result<UplinkPhy, BridgeError> {
    if data.len() < MIN_PHY_LEN {
        return Err(BridgeError::InvalidPhy(format!(
            "PHY too short: {} bytes (minimum {})",
            data.len(),
            MIN_PHY_LEN
        )));
    }

    let mhdr = data[0];
    let dev_addr = u32::from_le_bytes(data[1..5].try_into().unwrap());
    let fctrl = data[5];
    let fcnt16 = u16::from_le_bytes(data[6..8].try_into().unwrap());
    let fport = data[8];
    let mic_start = data.len() - 4;
    let frm_payload = data[9..mic_start].to_vec();
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&data[mic_start..]);

    Ok(UplinkPhy {
        mhdr,
        dev_addr,
        fctrl,
        fcnt16,
        fport,
        frm_payload,
        mic,
    })
}

/// Build a downlink PHYPayload (spec §4.C "Downlink assembly").
///
/// Returns `(base64(PHY), len(PHY))`. Only the low 16 bits of `fcnt` appear
/// on the wire (FHDR); the cryptographic contexts use the full 32-bit
/// value.
pub fn build_downlink(
    dev_addr: u32,
    nwk_skey: &[u8; 16],
    app_skey: &[u8; 16],
    payload: &[u8],
    fcnt: u32,
    fport: u8,
    confirmed: bool,
) -> (String, usize) {
    let mhdr = if confirmed { MHDR_CONFIRMED_DOWN } else { MHDR_UNCONFIRMED_DOWN };

    let mut fhdr = Vec::with_capacity(7);
    fhdr.extend_from_slice(&dev_addr.to_le_bytes());
    fhdr.push(0x00); // FCtrl
    fhdr.extend_from_slice(&(fcnt as u16).to_le_bytes());

    let frm_payload = crypto::crypt_payload(app_skey, dev_addr, fcnt, Direction::Down, payload);

    let mut mac_payload = Vec::with_capacity(fhdr.len() + 1 + frm_payload.len());
    mac_payload.extend_from_slice(&fhdr);
    mac_payload.push(fport);
    mac_payload.extend_from_slice(&frm_payload);

    let mut msg = Vec::with_capacity(1 + mac_payload.len());
    msg.push(mhdr);
    msg.extend_from_slice(&mac_payload);

    let mic = crypto::mic(nwk_skey, dev_addr, fcnt, Direction::Down, &msg);

    let mut phy = msg;
    phy.extend_from_slice(&mic);

    (crate::codec::radio::base64_encode(&phy), phy.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex_str: &str) -> [u8; 16] {
        let bytes = hex::decode(hex_str).unwrap();
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        out
    }

    #[test]
    fn parse_rejects_short_phy() {
        let result = parse_uplink_phy(&[0x40, 1, 2, 3]);
        assert!(matches!(result, Err(BridgeError::InvalidPhy(_))));
    }

    #[test]
    fn parse_extracts_fields() {
        let data: Vec<u8> = vec![
            0x40, // MHDR
            0x04, 0x03, 0x02, 0x01, // DevAddr (LE)
            0x00, // FCtrl
            0x01, 0x00, // FCnt (LE)
            0x39, // FPort = 57
            0xAA, 0xBB, // FRMPayload
            0xEF, 0xBE, 0xAD, 0xDE, // MIC (LE)
        ];
        let phy = parse_uplink_phy(&data).unwrap();
        assert_eq!(phy.dev_addr, 0x01020304);
        assert_eq!(phy.fcnt16, 1);
        assert_eq!(phy.fport, 57);
        assert_eq!(phy.frm_payload, vec![0xAA, 0xBB]);
        assert_eq!(phy.mic, [0xEF, 0xBE, 0xAD, 0xDE]);
    }

    /// Building a downlink then parsing it back recovers dev_addr/fcnt/fport
    /// and a MIC that verifies with the same NwkSKey.
    #[test]
    fn build_downlink_round_trips_through_parse() {
        let nwk = key("2B7E151628AED2A6ABF7158809CF4F3C");
        let app = key("000102030405060708090A0B0C0D0E0F");
        let dev_addr = 0x26011BDAu32;

        let (b64, len) = build_downlink(dev_addr, &nwk, &app, b"hello", 5, 10, false);
        let phy = crate::codec::radio::base64_decode(&b64).unwrap();
        assert_eq!(phy.len(), len);

        let parsed = parse_uplink_phy(&phy).unwrap();
        assert_eq!(parsed.dev_addr, dev_addr);
        assert_eq!(parsed.fcnt16, 5);
        assert_eq!(parsed.fport, 10);

        let expected_mic = crypto::mic(&nwk, dev_addr, 5, Direction::Down, &parsed.mic_covered());
        assert_eq!(parsed.mic, expected_mic);

        let plaintext = crypto::crypt_payload(&app, dev_addr, 5, Direction::Down, &parsed.frm_payload);
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn confirmed_downlink_sets_mhdr() {
        let key16 = [0u8; 16];
        let (b64, _) = build_downlink(1, &key16, &key16, b"x", 0, 1, true);
        let phy = crate::codec::radio::base64_decode(&b64).unwrap();
        assert_eq!(phy[0], MHDR_CONFIRMED_DOWN);
    }
}
