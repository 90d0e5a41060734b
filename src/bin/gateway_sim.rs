//! Gateway Simulator
//!
//! Simulates a LoRa gateway speaking Semtech UDP Packet Forwarder to the
//! bridge's two sockets: PUSH_DATA uplinks against the uplink port, and a
//! PULL_DATA poll against the downlink port. Frames carry real AES-128
//! encrypted payloads and AES-CMAC MICs (reimplemented locally since this
//! binary has no access to the main crate's library internals), so a
//! running bridge configured with the same NwkSKey/AppSKey will decrypt and
//! publish them.
//!
//! Usage: cargo run --bin gateway-sim [uplink_addr] [downlink_addr]

use std::env;
use std::net::SocketAddr;

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};

const PROTOCOL_VERSION: u8 = 0x02;
const PUSH_DATA: u8 = 0x00;
const PULL_DATA: u8 = 0x02;

const GATEWAY_EUI: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];

/// Test device: matches the key pair used throughout the bridge's own unit
/// tests, so a locally running bridge with this device in its directory
/// will verify the MIC and decrypt the payload correctly.
const NWK_SKEY: [u8; 16] = [0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C];
const APP_SKEY: [u8; 16] = [0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C];
const DEV_ADDR: u32 = 0x26011BDA;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let uplink_addr: SocketAddr = args.next().unwrap_or_else(|| "127.0.0.1:1730".to_string()).parse()?;
    let downlink_addr: SocketAddr = args.next().unwrap_or_else(|| "127.0.0.1:1700".to_string()).parse()?;

    println!("LoRaWAN bridge gateway simulator");
    println!("  uplink target:   {uplink_addr}");
    println!("  downlink target: {downlink_addr}");
    println!("  gateway id:      {}", hex::encode(GATEWAY_EUI));
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut token: u16 = 0;

    let scenarios = vec![
        ("temperature sensor, unconfirmed", unconfirmed_frame(1, 0x01, &[0x00, 0xE1])),
        ("door sensor, confirmed", confirmed_frame(7, 0x02, &[0x01])),
        ("humidity sensor, unconfirmed", unconfirmed_frame(2, 0x01, &[0x41])),
    ];

    for (desc, phy) in &scenarios {
        token = token.wrapping_add(1);
        let packet = build_push_data(token, &GATEWAY_EUI, phy);

        println!("sending: {desc} ({} byte PHY)", phy.len());
        socket.send_to(&packet, uplink_addr).await?;

        let mut ack_buf = [0u8; 64];
        match tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut ack_buf)).await {
            Ok(Ok((len, from))) if len >= 4 && ack_buf[3] == 0x01 => {
                println!("  PUSH_ACK received from {from}");
            }
            Ok(Ok((len, from))) => println!("  unexpected {len}-byte response from {from}"),
            Ok(Err(e)) => println!("  recv error: {e}"),
            Err(_) => println!("  no ACK (timeout)"),
        }
        println!();

        sleep(Duration::from_millis(500)).await;
    }

    println!("polling the downlink socket for any queued response");
    token = token.wrapping_add(1);
    let pull_data = build_pull_data(token, &GATEWAY_EUI);
    socket.send_to(&pull_data, downlink_addr).await?;

    let mut buf = [0u8; 512];
    match tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) if len >= 4 && buf[3] == 0x04 => println!("  PULL_ACK received from {from}"),
        Ok(Ok((len, from))) => println!("  {len}-byte response from {from} (PULL_RESP if a downlink was queued)"),
        Ok(Err(e)) => println!("  recv error: {e}"),
        Err(_) => println!("  no response (timeout)"),
    }

    println!();
    println!("done");
    Ok(())
}

fn build_push_data(token: u16, gateway_eui: &[u8; 8], phy: &[u8]) -> Vec<u8> {
    let json = rxpk_json(phy);
    let mut packet = Vec::new();
    packet.push(PROTOCOL_VERSION);
    packet.push((token >> 8) as u8);
    packet.push(token as u8);
    packet.push(PUSH_DATA);
    packet.extend_from_slice(gateway_eui);
    packet.extend_from_slice(json.as_bytes());
    packet
}

fn build_pull_data(token: u16, gateway_eui: &[u8; 8]) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.push(PROTOCOL_VERSION);
    packet.push((token >> 8) as u8);
    packet.push(token as u8);
    packet.push(PULL_DATA);
    packet.extend_from_slice(gateway_eui);
    packet
}

fn rxpk_json(phy: &[u8]) -> String {
    use base64::Engine;
    let data = base64::engine::general_purpose::STANDARD.encode(phy);
    format!(
        r#"{{"rxpk":[{{"freq":915.2,"rssi":-65,"lsnr":7.5,"datr":"SF7BW125","codr":"4/5","size":{},"data":"{}"}}]}}"#,
        phy.len(),
        data
    )
}

/// Build a real unconfirmed-uplink PHY payload: encrypted FRMPayload and a
/// CMAC'd MIC, so a bridge holding the matching keys decrypts it correctly.
fn unconfirmed_frame(fcnt: u16, fport: u8, plaintext: &[u8]) -> Vec<u8> {
    build_frame(0x40, fcnt, fport, plaintext)
}

fn confirmed_frame(fcnt: u16, fport: u8, plaintext: &[u8]) -> Vec<u8> {
    build_frame(0x80, fcnt, fport, plaintext)
}

fn build_frame(mhdr: u8, fcnt: u16, fport: u8, plaintext: &[u8]) -> Vec<u8> {
    let dev_addr_le = DEV_ADDR.to_le_bytes();
    let ciphertext = crypt_payload(&APP_SKEY, DEV_ADDR, fcnt as u32, Direction::Up, plaintext);

    let mut msg = vec![mhdr];
    msg.extend_from_slice(&dev_addr_le);
    msg.push(0x00); // FCtrl
    msg.extend_from_slice(&fcnt.to_le_bytes());
    msg.push(fport);
    msg.extend_from_slice(&ciphertext);

    let tag = mic(&NWK_SKEY, DEV_ADDR, fcnt as u32, Direction::Up, &msg);
    msg.extend_from_slice(&tag);
    msg
}

#[derive(Clone, Copy)]
#[repr(u8)]
enum Direction {
    Up = 0,
}

fn crypt_payload(key: &[u8; 16], dev_addr: u32, fcnt: u32, dir: Direction, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new_from_slice(key).expect("16-byte key");
    let dev_addr_le = dev_addr.to_le_bytes();
    let fcnt_le = fcnt.to_le_bytes();

    let mut keystream = Vec::with_capacity(data.len().div_ceil(16) * 16);
    let mut block_num: u8 = 1;
    while keystream.len() < data.len() {
        let mut a_i = [0u8; 16];
        a_i[0] = 0x01;
        a_i[5] = dir as u8;
        a_i[6..10].copy_from_slice(&dev_addr_le);
        a_i[10..14].copy_from_slice(&fcnt_le);
        a_i[15] = block_num;

        let mut block = aes::Block::clone_from_slice(&a_i);
        cipher.encrypt_block(&mut block);
        keystream.extend_from_slice(&block);
        block_num = block_num.wrapping_add(1);
    }

    data.iter().zip(keystream.iter()).map(|(d, s)| d ^ s).collect()
}

fn mic(key: &[u8; 16], dev_addr: u32, fcnt: u32, dir: Direction, msg: &[u8]) -> [u8; 4] {
    let dev_addr_le = dev_addr.to_le_bytes();
    let fcnt_le = fcnt.to_le_bytes();

    let mut b0 = [0u8; 16];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr_le);
    b0[10..14].copy_from_slice(&fcnt_le);
    b0[15] = msg.len() as u8;

    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("16-byte key");
    mac.update(&b0);
    mac.update(msg);
    let full = mac.finalize().into_bytes();

    let mut out = [0u8; 4];
    out.copy_from_slice(&full[..4]);
    out
}
