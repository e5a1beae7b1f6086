//! Gateway Simulator
//!
//! Simulates a LoRa gateway speaking the Semtech UDP packet forwarder
//! protocol to a server. Useful for testing without hardware.
//!
//! Sends a PULL_DATA keep-alive, then a series of PUSH_DATA datagrams, and
//! answers any PULL_RESP it receives with a PULL_ACK.
//!
//! Usage: cargo run --bin gateway-sim [server_addr]

use std::env;
use std::net::SocketAddr;

use chrono::{SubsecRound, Utc};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

use lora_pktfwd::udp::payload::CrcStatus;
use lora_pktfwd::{DataRate, GatewayId, Identifier, Packet, Payload, Rxpk, Stat, Token};

/// Fake gateway EUI
const GATEWAY_EUI: GatewayId = GatewayId([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11]);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1700".to_string())
        .parse()?;

    println!("🌊 Gateway Simulator");
    println!("  Target: {}", server_addr);
    println!("  Gateway EUI: {}", GATEWAY_EUI);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut token: u16 = 0;

    token = token.wrapping_add(1);
    println!("📡 Sending: PULL_DATA keep-alive");
    let pull = Packet::pull_data(Token::from(token), GATEWAY_EUI);
    socket.send_to(&pull.encode()?, server_addr).await?;
    await_response(&socket, Identifier::PullAck).await?;
    println!();

    let scenarios = vec![
        ("Uplink (LoRa, temperature sensor)", lora_uplink()),
        ("Uplink (FSK)", fsk_uplink()),
        ("Gateway Status", gateway_status()),
    ];

    for (desc, payload) in scenarios {
        token = token.wrapping_add(1);
        let packet = Packet::push_data(Token::from(token), GATEWAY_EUI, payload);
        let bytes = packet.encode()?;

        println!("📡 Sending: {}", desc);
        println!("   Size: {} bytes", bytes.len());
        socket.send_to(&bytes, server_addr).await?;
        await_response(&socket, Identifier::PushAck).await?;
        println!();

        sleep(Duration::from_secs(2)).await;
    }

    println!("✨ Simulation complete!");
    Ok(())
}

/// Wait for the expected ack, answering downlinks that arrive first
async fn await_response(socket: &UdpSocket, expected: Identifier) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        let (len, from) = match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                println!("   ⏰ No {} (timeout)", expected);
                return Ok(());
            }
        };

        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                println!("   ⚠️  Undecodable response ({} bytes) from {}: {}", len, from, e);
                continue;
            }
        };

        if packet.identifier == Identifier::PullResp {
            if let Some(txpk) = packet.payload.as_ref().and_then(|p| p.downlink.as_ref()) {
                println!(
                    "   📥 PULL_RESP {}: freq={} MHz, powe={} dBm, {} bytes",
                    packet.token,
                    txpk.freq,
                    txpk.powe,
                    txpk.data.len()
                );
            }
            let ack = Packet::pull_ack(packet.token);
            socket.send_to(&ack.encode()?, from).await?;
            continue;
        }

        if packet.identifier == expected {
            println!("   ✅ {} received from {} (token: {})", expected, from, packet.token);
        } else {
            println!("   ⚠️  Unexpected {} from {}", packet.identifier, from);
        }
        return Ok(());
    }
}

fn lora_uplink() -> Payload {
    // Unconfirmed Data Up, DevAddr=260B1234, FCnt=66, FPort=1
    let phy: Vec<u8> = vec![
        0x40, 0x34, 0x12, 0x0B, 0x26, 0x80, 0x42, 0x00, 0x01, 0x00, 0xE1, 0x78, 0x56, 0x34, 0x12,
    ];
    let rxpk = Rxpk {
        time: Some(Utc::now().trunc_subsecs(6)),
        tmst: 3512348611,
        chan: 2,
        rfch: 0,
        freq: 868.1,
        stat: CrcStatus::Ok,
        datr: DataRate::Lora("SF7BW125".to_string()),
        codr: Some("4/5".to_string()),
        rssi: -65,
        lsnr: Some(7.5),
        size: phy.len() as u32,
        data: phy,
    };
    Payload::uplink(vec![rxpk], None)
}

fn fsk_uplink() -> Payload {
    let phy: Vec<u8> = vec![0x80, 0x78, 0x56, 0x0B, 0x26, 0x00, 0x07, 0x00, 0x02, 0x01];
    let rxpk = Rxpk {
        time: Some(Utc::now().trunc_subsecs(6)),
        tmst: 3512448611,
        chan: 8,
        rfch: 1,
        freq: 868.8,
        stat: CrcStatus::Ok,
        datr: DataRate::Fsk(50000),
        codr: None,
        rssi: -80,
        lsnr: None,
        size: phy.len() as u32,
        data: phy,
    };
    Payload::uplink(vec![rxpk], None)
}

fn gateway_status() -> Payload {
    let stat = Stat {
        time: Some(Utc::now().trunc_subsecs(0)),
        lati: Some(29.7604),
        long: Some(-95.3698),
        alti: Some(15),
        rxnb: 47,
        rxok: 44,
        rxfw: 44,
        ackr: 100.0,
        dwnb: 3,
        txnb: 3,
    };
    Payload::uplink(vec![], Some(stat))
}
