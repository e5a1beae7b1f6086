pub mod packet;
pub mod payload;

use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::session::{Event, Outbound, SessionManager};
use packet::{GatewayId, Token};
use payload::Txpk;

/// Capacity of the event channel towards the application
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle for submitting downlinks to connected gateways.
///
/// Cheap to clone; every clone shares the socket and the session registry.
#[derive(Clone)]
pub struct DownlinkSender {
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionManager>,
}

impl DownlinkSender {
    /// Send a PULL_RESP to the gateway and track it until acknowledged.
    ///
    /// Returns the token the acknowledgment (or failure event) will carry.
    pub async fn send_downlink(&self, gateway_id: GatewayId, txpk: Txpk) -> anyhow::Result<Token> {
        let outbound = self
            .sessions
            .send_downlink(gateway_id, txpk, Instant::now())?;
        let token = outbound.packet.token;
        send(&self.socket, &outbound).await?;
        info!(
            "PULL_RESP sent to gateway {} at {} (token: {})",
            gateway_id, outbound.addr, token
        );
        Ok(token)
    }

    /// Withdraw a downlink that has not been acknowledged yet
    pub fn cancel_downlink(&self, gateway_id: GatewayId, token: Token) -> anyhow::Result<()> {
        self.sessions.cancel_downlink(gateway_id, token)?;
        Ok(())
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

/// Start the Semtech UDP Packet Forwarder server
///
/// Spawns the receive loop and the retry/eviction sweep, and returns the
/// downlink handle plus the stream of session events.
pub async fn start_server(
    config: &Config,
) -> anyhow::Result<(DownlinkSender, mpsc::Receiver<Event>)> {
    let socket = Arc::new(UdpSocket::bind(&config.udp.bind).await?);
    info!("UDP server listening on {}", socket.local_addr()?);

    let sessions = Arc::new(SessionManager::new(config.session.clone()));
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(run_receiver(
        Arc::clone(&socket),
        Arc::clone(&sessions),
        events_tx.clone(),
    ));
    tokio::spawn(run_sweeper(
        Arc::clone(&socket),
        Arc::clone(&sessions),
        events_tx,
    ));

    Ok((DownlinkSender { socket, sessions }, events_rx))
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionManager>,
    events: mpsc::Sender<Event>,
) {
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("UDP receive failed: {}", e);
                continue;
            }
        };
        debug!("Received {} bytes from {}", len, src);

        let dispatch = match sessions.handle_datagram(&buf[..len], src, Instant::now()) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", src, e);
                continue;
            }
        };

        // Ack before handing events on: it confirms receipt, not processing.
        if let Some(reply) = dispatch.reply {
            if let Err(e) = send(&socket, &reply).await {
                error!("Failed to send {} to {}: {}", reply.packet.identifier, src, e);
            }
        }

        if !forward(&events, dispatch.events) {
            info!("Event receiver dropped, stopping UDP receive loop");
            return;
        }
    }
}

async fn run_sweeper(
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionManager>,
    events: mpsc::Sender<Event>,
) {
    let mut ticker = tokio::time::interval(sessions.config().sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let sweep = sessions.sweep(Instant::now());

        for outbound in &sweep.retransmits {
            match send(&socket, outbound).await {
                Ok(()) => info!(
                    "Retransmitted PULL_RESP to {} (token: {})",
                    outbound.addr, outbound.packet.token
                ),
                Err(e) => error!("Failed to retransmit to {}: {}", outbound.addr, e),
            }
        }

        if !forward(&events, sweep.events) {
            info!("Event receiver dropped, stopping sweep task");
            return;
        }
    }
}

async fn send(socket: &UdpSocket, outbound: &Outbound) -> anyhow::Result<()> {
    let bytes = outbound.packet.encode()?;
    socket.send_to(&bytes, outbound.addr).await?;
    Ok(())
}

/// Hand events to the application without waiting on it.
///
/// A full channel drops the event so acks and retries keep flowing. Returns
/// false once the application side has gone away.
fn forward(tx: &mpsc::Sender<Event>, events: Vec<Event>) -> bool {
    for event in events {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }
    true
}
