//! Per-gateway session state
//!
//! Tracks which gateways are alive, where their downlinks go, and which
//! PULL_RESP tokens are still waiting for an acknowledgment. Every handler is
//! synchronous bookkeeping that takes the current instant and returns the
//! packets to send; the transport owns the socket and the clock.
//!
//! Locking: the registry lock is only held to find or insert a session, each
//! session has its own mutex, so traffic for different gateways never waits
//! on the same lock. Order is registry → session → peer table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, SessionError};
use crate::udp::packet::{GatewayId, Identifier, Packet, Token};
use crate::udp::payload::{Rxpk, Stat, Txpk};

/// Notification for the application layer
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    UplinkReceived { gateway_id: GatewayId, frame: Rxpk },
    StatusReceived { gateway_id: GatewayId, status: Stat },
    DownlinkAcked { gateway_id: GatewayId, token: Token },
    /// No acknowledgment after all retries, or the gateway went away
    DownlinkFailed { gateway_id: GatewayId, token: Token },
    GatewayDisconnected { gateway_id: GatewayId },
}

/// Packet addressed to a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub packet: Packet,
}

/// Result of handling one inbound packet
#[derive(Debug, Default)]
pub struct Dispatch {
    pub reply: Option<Outbound>,
    pub events: Vec<Event>,
}

/// Result of one periodic sweep
#[derive(Debug, Default)]
pub struct Sweep {
    pub retransmits: Vec<Outbound>,
    pub events: Vec<Event>,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub gateway_id: GatewayId,
    /// Source address of the latest PULL_DATA
    pub route: Option<SocketAddr>,
    pub last_seen: Instant,
    /// Latest PULL_DATA, or session creation; drives eviction
    pub last_keepalive: Instant,
    pub pending: usize,
    pub stale_acks: u64,
}

struct PendingDownlink {
    packet: Packet,
    deadline: Instant,
    retries: u32,
}

struct Session {
    gateway_id: GatewayId,
    route: Option<SocketAddr>,
    last_seen: Instant,
    last_keepalive: Instant,
    pending: HashMap<Token, PendingDownlink>,
    next_token: u16,
    stale_acks: u64,
    /// Set once removed from the registry; holders of a stale handle retry
    evicted: bool,
}

impl Session {
    fn new(gateway_id: GatewayId, now: Instant) -> Self {
        Self {
            gateway_id,
            route: None,
            last_seen: now,
            last_keepalive: now,
            pending: HashMap::new(),
            next_token: 0,
            stale_acks: 0,
            evicted: false,
        }
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    fn keep_alive(&mut self, now: Instant) {
        if now > self.last_keepalive {
            self.last_keepalive = now;
        }
    }

    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_keepalive) >= window
    }

    /// Next counter value not currently outstanding
    fn allocate_token(&mut self) -> Option<Token> {
        for _ in 0..=u16::MAX {
            let token = Token::from(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if !self.pending.contains_key(&token) {
                return Some(token);
            }
        }
        None
    }

    fn fail_all(&mut self, events: &mut Vec<Event>) {
        let gateway_id = self.gateway_id;
        events.extend(
            self.pending
                .drain()
                .map(|(token, _)| Event::DownlinkFailed { gateway_id, token }),
        );
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            gateway_id: self.gateway_id,
            route: self.route,
            last_seen: self.last_seen,
            last_keepalive: self.last_keepalive,
            pending: self.pending.len(),
            stale_acks: self.stale_acks,
        }
    }
}

/// Registry of gateway sessions, shared by the receive loop, the sweep task
/// and downlink submitters.
pub struct SessionManager {
    config: SessionConfig,
    sessions: RwLock<HashMap<GatewayId, Arc<Mutex<Session>>>>,
    /// Any source address a gateway has used, for correlating acks
    peers: RwLock<HashMap<SocketAddr, GatewayId>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Decode a datagram and handle it
    pub fn handle_datagram(
        &self,
        data: &[u8],
        src: SocketAddr,
        now: Instant,
    ) -> Result<Dispatch, Error> {
        let packet = Packet::decode(data)?;
        Ok(self.handle_packet(packet, src, now))
    }

    pub fn handle_packet(&self, packet: Packet, src: SocketAddr, now: Instant) -> Dispatch {
        let token = packet.token;

        match packet.identifier {
            Identifier::PushData => {
                let Some(gateway_id) = packet.gateway_id else {
                    warn!("PUSH_DATA from {} without gateway EUI", src);
                    return Dispatch::default();
                };
                debug!(
                    "PUSH_DATA from gateway {} at {} (token: {})",
                    gateway_id, src, token
                );
                self.with_session(gateway_id, now, |_| self.remember_peer(src, gateway_id));

                let mut events = Vec::new();
                if let Some(payload) = packet.payload {
                    events.extend(
                        payload
                            .uplink_frames
                            .into_iter()
                            .map(|frame| Event::UplinkReceived { gateway_id, frame }),
                    );
                    if let Some(status) = payload.status {
                        events.push(Event::StatusReceived { gateway_id, status });
                    }
                }

                Dispatch {
                    reply: Some(Outbound {
                        addr: src,
                        packet: Packet::push_ack(token),
                    }),
                    events,
                }
            }
            Identifier::PullData => {
                let Some(gateway_id) = packet.gateway_id else {
                    warn!("PULL_DATA from {} without gateway EUI", src);
                    return Dispatch::default();
                };
                debug!(
                    "PULL_DATA from gateway {} at {} (token: {})",
                    gateway_id, src, token
                );
                self.with_session(gateway_id, now, |session| {
                    session.keep_alive(now);
                    if session.route != Some(src) {
                        info!("Gateway {} downlink route is now {}", gateway_id, src);
                        session.route = Some(src);
                    }
                    self.remember_peer(src, gateway_id);
                });

                Dispatch {
                    reply: Some(Outbound {
                        addr: src,
                        packet: Packet::pull_ack(token),
                    }),
                    events: Vec::new(),
                }
            }
            Identifier::PushAck | Identifier::PullAck => Dispatch {
                reply: None,
                events: self
                    .acknowledge(packet.identifier, token, src, now)
                    .into_iter()
                    .collect(),
            },
            Identifier::PullResp => {
                warn!("Ignoring PULL_RESP from {} (token: {})", src, token);
                Dispatch::default()
            }
        }
    }

    /// Register a downlink and build its PULL_RESP
    pub fn send_downlink(
        &self,
        gateway_id: GatewayId,
        txpk: Txpk,
        now: Instant,
    ) -> Result<Outbound, SessionError> {
        let entry = self
            .lookup(gateway_id)
            .ok_or(SessionError::UnknownGateway(gateway_id))?;
        let mut session = entry.lock();
        if session.evicted {
            return Err(SessionError::UnknownGateway(gateway_id));
        }

        let addr = session.route.ok_or(SessionError::NoRoute(gateway_id))?;
        let token = session
            .allocate_token()
            .ok_or(SessionError::TokensExhausted(gateway_id))?;

        let packet = Packet::pull_resp(token, txpk);
        // Reject unencodable commands before they occupy a token.
        packet.encode()?;

        session.pending.insert(
            token,
            PendingDownlink {
                packet: packet.clone(),
                deadline: now + self.config.ack_timeout(),
                retries: 0,
            },
        );
        debug!(
            "PULL_RESP to gateway {} at {} (token: {})",
            gateway_id, addr, token
        );

        Ok(Outbound { addr, packet })
    }

    /// Withdraw a pending downlink. Nothing is sent or reported for it.
    pub fn cancel_downlink(&self, gateway_id: GatewayId, token: Token) -> Result<(), SessionError> {
        let entry = self
            .lookup(gateway_id)
            .ok_or(SessionError::UnknownGateway(gateway_id))?;
        let mut session = entry.lock();
        match session.pending.remove(&token) {
            Some(_) => {
                debug!("Cancelled downlink {} for gateway {}", token, gateway_id);
                Ok(())
            }
            None => Err(SessionError::NotOutstanding { gateway_id, token }),
        }
    }

    /// Retransmit or fail overdue downlinks and evict gateways whose
    /// PULL_DATA keep-alives stopped
    pub fn sweep(&self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        let inactivity = self.config.inactivity_timeout();

        let entries: Vec<_> = self
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut idle = Vec::new();
        for (gateway_id, entry) in entries {
            let mut session = entry.lock();
            if session.is_idle(now, inactivity) {
                idle.push(gateway_id);
                continue;
            }
            self.expire_downlinks(&mut session, now, &mut sweep);
        }

        if !idle.is_empty() {
            self.evict_idle(idle, now, &mut sweep);
        }

        sweep
    }

    /// Second sweep pass, under the registry write lock
    fn evict_idle(&self, idle: Vec<GatewayId>, now: Instant, sweep: &mut Sweep) {
        let inactivity = self.config.inactivity_timeout();
        let mut sessions = self.sessions.write();
        for gateway_id in idle {
            let Some(entry) = sessions.get(&gateway_id).cloned() else {
                continue;
            };
            let mut session = entry.lock();
            // A keep-alive may have arrived since the first pass.
            if !session.is_idle(now, inactivity) {
                self.expire_downlinks(&mut session, now, sweep);
                continue;
            }
            info!(
                "Gateway {} sent no PULL_DATA for {:?}, closing session",
                gateway_id, inactivity
            );
            session.evicted = true;
            session.fail_all(&mut sweep.events);
            sessions.remove(&gateway_id);
            self.peers.write().retain(|_, id| *id != gateway_id);
            sweep
                .events
                .push(Event::GatewayDisconnected { gateway_id });
        }
    }

    /// Tear the registry down, failing whatever is still pending
    pub fn shutdown(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let mut sessions = self.sessions.write();
        for (gateway_id, entry) in sessions.drain() {
            let mut session = entry.lock();
            session.evicted = true;
            session.fail_all(&mut events);
            events.push(Event::GatewayDisconnected { gateway_id });
        }
        self.peers.write().clear();
        info!("Session registry shut down");
        events
    }

    pub fn session(&self, gateway_id: GatewayId) -> Option<SessionInfo> {
        self.lookup(gateway_id).map(|entry| entry.lock().info())
    }

    pub fn is_active(&self, gateway_id: GatewayId) -> bool {
        self.sessions.read().contains_key(&gateway_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn lookup(&self, gateway_id: GatewayId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(&gateway_id).cloned()
    }

    fn entry(&self, gateway_id: GatewayId, now: Instant) -> Arc<Mutex<Session>> {
        if let Some(entry) = self.lookup(gateway_id) {
            return entry;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(sessions.entry(gateway_id).or_insert_with(|| {
            info!("New session for gateway {}", gateway_id);
            Arc::new(Mutex::new(Session::new(gateway_id, now)))
        }))
    }

    /// Run `f` on the gateway's live session, creating it if needed
    fn with_session<R>(
        &self,
        gateway_id: GatewayId,
        now: Instant,
        f: impl FnOnce(&mut Session) -> R,
    ) -> R {
        loop {
            let entry = self.entry(gateway_id, now);
            let mut session = entry.lock();
            if session.evicted {
                continue;
            }
            session.touch(now);
            return f(&mut *session);
        }
    }

    fn remember_peer(&self, addr: SocketAddr, gateway_id: GatewayId) {
        if self.peers.read().get(&addr) == Some(&gateway_id) {
            return;
        }
        self.peers.write().insert(addr, gateway_id);
    }

    fn acknowledge(
        &self,
        identifier: Identifier,
        token: Token,
        src: SocketAddr,
        now: Instant,
    ) -> Option<Event> {
        let gateway_id = self.peers.read().get(&src).copied();
        let Some(entry) = gateway_id.and_then(|id| self.lookup(id)) else {
            warn!(
                "{} from unknown address {} (token: {}), ignoring",
                identifier, src, token
            );
            return None;
        };

        let mut session = entry.lock();
        if session.evicted {
            return None;
        }
        session.touch(now);
        let gateway_id = session.gateway_id;

        match session.pending.remove(&token) {
            Some(pending) => {
                info!(
                    "Downlink {} acknowledged by gateway {} after {} retr{}",
                    token,
                    gateway_id,
                    pending.retries,
                    if pending.retries == 1 { "y" } else { "ies" }
                );
                Some(Event::DownlinkAcked { gateway_id, token })
            }
            None => {
                session.stale_acks += 1;
                warn!(
                    "Stale {} from gateway {} (token: {})",
                    identifier, gateway_id, token
                );
                None
            }
        }
    }

    fn expire_downlinks(&self, session: &mut Session, now: Instant, sweep: &mut Sweep) {
        let gateway_id = session.gateway_id;
        let overdue: Vec<Token> = session
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in overdue {
            let retry = match (session.route, session.pending.get_mut(&token)) {
                (Some(addr), Some(pending)) if pending.retries < self.config.max_retries => {
                    pending.retries += 1;
                    pending.deadline = now + self.config.ack_timeout();
                    Some(Outbound {
                        addr,
                        packet: pending.packet.clone(),
                    })
                }
                _ => None,
            };

            match retry {
                Some(outbound) => {
                    debug!("Retrying downlink {} to gateway {}", token, gateway_id);
                    sweep.retransmits.push(outbound);
                }
                None => {
                    session.pending.remove(&token);
                    warn!(
                        "Downlink {} to gateway {} was never acknowledged",
                        token, gateway_id
                    );
                    sweep
                        .events
                        .push(Event::DownlinkFailed { gateway_id, token });
                }
            }
        }
    }
}
