//! Semtech UDP packet forwarder protocol (GWMP v1)
//!
//! - [`udp::packet`]: binary header framing
//! - [`udp::payload`]: `rxpk` / `stat` / `txpk` JSON bodies
//! - [`session`]: per-gateway keep-alive, acknowledgment and retry tracking
//! - [`udp::start_server`]: tokio UDP transport around the two

pub mod config;
pub mod error;
pub mod session;
pub mod udp;

pub use error::{Error, SessionError};
pub use session::{Event, SessionManager};
pub use udp::packet::{GatewayId, Identifier, Packet, Token};
pub use udp::payload::{DataRate, Payload, PayloadKind, Rxpk, Stat, Txpk};
