//! Error types for the packet codec and the session manager

use crate::udp::packet::{GatewayId, Token};

/// Codec failure for a single datagram.
///
/// None of these are recoverable for the offending datagram; the caller drops
/// it and carries on with the next one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unknown modulation: {0:?}")]
    UnknownModulation(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("malformed timestamp {value:?}: {reason}")]
    MalformedTimestamp { value: String, reason: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedPayload(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::MalformedPayload(format!("invalid base64 data: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rejection of a downlink submission
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("gateway {0} has no active session")]
    UnknownGateway(GatewayId),

    #[error("gateway {0} has not sent PULL_DATA yet, no downlink route")]
    NoRoute(GatewayId),

    #[error("no free token for gateway {0}")]
    TokensExhausted(GatewayId),

    #[error("token {token} is not outstanding for gateway {gateway_id}")]
    NotOutstanding { gateway_id: GatewayId, token: Token },

    #[error(transparent)]
    Codec(#[from] Error),
}
