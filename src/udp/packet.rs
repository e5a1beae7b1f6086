//! Semtech UDP Packet Forwarder Protocol (GWMP) framing
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! Every datagram starts with a 4-byte header, followed by the gateway EUI for
//! gateway-originated requests and by a JSON body for the two kinds that
//! carry one:
//!
//! ```text
//! offset 0       : version     (1 byte, 0x01)
//! offset 1-2     : token       (2 bytes, opaque)
//! offset 3       : identifier  (1 byte)
//! offset 4-11    : gateway EUI (PUSH_DATA, PULL_DATA only)
//! offset 4 or 12 : JSON body   (PUSH_DATA, PULL_RESP only)
//! ```

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use super::payload::{Payload, PayloadKind, Txpk};
use crate::error::{Error, Result};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Length of the common header (version, token, identifier)
pub const HEADER_LEN: usize = 4;

/// Length of the header plus gateway EUI
pub const GATEWAY_HEADER_LEN: usize = HEADER_LEN + 8;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Identifier {
    /// Gateway → server, uplink frames and status
    PushData = 0x00,
    /// Server → gateway, acknowledges PUSH_DATA
    PushAck = 0x01,
    /// Gateway → server, keep-alive that opens the downlink path
    PullData = 0x02,
    /// Server → gateway, downlink command
    PullResp = 0x03,
    /// Acknowledges PULL_DATA, and PULL_RESP in the other direction
    PullAck = 0x04,
}

impl Identifier {
    /// Whether the gateway EUI follows the header
    pub fn has_gateway_id(self) -> bool {
        matches!(self, Identifier::PushData | Identifier::PullData)
    }

    /// Which JSON body this kind carries, if any
    pub fn payload_kind(self) -> Option<PayloadKind> {
        match self {
            Identifier::PushData => Some(PayloadKind::Uplink),
            Identifier::PullResp => Some(PayloadKind::Downlink),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Identifier {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Identifier::PushData),
            0x01 => Ok(Identifier::PushAck),
            0x02 => Ok(Identifier::PullData),
            0x03 => Ok(Identifier::PullResp),
            0x04 => Ok(Identifier::PullAck),
            _ => Err(Error::MalformedHeader(format!(
                "unknown packet identifier: 0x{:02x}",
                value
            ))),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::PushData => write!(f, "PUSH_DATA"),
            Identifier::PushAck => write!(f, "PUSH_ACK"),
            Identifier::PullData => write!(f, "PULL_DATA"),
            Identifier::PullResp => write!(f, "PULL_RESP"),
            Identifier::PullAck => write!(f, "PULL_ACK"),
        }
    }
}

/// Request/acknowledgment correlation token.
///
/// Opaque: only ever compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub [u8; 2]);

impl From<u16> for Token {
    fn from(value: u16) -> Self {
        Token(value.to_be_bytes())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Gateway identifier (EUI-64, 8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId(pub [u8; 8]);

impl From<u64> for GatewayId {
    fn from(value: u64) -> Self {
        GatewayId(value.to_be_bytes())
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Parsed GWMP packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub version: u8,
    pub token: Token,
    pub identifier: Identifier,
    /// Only on PUSH_DATA and PULL_DATA
    pub gateway_id: Option<GatewayId>,
    /// Only on PUSH_DATA and PULL_RESP
    pub payload: Option<Payload>,
}

impl Packet {
    pub fn push_data(token: Token, gateway_id: GatewayId, payload: Payload) -> Self {
        Self::new(token, Identifier::PushData, Some(gateway_id), Some(payload))
    }

    pub fn push_ack(token: Token) -> Self {
        Self::new(token, Identifier::PushAck, None, None)
    }

    pub fn pull_data(token: Token, gateway_id: GatewayId) -> Self {
        Self::new(token, Identifier::PullData, Some(gateway_id), None)
    }

    pub fn pull_resp(token: Token, txpk: Txpk) -> Self {
        Self::new(token, Identifier::PullResp, None, Some(Payload::downlink(txpk)))
    }

    pub fn pull_ack(token: Token) -> Self {
        Self::new(token, Identifier::PullAck, None, None)
    }

    fn new(
        token: Token,
        identifier: Identifier,
        gateway_id: Option<GatewayId>,
        payload: Option<Payload>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token,
            identifier,
            gateway_id,
            payload,
        }
    }

    /// Parse a raw UDP datagram into a GWMP packet
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::MalformedHeader(format!(
                "unsupported protocol version: 0x{:02x}",
                version
            )));
        }

        let mut token = [0u8; 2];
        buf.copy_to_slice(&mut token);
        let identifier = Identifier::try_from(buf.get_u8())?;

        let gateway_id = if identifier.has_gateway_id() {
            if buf.remaining() < 8 {
                return Err(Error::MalformedHeader(format!(
                    "{} too short for gateway EUI: {} bytes",
                    identifier,
                    data.len()
                )));
            }
            let mut eui = [0u8; 8];
            buf.copy_to_slice(&mut eui);
            Some(GatewayId(eui))
        } else {
            None
        };

        // Trailing bytes on kinds without a body are tolerated and dropped.
        let payload = match identifier.payload_kind() {
            Some(kind) => {
                if !buf.has_remaining() {
                    return Err(Error::MalformedPayload(format!(
                        "{} without JSON body",
                        identifier
                    )));
                }
                Some(Payload::decode(buf, kind)?)
            }
            None => None,
        };

        Ok(Self {
            version,
            token: Token(token),
            identifier,
            gateway_id,
            payload,
        })
    }

    /// Serialize into a datagram, the exact inverse of [`Packet::decode`]
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::InvalidPacket(format!(
                "unsupported protocol version: 0x{:02x}",
                self.version
            )));
        }
        if self.identifier.has_gateway_id() != self.gateway_id.is_some() {
            return Err(Error::InvalidPacket(format!(
                "{} {} a gateway EUI",
                self.identifier,
                if self.identifier.has_gateway_id() {
                    "requires"
                } else {
                    "must not carry"
                }
            )));
        }

        let body = match (self.identifier.payload_kind(), &self.payload) {
            (Some(kind), Some(payload)) => Some(payload.encode(kind)?),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::InvalidPacket(format!(
                    "{} requires a payload",
                    self.identifier
                )))
            }
            (None, Some(_)) => {
                return Err(Error::InvalidPacket(format!(
                    "{} must not carry a payload",
                    self.identifier
                )))
            }
        };

        let mut buf = BytesMut::with_capacity(
            GATEWAY_HEADER_LEN + body.as_ref().map(Vec::len).unwrap_or(0),
        );
        buf.put_u8(self.version);
        buf.put_slice(&self.token.0);
        buf.put_u8(self.identifier as u8);
        if let Some(gateway_id) = &self.gateway_id {
            buf.put_slice(&gateway_id.0);
        }
        if let Some(body) = body {
            buf.put_slice(&body);
        }
        Ok(buf.to_vec())
    }
}
