//! JSON bodies carried by PUSH_DATA (`rxpk`, `stat`) and PULL_RESP (`txpk`)
//!
//! The wire JSON does not map one-to-one onto the typed records: `datr` is a
//! string or an integer depending on `modu`, radio payloads travel as base64,
//! and the two time fields use different ISO 8601 layouts. Each record
//! therefore has a private `Wire*` twin that serde handles, and the
//! conversions between the two carry the field rules.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Accepts padded and unpadded input. Encoding always goes through `STANDARD`.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// rxpk/txpk `time`: `2013-03-31T16:21:17.528002Z`
const COMPACT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// stat `time`: `2014-01-12 08:59:28 GMT`
const EXPANDED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default LoRa preamble length when `prea` is absent
pub const DEFAULT_PREAMBLE: u32 = 8;

/// Which message the body belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// PUSH_DATA: `rxpk` and `stat`
    Uplink,
    /// PULL_RESP: `txpk`
    Downlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Lora,
    Fsk,
}

impl Modulation {
    pub fn as_str(self) -> &'static str {
        match self {
            Modulation::Lora => "LORA",
            Modulation::Fsk => "FSK",
        }
    }

    fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            Some("LORA") => Ok(Modulation::Lora),
            Some("FSK") => Ok(Modulation::Fsk),
            other => Err(Error::UnknownModulation(other.unwrap_or_default().to_string())),
        }
    }
}

/// Datarate, keyed by modulation.
///
/// LoRa uses an identifier such as `SF7BW125`; FSK uses bits per second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRate {
    Lora(String),
    Fsk(u32),
}

impl DataRate {
    pub fn modulation(&self) -> Modulation {
        match self {
            DataRate::Lora(_) => Modulation::Lora,
            DataRate::Fsk(_) => Modulation::Fsk,
        }
    }

    fn from_wire(modu: Option<&str>, datr: Option<Value>) -> Result<Self> {
        let modulation = Modulation::parse(modu)?;
        let datr = datr.ok_or_else(|| Error::MalformedPayload("missing datr".to_string()))?;

        match (modulation, datr) {
            (Modulation::Lora, Value::String(id)) => Ok(DataRate::Lora(id)),
            (Modulation::Fsk, Value::Number(n)) => n
                .as_u64()
                .and_then(|bps| u32::try_from(bps).ok())
                .map(DataRate::Fsk)
                .ok_or_else(|| Error::MalformedPayload(format!("invalid FSK datarate: {}", n))),
            (Modulation::Fsk, Value::String(s)) => s
                .parse()
                .map(DataRate::Fsk)
                .map_err(|_| Error::MalformedPayload(format!("invalid FSK datarate: {:?}", s))),
            (modulation, other) => Err(Error::MalformedPayload(format!(
                "datr {} does not fit {} modulation",
                other,
                modulation.as_str()
            ))),
        }
    }

    fn to_wire(&self) -> (String, Value) {
        let datr = match self {
            DataRate::Lora(id) => Value::String(id.clone()),
            DataRate::Fsk(bps) => Value::from(*bps),
        };
        (self.modulation().as_str().to_string(), datr)
    }
}

/// CRC status of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcStatus {
    Ok,
    Fail,
    #[default]
    NoCrc,
}

impl CrcStatus {
    fn from_wire(value: i32) -> Result<Self> {
        match value {
            1 => Ok(CrcStatus::Ok),
            -1 => Ok(CrcStatus::Fail),
            0 => Ok(CrcStatus::NoCrc),
            other => Err(Error::MalformedPayload(format!("invalid CRC status: {}", other))),
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            CrcStatus::Ok => 1,
            CrcStatus::Fail => -1,
            CrcStatus::NoCrc => 0,
        }
    }
}

/// Received radio frame (one `rxpk` entry)
#[derive(Debug, Clone, PartialEq)]
pub struct Rxpk {
    /// UTC time of reception, µs precision
    pub time: Option<DateTime<Utc>>,
    /// Concentrator counter at "RX finished", µs
    pub tmst: u32,
    /// IF channel
    pub chan: u32,
    /// RF chain
    pub rfch: u32,
    /// Center frequency in MHz
    pub freq: f64,
    pub stat: CrcStatus,
    pub datr: DataRate,
    /// LoRa coding rate, e.g. "4/5"
    pub codr: Option<String>,
    /// RSSI in dBm
    pub rssi: i32,
    /// LoRa SNR in dB
    pub lsnr: Option<f64>,
    pub size: u32,
    /// Raw PHY payload
    pub data: Vec<u8>,
}

/// Gateway status report (`stat`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stat {
    /// Gateway system time, second precision
    pub time: Option<DateTime<Utc>>,
    pub lati: Option<f64>,
    pub long: Option<f64>,
    pub alti: Option<i32>,
    /// Radio packets received
    pub rxnb: u32,
    /// Radio packets received with a valid CRC
    pub rxok: u32,
    /// Radio packets forwarded
    pub rxfw: u32,
    /// Percentage of upstream datagrams acknowledged
    pub ackr: f64,
    /// Downlink datagrams received
    pub dwnb: u32,
    /// Packets emitted
    pub txnb: u32,
}

/// When a downlink goes on air
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSchedule {
    Immediate,
    /// Concentrator counter value
    Timestamp(u32),
    /// Absolute time, needs GPS
    GpsTime(DateTime<Utc>),
}

/// Downlink command (`txpk`).
///
/// Optional fields keep their presence; use the accessors for the value the
/// gateway will actually apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Txpk {
    pub imme: Option<bool>,
    pub tmst: Option<u32>,
    pub time: Option<DateTime<Utc>>,
    /// Center frequency in MHz
    pub freq: f64,
    pub rfch: u32,
    /// TX power in dBm
    pub powe: u32,
    pub datr: DataRate,
    pub codr: Option<String>,
    /// FSK frequency deviation in Hz
    pub fdev: Option<u32>,
    /// LoRa polarization inversion
    pub ipol: Option<bool>,
    /// Preamble size
    pub prea: Option<u32>,
    pub size: u32,
    pub data: Vec<u8>,
    /// Disable physical layer CRC
    pub ncrc: Option<bool>,
}

impl Txpk {
    /// Minimal command on RF chain 0 with every optional field absent
    pub fn new(freq: f64, powe: u32, datr: DataRate, data: Vec<u8>) -> Self {
        Self {
            imme: None,
            tmst: None,
            time: None,
            freq,
            rfch: 0,
            powe,
            datr,
            codr: None,
            fdev: None,
            ipol: None,
            prea: None,
            size: data.len() as u32,
            data,
            ncrc: None,
        }
    }

    pub fn immediate(&self) -> bool {
        self.imme.unwrap_or(false)
    }

    pub fn polarization_inverted(&self) -> bool {
        self.ipol.unwrap_or(false)
    }

    pub fn crc_disabled(&self) -> bool {
        self.ncrc.unwrap_or(false)
    }

    pub fn preamble(&self) -> u32 {
        self.prea.unwrap_or(DEFAULT_PREAMBLE)
    }

    pub fn frequency_deviation(&self) -> u32 {
        self.fdev.unwrap_or(0)
    }

    /// `imme` wins over `tmst`, which wins over `time`
    pub fn schedule(&self) -> Option<TxSchedule> {
        if self.immediate() {
            return Some(TxSchedule::Immediate);
        }
        self.tmst
            .map(TxSchedule::Timestamp)
            .or_else(|| self.time.map(TxSchedule::GpsTime))
    }
}

/// Decoded JSON body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub uplink_frames: Vec<Rxpk>,
    pub status: Option<Stat>,
    pub downlink: Option<Txpk>,
}

impl Payload {
    pub fn uplink(frames: Vec<Rxpk>, status: Option<Stat>) -> Self {
        Self {
            uplink_frames: frames,
            status,
            downlink: None,
        }
    }

    pub fn downlink(txpk: Txpk) -> Self {
        Self {
            uplink_frames: Vec::new(),
            status: None,
            downlink: Some(txpk),
        }
    }

    pub fn decode(data: &[u8], kind: PayloadKind) -> Result<Self> {
        let body: Map<String, Value> = serde_json::from_slice(data)?;

        match kind {
            PayloadKind::Uplink => {
                if body.contains_key("txpk") {
                    return Err(Error::SchemaMismatch(
                        "txpk found in uplink body".to_string(),
                    ));
                }
                let wire: WireUplink = serde_json::from_value(Value::Object(body))?;
                let uplink_frames = wire
                    .rxpk
                    .unwrap_or_default()
                    .into_iter()
                    .map(Rxpk::from_wire)
                    .collect::<Result<Vec<_>>>()?;
                let status = wire.stat.map(Stat::from_wire).transpose()?;
                Ok(Self::uplink(uplink_frames, status))
            }
            PayloadKind::Downlink => {
                if let Some(key) = ["rxpk", "stat"].iter().find(|k| body.contains_key(**k)) {
                    return Err(Error::SchemaMismatch(format!(
                        "{} found in downlink body",
                        key
                    )));
                }
                let wire: WireDownlink = serde_json::from_value(Value::Object(body))?;
                Ok(Self::downlink(Txpk::from_wire(wire.txpk)?))
            }
        }
    }

    pub fn encode(&self, kind: PayloadKind) -> Result<Vec<u8>> {
        match kind {
            PayloadKind::Uplink => {
                if self.downlink.is_some() {
                    return Err(Error::SchemaMismatch(
                        "txpk in uplink body".to_string(),
                    ));
                }
                let rxpk = if self.uplink_frames.is_empty() {
                    None
                } else {
                    Some(
                        self.uplink_frames
                            .iter()
                            .map(Rxpk::to_wire)
                            .collect::<Result<Vec<_>>>()?,
                    )
                };
                let wire = WireUplink {
                    rxpk,
                    stat: self.status.as_ref().map(Stat::to_wire).transpose()?,
                };
                Ok(serde_json::to_vec(&wire)?)
            }
            PayloadKind::Downlink => {
                if !self.uplink_frames.is_empty() || self.status.is_some() {
                    return Err(Error::SchemaMismatch(
                        "rxpk or stat in downlink body".to_string(),
                    ));
                }
                let txpk = self.downlink.as_ref().ok_or_else(|| {
                    Error::InvalidPacket("downlink body requires txpk".to_string())
                })?;
                let wire = WireDownlink {
                    txpk: txpk.to_wire()?,
                };
                Ok(serde_json::to_vec(&wire)?)
            }
        }
    }
}

impl Rxpk {
    fn from_wire(wire: WireRxpk) -> Result<Self> {
        Ok(Self {
            time: wire.time.as_deref().map(parse_compact_time).transpose()?,
            tmst: wire.tmst,
            chan: wire.chan,
            rfch: wire.rfch,
            freq: wire.freq,
            stat: CrcStatus::from_wire(wire.stat)?,
            datr: DataRate::from_wire(wire.modu.as_deref(), wire.datr)?,
            codr: wire.codr,
            rssi: wire.rssi,
            lsnr: wire.lsnr,
            size: wire.size,
            data: LENIENT.decode(&wire.data)?,
        })
    }

    fn to_wire(&self) -> Result<WireRxpk> {
        let (modu, datr) = self.datr.to_wire();
        Ok(WireRxpk {
            time: self.time.as_ref().map(format_compact_time).transpose()?,
            tmst: self.tmst,
            chan: self.chan,
            rfch: self.rfch,
            freq: self.freq,
            stat: self.stat.to_wire(),
            modu: Some(modu),
            datr: Some(datr),
            codr: self.codr.clone(),
            rssi: self.rssi,
            lsnr: self.lsnr,
            size: self.size,
            data: STANDARD.encode(&self.data),
        })
    }
}

impl Stat {
    fn from_wire(wire: WireStat) -> Result<Self> {
        Ok(Self {
            time: wire.time.as_deref().map(parse_expanded_time).transpose()?,
            lati: wire.lati,
            long: wire.long,
            alti: wire.alti,
            rxnb: wire.rxnb,
            rxok: wire.rxok,
            rxfw: wire.rxfw,
            ackr: wire.ackr,
            dwnb: wire.dwnb,
            txnb: wire.txnb,
        })
    }

    fn to_wire(&self) -> Result<WireStat> {
        Ok(WireStat {
            time: self.time.as_ref().map(format_expanded_time).transpose()?,
            lati: self.lati,
            long: self.long,
            alti: self.alti,
            rxnb: self.rxnb,
            rxok: self.rxok,
            rxfw: self.rxfw,
            ackr: self.ackr,
            dwnb: self.dwnb,
            txnb: self.txnb,
        })
    }
}

impl Txpk {
    fn from_wire(wire: WireTxpk) -> Result<Self> {
        Ok(Self {
            imme: wire.imme,
            tmst: wire.tmst,
            time: wire.time.as_deref().map(parse_compact_time).transpose()?,
            freq: wire.freq,
            rfch: wire.rfch,
            powe: wire.powe,
            datr: DataRate::from_wire(wire.modu.as_deref(), wire.datr)?,
            codr: wire.codr,
            fdev: wire.fdev,
            ipol: wire.ipol,
            prea: wire.prea,
            size: wire.size,
            data: LENIENT.decode(&wire.data)?,
            ncrc: wire.ncrc,
        })
    }

    fn to_wire(&self) -> Result<WireTxpk> {
        let (modu, datr) = self.datr.to_wire();
        Ok(WireTxpk {
            imme: self.imme,
            tmst: self.tmst,
            time: self.time.as_ref().map(format_compact_time).transpose()?,
            freq: self.freq,
            rfch: self.rfch,
            powe: self.powe,
            modu: Some(modu),
            datr: Some(datr),
            codr: self.codr.clone(),
            fdev: self.fdev,
            ipol: self.ipol,
            prea: self.prea,
            size: self.size,
            data: STANDARD.encode(&self.data),
            ncrc: self.ncrc,
        })
    }
}

fn parse_compact_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::MalformedTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Fails rather than drop precision the wire layout cannot hold
fn format_compact_time(time: &DateTime<Utc>) -> Result<String> {
    if time.nanosecond() % 1_000 != 0 {
        return Err(Error::InvalidPacket(format!(
            "time {} is finer than microseconds",
            time.to_rfc3339()
        )));
    }
    Ok(time.format(COMPACT_TIME_FORMAT).to_string())
}

fn parse_expanded_time(value: &str) -> Result<DateTime<Utc>> {
    let malformed = |reason: String| Error::MalformedTimestamp {
        value: value.to_string(),
        reason,
    };
    let naive = value
        .strip_suffix(" GMT")
        .or_else(|| value.strip_suffix(" UTC"))
        .ok_or_else(|| malformed("expected GMT or UTC suffix".to_string()))?;
    NaiveDateTime::parse_from_str(naive, EXPANDED_TIME_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| malformed(e.to_string()))
}

fn format_expanded_time(time: &DateTime<Utc>) -> Result<String> {
    if time.nanosecond() != 0 {
        return Err(Error::InvalidPacket(format!(
            "stat time {} has fractional seconds",
            time.to_rfc3339()
        )));
    }
    Ok(format!("{} GMT", time.format(EXPANDED_TIME_FORMAT)))
}

#[derive(Debug, Serialize, Deserialize)]
struct WireUplink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rxpk: Option<Vec<WireRxpk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stat: Option<WireStat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireDownlink {
    txpk: WireTxpk,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRxpk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default)]
    tmst: u32,
    #[serde(default)]
    chan: u32,
    #[serde(default)]
    rfch: u32,
    #[serde(default)]
    freq: f64,
    #[serde(default)]
    stat: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datr: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    codr: Option<String>,
    #[serde(default)]
    rssi: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lsnr: Option<f64>,
    #[serde(default)]
    size: u32,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireStat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lati: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    long: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alti: Option<i32>,
    #[serde(default)]
    rxnb: u32,
    #[serde(default)]
    rxok: u32,
    #[serde(default)]
    rxfw: u32,
    #[serde(default)]
    ackr: f64,
    #[serde(default)]
    dwnb: u32,
    #[serde(default)]
    txnb: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTxpk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    imme: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tmst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default)]
    freq: f64,
    #[serde(default)]
    rfch: u32,
    #[serde(default)]
    powe: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datr: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    codr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fdev: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipol: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prea: Option<u32>,
    #[serde(default)]
    size: u32,
    #[serde(default)]
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ncrc: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn encode_json(payload: &Payload, kind: PayloadKind) -> Value {
        let bytes = payload.encode(kind).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn fsk_rxpk() -> Rxpk {
        Rxpk {
            time: None,
            tmst: 3512348514,
            chan: 9,
            rfch: 1,
            freq: 869.1,
            stat: CrcStatus::Ok,
            datr: DataRate::Fsk(50000),
            codr: None,
            rssi: -75,
            lsnr: None,
            size: 2,
            data: vec![0xCA, 0xFE],
        }
    }

    #[test]
    fn test_decode_semtech_rxpk() {
        let json = br#"{"rxpk":[{"time":"2013-03-31T16:21:17.528002Z","tmst":3512348611,"chan":2,"rfch":0,"freq":866.349812,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/6","rssi":-35,"lsnr":5.1,"size":4,"data":"3q2+7w=="}]}"#;

        let payload = Payload::decode(json, PayloadKind::Uplink).unwrap();
        assert!(payload.status.is_none());
        assert_eq!(payload.uplink_frames.len(), 1);

        let rxpk = &payload.uplink_frames[0];
        let time = rxpk.time.unwrap();
        assert_eq!(
            time.with_nanosecond(0).unwrap(),
            Utc.with_ymd_and_hms(2013, 3, 31, 16, 21, 17).unwrap()
        );
        assert_eq!(time.nanosecond(), 528_002_000);
        assert_eq!(rxpk.tmst, 3512348611);
        assert_eq!(rxpk.freq, 866.349812);
        assert_eq!(rxpk.stat, CrcStatus::Ok);
        assert_eq!(rxpk.datr, DataRate::Lora("SF7BW125".to_string()));
        assert_eq!(rxpk.codr.as_deref(), Some("4/6"));
        assert_eq!(rxpk.rssi, -35);
        assert_eq!(rxpk.lsnr, Some(5.1));
        assert_eq!(rxpk.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_rxpk_time_reencodes_with_microseconds() {
        let json = br#"{"rxpk":[{"time":"2013-03-31T16:21:17.528002Z","modu":"LORA","datr":"SF7BW125","data":""}]}"#;
        let payload = Payload::decode(json, PayloadKind::Uplink).unwrap();
        let value = encode_json(&payload, PayloadKind::Uplink);
        assert_eq!(value["rxpk"][0]["time"], "2013-03-31T16:21:17.528002Z");
    }

    #[test]
    fn test_fsk_datarate_is_integer() {
        let payload = Payload::uplink(vec![fsk_rxpk()], None);
        let value = encode_json(&payload, PayloadKind::Uplink);
        assert_eq!(value["rxpk"][0]["modu"], "FSK");
        assert_eq!(value["rxpk"][0]["datr"], 50000);
        assert!(value["rxpk"][0]["datr"].is_u64());

        let bytes = payload.encode(PayloadKind::Uplink).unwrap();
        let decoded = Payload::decode(&bytes, PayloadKind::Uplink).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_lora_datarate_is_string() {
        let txpk = Txpk::new(869.525, 27, DataRate::Lora("SF9BW125".to_string()), vec![1]);
        let payload = Payload::downlink(txpk);
        let value = encode_json(&payload, PayloadKind::Downlink);
        assert_eq!(value["txpk"]["modu"], "LORA");
        assert_eq!(value["txpk"]["datr"], "SF9BW125");

        let bytes = payload.encode(PayloadKind::Downlink).unwrap();
        let decoded = Payload::decode(&bytes, PayloadKind::Downlink).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_fsk_datarate_accepts_numeric_string() {
        let json = br#"{"rxpk":[{"modu":"FSK","datr":"50000","data":""}]}"#;
        let payload = Payload::decode(json, PayloadKind::Uplink).unwrap();
        assert_eq!(payload.uplink_frames[0].datr, DataRate::Fsk(50000));
    }

    #[test]
    fn test_datarate_shape_must_match_modulation() {
        let json = br#"{"rxpk":[{"modu":"LORA","datr":50000,"data":""}]}"#;
        assert!(matches!(
            Payload::decode(json, PayloadKind::Uplink),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_unknown_modulation() {
        let json = br#"{"rxpk":[{"modu":"LR-FHSS","datr":"M0CW137","data":""}]}"#;
        match Payload::decode(json, PayloadKind::Uplink) {
            Err(Error::UnknownModulation(m)) => assert_eq!(m, "LR-FHSS"),
            other => panic!("Expected UnknownModulation, got {:?}", other),
        }

        let json = br#"{"txpk":{"datr":"SF7BW125","data":""}}"#;
        assert!(matches!(
            Payload::decode(json, PayloadKind::Downlink),
            Err(Error::UnknownModulation(_))
        ));
    }

    #[test]
    fn test_stat_expanded_time() {
        let json = br#"{"stat":{"time":"2014-01-12 08:59:28 GMT","lati":46.24000,"long":3.25230,"alti":145,"rxnb":2,"rxok":2,"rxfw":2,"ackr":100.0,"dwnb":2,"txnb":2}}"#;
        let payload = Payload::decode(json, PayloadKind::Uplink).unwrap();
        let stat = payload.status.clone().unwrap();
        assert_eq!(
            stat.time,
            Some(Utc.with_ymd_and_hms(2014, 1, 12, 8, 59, 28).unwrap())
        );
        assert_eq!(stat.lati, Some(46.24));
        assert_eq!(stat.long, Some(3.2523));
        assert_eq!(stat.alti, Some(145));
        assert_eq!(stat.ackr, 100.0);

        let value = encode_json(&payload, PayloadKind::Uplink);
        assert_eq!(value["stat"]["time"], "2014-01-12 08:59:28 GMT");
    }

    #[test]
    fn test_stat_time_utc_suffix_accepted() {
        let json = br#"{"stat":{"time":"2026-02-18 17:30:00 UTC"}}"#;
        let payload = Payload::decode(json, PayloadKind::Uplink).unwrap();
        assert_eq!(
            payload.status.unwrap().time,
            Some(Utc.with_ymd_and_hms(2026, 2, 18, 17, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_absent_time_is_not_an_error() {
        let json = br#"{"stat":{"rxnb":1}}"#;
        let payload = Payload::decode(json, PayloadKind::Uplink).unwrap();
        assert_eq!(payload.status.unwrap().time, None);
    }

    #[test]
    fn test_malformed_timestamps() {
        let bad_stat = br#"{"stat":{"time":"yesterday"}}"#;
        assert!(matches!(
            Payload::decode(bad_stat, PayloadKind::Uplink),
            Err(Error::MalformedTimestamp { .. })
        ));

        let bad_rxpk = br#"{"rxpk":[{"time":"2013-13-31T16:21:17Z","modu":"LORA","datr":"SF7BW125","data":""}]}"#;
        assert!(matches!(
            Payload::decode(bad_rxpk, PayloadKind::Uplink),
            Err(Error::MalformedTimestamp { .. })
        ));
    }

    #[test]
    fn test_stat_time_with_fractional_seconds_rejected() {
        let at = Utc.with_ymd_and_hms(2014, 1, 12, 8, 59, 28).unwrap();
        let status = |time: DateTime<Utc>| Stat {
            time: Some(time),
            ..Stat::default()
        };

        let whole = Payload::uplink(vec![], Some(status(at)));
        let bytes = whole.encode(PayloadKind::Uplink).unwrap();
        assert_eq!(Payload::decode(&bytes, PayloadKind::Uplink).unwrap(), whole);

        let fractional = Payload::uplink(
            vec![],
            Some(status(at.with_nanosecond(750_000_000).unwrap())),
        );
        assert!(matches!(
            fractional.encode(PayloadKind::Uplink),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_compact_time_finer_than_microseconds_rejected() {
        let at = Utc.with_ymd_and_hms(2013, 3, 31, 16, 21, 17).unwrap();

        let micros = Rxpk {
            time: Some(at.with_nanosecond(528_002_000).unwrap()),
            ..fsk_rxpk()
        };
        let payload = Payload::uplink(vec![micros], None);
        let bytes = payload.encode(PayloadKind::Uplink).unwrap();
        assert_eq!(Payload::decode(&bytes, PayloadKind::Uplink).unwrap(), payload);

        let nanos = Rxpk {
            time: Some(at.with_nanosecond(528_002_001).unwrap()),
            ..fsk_rxpk()
        };
        assert!(matches!(
            Payload::uplink(vec![nanos], None).encode(PayloadKind::Uplink),
            Err(Error::InvalidPacket(_))
        ));

        let mut txpk = Txpk::new(869.525, 14, DataRate::Lora("SF9BW125".to_string()), vec![1]);
        txpk.time = Some(at.with_nanosecond(1).unwrap());
        assert!(matches!(
            Payload::downlink(txpk).encode(PayloadKind::Downlink),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_base64_padding() {
        let padded = br#"{"txpk":{"modu":"LORA","datr":"SF9BW125","size":4,"data":"AQIDBA=="}}"#;
        let unpadded = br#"{"txpk":{"modu":"LORA","datr":"SF9BW125","size":4,"data":"AQIDBA"}}"#;

        let a = Payload::decode(padded, PayloadKind::Downlink).unwrap();
        let b = Payload::decode(unpadded, PayloadKind::Downlink).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.downlink.as_ref().unwrap().data, vec![1, 2, 3, 4]);

        let value = encode_json(&b, PayloadKind::Downlink);
        assert_eq!(value["txpk"]["data"], "AQIDBA==");
    }

    #[test]
    fn test_invalid_base64() {
        let json = br#"{"txpk":{"modu":"LORA","datr":"SF9BW125","data":"not base64!"}}"#;
        assert!(matches!(
            Payload::decode(json, PayloadKind::Downlink),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_txpk_defaults() {
        let json = br#"{"txpk":{"freq":869.525,"rfch":0,"powe":27,"modu":"LORA","datr":"SF9BW125","codr":"4/5","size":4,"data":"AQIDBA"}}"#;
        let txpk = Payload::decode(json, PayloadKind::Downlink)
            .unwrap()
            .downlink
            .unwrap();

        assert_eq!(txpk.imme, None);
        assert!(!txpk.immediate());
        assert!(!txpk.polarization_inverted());
        assert!(!txpk.crc_disabled());
        assert_eq!(txpk.preamble(), DEFAULT_PREAMBLE);
        assert_eq!(txpk.frequency_deviation(), 0);
        assert_eq!(txpk.schedule(), None);

        // Absent fields stay absent on the way out.
        let value = encode_json(&Payload::downlink(txpk), PayloadKind::Downlink);
        let txpk = value["txpk"].as_object().unwrap();
        for key in ["imme", "tmst", "time", "ipol", "ncrc", "prea", "fdev"] {
            assert!(!txpk.contains_key(key), "{} should be omitted", key);
        }
    }

    #[test]
    fn test_explicit_false_is_kept() {
        let json = br#"{"txpk":{"imme":false,"ipol":false,"modu":"LORA","datr":"SF9BW125","data":""}}"#;
        let txpk = Payload::decode(json, PayloadKind::Downlink)
            .unwrap()
            .downlink
            .unwrap();
        assert_eq!(txpk.imme, Some(false));
        assert_eq!(txpk.ipol, Some(false));
    }

    #[test]
    fn test_txpk_schedule() {
        let mut txpk = Txpk::new(869.525, 14, DataRate::Fsk(50000), vec![]);
        txpk.tmst = Some(1000);
        assert_eq!(txpk.schedule(), Some(TxSchedule::Timestamp(1000)));

        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        txpk.tmst = None;
        txpk.time = Some(at);
        assert_eq!(txpk.schedule(), Some(TxSchedule::GpsTime(at)));

        txpk.imme = Some(true);
        assert_eq!(txpk.schedule(), Some(TxSchedule::Immediate));
    }

    #[test]
    fn test_schema_mismatch() {
        let downlink_body = br#"{"txpk":{"modu":"LORA","datr":"SF9BW125","data":""}}"#;
        assert!(matches!(
            Payload::decode(downlink_body, PayloadKind::Uplink),
            Err(Error::SchemaMismatch(_))
        ));

        let uplink_body = br#"{"stat":{"rxnb":1}}"#;
        assert!(matches!(
            Payload::decode(uplink_body, PayloadKind::Downlink),
            Err(Error::SchemaMismatch(_))
        ));

        let txpk = Txpk::new(869.525, 14, DataRate::Lora("SF12BW125".to_string()), vec![]);
        assert!(matches!(
            Payload::downlink(txpk).encode(PayloadKind::Uplink),
            Err(Error::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_downlink_without_txpk() {
        assert!(matches!(
            Payload::decode(b"{}", PayloadKind::Downlink),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_json_syntax_error() {
        assert!(matches!(
            Payload::decode(br#"{"rxpk":["#, PayloadKind::Uplink),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(
            Payload::decode(b"[1,2]", PayloadKind::Uplink),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_floats_not_truncated() {
        let stat = Stat {
            lati: Some(46.123456789),
            long: Some(-95.3698),
            ackr: 33.333333,
            ..Stat::default()
        };
        let payload = Payload::uplink(vec![], Some(stat));
        let bytes = payload.encode(PayloadKind::Uplink).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("46.123456789"));
        assert_eq!(Payload::decode(&bytes, PayloadKind::Uplink).unwrap(), payload);
    }

    #[test]
    fn test_empty_uplink_omits_rxpk() {
        let value = encode_json(&Payload::default(), PayloadKind::Uplink);
        assert_eq!(value, serde_json::json!({}));
    }
}
