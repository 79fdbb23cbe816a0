//! S4 serial frame codec.
//!
//! The S4 speaks CR/LF-terminated ASCII lines. The reply family is small:
//! a hardware identification line sent after the `USB` handshake, register
//! value replies (`IDS`/`IDD`/`IDT`), stroke pulse notifications, and a few
//! informational lines we ignore. Classification is pure and never fails;
//! anything unrecognised (including truncated register replies) is `Other`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::registers::Width;

/// Prefix of the hardware identification reply (`_WR_<hw>`).
const HARDWARE_PREFIX: &str = "_WR_";

/// Classification of one inbound serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Datapoint,
    HardwareType,
    Pulse,
    Other,
}

/// A classified line with the datapoint payload extracted when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Datapoint(DatapointFrame),
    HardwareType,
    Pulse,
    Other,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Datapoint(_) => FrameKind::Datapoint,
            Frame::HardwareType => FrameKind::HardwareType,
            Frame::Pulse => FrameKind::Pulse,
            Frame::Other => FrameKind::Other,
        }
    }
}

/// Payload of an `ID{S|D|T}` register reply: the width tag, the three hex
/// characters of the memory address, and the raw value digits (2, 4 or 6
/// hex characters matching the width).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointFrame {
    pub width: Width,
    pub address: String,
    pub digits: String,
}

/// One raw line as it travelled on the wire, stamped with its arrival time.
/// This is also the recording file representation: one JSON object per line,
/// `{"time": <epoch_ms>, "type": "datapoint"|"hardwaretype"|"other", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRead {
    pub time: u64,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub data: String,
}

impl RawRead {
    pub fn now(kind: FrameKind, data: impl Into<String>) -> Self {
        RawRead {
            time: epoch_ms(),
            kind,
            data: data.into(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Classify one serial line (without its CR/LF terminator).
pub fn classify(line: &str) -> Frame {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.starts_with(HARDWARE_PREFIX) {
        return Frame::HardwareType;
    }

    if let Some(dp) = parse_datapoint(line) {
        return Frame::Datapoint(dp);
    }

    if let Some(rest) = line.strip_prefix('P') {
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Frame::Pulse;
        }
    }

    Frame::Other
}

/// Parse an `ID{S|D|T}<addr><digits>` register reply. Returns `None` for
/// anything that is not an exact-length, all-hex reply.
fn parse_datapoint(line: &str) -> Option<DatapointFrame> {
    let rest = line.strip_prefix("ID")?;
    let mut chars = rest.chars();
    let width = Width::from_tag(chars.next()?)?;

    let body = chars.as_str();
    if body.len() != 3 + width.hex_digits() {
        return None;
    }
    if !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let (address, digits) = body.split_at(3);
    Some(DatapointFrame {
        width,
        address: address.to_ascii_uppercase(),
        digits: digits.to_ascii_uppercase(),
    })
}

/// Build the canonical wire line for a register value, the inverse of
/// [`classify`] for datapoint frames. Used by the replay tooling and tests.
pub fn datapoint_line(width: Width, address: &str, value: u32) -> String {
    format!(
        "ID{}{}{:0digits$X}",
        width.tag(),
        address.to_ascii_uppercase(),
        value,
        digits = width.hex_digits()
    )
}
