//! The S4 register map and the driver-owned value table.
//!
//! Registers are named memory locations on the monitor, read with the
//! `IR{S|D|T}{addr}` command and reported back in `ID{S|D|T}` replies.
//! The definition table is fixed at startup; only the cached current
//! values mutate, and the driver's frame handler is their single writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::DatapointFrame;

/// Payload width of a register: 1, 2 or 3 bytes on the wire, reported as
/// 2, 4 or 6 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    Single,
    Double,
    Triple,
}

impl Width {
    /// Wire tag used in `IR` requests and `ID` replies.
    pub const fn tag(self) -> char {
        match self {
            Width::Single => 'S',
            Width::Double => 'D',
            Width::Triple => 'T',
        }
    }

    /// Number of hex characters carrying the value.
    pub const fn hex_digits(self) -> usize {
        match self {
            Width::Single => 2,
            Width::Double => 4,
            Width::Triple => 6,
        }
    }

    /// Payload width in bytes.
    pub const fn bytes(self) -> u8 {
        match self {
            Width::Single => 1,
            Width::Double => 2,
            Width::Triple => 3,
        }
    }

    pub fn from_tag(tag: char) -> Option<Width> {
        match tag {
            'S' => Some(Width::Single),
            'D' => Some(Width::Double),
            'T' => Some(Width::Triple),
            _ => None,
        }
    }
}

/// Static definition of one S4 register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDef {
    pub name: &'static str,
    pub address: &'static str,
    pub width: Width,
    /// How the reply digits are interpreted: most registers report hex,
    /// the display clock registers report decimal digits.
    pub radix: u32,
}

/// The registers this daemon knows about, per the upstream S4 memory map.
pub const REGISTERS: &[RegisterDef] = &[
    RegisterDef { name: "mph", address: "1A3", width: Width::Double, radix: 10 },
    RegisterDef { name: "stroke_rate", address: "1A9", width: Width::Single, radix: 16 },
    RegisterDef { name: "distance", address: "057", width: Width::Double, radix: 16 },
    RegisterDef { name: "m_s_distance_dec", address: "054", width: Width::Single, radix: 16 },
    RegisterDef { name: "m_s_distance", address: "055", width: Width::Double, radix: 16 },
    RegisterDef { name: "clock_down_dec", address: "05A", width: Width::Single, radix: 16 },
    RegisterDef { name: "clock_down", address: "05B", width: Width::Double, radix: 16 },
    RegisterDef { name: "total_dis", address: "081", width: Width::Double, radix: 16 },
    RegisterDef { name: "kcal_watts", address: "088", width: Width::Double, radix: 16 },
    RegisterDef { name: "total_kcal", address: "08A", width: Width::Double, radix: 16 },
    RegisterDef { name: "tank_volume", address: "0A9", width: Width::Single, radix: 16 },
    RegisterDef { name: "strokes_cnt", address: "140", width: Width::Double, radix: 16 },
    RegisterDef { name: "stroke_average", address: "142", width: Width::Single, radix: 16 },
    RegisterDef { name: "stroke_pull", address: "143", width: Width::Single, radix: 16 },
    RegisterDef { name: "m_s_total", address: "148", width: Width::Double, radix: 16 },
    RegisterDef { name: "m_s_average", address: "14A", width: Width::Double, radix: 16 },
    RegisterDef { name: "display_sec", address: "1E1", width: Width::Single, radix: 10 },
    RegisterDef { name: "display_min", address: "1E2", width: Width::Single, radix: 10 },
    RegisterDef { name: "display_hr", address: "1E3", width: Width::Single, radix: 10 },
];

/// One decoded register value as published on the datapoint stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Arrival time, epoch milliseconds.
    pub time: u64,
    pub name: &'static str,
    pub address: &'static str,
    pub width: Width,
    pub value: u32,
}

/// The driver-owned register table: static definitions plus the cached
/// current value of each register.
pub struct RegisterTable {
    entries: Vec<Entry>,
    by_address: HashMap<&'static str, usize>,
    by_name: HashMap<&'static str, usize>,
}

struct Entry {
    def: RegisterDef,
    current: AtomicU32,
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterTable {
    pub fn new() -> Self {
        let entries: Vec<Entry> = REGISTERS
            .iter()
            .map(|def| Entry {
                def: *def,
                current: AtomicU32::new(0),
            })
            .collect();
        let by_address = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.def.address, i))
            .collect();
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.def.name, i))
            .collect();
        RegisterTable {
            entries,
            by_address,
            by_name,
        }
    }

    pub fn defs(&self) -> impl Iterator<Item = &RegisterDef> {
        self.entries.iter().map(|e| &e.def)
    }

    pub fn def_by_name(&self, name: &str) -> Option<&RegisterDef> {
        self.by_name.get(name).map(|&i| &self.entries[i].def)
    }

    /// Decode a datapoint frame against the table, caching the value.
    ///
    /// Fails with [`Error::ParseMalformed`] for unknown addresses, width
    /// mismatches, and digits that do not parse in the register's radix.
    pub fn decode(&self, frame: &DatapointFrame, time: u64) -> Result<Sample> {
        let idx = self
            .by_address
            .get(frame.address.as_str())
            .copied()
            .ok_or_else(|| {
                Error::ParseMalformed(format!("unknown register address {}", frame.address))
            })?;
        let entry = &self.entries[idx];

        if entry.def.width != frame.width {
            return Err(Error::ParseMalformed(format!(
                "register {} replied with width {} but is defined as {}",
                entry.def.name,
                frame.width.tag(),
                entry.def.width.tag()
            )));
        }

        let value = u32::from_str_radix(&frame.digits, entry.def.radix).map_err(|e| {
            Error::ParseMalformed(format!(
                "register {} value {:?} is not base-{}: {}",
                entry.def.name, frame.digits, entry.def.radix, e
            ))
        })?;

        entry.current.store(value, Ordering::Relaxed);

        Ok(Sample {
            time,
            name: entry.def.name,
            address: entry.def.address,
            width: entry.def.width,
            value,
        })
    }

    /// Last decoded value of a register, by name.
    pub fn read_current(&self, name: &str) -> Option<u32> {
        self.by_name
            .get(name)
            .map(|&i| self.entries[i].current.load(Ordering::Relaxed))
    }

    /// Snapshot of current values. With `None`, every register is returned;
    /// unknown names in the subset are skipped.
    pub fn snapshot(&self, subset: Option<&[String]>) -> Vec<(&'static str, u32)> {
        match subset {
            None => self
                .entries
                .iter()
                .map(|e| (e.def.name, e.current.load(Ordering::Relaxed)))
                .collect(),
            Some(names) => names
                .iter()
                .filter_map(|n| {
                    self.by_name
                        .get(n.as_str())
                        .map(|&i| (self.entries[i].def.name, self.entries[i].current.load(Ordering::Relaxed)))
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{classify, Frame};

    fn datapoint(line: &str) -> DatapointFrame {
        match classify(line) {
            Frame::Datapoint(dp) => dp,
            other => panic!("{line} classified as {other:?}"),
        }
    }

    #[test]
    fn decode_stroke_rate_reply() {
        let table = RegisterTable::new();
        let sample = table.decode(&datapoint("IDS1A912"), 42).unwrap();
        assert_eq!(sample.name, "stroke_rate");
        assert_eq!(sample.address, "1A9");
        assert_eq!(sample.width, Width::Single);
        assert_eq!(sample.value, 18);
        assert_eq!(sample.time, 42);
    }

    #[test]
    fn decode_watts_reply() {
        let table = RegisterTable::new();
        let sample = table.decode(&datapoint("IDD08800C8"), 0).unwrap();
        assert_eq!(sample.name, "kcal_watts");
        assert_eq!(sample.value, 200);
    }

    #[test]
    fn decode_is_deterministic() {
        let table = RegisterTable::new();
        let a = table.decode(&datapoint("IDD05701F4"), 7).unwrap();
        let b = table.decode(&datapoint("IDD05701F4"), 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_caches_current_value() {
        let table = RegisterTable::new();
        assert_eq!(table.read_current("distance"), Some(0));
        table.decode(&datapoint("IDD05701F4"), 0).unwrap();
        assert_eq!(table.read_current("distance"), Some(500));
    }

    #[test]
    fn decode_decimal_radix_register() {
        let table = RegisterTable::new();
        // display_sec reports decimal digits: "45" means 45 seconds.
        let sample = table.decode(&datapoint("IDS1E145"), 0).unwrap();
        assert_eq!(sample.name, "display_sec");
        assert_eq!(sample.value, 45);
    }

    #[test]
    fn decode_rejects_hex_digits_in_decimal_register() {
        let table = RegisterTable::new();
        let err = table.decode(&datapoint("IDS1E14A"), 0).unwrap_err();
        assert!(matches!(err, Error::ParseMalformed(_)), "{err}");
        // The cached value must be untouched by the failed decode.
        assert_eq!(table.read_current("display_sec"), Some(0));
    }

    #[test]
    fn decode_rejects_unknown_address() {
        let table = RegisterTable::new();
        let err = table.decode(&datapoint("IDS99912"), 0).unwrap_err();
        assert!(matches!(err, Error::ParseMalformed(_)), "{err}");
    }

    #[test]
    fn decode_rejects_width_mismatch() {
        let table = RegisterTable::new();
        // stroke_rate is a single-byte register; a double reply is bogus.
        let err = table.decode(&datapoint("IDD1A90012"), 0).unwrap_err();
        assert!(matches!(err, Error::ParseMalformed(_)), "{err}");
    }

    #[test]
    fn snapshot_full_and_subset() {
        let table = RegisterTable::new();
        table.decode(&datapoint("IDS1A912"), 0).unwrap();
        table.decode(&datapoint("IDD08800C8"), 0).unwrap();

        let all = table.snapshot(None);
        assert_eq!(all.len(), REGISTERS.len());

        let subset = table.snapshot(Some(&[
            "stroke_rate".to_string(),
            "kcal_watts".to_string(),
            "no_such_register".to_string(),
        ]));
        assert_eq!(subset, vec![("stroke_rate", 18), ("kcal_watts", 200)]);
    }

    #[test]
    fn register_addresses_are_unique() {
        let table = RegisterTable::new();
        assert_eq!(table.by_address.len(), REGISTERS.len());
        assert_eq!(table.by_name.len(), REGISTERS.len());
    }

    #[test]
    fn width_tags_round_trip() {
        for width in [Width::Single, Width::Double, Width::Triple] {
            assert_eq!(Width::from_tag(width.tag()), Some(width));
        }
        assert_eq!(Width::from_tag('X'), None);
        assert_eq!(Width::from_tag('s'), None);
    }

    #[test]
    fn width_sizes() {
        assert_eq!(Width::Single.hex_digits(), 2);
        assert_eq!(Width::Double.hex_digits(), 4);
        assert_eq!(Width::Triple.hex_digits(), 6);
        assert_eq!(Width::Single.bytes(), 1);
        assert_eq!(Width::Double.bytes(), 2);
        assert_eq!(Width::Triple.bytes(), 3);
    }
}
