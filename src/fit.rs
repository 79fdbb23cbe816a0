//! FIT activity file encoding.
//!
//! Encodes a finished session as a Garmin FIT activity: 14-byte header,
//! `file_id`, one `record` message per training sample, `lap` and
//! `session` messages, CRC-16/ARC over header and file. The unit
//! conversions demanded by the format (meters to centimeters, m/s to mm/s,
//! rounded kilocalories, stroke rate as cadence) live here, not in the
//! session.

use chrono::{DateTime, Utc};

use crate::session::{SessionSummary, TrainingSample};

/// Seconds between the Unix epoch and the FIT epoch (1989-12-31T00:00:00Z).
const FIT_EPOCH_OFFSET: i64 = 631_065_600;

/// FIT sport enum value for rowing.
const SPORT_ROWING: u8 = 15;

// FIT base type codes used below.
const BASE_ENUM: u8 = 0;
const BASE_UINT8: u8 = 2;
const BASE_UINT16: u8 = 132;
const BASE_UINT32: u8 = 134;
const BASE_UINT32Z: u8 = 140;

// Invalid-value sentinels per base type.
const INVALID_U8: u8 = 0xFF;
const INVALID_U16: u16 = 0xFFFF;
const INVALID_U32: u32 = 0xFFFF_FFFF;

/// CRC-16/ARC (polynomial 0xA001, reflected), as used by FIT headers and
/// file trailers.
fn fit_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        for bit in 0..8 {
            let b = (byte >> bit) & 1;
            let c = (crc & 1) as u8;
            crc >>= 1;
            if b ^ c != 0 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

fn unix_ms_to_fit_timestamp(epoch_ms: u64) -> u32 {
    let unix_secs = (epoch_ms / 1000) as i64;
    (unix_secs - FIT_EPOCH_OFFSET).max(0) as u32
}

fn datetime_to_fit_timestamp(dt: &DateTime<Utc>) -> u32 {
    (dt.timestamp() - FIT_EPOCH_OFFSET).max(0) as u32
}

struct FitWriter {
    data: Vec<u8>,
}

impl FitWriter {
    fn new() -> Self {
        // Reserve space for the 14-byte header, filled in by finish().
        FitWriter {
            data: vec![0u8; 14],
        }
    }

    /// Write a definition message: `(field_def_num, size, base_type)` per
    /// field, little-endian architecture.
    fn write_definition(&mut self, local_msg: u8, global_msg: u16, fields: &[(u8, u8, u8)]) {
        self.data.push(0x40 | (local_msg & 0x0F));
        self.data.push(0); // reserved
        self.data.push(0); // architecture: little-endian
        self.data.extend_from_slice(&global_msg.to_le_bytes());
        self.data.push(fields.len() as u8);
        for &(field_def_num, size, base_type) in fields {
            self.data.push(field_def_num);
            self.data.push(size);
            self.data.push(base_type);
        }
    }

    fn write_data(&mut self, local_msg: u8, field_data: &[u8]) {
        self.data.push(local_msg & 0x0F);
        self.data.extend_from_slice(field_data);
    }

    /// Fill in the header and append the file CRC.
    fn finish(mut self) -> Vec<u8> {
        let data_size = (self.data.len() - 14) as u32;

        self.data[0] = 14; // header size
        self.data[1] = 0x20; // protocol version 2.0
        let profile_version: u16 = 2132;
        self.data[2..4].copy_from_slice(&profile_version.to_le_bytes());
        self.data[4..8].copy_from_slice(&data_size.to_le_bytes());
        self.data[8..12].copy_from_slice(b".FIT");
        let header_crc = fit_crc16(&self.data[0..12]);
        self.data[12..14].copy_from_slice(&header_crc.to_le_bytes());

        let file_crc = fit_crc16(&self.data);
        self.data.extend_from_slice(&file_crc.to_le_bytes());
        self.data
    }
}

/// Encode a finished session as a FIT activity file.
pub fn encode_activity(
    summary: &SessionSummary,
    samples: &[TrainingSample],
    start_time: DateTime<Utc>,
) -> Vec<u8> {
    let mut w = FitWriter::new();
    let start_ts = datetime_to_fit_timestamp(&start_time);

    // --- file_id (global 0) ---
    w.write_definition(
        0,
        0,
        &[
            (0, 1, BASE_ENUM),    // type
            (1, 2, BASE_UINT16),  // manufacturer
            (2, 2, BASE_UINT16),  // product
            (3, 4, BASE_UINT32Z), // serial_number
            (4, 4, BASE_UINT32),  // time_created
        ],
    );
    let mut file_id = Vec::with_capacity(13);
    file_id.push(4); // type = activity
    file_id.extend_from_slice(&255u16.to_le_bytes()); // manufacturer = development
    file_id.extend_from_slice(&1u16.to_le_bytes()); // product
    file_id.extend_from_slice(&0u32.to_le_bytes()); // serial
    file_id.extend_from_slice(&start_ts.to_le_bytes());
    w.write_data(0, &file_id);

    // --- record (global 20), one per sample ---
    w.write_definition(
        1,
        20,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (5, 4, BASE_UINT32),   // distance, m * 100
            (6, 2, BASE_UINT16),   // speed, m/s * 1000
            (7, 2, BASE_UINT16),   // power, watts
            (3, 1, BASE_UINT8),    // heart_rate, bpm
            (4, 1, BASE_UINT8),    // cadence, strokes/min
        ],
    );
    for sample in samples {
        let mut rec = Vec::with_capacity(15);
        rec.extend_from_slice(&unix_ms_to_fit_timestamp(sample.timestamp).to_le_bytes());
        let distance = sample
            .distance_m
            .map_or(INVALID_U32, |m| m.saturating_mul(100));
        rec.extend_from_slice(&distance.to_le_bytes());
        let speed = sample
            .speed_mps
            .map_or(INVALID_U16, |v| (v * 1000.0).round().min(65534.0) as u16);
        rec.extend_from_slice(&speed.to_le_bytes());
        let power = sample
            .power_w
            .map_or(INVALID_U16, |p| p.round().clamp(0.0, 65534.0) as u16);
        rec.extend_from_slice(&power.to_le_bytes());
        rec.push(
            sample
                .heart_rate
                .map_or(INVALID_U8, |h| h.min(254) as u8),
        );
        rec.push(
            sample
                .stroke_rate
                .map_or(INVALID_U8, |c| c.min(254) as u8),
        );
        w.write_data(1, &rec);
    }

    let end_ts = start_ts + summary.duration_s as u32;
    let elapsed_ms = (summary.duration_s * 1000).min(u32::MAX as u64) as u32;

    // --- lap (global 19) ---
    w.write_definition(
        2,
        19,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (2, 4, BASE_UINT32),   // start_time
            (7, 4, BASE_UINT32),   // total_elapsed_time, s * 1000
            (8, 4, BASE_UINT32),   // total_timer_time, s * 1000
        ],
    );
    let mut lap = Vec::with_capacity(16);
    lap.extend_from_slice(&end_ts.to_le_bytes());
    lap.extend_from_slice(&start_ts.to_le_bytes());
    lap.extend_from_slice(&elapsed_ms.to_le_bytes());
    lap.extend_from_slice(&elapsed_ms.to_le_bytes());
    w.write_data(2, &lap);

    // --- session (global 18) ---
    w.write_definition(
        3,
        18,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (2, 4, BASE_UINT32),   // start_time
            (7, 4, BASE_UINT32),   // total_elapsed_time
            (8, 4, BASE_UINT32),   // total_timer_time
            (5, 1, BASE_ENUM),     // sport
            (9, 4, BASE_UINT32),   // total_distance, m * 100
            (11, 2, BASE_UINT16),  // total_calories, kcal
            (20, 2, BASE_UINT16),  // avg_power
            (21, 2, BASE_UINT16),  // max_power
            (16, 1, BASE_UINT8),   // avg_heart_rate
            (17, 1, BASE_UINT8),   // max_heart_rate
        ],
    );
    let mut sess = Vec::with_capacity(30);
    sess.extend_from_slice(&end_ts.to_le_bytes());
    sess.extend_from_slice(&start_ts.to_le_bytes());
    sess.extend_from_slice(&elapsed_ms.to_le_bytes());
    sess.extend_from_slice(&elapsed_ms.to_le_bytes());
    sess.push(SPORT_ROWING);
    let total_distance = summary
        .distance_m
        .map_or(INVALID_U32, |m| m.saturating_mul(100));
    sess.extend_from_slice(&total_distance.to_le_bytes());
    let calories = summary
        .total_calories
        .map_or(INVALID_U16, |c| c.min(65534) as u16);
    sess.extend_from_slice(&calories.to_le_bytes());
    let avg_power = summary
        .avg_power_w
        .map_or(INVALID_U16, |p| p.round().clamp(0.0, 65534.0) as u16);
    sess.extend_from_slice(&avg_power.to_le_bytes());
    let max_power = summary
        .max_power_w
        .map_or(INVALID_U16, |p| p.round().clamp(0.0, 65534.0) as u16);
    sess.extend_from_slice(&max_power.to_le_bytes());
    sess.push(summary.avg_heart_rate.map_or(INVALID_U8, |h| h.min(254) as u8));
    sess.push(summary.max_heart_rate.map_or(INVALID_U8, |h| h.min(254) as u8));
    w.write_data(3, &sess);

    w.finish()
}
