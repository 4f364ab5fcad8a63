//! Heart Rate Measurement Decoder
//!
//! Turns the raw value of the GATT Heart Rate Measurement characteristic
//! (0x2A37) into a [`HeartRateSample`].
//!
//! # Payload Layout
//!
//! ```text
//! [0]     : Flags
//!           bit 0: BPM format (0 = u8, 1 = u16 little-endian)
//!           bit 3: Energy Expended present (u16, skipped)
//!           bit 4: RR intervals present
//! [1..]   : BPM (1 or 2 bytes)
//! [..]    : Energy Expended (2 bytes, optional)
//! [..]    : RR intervals, u16 little-endian in 1/1024 s units (optional, repeated)
//! ```

use crate::domain::models::HeartRateSample;
use thiserror::Error;

pub const FLAG_BPM_U16: u8 = 0x01;
pub const FLAG_ENERGY_EXPENDED: u8 = 0x08;
pub const FLAG_RR_INTERVALS: u8 = 0x10;

/// Largest BPM value the bridge accepts as physiological
pub const MAX_BPM: u16 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated payload: need {needed} bytes, got {got}")]
    TruncatedPayload { needed: usize, got: usize },

    #[error("bpm {0} outside 0..=300")]
    OutOfRange(u16),
}

/// Decode a measurement payload received at `timestamp_seconds`
pub fn decode(payload: &[u8], timestamp_seconds: f64) -> Result<HeartRateSample, DecodeError> {
    let flags = *payload.first().ok_or(DecodeError::TruncatedPayload {
        needed: 2,
        got: 0,
    })?;

    let wide = flags & FLAG_BPM_U16 != 0;
    let bpm_end = if wide { 3 } else { 2 };
    if payload.len() < bpm_end {
        return Err(DecodeError::TruncatedPayload {
            needed: bpm_end,
            got: payload.len(),
        });
    }

    let bpm = if wide {
        u16::from_le_bytes([payload[1], payload[2]])
    } else {
        payload[1] as u16
    };
    if bpm > MAX_BPM {
        return Err(DecodeError::OutOfRange(bpm));
    }

    let mut idx = bpm_end;
    if flags & FLAG_ENERGY_EXPENDED != 0 && payload.len() >= idx + 2 {
        idx += 2;
    }

    let rr_intervals_millis = if flags & FLAG_RR_INTERVALS != 0 {
        let intervals: Vec<f64> = payload[idx.min(payload.len())..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .filter(|raw| *raw != 0)
            .map(|raw| raw as f64 * 1000.0 / 1024.0)
            .collect();
        Some(intervals)
    } else {
        None
    };

    Ok(HeartRateSample {
        bpm,
        timestamp_seconds,
        rr_intervals_millis,
    })
}
