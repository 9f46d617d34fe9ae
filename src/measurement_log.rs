//! Reader for recorded lidar/radar measurement logs.
//!
//! One measurement per line, whitespace separated:
//!
//! ```text
//! L  px   py   timestamp_us  [gt_px gt_py gt_vx gt_vy]
//! R  rho  phi  rho_dot  timestamp_us  [gt_px gt_py gt_vx gt_vy]
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. Paths ending in `.gz`
//! are decompressed on the fly.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::types::{LidarObservation, Observation, RadarObservation, StateVector};

const GROUND_TRUTH_FIELDS: usize = 4;

/// True target state recorded alongside a measurement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub px: f64,
    pub py: f64,
    pub vx: f64,
    pub vy: f64,
}

impl GroundTruth {
    pub fn as_vector(&self) -> StateVector {
        StateVector::new(self.px, self.py, self.vx, self.vy)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggedMeasurement {
    pub observation: Observation,
    pub ground_truth: Option<GroundTruth>,
}

pub fn load_log(path: &Path) -> Result<Vec<LoggedMeasurement>, LogError> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        read_log(BufReader::new(GzDecoder::new(file)))
    } else {
        read_log(BufReader::new(file))
    }
}

pub fn read_log<R: BufRead>(reader: R) -> Result<Vec<LoggedMeasurement>, LogError> {
    let mut measurements = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(m) = parse_line(&line, idx + 1)? {
            measurements.push(m);
        }
    }
    Ok(measurements)
}

/// Parse one log line; `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str, line_no: usize) -> Result<Option<LoggedMeasurement>, LogError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let malformed = |reason: String| LogError::Malformed { line: line_no, reason };
    let fields: Vec<&str> = trimmed.split_whitespace().collect();

    // Measurement values between the tag and the timestamp
    let value_count = match fields[0] {
        "L" => 2,
        "R" => 3,
        other => return Err(malformed(format!("unknown sensor tag '{other}'"))),
    };

    let base = 1 + value_count + 1;
    let trailing = fields.len().checked_sub(base).ok_or_else(|| {
        malformed(format!("expected at least {base} fields, found {}", fields.len()))
    })?;
    if trailing != 0 && trailing != GROUND_TRUTH_FIELDS {
        return Err(malformed(format!(
            "expected {base} or {} fields, found {}",
            base + GROUND_TRUTH_FIELDS,
            fields.len()
        )));
    }

    let number = |idx: usize| -> Result<f64, LogError> {
        let value: f64 = fields[idx].parse().map_err(|_| {
            malformed(format!("field {} '{}' is not a number", idx + 1, fields[idx]))
        })?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(malformed(format!("field {} is not finite", idx + 1)))
        }
    };

    let timestamp_us: i64 = fields[base - 1]
        .parse()
        .map_err(|_| malformed(format!("timestamp '{}' is not an integer", fields[base - 1])))?;

    let observation = if value_count == 2 {
        Observation::Lidar(LidarObservation::new(timestamp_us, number(1)?, number(2)?))
    } else {
        Observation::Radar(RadarObservation::new(timestamp_us, number(1)?, number(2)?, number(3)?))
    };

    let ground_truth = if trailing == GROUND_TRUTH_FIELDS {
        Some(GroundTruth {
            px: number(base)?,
            py: number(base + 1)?,
            vx: number(base + 2)?,
            vy: number(base + 3)?,
        })
    } else {
        None
    };

    Ok(Some(LoggedMeasurement { observation, ground_truth }))
}
