//! Core data model for sensor fusion system
//!
//! Defines the value types carried between the source adapters, the
//! calibration layer, the fusion engine and the NMEA builder, plus the
//! weakly-typed JSON coercion helpers the wire protocols rely on.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 3D vector used for acceleration (m/s²), angular rate (deg/s) and
/// magnetic field (µT) readings alike.
pub type Vec3 = Vector3<f64>;

/// A single timestamped reading from the IMU (accelerometer + gyroscope,
/// optional magnetometer).
///
/// `accel` and `gyro` are always present together; `magnetometer` is
/// independent and may be absent even when the other two are present.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuSample {
    /// Linear acceleration in m/s², gravity included.
    pub accel: Vec3,
    /// Angular velocity in deg/s.
    pub gyro: Vec3,
    /// Magnetic field in µT, when available.
    pub magnetometer: Option<Vec3>,
}

/// The last-known GPS fix, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// Ground speed in m/s, clamped to `>= 0`.
    pub speed_ms: f64,
    /// Course over ground in degrees, normalized to `[0, 360)`.
    pub track: f64,
    /// ISO-8601 UTC timestamp of the fix, when the source reported one.
    pub time_iso: Option<String>,
    pub valid: bool,
    /// 0 = no fix, 1 = GPS, 2 = DGPS, ...
    pub fix_quality: i32,
    pub num_sats: u32,
    pub hdop: f64,
}

impl GpsFix {
    /// Build a fix from raw fields, applying the invariants from the data
    /// model: speed clamped non-negative, track normalized into `[0, 360)`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lat: f64,
        lon: f64,
        alt: f64,
        speed_ms: f64,
        track: f64,
        time_iso: Option<String>,
        valid: bool,
        fix_quality: i32,
        num_sats: u32,
        hdop: f64,
    ) -> Self {
        Self {
            lat,
            lon,
            alt,
            speed_ms: speed_ms.max(0.0),
            track: normalize_degrees(track),
            time_iso,
            valid,
            fix_quality,
            num_sats,
            hdop,
        }
    }
}

/// Normalize an angle in degrees into `[0.0, 360.0)`.
///
/// `rem_euclid` already wraps negative and overflowing inputs correctly,
/// including `-10 -> 350`, `370 -> 10`, `360 -> 0`.
pub fn normalize_degrees(deg: f64) -> f64 {
    if !deg.is_finite() {
        return 0.0;
    }
    deg.rem_euclid(360.0)
}

/// Static bias/offset calibration applied to raw IMU samples.
///
/// All fields default to zero, which is the identity correction: a sample
/// run through a zero `Calibration` is returned unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub gyro_bias: Vec3,
    pub accel_offset: Vec3,
    pub magnetometer_bias: Vec3,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            gyro_bias: Vec3::zeros(),
            accel_offset: Vec3::zeros(),
            magnetometer_bias: Vec3::zeros(),
        }
    }
}

impl Calibration {
    /// Apply this calibration to a raw sample, element-wise subtraction.
    /// An absent magnetometer reading stays absent regardless of bias.
    pub fn apply(&self, raw: ImuSample) -> ImuSample {
        ImuSample {
            accel: raw.accel - self.accel_offset,
            gyro: raw.gyro - self.gyro_bias,
            magnetometer: raw.magnetometer.map(|m| m - self.magnetometer_bias),
        }
    }

    /// Load from a JSON file, tolerating a missing or malformed file by
    /// falling back to zero calibration. Partial objects load zeros for
    /// the fields they omit.
    pub fn load_from_file(path: &std::path::Path) -> Self {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let Ok(value) = serde_json::from_str::<Value>(&contents) else {
            return Self::default();
        };
        Self::from_value(&value)
    }

    fn from_value(value: &Value) -> Self {
        let mut cal = Self::default();
        if let Some(v) = value.get("gyro_bias").and_then(vec3_from_json) {
            cal.gyro_bias = v;
        }
        if let Some(v) = value.get("accel_offset").and_then(vec3_from_json) {
            cal.accel_offset = v;
        }
        if let Some(v) = value.get("magnetometer_bias").and_then(vec3_from_json) {
            cal.magnetometer_bias = v;
        }
        cal
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "gyro_bias": [self.gyro_bias.x, self.gyro_bias.y, self.gyro_bias.z],
            "accel_offset": [self.accel_offset.x, self.accel_offset.y, self.accel_offset.z],
            "magnetometer_bias": [self.magnetometer_bias.x, self.magnetometer_bias.y, self.magnetometer_bias.z],
        })
    }
}

/// State of an in-progress (or idle) online gyro-bias collection run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRun {
    pub status: CalibrationStatus,
    pub samples_collected: u32,
    pub samples_needed: u32,
    pub accumulator: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationStatus {
    Idle,
    Collecting,
}

impl Default for CalibrationRun {
    fn default() -> Self {
        Self {
            status: CalibrationStatus::Idle,
            samples_collected: 0,
            samples_needed: 0,
            accumulator: Vec3::zeros(),
        }
    }
}

/// Coerce a JSON value to `f64`, accepting both JSON numbers and numeric
/// strings (the wire protocols are weakly typed per the design notes).
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce a JSON array of length 3 into a `Vec3`. Any element that fails
/// numeric coercion discards the whole vector (returns `None`).
pub fn vec3_from_json(value: &Value) -> Option<Vec3> {
    let arr = value.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    let x = coerce_f64(&arr[0])?;
    let y = coerce_f64(&arr[1])?;
    let z = coerce_f64(&arr[2])?;
    Some(Vec3::new(x, y, z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_calibration_is_identity() {
        let cal = Calibration::default();
        let raw = ImuSample {
            accel: Vec3::new(1.0, 2.0, 9.81),
            gyro: Vec3::new(0.1, -0.2, 0.3),
            magnetometer: Some(Vec3::new(10.0, 20.0, 30.0)),
        };
        let out = cal.apply(raw);
        assert_eq!(out.accel, raw.accel);
        assert_eq!(out.gyro, raw.gyro);
        assert_eq!(out.magnetometer, raw.magnetometer);
    }

    #[test]
    fn calibration_round_trips_through_json() {
        let cal = Calibration {
            gyro_bias: Vec3::new(0.1, -0.05, 0.02),
            accel_offset: Vec3::new(0.01, 0.0, -0.3),
            magnetometer_bias: Vec3::new(1.0, 2.0, 3.0),
        };
        let value = cal.to_value();
        let round_tripped = Calibration::from_value(&value);
        assert_eq!(cal, round_tripped);
    }

    #[test]
    fn missing_magnetometer_stays_absent_after_calibration() {
        let cal = Calibration {
            magnetometer_bias: Vec3::new(5.0, 5.0, 5.0),
            ..Default::default()
        };
        let raw = ImuSample {
            accel: Vec3::zeros(),
            gyro: Vec3::zeros(),
            magnetometer: None,
        };
        assert!(cal.apply(raw).magnetometer.is_none());
    }

    #[test]
    fn track_wraparound() {
        assert_eq!(normalize_degrees(-10.0), 350.0);
        assert_eq!(normalize_degrees(370.0), 10.0);
        assert_eq!(normalize_degrees(360.0), 0.0);
    }

    #[test]
    fn vec3_from_json_rejects_bad_element() {
        let v: Value = serde_json::json!([1, 2, "x"]);
        assert!(vec3_from_json(&v).is_none());
    }

    #[test]
    fn coerce_f64_accepts_numeric_strings() {
        assert_eq!(coerce_f64(&serde_json::json!("3.5")), Some(3.5));
        assert_eq!(coerce_f64(&serde_json::json!(3.5)), Some(3.5));
        assert_eq!(coerce_f64(&serde_json::json!("not a number")), None);
    }
}
