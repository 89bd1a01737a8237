//! Attitude and Heading Reference System (AHRS) wrapper
//!
//! A thin facade over a concrete quaternion integrator, matching the
//! pattern the `ahrs-rs`-based example in the corpus uses (`Madgwick::new`
//! + `.update(&gyro, &accel, &mag)`): the fusion engine only ever sees
//! `AhrsState`, never the backing crate's types, so swapping Madgwick for
//! Mahony (or any other backend) later is a one-file change.

use crate::types::Vec3;
use ahrs::{Ahrs as AhrsAlgorithm, Madgwick};
use anyhow::{bail, Result};
use nalgebra::UnitQuaternion;

/// Backend-agnostic integrator contract. `update` takes gyro in rad/s
/// (already converted from the deg/s the rest of the crate uses) because
/// that is what every published AHRS crate expects.
trait AhrsBackend: Send {
    fn update(
        &mut self,
        gyro_rad: Vec3,
        accel: Vec3,
        mag: Option<Vec3>,
    ) -> std::result::Result<UnitQuaternion<f64>, &'static str>;
}

impl AhrsBackend for Madgwick<f64> {
    fn update(
        &mut self,
        gyro_rad: Vec3,
        accel: Vec3,
        mag: Option<Vec3>,
    ) -> std::result::Result<UnitQuaternion<f64>, &'static str> {
        let result = match mag {
            Some(m) => AhrsAlgorithm::update(self, &gyro_rad, &accel, &m),
            None => AhrsAlgorithm::update_imu(self, &gyro_rad, &accel),
        };
        // The borrowed `&str` error ties to `&mut self`, not `'static`; drop
        // it rather than let it escape through the trait's return type.
        result.map(|q| *q).map_err(|_| "AHRS update rejected sample")
    }
}

/// Orientation estimate, updated once per IMU sample.
///
/// `yaw_deg` is only meaningful once `initialized` is true (i.e. after the
/// first successful `update`); before that it holds whatever default the
/// backend started at.
pub struct AhrsState {
    backend: Box<dyn AhrsBackend>,
    initialized: bool,
    yaw_deg: f64,
}

impl AhrsState {
    /// Construct the wrapper around a Madgwick filter with the given
    /// sample period (seconds) and gain (beta, typically in `[0, 1]`
    /// though values outside that range are tolerated by the backend).
    ///
    /// A non-positive sample period can never integrate anything useful,
    /// so we treat it as a fatal, actionable startup error rather than
    /// silently producing a filter nobody can trust — per the contract
    /// that a missing/unusable backend must surface at construction.
    pub fn new(sample_period_s: f64, gain: f64) -> Result<Self> {
        if !sample_period_s.is_finite() || sample_period_s <= 0.0 {
            bail!(
                "AHRS backend unavailable: invalid sample period {sample_period_s}s (must be > 0)"
            );
        }
        Ok(Self {
            backend: Box::new(Madgwick::new(sample_period_s, gain)),
            initialized: false,
            yaw_deg: 0.0,
        })
    }

    /// Advance the filter with a new IMU reading. `dt_s` is accepted for
    /// interface symmetry with the spec but the Madgwick integrator bakes
    /// its sample period in at construction; the fusion engine always
    /// calls this at that fixed period (`1 / imu_rate_hz`), so the two
    /// never diverge in practice.
    pub fn update(&mut self, gyro_degps: Vec3, accel_mps2: Vec3, magnetometer_ut: Option<Vec3>, dt_s: f64) {
        let _ = dt_s;
        let gyro_rad = gyro_degps.map(|v| v.to_radians());
        match self.backend.update(gyro_rad, accel_mps2, magnetometer_ut) {
            Ok(q) => {
                let (_roll, _pitch, yaw) = q.euler_angles();
                self.yaw_deg = crate::types::normalize_degrees(yaw.to_degrees());
                self.initialized = true;
            }
            Err(reason) => {
                tracing::debug!(%reason, "AHRS update rejected sample");
            }
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Current yaw in `[0, 360)`. Undefined (holds the last-computed or
    /// default value) before `initialized()` is true.
    pub fn yaw_deg(&self) -> f64 {
        self.yaw_deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_sample_period() {
        assert!(AhrsState::new(0.0, 0.5).is_err());
        assert!(AhrsState::new(-0.01, 0.5).is_err());
    }

    #[test]
    fn stays_uninitialized_until_first_update() {
        let state = AhrsState::new(0.01, 0.5).unwrap();
        assert!(!state.initialized());
    }

    #[test]
    fn yaw_in_range_after_update_with_zero_inputs() {
        let mut state = AhrsState::new(0.01, 0.5).unwrap();
        state.update(Vec3::zeros(), Vec3::new(0.0, 0.0, 9.81), None, 0.01);
        assert!(state.initialized());
        assert!(state.yaw_deg() >= 0.0 && state.yaw_deg() < 360.0);
    }

    #[test]
    fn tolerates_large_dt_and_zero_accel() {
        let mut state = AhrsState::new(0.01, 0.5).unwrap();
        state.update(Vec3::zeros(), Vec3::zeros(), None, 1.0);
        assert!(state.yaw_deg() >= 0.0 && state.yaw_deg() < 360.0);
    }

    #[test]
    fn accepts_magnetometer_reading() {
        let mut state = AhrsState::new(0.01, 0.5).unwrap();
        state.update(
            Vec3::new(1.0, 0.5, -0.2),
            Vec3::new(0.0, 0.0, 9.81),
            Some(Vec3::new(20.0, 0.0, 40.0)),
            0.01,
        );
        assert!(state.initialized());
    }
}
