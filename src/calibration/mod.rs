//! Calibration state, online gyro-bias collection and atomic persistence.
//!
//! The manager is the single owner of `Calibration` and the current
//! `CalibrationRun`; everything else (the calibrated-source wrapper, the
//! control server) only ever sees it through [`CalibrationManager`]'s
//! locked API, so "API write takes effect on the next IMU read" falls out
//! of there being no other copy of the state to go stale.

pub mod server;
pub mod source;

pub use source::CalibratedSource;

use crate::types::{Calibration, CalibrationRun, CalibrationStatus, Vec3};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const MIN_CALIBRATION_SECONDS: f64 = 0.5;
const MAX_CALIBRATION_SECONDS: f64 = 60.0;

/// Errors the control server surfaces as an `{"error": "..."}` response line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("unknown calibration field \"{0}\"")]
    UnknownField(String),
    #[error("{0} must be a length-3 numeric array")]
    InvalidField(String),
}

struct Inner {
    calibration: Calibration,
    run: CalibrationRun,
}

/// A length-3 numeric override for one calibration field, as accepted by
/// `set_calibration` — `None` leaves that field untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct CalibrationPatch {
    pub gyro_bias: Option<Vec3>,
    pub accel_offset: Option<Vec3>,
    pub magnetometer_bias: Option<Vec3>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSnapshot {
    pub calibration: Calibration,
    pub run: CalibrationRun,
}

#[derive(Clone)]
pub struct CalibrationManager {
    inner: Arc<Mutex<Inner>>,
    persist_path: Option<PathBuf>,
    imu_rate_hz: u32,
}

impl CalibrationManager {
    /// Loads any existing calibration file (falling back to zero
    /// calibration on any error, per the format's tolerant-load contract)
    /// and starts with an idle run.
    pub fn new(persist_path: Option<PathBuf>, imu_rate_hz: u32) -> Self {
        let calibration = persist_path
            .as_deref()
            .map(Calibration::load_from_file)
            .unwrap_or_default();
        Self {
            inner: Arc::new(Mutex::new(Inner { calibration, run: CalibrationRun::default() })),
            persist_path,
            imu_rate_hz,
        }
    }

    pub fn get(&self) -> CalibrationSnapshot {
        let guard = self.inner.lock();
        CalibrationSnapshot { calibration: guard.calibration, run: guard.run }
    }

    /// Current calibration only, for the hot path (calibrated-source
    /// wrapper) that doesn't need the run status.
    pub fn current_calibration(&self) -> Calibration {
        self.inner.lock().calibration
    }

    /// Replaces only the fields present in `patch`; persists afterward if
    /// a save path is configured. Never partially applies — the lock is
    /// held for the whole mutate-then-maybe-persist sequence.
    pub fn set(&self, patch: CalibrationPatch) {
        let mut guard = self.inner.lock();
        if let Some(v) = patch.gyro_bias {
            guard.calibration.gyro_bias = v;
        }
        if let Some(v) = patch.accel_offset {
            guard.calibration.accel_offset = v;
        }
        if let Some(v) = patch.magnetometer_bias {
            guard.calibration.magnetometer_bias = v;
        }
        self.persist(&guard.calibration);
    }

    /// Starts (or restarts) an online gyro-bias collection run.
    /// `seconds` is clamped into `[0.5, 60]`; `samples_needed` derives
    /// from the configured IMU rate.
    pub fn start_gyro_run(&self, seconds: f64) -> u32 {
        let seconds = if seconds.is_finite() {
            seconds.clamp(MIN_CALIBRATION_SECONDS, MAX_CALIBRATION_SECONDS)
        } else {
            MIN_CALIBRATION_SECONDS
        };
        let samples_needed = if self.imu_rate_hz == 0 {
            1
        } else {
            ((seconds * self.imu_rate_hz as f64).round() as u32).max(1)
        };

        let mut guard = self.inner.lock();
        guard.run = CalibrationRun {
            status: CalibrationStatus::Collecting,
            samples_collected: 0,
            samples_needed,
            accumulator: Vec3::zeros(),
        };
        samples_needed
    }

    /// Feeds one raw gyro reading into the active run, if any. Completes
    /// the run (averaging into `gyro_bias`, persisting, going idle) once
    /// enough samples have accumulated.
    pub fn add_gyro_sample(&self, raw_gyro: Vec3) {
        let mut guard = self.inner.lock();
        if guard.run.status != CalibrationStatus::Collecting {
            return;
        }
        guard.run.accumulator += raw_gyro;
        guard.run.samples_collected += 1;

        if guard.run.samples_collected >= guard.run.samples_needed {
            guard.calibration.gyro_bias =
                guard.run.accumulator / guard.run.samples_collected as f64;
            guard.run.status = CalibrationStatus::Idle;
            self.persist(&guard.calibration);
        }
    }

    /// Abandons any in-progress run without touching `calibration` — used
    /// on shutdown so a half-collected run never silently biases the
    /// next startup.
    pub fn abandon_run(&self) {
        let mut guard = self.inner.lock();
        guard.run = CalibrationRun::default();
    }

    fn persist(&self, calibration: &Calibration) {
        let Some(path) = &self.persist_path else { return };
        let value = calibration.to_value();
        let contents = match serde_json::to_string_pretty(&value) {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize calibration for persistence");
                return;
            }
        };
        if let Err(err) = write_atomic(path, &contents) {
            tracing::warn!(%err, path = %path.display(), "failed to persist calibration");
        }
    }
}

/// Write-to-temp-then-rename so a crash or concurrent read never observes
/// a partially written calibration file.
fn write_atomic(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}
