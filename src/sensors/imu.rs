//! Local IIO sysfs IMU reader
//!
//! Reads raw channel values out of the kernel's Industrial I/O sysfs tree
//! (`/sys/bus/iio/devices/iio:deviceN/`) the way any of the usual Linux IMU
//! parts (MPU6050/9250, LSM6DSx, BNO055, ICM20948, ADXL345) expose them:
//! one `in_<kind>_<axis>_raw` file per axis, a shared or per-axis scale, and
//! an optional per-axis offset.

use crate::sensors::ImuSource;
use crate::types::{ImuSample, Vec3};
use std::path::{Path, PathBuf};

const IIO_BASE: &str = "/sys/bus/iio/devices";

const KNOWN_DEVICE_NAMES: &[&str] =
    &["mpu6050", "mpu9250", "lsm6ds", "bno055", "icm20948", "adxl345"];

/// Reads accelerometer, gyroscope and (optionally) magnetometer channels
/// from the IIO tree on every poll. Each channel may live on its own
/// device, or all three may share one device (as with the BNO055).
pub struct LocalImuReader {
    accel_dir: Option<PathBuf>,
    gyro_dir: Option<PathBuf>,
    mag_dir: Option<PathBuf>,
}

impl LocalImuReader {
    /// `accel_path`/`gyro_path`/`magnetometer_path` override autodiscovery
    /// when present; otherwise the IIO tree under `base` is scanned for a
    /// device exposing the relevant channel kind.
    pub fn new(
        base: &Path,
        accel_path: Option<PathBuf>,
        gyro_path: Option<PathBuf>,
        magnetometer_path: Option<PathBuf>,
    ) -> Self {
        Self {
            accel_dir: accel_path.or_else(|| discover_device_for_kind(base, "accel")),
            gyro_dir: gyro_path.or_else(|| discover_device_for_kind(base, "anglvel")),
            mag_dir: magnetometer_path.or_else(|| discover_device_for_kind(base, "magn")),
        }
    }

    /// Construct straight from CLI overrides, scanning the default IIO
    /// root for anything left unset.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            Path::new(IIO_BASE),
            config.accel_path.as_ref().map(PathBuf::from),
            config.gyro_path.as_ref().map(PathBuf::from),
            config.magnetometer_path.as_ref().map(PathBuf::from),
        )
    }
}

impl ImuSource for LocalImuReader {
    fn read_imu(&mut self) -> Option<ImuSample> {
        let accel_dir = self.accel_dir.as_ref()?;
        let gyro_dir = self.gyro_dir.as_ref()?;

        let accel = read_vector(accel_dir, "accel")?.0;
        let (gyro_raw, gyro_scale) = read_vector(gyro_dir, "anglvel")?;
        // Heuristic from the field: a tiny scale means the driver reports
        // rad/s, so convert to the deg/s the rest of the pipeline expects.
        let gyro = if gyro_scale.abs() < 0.01 {
            gyro_raw.map(|v| v.to_degrees())
        } else {
            gyro_raw
        };

        let magnetometer = self
            .mag_dir
            .as_ref()
            .and_then(|dir| read_vector(dir, "magn"))
            .map(|(v, _)| v);

        Some(ImuSample { accel, gyro, magnetometer })
    }
}

fn discover_device_for_kind(base: &Path, kind: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(base).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && has_channel(path, kind))
        .collect();
    candidates.sort();

    candidates
        .iter()
        .find(|path| device_name_matches_known(path))
        .or_else(|| candidates.first())
        .cloned()
}

fn device_name_matches_known(dir: &Path) -> bool {
    let Ok(name) = std::fs::read_to_string(dir.join("name")) else {
        return false;
    };
    let name = name.trim().to_lowercase();
    KNOWN_DEVICE_NAMES.iter().any(|known| name.contains(known))
}

fn has_channel(dir: &Path, kind: &str) -> bool {
    dir.join(format!("in_{kind}_x_raw")).is_file()
}

fn read_num<T: std::str::FromStr>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path).ok()?.trim().parse::<T>().ok()
}

/// Read one axis: `raw * scale - offset`, where `scale` falls back from a
/// per-axis file to a device-wide shared one, and `offset` defaults to 0
/// when the file is absent.
fn read_axis(dir: &Path, kind: &str, axis: char) -> Option<(f64, f64)> {
    let raw: i64 = read_num(&dir.join(format!("in_{kind}_{axis}_raw")))?;
    let scale: f64 = read_num(&dir.join(format!("in_{kind}_{axis}_scale")))
        .or_else(|| read_num(&dir.join(format!("in_{kind}_scale"))))
        .unwrap_or(1.0);
    let offset: f64 = read_num(&dir.join(format!("in_{kind}_{axis}_offset"))).unwrap_or(0.0);
    Some((raw as f64 * scale - offset, scale))
}

/// Returns the assembled vector plus the scale used for the `x` axis (the
/// only one the rad/s-vs-deg/s heuristic needs).
fn read_vector(dir: &Path, kind: &str) -> Option<(Vec3, f64)> {
    let (x, scale) = read_axis(dir, kind, 'x')?;
    let (y, _) = read_axis(dir, kind, 'y')?;
    let (z, _) = read_axis(dir, kind, 'z')?;
    Some((Vec3::new(x, y, z), scale))
}
