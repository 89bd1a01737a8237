//! Command-line configuration
//!
//! Out of scope for the core fusion pipeline per the specification, but the
//! pipeline still consumes the values this layer produces, so it is wired
//! the way the teacher crate wires its own `Config`: a plain struct built
//! once at startup and cloned into whichever task needs it.

use clap::{Parser, ValueEnum};

/// Which family of adapters to construct for IMU/GPS acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum Source {
    /// Read the local IIO sysfs tree and connect to a local gpsd.
    Linux,
    /// Accept IMU+GPS updates over the remote ingest TCP protocol only.
    Remote,
    /// Prefer `linux`, fall back to `remote` adapters that are still wired
    /// up to listen in case the local hardware never produces data.
    Auto,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "navit-daemon")]
#[command(about = "Fuses IMU + GPS into a gpsd-compatible NMEA heading feed", long_about = None)]
pub struct Config {
    /// Source adapter family.
    #[arg(long, value_enum, default_value_t = Source::Auto)]
    pub source: Source,

    /// gpsd host to connect to for the local GPS reader.
    #[arg(long, default_value = "127.0.0.1")]
    pub gpsd_host: String,

    /// gpsd port.
    #[arg(long, default_value_t = 2947)]
    pub gpsd_port: u16,

    /// Bind address for the remote IMU+GPS ingest server.
    #[arg(long, default_value = "0.0.0.0")]
    pub remote_bind: String,

    /// Port for the remote IMU+GPS ingest server.
    #[arg(long, default_value_t = 2949)]
    pub remote_port: u16,

    /// Bind address for the NMEA broadcast server.
    #[arg(long, default_value = "127.0.0.1")]
    pub nmea_bind: String,

    /// Port for the NMEA broadcast server.
    #[arg(long, default_value_t = 2948)]
    pub nmea_port: u16,

    /// IMU sample rate in Hz.
    #[arg(long, default_value_t = 100)]
    pub imu_rate_hz: u32,

    /// NMEA emission rate in Hz.
    #[arg(long, default_value_t = 5)]
    pub output_rate_hz: u32,

    /// Madgwick filter gain (beta).
    #[arg(long, default_value_t = 0.5)]
    pub fusion_gain: f64,

    /// Optional sysfs path override for the accelerometer device.
    #[arg(long)]
    pub accel_path: Option<String>,

    /// Optional sysfs path override for the gyroscope device.
    #[arg(long)]
    pub gyro_path: Option<String>,

    /// Optional sysfs path override for the magnetometer device.
    #[arg(long)]
    pub magnetometer_path: Option<String>,

    /// Path to the calibration persistence file.
    #[arg(long)]
    pub calibration_file: Option<String>,

    /// Port for the calibration control server. `0` disables it.
    #[arg(long, default_value_t = 0)]
    pub calibration_port: u16,

    /// Bind address for the calibration control server (loopback only by
    /// convention, but the CLI does not enforce that).
    #[arg(long, default_value = "127.0.0.1")]
    pub calibration_bind: String,
}
