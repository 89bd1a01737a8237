//! Source adapters
//!
//! Every acquisition backend — local sysfs/gpsd reader or remote JSON
//! listener — is polymorphic over these two non-blocking capabilities. The
//! fusion engine never depends on a concrete adapter type, only on these
//! traits, so `--source linux|remote|auto` is a matter of which structs get
//! boxed up at startup.

pub mod gps;
pub mod imu;
pub mod remote;

pub use gps::LocalGpsReader;
pub use imu::LocalImuReader;
pub use remote::{RemoteGpsSource, RemoteImuSource, RemoteIngestServer};

use crate::types::{GpsFix, ImuSample};

/// Produces IMU samples. Returns `None` when no fresh sample is available;
/// must never block the caller for long enough to stall the IMU loop.
pub trait ImuSource: Send {
    fn read_imu(&mut self) -> Option<ImuSample>;
}

/// Produces GPS fixes. Returns `None` when no fresher fix has arrived since
/// the last call.
pub trait GpsSource: Send {
    fn read_fix(&mut self) -> Option<GpsFix>;
}

/// `auto` mode: prefer a primary source on every poll, falling back to a
/// secondary one (typically the remote listener) when the primary has
/// nothing fresh. Both sources stay wired up regardless of which one is
/// currently answering.
pub struct FallbackImuSource {
    primary: Box<dyn ImuSource>,
    secondary: Box<dyn ImuSource>,
}

impl FallbackImuSource {
    pub fn new(primary: Box<dyn ImuSource>, secondary: Box<dyn ImuSource>) -> Self {
        Self { primary, secondary }
    }
}

impl ImuSource for FallbackImuSource {
    fn read_imu(&mut self) -> Option<ImuSample> {
        self.primary.read_imu().or_else(|| self.secondary.read_imu())
    }
}

pub struct FallbackGpsSource {
    primary: Box<dyn GpsSource>,
    secondary: Box<dyn GpsSource>,
}

impl FallbackGpsSource {
    pub fn new(primary: Box<dyn GpsSource>, secondary: Box<dyn GpsSource>) -> Self {
        Self { primary, secondary }
    }
}

impl GpsSource for FallbackGpsSource {
    fn read_fix(&mut self) -> Option<GpsFix> {
        self.primary.read_fix().or_else(|| self.secondary.read_fix())
    }
}
