//! Calibrated-source wrapper
//!
//! Sits between any raw [`ImuSource`] and the fusion engine. Every read
//! snapshots the live `Calibration` (never a cached copy, so control-plane
//! writes take effect on the very next sample) and, when a gyro-bias run
//! is active, feeds the *raw* gyro into it before returning the corrected
//! sample.

use crate::calibration::CalibrationManager;
use crate::sensors::ImuSource;
use crate::types::ImuSample;

pub struct CalibratedSource {
    inner: Box<dyn ImuSource>,
    manager: CalibrationManager,
}

impl CalibratedSource {
    pub fn new(inner: Box<dyn ImuSource>, manager: CalibrationManager) -> Self {
        Self { inner, manager }
    }
}

impl ImuSource for CalibratedSource {
    fn read_imu(&mut self) -> Option<ImuSample> {
        let raw = self.inner.read_imu()?;
        self.manager.add_gyro_sample(raw.gyro);
        let calibration = self.manager.current_calibration();
        Some(calibration.apply(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPatch;
    use crate::types::Vec3;

    struct FixedSource(Option<ImuSample>);

    impl ImuSource for FixedSource {
        fn read_imu(&mut self) -> Option<ImuSample> {
            self.0
        }
    }

    fn sample(gyro: Vec3) -> ImuSample {
        ImuSample { accel: Vec3::new(0.0, 0.0, 9.81), gyro, magnetometer: None }
    }

    #[test]
    fn none_from_inner_propagates_without_touching_calibration_run() {
        let manager = CalibrationManager::new(None, 100);
        manager.start_gyro_run(1.0);
        let mut source = CalibratedSource::new(Box::new(FixedSource(None)), manager.clone());
        assert!(source.read_imu().is_none());
        assert_eq!(manager.get().run.samples_collected, 0);
    }

    #[test]
    fn bias_is_applied_and_reflects_live_api_writes() {
        let manager = CalibrationManager::new(None, 100);
        let mut source =
            CalibratedSource::new(Box::new(FixedSource(Some(sample(Vec3::new(1.0, 1.0, 1.0))))), manager.clone());

        let first = source.read_imu().unwrap();
        assert_eq!(first.gyro, Vec3::new(1.0, 1.0, 1.0));

        manager.set(CalibrationPatch { gyro_bias: Some(Vec3::new(0.5, 0.0, 0.0)), ..Default::default() });
        let second = source.read_imu().unwrap();
        assert_eq!(second.gyro, Vec3::new(0.5, 1.0, 1.0));
    }

    #[test]
    fn active_run_accumulates_raw_not_calibrated_gyro() {
        let manager = CalibrationManager::new(None, 100);
        manager.set(CalibrationPatch { gyro_bias: Some(Vec3::new(1.0, 0.0, 0.0)), ..Default::default() });
        let needed = manager.start_gyro_run(1.0);

        let raw = Vec3::new(1.0, 0.0, 0.0);
        let mut source = CalibratedSource::new(Box::new(FixedSource(Some(sample(raw)))), manager.clone());
        for _ in 0..needed {
            source.read_imu();
        }
        // Raw gyro (1,0,0) fed into the run, not the calibrated (0,0,0).
        assert_eq!(manager.get().calibration.gyro_bias, raw);
    }
}
