use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::types::AccelSample;

/// Per-session calibration snapshot.
///
/// Produced by an external calibration flow, validated here, and read-only
/// for as long as a session applies it. Orientation-dependent X/Y swap runs
/// before the offsets are subtracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    pub accel_offset_x: f64,
    pub accel_offset_y: f64,
    pub accel_offset_z: f64,
    pub gyro_offset_x: f64,
    pub gyro_offset_y: f64,
    pub gyro_offset_z: f64,
    /// Exchange X and Y before correction (device mounted sideways)
    pub axis_swap_xy: bool,
    /// Magnitude threshold for bump detection, m/s^2
    pub bump_threshold: f64,
    /// Residual Z-axis gyro drift rate measured by the calibration flow.
    /// Carried for downstream analysis; not applied per sample.
    pub gyro_z_drift: f64,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            accel_offset_x: 0.0,
            accel_offset_y: 0.0,
            accel_offset_z: 0.0,
            gyro_offset_x: 0.0,
            gyro_offset_y: 0.0,
            gyro_offset_z: 0.0,
            axis_swap_xy: false,
            bump_threshold: 15.0,
            gyro_z_drift: 0.0,
        }
    }
}

impl CalibrationParameters {
    /// Build from a loosely-typed JSON map, rejecting malformed input.
    ///
    /// Every numeric field must be present and finite; `axis_swap_xy` must be
    /// a boolean. Missing or mistyped fields are an error, never a silent
    /// default.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            PipelineError::InvalidCalibration("calibration payload is not an object".to_string())
        })?;

        let number = |key: &str| -> Result<f64> {
            let v = map
                .get(key)
                .ok_or_else(|| {
                    PipelineError::InvalidCalibration(format!("missing field `{key}`"))
                })?
                .as_f64()
                .ok_or_else(|| {
                    PipelineError::InvalidCalibration(format!("field `{key}` is not a number"))
                })?;
            if !v.is_finite() {
                return Err(PipelineError::InvalidCalibration(format!(
                    "field `{key}` is not finite"
                )));
            }
            Ok(v)
        };

        let axis_swap_xy = map
            .get("axis_swap_xy")
            .ok_or_else(|| {
                PipelineError::InvalidCalibration("missing field `axis_swap_xy`".to_string())
            })?
            .as_bool()
            .ok_or_else(|| {
                PipelineError::InvalidCalibration("field `axis_swap_xy` is not a boolean".to_string())
            })?;

        let params = Self {
            accel_offset_x: number("accel_offset_x")?,
            accel_offset_y: number("accel_offset_y")?,
            accel_offset_z: number("accel_offset_z")?,
            gyro_offset_x: number("gyro_offset_x")?,
            gyro_offset_y: number("gyro_offset_y")?,
            gyro_offset_z: number("gyro_offset_z")?,
            axis_swap_xy,
            bump_threshold: number("bump_threshold")?,
            gyro_z_drift: number("gyro_z_drift")?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.bump_threshold.is_finite() || self.bump_threshold <= 0.0 {
            return Err(PipelineError::InvalidCalibration(format!(
                "bump_threshold must be positive, got {}",
                self.bump_threshold
            )));
        }
        let offsets = [
            self.accel_offset_x,
            self.accel_offset_y,
            self.accel_offset_z,
            self.gyro_offset_x,
            self.gyro_offset_y,
            self.gyro_offset_z,
            self.gyro_z_drift,
        ];
        if offsets.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidCalibration(
                "offsets must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Axis swap + offset subtraction on a raw accelerometer reading.
    pub fn correct_accel(&self, sample: &AccelSample) -> Vector3<f64> {
        let (raw_x, raw_y) = if self.axis_swap_xy {
            (sample.y, sample.x)
        } else {
            (sample.x, sample.y)
        };
        Vector3::new(
            raw_x - self.accel_offset_x,
            raw_y - self.accel_offset_y,
            sample.z - self.accel_offset_z,
        )
    }

    /// Offset subtraction on the Z-axis gyro reading.
    pub fn correct_gyro_z(&self, gyro_z: f64) -> f64 {
        gyro_z - self.gyro_offset_z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "accel_offset_x": 0.1,
            "accel_offset_y": -0.2,
            "accel_offset_z": 0.5,
            "gyro_offset_x": 0.01,
            "gyro_offset_y": 0.02,
            "gyro_offset_z": 0.03,
            "axis_swap_xy": false,
            "bump_threshold": 12.0,
            "gyro_z_drift": 0.001,
        })
    }

    #[test]
    fn test_from_json_valid() {
        let params = CalibrationParameters::from_json(&payload()).unwrap();
        assert_eq!(params.bump_threshold, 12.0);
        assert!(!params.axis_swap_xy);
    }

    #[test]
    fn test_from_json_rejects_missing_field() {
        let mut value = payload();
        value.as_object_mut().unwrap().remove("gyro_offset_z");
        let err = CalibrationParameters::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("gyro_offset_z"));
    }

    #[test]
    fn test_from_json_rejects_mistyped_field() {
        let mut value = payload();
        value["bump_threshold"] = json!("high");
        assert!(CalibrationParameters::from_json(&value).is_err());
    }

    #[test]
    fn test_from_json_rejects_nonpositive_threshold() {
        let mut value = payload();
        value["bump_threshold"] = json!(0.0);
        assert!(CalibrationParameters::from_json(&value).is_err());
    }

    #[test]
    fn test_offset_subtraction_exact() {
        let params = CalibrationParameters {
            accel_offset_z: 0.5,
            gyro_offset_z: 0.03,
            ..Default::default()
        };
        let corrected = params.correct_accel(&AccelSample::new(0.0, 0.0, 9.81, 0));
        assert_eq!(corrected.z, 9.81 - 0.5);
        assert_eq!(params.correct_gyro_z(0.13), 0.13 - 0.03);
    }

    #[test]
    fn test_axis_swap_exchanges_x_and_y() {
        let params = CalibrationParameters {
            axis_swap_xy: true,
            ..Default::default()
        };
        let corrected = params.correct_accel(&AccelSample::new(1.0, 2.0, 3.0, 0));
        assert_eq!(corrected.x, 2.0);
        assert_eq!(corrected.y, 1.0);
        assert_eq!(corrected.z, 3.0);
    }

    #[test]
    fn test_magnitude_invariant_under_swap() {
        let swapped = CalibrationParameters {
            axis_swap_xy: true,
            ..Default::default()
        };
        let plain = CalibrationParameters::default();
        let sample = AccelSample::new(3.0, 4.0, 5.0, 0);
        assert_abs_diff_eq!(
            plain.correct_accel(&sample).norm(),
            swapped.correct_accel(&sample).norm(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(plain.correct_accel(&sample).norm(), 7.0711, epsilon = 1e-3);
    }
}
