//! YAML settings for a mapper session.
//!
//! ```yaml
//! max_trackers: 2
//! orb:
//!   scale_factor: 1.2
//!   levels: 8
//! trackers:
//!   - name: front
//!     pivot:
//!       data: [1.0, 0.0, 0.0, 0.0,
//!              0.0, 1.0, 0.0, 0.0,
//!              0.0, 0.0, 1.0, 0.0,
//!              0.0, 0.0, 0.0, 1.0]
//! ```

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nalgebra::{Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion};
use serde::Deserialize;

use crate::map::{Pose, ScalePyramid};
use crate::mapper::MapperConfig;

/// Row-major 4x4 transform, as in calibration files.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformYaml {
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrbSettings {
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_levels")]
    pub levels: u32,
}

impl Default for OrbSettings {
    fn default() -> Self {
        Self {
            scale_factor: default_scale_factor(),
            levels: default_levels(),
        }
    }
}

fn default_scale_factor() -> f64 {
    1.2
}

fn default_levels() -> u32 {
    8
}

fn default_max_trackers() -> u32 {
    2
}

/// One tracker rig.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSettings {
    pub name: String,
    /// Pivot calibration, identity when absent.
    pub pivot: Option<TransformYaml>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_trackers")]
    pub max_trackers: u32,
    #[serde(default)]
    pub orb: OrbSettings,
    #[serde(default)]
    pub trackers: Vec<TrackerSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_trackers: default_max_trackers(),
            orb: OrbSettings::default(),
            trackers: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse and validate settings from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_trackers == 0 {
            bail!("max_trackers must be at least 1");
        }
        if self.trackers.len() > self.max_trackers as usize {
            bail!(
                "{} trackers configured but max_trackers is {}",
                self.trackers.len(),
                self.max_trackers
            );
        }
        if self.orb.scale_factor <= 1.0 || self.orb.levels == 0 {
            bail!(
                "Invalid ORB pyramid: scale factor {}, {} levels",
                self.orb.scale_factor,
                self.orb.levels
            );
        }
        for tracker in &self.trackers {
            if let Some(pivot) = &tracker.pivot {
                transform_from(&pivot.data)
                    .with_context(|| format!("Invalid pivot for tracker {}", tracker.name))?;
            }
        }
        Ok(())
    }

    pub fn mapper_config(&self) -> MapperConfig {
        MapperConfig {
            max_trackers: self.max_trackers,
            pyramid: ScalePyramid::new(self.orb.scale_factor, self.orb.levels),
        }
    }

    /// Pivot of every configured tracker, in order.
    pub fn pivots(&self) -> Result<Vec<Pose>> {
        self.trackers
            .iter()
            .map(|t| match &t.pivot {
                Some(pivot) => transform_from(&pivot.data),
                None => Ok(Pose::identity()),
            })
            .collect()
    }
}

/// Load settings from a YAML file.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let settings: Settings = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )
    .with_context(|| format!("Failed to parse {:?}", path))?;
    settings.validate()?;
    Ok(settings)
}

fn transform_from(data: &[f64]) -> Result<Pose> {
    if data.len() != 16 {
        bail!("Expected 16 elements for transform, got {}", data.len());
    }
    let mat = Matrix4::from_row_slice(data);
    if (mat[(3, 0)], mat[(3, 1)], mat[(3, 2)], mat[(3, 3)]) != (0.0, 0.0, 0.0, 1.0) {
        bail!("Transform bottom row must be [0, 0, 0, 1]");
    }

    let r: Matrix3<f64> = mat.fixed_view::<3, 3>(0, 0).into_owned();
    if (r.transpose() * r - Matrix3::identity()).norm() > 1e-6 {
        bail!("Transform rotation is not orthonormal");
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = Translation3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
    Ok(Isometry3::from_parts(translation, rotation))
}
