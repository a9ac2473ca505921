use crate::error::{Result, VoxelError};
use crate::model::CombineMode;
use crate::volume::{SampleRegion, VoxelGrid, MAX_AXIS_EXTENT};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest number of voxels a single display volume may have.
pub const MAX_DISPLAY_VOXELS: usize = 1 << 30;

/// A value per named axis, so configuration files never depend on an axis order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisTriple {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}
impl AxisTriple {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
    pub fn zyx(&self) -> [f64; 3] {
        [self.z, self.y, self.x]
    }
    fn is_finite(&self) -> bool {
        self.zyx().iter().all(|v| v.is_finite())
    }
}

/// Geometry and behaviour of a [`crate::VoxelStorage`]. Lengths are micrometres.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Lower corner of the addressable chamber.
    pub chamber_origin_um: AxisTriple,
    pub chamber_dimensions_um: AxisTriple,
    pub region_center_um: AxisTriple,
    pub region_half_widths_um: AxisTriple,
    pub storage_voxel_size_um: f64,
    pub display_voxel_size_um: f64,
    pub num_channels: usize,
    /// Additive accumulation saturates at `2^bit_depth - 1`.
    pub bit_depth: u8,
    /// How storage voxels falling into the same display voxel are combined.
    pub display_mode: CombineMode,
    /// Updates rejecting a larger share of their samples are logged as a warning.
    pub rejection_warn_fraction: f64,
    pub max_cached_transforms: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chamber_origin_um: AxisTriple::new(0.0, -5000.0, 12000.0),
            chamber_dimensions_um: AxisTriple::new(13500.0, 24500.0, 14500.0),
            region_center_um: AxisTriple::new(6655.0, 7000.0, 19250.0),
            region_half_widths_um: AxisTriple::new(6000.0, 12000.0, 7000.0),
            storage_voxel_size_um: 5.0,
            display_voxel_size_um: 100.0,
            num_channels: 4,
            bit_depth: 16,
            display_mode: CombineMode::Maximum,
            rejection_warn_fraction: 0.5,
            max_cached_transforms: 16,
        }
    }
}

impl StorageConfig {
    /// Parses and validates a JSON configuration. Missing fields take their default.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: StorageConfig = serde_json::from_str(json).context("Failed to parse storage config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(VoxelError::InvalidConfig(msg));

        for (name, size) in [
            ("storage", self.storage_voxel_size_um),
            ("display", self.display_voxel_size_um),
        ] {
            if !(size.is_finite() && size > 0.0) {
                return invalid(format!("{} voxel size must be positive, got {}", name, size));
            }
        }
        if self.display_voxel_size_um < self.storage_voxel_size_um {
            return invalid(format!(
                "display voxel size {} is smaller than storage voxel size {}",
                self.display_voxel_size_um, self.storage_voxel_size_um
            ));
        }
        if !(self.chamber_origin_um.is_finite() && self.region_center_um.is_finite()) {
            return invalid("chamber origin and region center must be finite".to_string());
        }
        if self.chamber_dimensions_um.zyx().iter().any(|d| !(d.is_finite() && *d > 0.0)) {
            return invalid(format!(
                "chamber dimensions must be positive, got {:?}",
                self.chamber_dimensions_um
            ));
        }
        if self.region_half_widths_um.zyx().iter().any(|h| !(h.is_finite() && *h >= 0.0)) {
            return invalid(format!(
                "region half widths must be non-negative, got {:?}",
                self.region_half_widths_um
            ));
        }
        if self.num_channels == 0 {
            return invalid("at least one channel is required".to_string());
        }
        if !(1..=24).contains(&self.bit_depth) {
            return invalid(format!("bit depth must be 1..=24, got {}", self.bit_depth));
        }
        if !(0.0..=1.0).contains(&self.rejection_warn_fraction) {
            return invalid(format!(
                "rejection warn fraction must be within 0..=1, got {}",
                self.rejection_warn_fraction
            ));
        }
        let extent = self.storage_grid().extent;
        if extent.iter().any(|&e| e >= MAX_AXIS_EXTENT) {
            return invalid(format!(
                "storage grid {:?} exceeds {} voxels per axis",
                extent, MAX_AXIS_EXTENT
            ));
        }
        let shape = self.display_shape();
        let voxels = shape.iter().try_fold(1usize, |acc, &n| acc.checked_mul(n));
        if !voxels.is_some_and(|n| n <= MAX_DISPLAY_VOXELS) {
            return invalid(format!(
                "display volume {:?} exceeds {} voxels",
                shape, MAX_DISPLAY_VOXELS
            ));
        }
        Ok(())
    }

    pub fn sample_region(&self) -> SampleRegion {
        SampleRegion {
            center_um: self.region_center_um.zyx(),
            half_widths_um: self.region_half_widths_um.zyx(),
        }
    }

    pub fn storage_grid(&self) -> VoxelGrid {
        self.sample_region().lattice(self.storage_voxel_size_um)
    }

    /// `[z, y, x]` voxel count of each display volume, covering the whole chamber.
    pub fn display_shape(&self) -> [usize; 3] {
        self.chamber_dimensions_um
            .zyx()
            .map(|d| (d / self.display_voxel_size_um).ceil() as usize)
    }

    pub fn display_grid(&self) -> VoxelGrid {
        VoxelGrid::new(
            self.chamber_origin_um.zyx(),
            self.display_voxel_size_um,
            self.display_shape(),
        )
    }

    pub fn max_value(&self) -> f32 {
        ((1u32 << self.bit_depth) - 1) as f32
    }
}
