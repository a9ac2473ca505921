use serde::Serialize;

/// Bounding box limiting where high-resolution samples are stored. All arrays are `[z, y, x]` µm.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct SampleRegion {
    pub center_um: [f64; 3],
    pub half_widths_um: [f64; 3],
}
impl SampleRegion {
    pub fn min_um(&self) -> [f64; 3] {
        [0usize, 1, 2].map(|i| self.center_um[i] - self.half_widths_um[i])
    }
    pub fn max_um(&self) -> [f64; 3] {
        [0usize, 1, 2].map(|i| self.center_um[i] + self.half_widths_um[i])
    }
    pub fn contains(&self, world: [f64; 3]) -> bool {
        let (min, max) = (self.min_um(), self.max_um());
        (0..3).all(|i| world[i] >= min[i] && world[i] <= max[i])
    }

    /// Storage lattice over the region: origin at the lower corner, both faces addressable.
    /// Extents too large for `usize` saturate and are left to the caller to reject.
    pub fn lattice(&self, voxel_size_um: f64) -> VoxelGrid {
        let extent = self
            .half_widths_um
            .map(|h| ((2.0 * h / voxel_size_um).round() as usize).saturating_add(1));
        VoxelGrid::new(self.min_um(), voxel_size_um, extent)
    }
}

/// Regular lattice of cubic voxels anchored at `origin_um`. All arrays are `[z, y, x]`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VoxelGrid {
    pub origin_um: [f64; 3],
    pub voxel_size_um: f64,
    pub extent: [usize; 3],
}
impl VoxelGrid {
    pub fn new(origin_um: [f64; 3], voxel_size_um: f64, extent: [usize; 3]) -> Self {
        Self {
            origin_um,
            voxel_size_um,
            extent,
        }
    }

    /// Fractional position of `world` in voxel units relative to the origin.
    pub fn to_voxel_units(&self, world: [f64; 3]) -> [f64; 3] {
        [0usize, 1, 2].map(|i| (world[i] - self.origin_um[i]) / self.voxel_size_um)
    }

    /// Nearest lattice point. `None` for non-finite input.
    pub fn index_round(&self, world: [f64; 3]) -> Option<[i64; 3]> {
        let v = self.to_voxel_units(world);
        v.iter().all(|c| c.is_finite()).then(|| v.map(|c| c.round() as i64))
    }

    /// Cell containing `world`, cell `i` spanning `[i, i + 1)` voxel units. `None` for non-finite input.
    pub fn index_floor(&self, world: [f64; 3]) -> Option<[i64; 3]> {
        let v = self.to_voxel_units(world);
        v.iter().all(|c| c.is_finite()).then(|| v.map(|c| c.floor() as i64))
    }

    /// World position of lattice point `index`.
    pub fn index_to_world(&self, index: [i64; 3]) -> [f64; 3] {
        [0usize, 1, 2].map(|i| index[i] as f64 * self.voxel_size_um + self.origin_um[i])
    }

    pub fn contains(&self, index: [i64; 3]) -> bool {
        (0..3).all(|i| index[i] >= 0 && (index[i] as usize) < self.extent[i])
    }

    pub fn voxel_count(&self) -> usize {
        self.extent.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_and_floor_differ_at_half_voxel() {
        let grid = VoxelGrid::new([0.0, 0.0, 0.0], 10.0, [10, 10, 10]);
        assert_eq!(grid.index_round([6.0, 14.0, 25.0]), Some([1, 1, 3]));
        assert_eq!(grid.index_floor([6.0, 14.0, 25.0]), Some([0, 1, 2]));
    }

    #[test]
    fn non_finite_is_rejected() {
        let grid = VoxelGrid::new([0.0, 0.0, 0.0], 10.0, [10, 10, 10]);
        assert_eq!(grid.index_round([f64::NAN, 0.0, 0.0]), None);
        assert_eq!(grid.index_floor([0.0, f64::INFINITY, 0.0]), None);
    }

    #[test]
    fn lattice_roundtrip() {
        let grid = VoxelGrid::new([100.0, -50.0, 3.5], 5.0, [100, 100, 100]);
        let world = grid.index_to_world([4, 7, 9]);
        assert_abs_diff_eq!(world[0], 120.0);
        assert_abs_diff_eq!(world[1], -15.0);
        assert_abs_diff_eq!(world[2], 48.5);
        assert_eq!(grid.index_round(world), Some([4, 7, 9]));
        assert!(grid.contains([99, 0, 0]));
        assert!(!grid.contains([100, 0, 0]));
        assert!(!grid.contains([0, -1, 0]));
    }

    #[test]
    fn region_bounds_are_inclusive() {
        let region = SampleRegion {
            center_um: [0.0, 0.0, 0.0],
            half_widths_um: [1.0, 2.0, 3.0],
        };
        assert!(region.contains([1.0, -2.0, 3.0]));
        assert!(!region.contains([1.01, 0.0, 0.0]));
        assert_eq!(region.min_um(), [-1.0, -2.0, -3.0]);
    }
}
