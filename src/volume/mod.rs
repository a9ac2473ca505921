mod downsample;
mod grid;
mod sparse;
mod transform;
mod transform_cache;

use crate::error::{Result, VoxelError};
use derive_more::Debug;
pub use downsample::{DisplayCache, DisplayDownsampler};
pub use grid::{SampleRegion, VoxelGrid};
pub use sparse::{SparseHighResStore, SparseVoxelMap, VoxelKey, MAX_AXIS_EXTENT, SPARSE_ENTRY_BYTES};
pub use transform::{AffineTransform, CoordinateTransformer};
pub use transform_cache::{TransformCache, TransformCacheKey};

/// Read access to a 3D grid of intensities, indexed `[z, y, x]`.
pub trait VoxelVolume {
    fn shape(&self) -> [usize; 3];
    /// Value at `zyx`, zero outside the volume.
    fn get(&self, zyx: [i64; 3]) -> f32;
}

/// Dense row-major `[z][y][x]` array of `f32` intensities.
#[derive(Clone, PartialEq, Debug)]
pub struct DenseVolume {
    shape: [usize; 3],
    #[debug(skip)]
    data: Vec<f32>,
}
impl DenseVolume {
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape[0] * shape[1] * shape[2]],
        }
    }

    pub fn from_vec(shape: [usize; 3], data: Vec<f32>) -> Result<Self> {
        let expected = shape[0] * shape[1] * shape[2];
        if data.len() != expected {
            return Err(VoxelError::ShapeMismatch {
                expected: vec![expected],
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    #[inline]
    pub fn index_of(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.shape[1] + y) * self.shape[2] + x
    }
    /// Inverse of [`Self::index_of`].
    #[inline]
    pub fn coords_of(&self, index: usize) -> [usize; 3] {
        let x = index % self.shape[2];
        let y = (index / self.shape[2]) % self.shape[1];
        let z = index / (self.shape[2] * self.shape[1]);
        [z, y, x]
    }
    pub fn contains(&self, zyx: [i64; 3]) -> bool {
        zyx.iter().zip(self.shape.iter()).all(|(&i, &n)| i >= 0 && (i as usize) < n)
    }

    #[inline]
    pub fn at(&self, z: usize, y: usize, x: usize) -> f32 {
        self.data[self.index_of(z, y, x)]
    }
    #[inline]
    pub fn set(&mut self, z: usize, y: usize, x: usize, value: f32) {
        let idx = self.index_of(z, y, x);
        self.data[idx] = value;
    }
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(0.0, f32::max)
    }
    /// Location of the largest value, `None` if the volume is all zero.
    pub fn argmax(&self) -> Option<[usize; 3]> {
        let (idx, max) = self
            .data
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        (max > 0.0).then(|| self.coords_of(idx))
    }
    pub fn nonzero_count(&self) -> usize {
        self.data.iter().filter(|v| **v != 0.0).count()
    }
    pub fn nonzero_voxels(&self) -> impl Iterator<Item = ([usize; 3], f32)> + '_ {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, v)| (self.coords_of(i), *v))
    }
}
impl VoxelVolume for DenseVolume {
    fn shape(&self) -> [usize; 3] {
        self.shape
    }
    fn get(&self, zyx: [i64; 3]) -> f32 {
        if self.contains(zyx) {
            self.at(zyx[0] as usize, zyx[1] as usize, zyx[2] as usize)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_roundtrip() {
        let vol = DenseVolume::new([3, 4, 5]);
        for idx in [0, 7, 19, 59] {
            let [z, y, x] = vol.coords_of(idx);
            assert_eq!(vol.index_of(z, y, x), idx);
        }
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(DenseVolume::from_vec([2, 2, 2], vec![0.0; 8]).is_ok());
        assert!(matches!(
            DenseVolume::from_vec([2, 2, 2], vec![0.0; 7]),
            Err(VoxelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn out_of_bounds_reads_zero() {
        let mut vol = DenseVolume::new([2, 2, 2]);
        vol.set(1, 1, 1, 7.0);
        assert_eq!(VoxelVolume::get(&vol, [1, 1, 1]), 7.0);
        assert_eq!(VoxelVolume::get(&vol, [2, 1, 1]), 0.0);
        assert_eq!(VoxelVolume::get(&vol, [-1, 0, 0]), 0.0);
        assert_eq!(vol.argmax(), Some([1, 1, 1]));
        assert_eq!(vol.nonzero_voxels().collect::<Vec<_>>(), vec![([1, 1, 1], 7.0)]);
    }
}
