use super::{DenseVolume, VoxelVolume};
use crate::error::{Result, VoxelError};
use itertools::iproduct;
use nalgebra::{Matrix4, Rotation3};
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransform {
    /// 3x4 affine transformation matrix in zyx coordinate order
    pub matrix: [[f64; 4]; 3],
}
impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
        }
    }

    /// Rotation by `rotation_deg` (about the x, y and z axes, in that order) around `center`,
    /// followed by a translation by `translation`. `center` and `translation` are zyx.
    pub fn rigid(rotation_deg: [f64; 3], center: [f64; 3], translation: [f64; 3]) -> Self {
        let [rx, ry, rz] = rotation_deg.map(f64::to_radians);
        let xyz = Rotation3::from_euler_angles(rx, ry, rz);
        let m = xyz.matrix();
        // reverse both axes to get the same rotation acting on zyx vectors
        let r = |i: usize, j: usize| m[(2 - i, 2 - j)];

        let mut matrix = [[0.0; 4]; 3];
        for i in 0..3 {
            let mut rc = 0.0;
            for j in 0..3 {
                matrix[i][j] = r(i, j);
                rc += r(i, j) * center[j];
            }
            matrix[i][3] = center[i] + translation[i] - rc;
        }
        Self { matrix }
    }

    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        [0usize, 1, 2].map(|i| m[i][0] * p[0] + m[i][1] * p[1] + m[i][2] * p[2] + m[i][3])
    }

    /// Invert this affine transformation matrix
    pub fn invert(&self) -> Result<Self> {
        let m = &self.matrix;
        #[rustfmt::skip]
        let homogeneous = Matrix4::new(
            m[0][0], m[0][1], m[0][2], m[0][3],
            m[1][0], m[1][1], m[1][2], m[1][3],
            m[2][0], m[2][1], m[2][2], m[2][3],
            0.0, 0.0, 0.0, 1.0,
        );

        let inv = homogeneous
            .try_inverse()
            .ok_or_else(|| VoxelError::InvalidArgument("matrix is not invertible".to_string()))?;

        let mut matrix = [[0.0; 4]; 3];
        for (i, row) in matrix.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = inv[(i, j)];
            }
        }
        Ok(AffineTransform { matrix })
    }
}

/// Camera-to-world mapping for acquired frames and rigid repositioning of display volumes.
#[derive(Debug, Clone, Default)]
pub struct CoordinateTransformer {
    rotation_deg: [f64; 3],
}
impl CoordinateTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rotation about x, y, z (degrees) applied to display volumes. Not range checked.
    pub fn set_rotation(&mut self, rx: f64, ry: f64, rz: f64) {
        self.rotation_deg = [rx, ry, rz];
    }
    pub fn rotation(&self) -> [f64; 3] {
        self.rotation_deg
    }

    /// All `(row, col)` pixel positions of a `rows x cols` frame, row-major.
    pub fn pixel_grid(rows: usize, cols: usize) -> Vec<[f64; 2]> {
        iproduct!(0..rows, 0..cols).map(|(r, c)| [r as f64, c as f64]).collect()
    }

    /// Maps `(row, col)` sensor pixels to world micrometres `[z, y, x]`.
    ///
    /// The frame is centred on the stage's x/y position; the detection path is fixed relative to the
    /// stage so there is no rotation. Stage values are millimetres.
    pub fn camera_to_world(
        &self,
        pixel_coords: &[[f64; 2]],
        z_position_mm: f64,
        stage_offset_mm: [f64; 2],
        pixel_size_um: f64,
        fov_mm: f64,
    ) -> Result<Vec<[f64; 3]>> {
        if !(pixel_size_um.is_finite() && pixel_size_um > 0.0) {
            return Err(VoxelError::InvalidArgument(format!(
                "pixel size must be positive, got {}",
                pixel_size_um
            )));
        }
        if !(fov_mm.is_finite() && fov_mm > 0.0) {
            return Err(VoxelError::InvalidArgument(format!(
                "field of view must be positive, got {}",
                fov_mm
            )));
        }
        let half_fov_um = fov_mm * 1000.0 / 2.0;
        let z_um = z_position_mm * 1000.0;
        let y0 = stage_offset_mm[1] * 1000.0 - half_fov_um;
        let x0 = stage_offset_mm[0] * 1000.0 - half_fov_um;

        Ok(pixel_coords
            .iter()
            .map(|[row, col]| [z_um, y0 + row * pixel_size_um, x0 + col * pixel_size_um])
            .collect())
    }

    /// Rotates `volume` about `center` by `rotation_deg`, then translates it by `translation`.
    /// `center` and `translation` are zyx voxel units. Voxels that come from outside the source are zero.
    ///
    /// Only used to reposition display volumes, never to place written samples.
    pub fn transform_voxel_volume_affine<V: VoxelVolume + Sync>(
        volume: &V,
        translation: [f64; 3],
        rotation_deg: [f64; 3],
        center: [f64; 3],
    ) -> Result<DenseVolume> {
        if !translation.iter().chain(rotation_deg.iter()).chain(center.iter()).all(|v| v.is_finite()) {
            return Err(VoxelError::InvalidArgument(
                "transform parameters must be finite".to_string(),
            ));
        }
        let shape = volume.shape();
        let mut out = DenseVolume::new(shape);
        let slice_len = shape[1] * shape[2];
        if slice_len == 0 {
            return Ok(out);
        }

        // nearest-neighbour pull: every output voxel looks up its source
        let inverse = AffineTransform::rigid(rotation_deg, center, translation).invert()?;
        out.data_mut()
            .par_chunks_mut(slice_len)
            .enumerate()
            .for_each(|(z, slice)| {
                for y in 0..shape[1] {
                    for x in 0..shape[2] {
                        let src = inverse.apply([z as f64, y as f64, x as f64]);
                        slice[y * shape[2] + x] = volume.get(src.map(|c| c.round() as i64));
                    }
                }
            });
        Ok(out)
    }
}
