use super::{SampleRegion, VoxelGrid, VoxelVolume};
use crate::error::{Result, VoxelError};
use crate::model::{CombineMode, UpdateReport, VoxelEntry};
use fxhash::FxHashMap;

const KEY_BITS: u32 = 21;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;
/// Largest per-axis extent a storage grid may have.
pub const MAX_AXIS_EXTENT: usize = 1 << KEY_BITS;

/// Estimated cost of one stored voxel: key, entry and hash table overhead.
pub const SPARSE_ENTRY_BYTES: usize =
    std::mem::size_of::<VoxelKey>() + std::mem::size_of::<VoxelEntry>() + std::mem::size_of::<u64>();

/// Storage voxel index `[z, y, x]` packed into one integer, 21 bits per axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelKey(u64);
impl VoxelKey {
    /// `None` if any component is negative or does not fit into 21 bits.
    pub fn from_index(index: [i64; 3]) -> Option<Self> {
        if index.iter().any(|&i| i < 0 || i as u64 > KEY_MASK) {
            return None;
        }
        let [z, y, x] = index.map(|i| i as u64);
        Some(VoxelKey((z << (2 * KEY_BITS)) | (y << KEY_BITS) | x))
    }
    pub fn index(self) -> [i64; 3] {
        [
            ((self.0 >> (2 * KEY_BITS)) & KEY_MASK) as i64,
            ((self.0 >> KEY_BITS) & KEY_MASK) as i64,
            (self.0 & KEY_MASK) as i64,
        ]
    }
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Written voxels of one channel. Keys are unique and unordered.
#[derive(Debug, Clone, Default)]
pub struct SparseVoxelMap {
    extent: [usize; 3],
    entries: FxHashMap<VoxelKey, VoxelEntry>,
}
impl SparseVoxelMap {
    pub fn new(extent: [usize; 3]) -> Self {
        Self {
            extent,
            entries: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn entry(&self, key: VoxelKey) -> Option<&VoxelEntry> {
        self.entries.get(&key)
    }

    pub fn insert_sample(&mut self, key: VoxelKey, value: f32, timestamp: f64, mode: CombineMode, max_value: f32) {
        self.entries
            .entry(key)
            .and_modify(|e| mode.combine(e, value, timestamp, max_value))
            .or_insert_with(|| mode.first(value, timestamp, max_value));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (VoxelKey, &VoxelEntry)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
    /// Copy of all entries, so the map can be released before heavy processing.
    pub fn snapshot(&self) -> Vec<(VoxelKey, VoxelEntry)> {
        self.entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn memory_bytes(&self) -> usize {
        self.entries.len() * SPARSE_ENTRY_BYTES
    }
}
impl VoxelVolume for SparseVoxelMap {
    fn shape(&self) -> [usize; 3] {
        self.extent
    }
    fn get(&self, zyx: [i64; 3]) -> f32 {
        VoxelKey::from_index(zyx)
            .and_then(|k| self.entries.get(&k))
            .map_or(0.0, |e| e.value)
    }
}

/// Quantizes world samples onto the high-resolution storage grid covering the sample region.
#[derive(Debug, Clone)]
pub struct SparseHighResStore {
    region: SampleRegion,
    grid: VoxelGrid,
    max_value: f32,
}
impl SparseHighResStore {
    pub fn new(region: SampleRegion, voxel_size_um: f64, bit_depth: u8) -> Result<Self> {
        if !(voxel_size_um.is_finite() && voxel_size_um > 0.0) {
            return Err(VoxelError::InvalidConfig(format!(
                "storage voxel size must be positive, got {}",
                voxel_size_um
            )));
        }
        if region.half_widths_um.iter().any(|h| !h.is_finite() || *h < 0.0) {
            return Err(VoxelError::InvalidConfig(format!(
                "sample region half widths must be non-negative, got {:?}",
                region.half_widths_um
            )));
        }
        if !(1..=24).contains(&bit_depth) {
            return Err(VoxelError::InvalidConfig(format!("bit depth must be 1..=24, got {}", bit_depth)));
        }
        let grid = region.lattice(voxel_size_um);
        if grid.extent.iter().any(|&e| e >= MAX_AXIS_EXTENT) {
            return Err(VoxelError::InvalidConfig(format!(
                "storage grid {:?} exceeds {} voxels per axis",
                grid.extent, MAX_AXIS_EXTENT
            )));
        }

        Ok(Self {
            region,
            grid,
            max_value: ((1u32 << bit_depth) - 1) as f32,
        })
    }

    pub fn get_region_bounds(&self) -> SampleRegion {
        self.region
    }
    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }
    pub fn max_value(&self) -> f32 {
        self.max_value
    }

    /// World position `[z, y, x]` µm of the centre of a stored voxel.
    pub fn voxel_center(&self, key: VoxelKey) -> [f64; 3] {
        self.grid.index_to_world(key.index())
    }

    /// Storage key for `world`, `None` outside the sample region.
    pub fn key_for(&self, world: [f64; 3]) -> Option<VoxelKey> {
        self.grid
            .index_round(world)
            .filter(|idx| self.grid.contains(*idx))
            .and_then(VoxelKey::from_index)
    }

    /// Quantizes a batch; returns the surviving `(key, value)` pairs and the number of dropped samples.
    pub fn quantize(&self, world_coords: &[[f64; 3]], pixel_values: &[f32]) -> Result<(Vec<(VoxelKey, f32)>, usize)> {
        if world_coords.len() != pixel_values.len() {
            return Err(VoxelError::LengthMismatch {
                coords: world_coords.len(),
                values: pixel_values.len(),
            });
        }
        let samples: Vec<(VoxelKey, f32)> = world_coords
            .iter()
            .zip(pixel_values)
            .filter_map(|(w, v)| self.key_for(*w).map(|k| (k, *v)))
            .collect();
        let rejected = world_coords.len() - samples.len();
        Ok((samples, rejected))
    }

    pub fn apply(&self, map: &mut SparseVoxelMap, samples: &[(VoxelKey, f32)], timestamp: f64, mode: CombineMode) {
        for (key, value) in samples {
            map.insert_sample(*key, *value, timestamp, mode, self.max_value);
        }
    }

    pub fn update(
        &self,
        map: &mut SparseVoxelMap,
        world_coords: &[[f64; 3]],
        pixel_values: &[f32],
        timestamp: f64,
        mode: CombineMode,
    ) -> Result<UpdateReport> {
        let (samples, rejected) = self.quantize(world_coords, pixel_values)?;
        self.apply(map, &samples, timestamp, mode);
        Ok(UpdateReport {
            accepted: samples.len(),
            rejected,
        })
    }
}
