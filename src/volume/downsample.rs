use super::{DenseVolume, VoxelGrid, VoxelKey};
use crate::model::{CombineMode, VoxelEntry};
use fxhash::FxHashMap;
use log::debug;
use rayon::prelude::*;
use std::sync::Arc;

/// Display-resolution dense volume of one channel.
///
/// The shape is fixed at construction. Each rebuild or reset bumps `generation` so derived
/// data (transformed copies) can tell when it went stale.
#[derive(Debug, Clone)]
pub struct DisplayCache {
    volume: Arc<DenseVolume>,
    generation: u64,
    rebuilds: u64,
}
impl DisplayCache {
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            volume: Arc::new(DenseVolume::new(shape)),
            generation: 0,
            rebuilds: 0,
        }
    }

    /// Shared handle to the current contents.
    pub fn volume(&self) -> Arc<DenseVolume> {
        self.volume.clone()
    }
    pub fn generation(&self) -> u64 {
        self.generation
    }
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
    pub fn size_in_bytes(&self) -> usize {
        self.volume.size_in_bytes()
    }

    /// Zeroes the volume in place.
    pub fn reset(&mut self) {
        Arc::make_mut(&mut self.volume).fill(0.0);
        self.generation += 1;
    }
}

/// Re-projects storage voxels into the display grid.
#[derive(Debug, Clone)]
pub struct DisplayDownsampler {
    storage: VoxelGrid,
    display: VoxelGrid,
    mode: CombineMode,
    max_value: f32,
}
impl DisplayDownsampler {
    pub fn new(storage: VoxelGrid, display: VoxelGrid, mode: CombineMode, max_value: f32) -> Self {
        Self {
            storage,
            display,
            mode,
            max_value,
        }
    }

    pub fn display_grid(&self) -> &VoxelGrid {
        &self.display
    }
    pub fn mode(&self) -> CombineMode {
        self.mode
    }

    /// Flat display index for a storage voxel, `None` if it falls outside the chamber.
    pub fn project(&self, key: VoxelKey) -> Option<usize> {
        let world = self.storage.index_to_world(key.index());
        let [z, y, x] = self.display.index_floor(world).filter(|idx| self.display.contains(*idx))?;
        let [_, ny, nx] = self.display.extent;
        Some((z as usize * ny + y as usize) * nx + x as usize)
    }

    /// Rebuilds `cache` from a snapshot of storage entries. Returns the number of populated display voxels.
    pub fn rebuild(&self, entries: &[(VoxelKey, VoxelEntry)], cache: &mut DisplayCache) -> usize {
        let projected: Vec<(usize, VoxelEntry)> = entries
            .par_iter()
            .filter_map(|(key, entry)| self.project(*key).map(|idx| (idx, *entry)))
            .collect();
        let outside = entries.len() - projected.len();

        let mut cells: FxHashMap<usize, VoxelEntry> = FxHashMap::default();
        for (idx, entry) in projected {
            cells
                .entry(idx)
                .and_modify(|c| self.mode.merge(c, &entry, self.max_value))
                .or_insert(entry);
        }

        let volume = Arc::make_mut(&mut cache.volume);
        volume.fill(0.0);
        let data = volume.data_mut();
        for (idx, entry) in &cells {
            data[*idx] = entry.value;
        }
        cache.generation += 1;
        cache.rebuilds += 1;

        debug!(
            "downsampled {} storage voxels into {} display voxels ({} outside chamber)",
            entries.len(),
            cells.len(),
            outside
        );
        cells.len()
    }
}
