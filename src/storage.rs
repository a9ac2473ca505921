//! Dual-resolution voxel storage shared between an acquisition writer and a display refresher.
//!
//! Samples are accumulated per channel in a sparse high-resolution map covering the sample region.
//! Display volumes covering the whole chamber are rebuilt from it lazily, only when a channel was
//! written since its last rebuild. In live view (a reference position is set) display volumes are
//! additionally shifted and rotated to follow the stage.
//!
//! Lock order per channel is display, then sparse. `update` only takes the sparse lock.

use crate::config::StorageConfig;
use crate::error::{Result, VoxelError};
use crate::locks::{lock, read, write};
use crate::model::{ChannelMemory, ChannelStats, CombineMode, MemoryUsage, StagePosition, UpdateReport};
use crate::volume::{
    CoordinateTransformer, DenseVolume, DisplayCache, DisplayDownsampler, SampleRegion, SparseHighResStore,
    SparseVoxelMap, TransformCache,
};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

struct ChannelState {
    sparse: Mutex<SparseVoxelMap>,
    display: Mutex<DisplayCache>,
    dirty: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
}
impl ChannelState {
    fn new(extent: [usize; 3], display_shape: [usize; 3]) -> Self {
        Self {
            sparse: Mutex::new(SparseVoxelMap::new(extent)),
            display: Mutex::new(DisplayCache::new(display_shape)),
            dirty: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

pub struct VoxelStorage {
    config: StorageConfig,
    store: SparseHighResStore,
    downsampler: DisplayDownsampler,
    transformer: RwLock<CoordinateTransformer>,
    transforms: TransformCache,
    channels: Vec<ChannelState>,
}

impl VoxelStorage {
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let store = SparseHighResStore::new(config.sample_region(), config.storage_voxel_size_um, config.bit_depth)?;
        let downsampler = DisplayDownsampler::new(
            *store.grid(),
            config.display_grid(),
            config.display_mode,
            store.max_value(),
        );
        let display_shape = config.display_shape();
        let channels = (0..config.num_channels)
            .map(|_| ChannelState::new(store.grid().extent, display_shape))
            .collect();

        info!(
            "voxel storage: {} channels, storage grid {:?} at {} µm, display {:?} at {} µm",
            config.num_channels,
            store.grid().extent,
            config.storage_voxel_size_um,
            display_shape,
            config.display_voxel_size_um
        );

        Ok(Self {
            transforms: TransformCache::new(config.display_voxel_size_um, config.max_cached_transforms),
            transformer: RwLock::new(CoordinateTransformer::new()),
            config,
            store,
            downsampler,
            channels,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
    /// `[z, y, x]` voxel count of every display volume.
    pub fn display_shape(&self) -> [usize; 3] {
        self.downsampler.display_grid().extent
    }
    /// `[z, y, x]` voxel count of the storage grid.
    pub fn storage_extent(&self) -> [usize; 3] {
        self.store.grid().extent
    }
    pub fn get_region_bounds(&self) -> SampleRegion {
        self.store.get_region_bounds()
    }

    /// Fractional display voxel coordinates of a world position (`[z, y, x]` µm).
    pub fn world_to_display_voxel(&self, world_um: [f64; 3]) -> [f64; 3] {
        self.downsampler.display_grid().to_voxel_units(world_um)
    }

    fn channel(&self, channel: usize) -> Result<&ChannelState> {
        self.channels.get(channel).ok_or(VoxelError::InvalidChannel {
            channel,
            channels: self.channels.len(),
        })
    }

    /// Accumulates one batch of samples into `channel`.
    ///
    /// Samples outside the sample region (or with non-finite coordinates) are dropped and counted in
    /// the report. Differing `world_coords`/`pixel_values` lengths fail without storing anything.
    pub fn update(
        &self,
        channel: usize,
        world_coords: &[[f64; 3]],
        pixel_values: &[f32],
        timestamp: f64,
        mode: CombineMode,
    ) -> Result<UpdateReport> {
        let state = self.channel(channel)?;
        let (samples, rejected) = self.store.quantize(world_coords, pixel_values)?;
        if !samples.is_empty() {
            let mut map = lock(&state.sparse);
            self.store.apply(&mut map, &samples, timestamp, mode);
            drop(map);
            state.dirty.store(true, Ordering::Release);
        }

        let report = UpdateReport {
            accepted: samples.len(),
            rejected,
        };
        state.accepted.fetch_add(report.accepted as u64, Ordering::Relaxed);
        state.rejected.fetch_add(report.rejected as u64, Ordering::Relaxed);
        if report.rejected > 0 && report.rejected_fraction() > self.config.rejection_warn_fraction {
            warn!(
                "channel {}: {} of {} samples fell outside the sample region",
                channel,
                report.rejected,
                report.total()
            );
        }
        Ok(report)
    }

    /// Rebuilds the display volume of `channel` if it was written since the last rebuild, or if
    /// `force` is set. Returns whether a rebuild happened.
    pub fn downsample_to_display(&self, channel: usize, force: bool) -> Result<bool> {
        let state = self.channel(channel)?;
        let mut cache = lock(&state.display);
        // cleared before the snapshot: writes racing with the rebuild mark the channel dirty again
        if !state.dirty.swap(false, Ordering::AcqRel) && !force {
            return Ok(false);
        }
        let entries = lock(&state.sparse).snapshot();
        self.downsampler.rebuild(&entries, &mut cache);
        Ok(true)
    }

    fn current_display(&self, channel: usize) -> Result<(Arc<DenseVolume>, u64)> {
        self.downsample_to_display(channel, false)?;
        let cache = lock(&self.channel(channel)?.display);
        Ok((cache.volume(), cache.generation()))
    }

    /// Up-to-date display volume of `channel`.
    pub fn get_display_volume(&self, channel: usize) -> Result<Arc<DenseVolume>> {
        Ok(self.current_display(channel)?.0)
    }

    /// Display volume as of the last rebuild, without checking for newer writes.
    pub fn get_cached_display_volume(&self, channel: usize) -> Result<Arc<DenseVolume>> {
        Ok(lock(&self.channel(channel)?.display).volume())
    }

    /// Display volume positioned for the current stage position.
    ///
    /// Without a reference position this is exactly [`Self::get_display_volume`]. With one, the
    /// volume is shifted by the stage movement since the reference and rotated about
    /// `holder_position_voxels` (display voxels, `[z, y, x]`) by the configured rotation plus the
    /// stage rotation delta.
    pub fn get_display_volume_transformed(
        &self,
        channel: usize,
        stage_position: &StagePosition,
        holder_position_voxels: [f64; 3],
    ) -> Result<Arc<DenseVolume>> {
        let (volume, generation) = self.current_display(channel)?;
        let rotation = read(&self.transformer).rotation();
        self.transforms.get_display_volume_transformed(
            channel,
            volume,
            generation,
            stage_position,
            holder_position_voxels,
            rotation,
        )
    }

    /// Enters relative placement. Must be cleared again before absolute acquisition.
    pub fn set_reference_position(&self, position: StagePosition) {
        self.transforms.set_reference_position(position);
    }
    pub fn clear_reference_position(&self) -> Option<StagePosition> {
        self.transforms.clear_reference_position()
    }
    pub fn reference_position(&self) -> Option<StagePosition> {
        self.transforms.reference_position()
    }
    pub fn invalidate_transform_cache(&self) {
        self.transforms.invalidate_transform_cache();
    }

    pub fn set_rotation(&self, rx: f64, ry: f64, rz: f64) {
        write(&self.transformer).set_rotation(rx, ry, rz);
        self.transforms.invalidate_transform_cache();
    }
    pub fn rotation(&self) -> [f64; 3] {
        read(&self.transformer).rotation()
    }

    /// See [`CoordinateTransformer::camera_to_world`].
    pub fn camera_to_world(
        &self,
        pixel_coords: &[[f64; 2]],
        z_position_mm: f64,
        stage_offset_mm: [f64; 2],
        pixel_size_um: f64,
        fov_mm: f64,
    ) -> Result<Vec<[f64; 3]>> {
        read(&self.transformer).camera_to_world(pixel_coords, z_position_mm, stage_offset_mm, pixel_size_um, fov_mm)
    }

    /// Drops all stored data of `channel`, or of every channel for `None`.
    pub fn clear(&self, channel: Option<usize>) -> Result<()> {
        let targets = match channel {
            Some(c) => {
                self.channel(c)?;
                c..c + 1
            }
            None => 0..self.channels.len(),
        };
        for c in targets.clone() {
            let state = &self.channels[c];
            let mut cache = lock(&state.display);
            lock(&state.sparse).clear();
            state.dirty.store(false, Ordering::Release);
            cache.reset();
            state.accepted.store(0, Ordering::Relaxed);
            state.rejected.store(0, Ordering::Relaxed);
        }
        self.transforms.invalidate_transform_cache();
        info!("cleared channels {:?}", targets);
        Ok(())
    }

    pub fn channel_stats(&self, channel: usize) -> Result<ChannelStats> {
        let state = self.channel(channel)?;
        let (rebuilds, generation) = {
            let cache = lock(&state.display);
            (cache.rebuilds(), cache.generation())
        };
        Ok(ChannelStats {
            voxel_count: lock(&state.sparse).len(),
            total_accepted: state.accepted.load(Ordering::Relaxed),
            total_rejected: state.rejected.load(Ordering::Relaxed),
            rebuilds,
            generation,
        })
    }

    pub fn get_memory_usage(&self) -> MemoryUsage {
        let channels: Vec<ChannelMemory> = self
            .channels
            .iter()
            .enumerate()
            .map(|(channel, state)| {
                let dense_bytes = lock(&state.display).size_in_bytes();
                let map = lock(&state.sparse);
                ChannelMemory {
                    channel,
                    sparse_entries: map.len(),
                    sparse_bytes: map.memory_bytes(),
                    dense_bytes,
                }
            })
            .collect();
        MemoryUsage {
            sparse_bytes: channels.iter().map(|c| c.sparse_bytes).sum(),
            dense_bytes: channels.iter().map(|c| c.dense_bytes).sum(),
            cached_transforms: self.transforms.len(),
            transform_cache_bytes: self.transforms.size_in_bytes(),
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AxisTriple;
    use crate::volume::SPARSE_ENTRY_BYTES;
    use approx::assert_abs_diff_eq;

    // world position [z, y, x] of the region centre
    const CENTER: [f64; 3] = [19250.0, 7000.0, 6655.0];

    fn config() -> StorageConfig {
        StorageConfig {
            display_voxel_size_um: 250.0,
            ..Default::default()
        }
    }

    fn storage() -> VoxelStorage {
        VoxelStorage::new(config()).unwrap()
    }

    fn write_one(storage: &VoxelStorage, channel: usize, world: [f64; 3], value: f32, mode: CombineMode) -> UpdateReport {
        storage.update(channel, &[world], &[value], 0.0, mode).unwrap()
    }

    #[test]
    fn quantization_stays_within_half_voxel() {
        let storage = storage();
        let half = config().storage_voxel_size_um / 2.0;
        for world in [
            CENTER,
            [12251.3, -4999.0, 700.2],
            [26249.9, 18999.99, 12654.0],
            [20000.0, 1234.567, 8001.25],
        ] {
            let key = storage.store.key_for(world).unwrap();
            let center = storage.store.voxel_center(key);
            for i in 0..3 {
                assert!((center[i] - world[i]).abs() <= half + 1e-9, "{:?} -> {:?}", world, center);
            }
        }
    }

    #[test]
    fn rejection_boundary_is_inclusive() {
        let storage = storage();
        let region = storage.get_region_bounds();
        let (min, max) = (region.min_um(), region.max_um());
        let step = config().storage_voxel_size_um;

        let report = storage
            .update(0, &[min, max], &[1.0, 1.0], 0.0, CombineMode::Maximum)
            .unwrap();
        assert_eq!(report, UpdateReport { accepted: 2, rejected: 0 });

        let outside = [
            [min[0] - step, min[1], min[2]],
            [max[0], max[1] + step, max[2]],
            [max[0], max[1], max[2] + step],
        ];
        let report = storage
            .update(0, &outside, &[1.0; 3], 0.0, CombineMode::Maximum)
            .unwrap();
        assert_eq!(report, UpdateReport { accepted: 0, rejected: 3 });
        let stats = storage.channel_stats(0).unwrap();
        assert_eq!(stats.total_rejected, 3);
        assert_eq!(stats.voxel_count, 2);
    }

    #[test]
    fn combination_modes_across_calls() {
        let storage = storage();
        for (channel, mode, expected) in [
            (0, CombineMode::Maximum, 50.0),
            (1, CombineMode::Latest, 30.0),
            (2, CombineMode::Additive, 90.0),
            (3, CombineMode::Average, 30.0),
        ] {
            for (t, value) in [10.0, 50.0, 30.0].into_iter().enumerate() {
                storage.update(channel, &[CENTER], &[value], t as f64, mode).unwrap();
            }
            let map = lock(&storage.channels[channel].sparse);
            let key = storage.store.key_for(CENTER).unwrap();
            assert_eq!(map.entry(key).map(|e| e.value), Some(expected), "{:?}", mode);
        }
    }

    #[test]
    fn display_volume_is_not_rebuilt_without_writes() {
        let storage = storage();
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        let first = storage.get_display_volume(0).unwrap();
        let second = storage.get_display_volume(0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.channel_stats(0).unwrap().rebuilds, 1);
        assert!(!storage.downsample_to_display(0, false).unwrap());
        assert!(storage.downsample_to_display(0, true).unwrap());
    }

    #[test]
    fn writes_only_dirty_their_channel() {
        let storage = storage();
        let before_0 = storage.get_display_volume(0).unwrap();
        let before_1 = storage.get_display_volume(1).unwrap();

        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        let after_0 = storage.get_display_volume(0).unwrap();
        let after_1 = storage.get_display_volume(1).unwrap();

        assert_ne!(*before_0, *after_0);
        assert!(Arc::ptr_eq(&before_1, &after_1));
        assert_eq!(storage.channel_stats(1).unwrap().rebuilds, 0);
    }

    #[test]
    fn cached_read_does_not_rebuild() {
        let storage = storage();
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        assert_eq!(storage.get_cached_display_volume(0).unwrap().nonzero_count(), 0);
        assert_eq!(storage.get_display_volume(0).unwrap().nonzero_count(), 1);
    }

    #[test]
    fn absolute_mode_passes_display_volume_through() {
        let storage = storage();
        storage.set_rotation(0.0, 30.0, 0.0);
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        let plain = storage.get_display_volume(0).unwrap();
        for stage in [StagePosition::default(), StagePosition::new(3.0, -2.0, 1.0, 45.0)] {
            let transformed = storage
                .get_display_volume_transformed(0, &stage, [10.0, 20.0, 30.0])
                .unwrap();
            assert_eq!(*transformed, *plain);
        }
    }

    #[test]
    fn relative_mode_follows_stage() {
        let storage = storage();
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        let at = storage.get_display_volume(0).unwrap().argmax().unwrap();

        storage.set_reference_position(StagePosition::default());
        let holder = storage.world_to_display_voxel(CENTER);
        let moved = storage
            .get_display_volume_transformed(0, &StagePosition::new(1.0, 0.0, 0.0, 0.0), holder)
            .unwrap();
        // 1 mm at 250 µm per display voxel
        assert_eq!(moved.argmax(), Some([at[0], at[1], at[2] + 4]));
        assert_eq!(moved.nonzero_count(), 1);

        let again = storage
            .get_display_volume_transformed(0, &StagePosition::new(1.0, 0.0, 0.0, 0.0), holder)
            .unwrap();
        assert!(Arc::ptr_eq(&moved, &again));
        assert_eq!(storage.get_memory_usage().cached_transforms, 1);

        // new data reaches the live view
        write_one(&storage, 0, [CENTER[0], CENTER[1], CENTER[2] - 1000.0], 20.0, CombineMode::Maximum);
        let refreshed = storage
            .get_display_volume_transformed(0, &StagePosition::new(1.0, 0.0, 0.0, 0.0), holder)
            .unwrap();
        assert_eq!(refreshed.nonzero_count(), 2);

        assert!(storage.clear_reference_position().is_some());
        assert_eq!(storage.get_memory_usage().cached_transforms, 0);
    }

    #[test]
    fn single_sample_lands_in_expected_display_voxel() {
        let storage = storage();
        assert_eq!(storage.display_shape(), [58, 98, 54]);
        let report = write_one(&storage, 0, [19250.0, 7000.0, 6655.0], 1000.0, CombineMode::Maximum);
        assert_eq!(report.accepted, 1);

        let volume = storage.get_display_volume(0).unwrap();
        assert_eq!(volume.at(29, 48, 26), 1000.0);
        assert_eq!(volume.argmax(), Some([29, 48, 26]));
        assert_eq!(volume.nonzero_count(), 1);

        let voxel = storage.world_to_display_voxel([19250.0, 7000.0, 6655.0]);
        assert_abs_diff_eq!(voxel[0], 29.0);
        assert_abs_diff_eq!(voxel[1], 48.0);
        assert_abs_diff_eq!(voxel[2], 26.62, epsilon = 1e-9);
    }

    #[test]
    fn region_outside_chamber_is_not_rendered() {
        let storage = VoxelStorage::new(StorageConfig {
            chamber_dimensions_um: AxisTriple::new(1000.0, 24500.0, 14500.0),
            display_voxel_size_um: 250.0,
            ..Default::default()
        })
        .unwrap();
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        write_one(&storage, 0, [CENTER[0], CENTER[1], 700.0], 20.0, CombineMode::Maximum);
        let volume = storage.get_display_volume(0).unwrap();
        assert_eq!(volume.nonzero_count(), 1);
        assert_eq!(volume.max_value(), 20.0);
    }

    #[test]
    fn clear_one_channel() {
        let storage = storage();
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        write_one(&storage, 1, CENTER, 10.0, CombineMode::Maximum);
        storage.get_display_volume(0).unwrap();

        storage.clear(Some(0)).unwrap();
        assert_eq!(storage.get_display_volume(0).unwrap().nonzero_count(), 0);
        assert_eq!(storage.get_display_volume(1).unwrap().nonzero_count(), 1);
        assert_eq!(storage.channel_stats(0).unwrap().voxel_count, 0);

        storage.clear(None).unwrap();
        let usage = storage.get_memory_usage();
        assert_eq!(usage.sparse_bytes, 0);
        assert_eq!(usage.dense_bytes, 4 * 58 * 98 * 54 * 4);
        assert!(storage.clear(Some(4)).is_err());
    }

    #[test]
    fn bad_calls_fail() {
        let storage = storage();
        assert_eq!(
            storage.update(0, &[CENTER, CENTER], &[1.0], 0.0, CombineMode::Maximum),
            Err(VoxelError::LengthMismatch { coords: 2, values: 1 })
        );
        assert_eq!(storage.channel_stats(0).unwrap().voxel_count, 0);
        assert_eq!(
            storage.update(7, &[CENTER], &[1.0], 0.0, CombineMode::Maximum),
            Err(VoxelError::InvalidChannel { channel: 7, channels: 4 })
        );
        assert!(storage.get_display_volume(4).is_err());
    }

    #[test]
    fn invalid_config_is_fatal() {
        let config = StorageConfig {
            display_voxel_size_um: 1.0,
            ..Default::default()
        };
        assert!(matches!(VoxelStorage::new(config), Err(VoxelError::InvalidConfig(_))));

        let config = StorageConfig {
            chamber_dimensions_um: AxisTriple::new(1e15, 1e15, 1e15),
            ..Default::default()
        };
        assert!(matches!(VoxelStorage::new(config), Err(VoxelError::InvalidConfig(_))));
    }

    #[test]
    fn memory_usage_counts_entries_and_transforms() {
        let storage = storage();
        write_one(&storage, 0, CENTER, 10.0, CombineMode::Maximum);
        write_one(&storage, 0, [CENTER[0], CENTER[1], CENTER[2] + 100.0], 10.0, CombineMode::Maximum);
        write_one(&storage, 2, CENTER, 10.0, CombineMode::Maximum);

        let usage = storage.get_memory_usage();
        assert_eq!(usage.channels[0].sparse_entries, 2);
        assert_eq!(usage.channels[0].sparse_bytes, 2 * SPARSE_ENTRY_BYTES);
        assert_eq!(usage.sparse_bytes, 3 * SPARSE_ENTRY_BYTES);
        assert_eq!(usage.cached_transforms, 0);
        assert_eq!(usage.transform_cache_bytes, 0);

        storage.set_reference_position(StagePosition::default());
        storage
            .get_display_volume_transformed(0, &StagePosition::new(1.0, 0.0, 0.0, 0.0), [29.0, 48.0, 26.0])
            .unwrap();
        let usage = storage.get_memory_usage();
        assert_eq!(usage.cached_transforms, 1);
        assert_eq!(usage.transform_cache_bytes, 58 * 98 * 54 * 4);
        assert_eq!(
            usage.total_bytes(),
            usage.sparse_bytes + usage.dense_bytes + usage.transform_cache_bytes
        );
    }

    #[test]
    fn concurrent_writer_and_refresher() {
        let storage = Arc::new(storage());
        storage.set_reference_position(StagePosition::default());
        let done = AtomicBool::new(false);
        let samples = 48;

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..samples {
                    let world = [CENTER[0], CENTER[1], 655.0 + 250.0 * i as f64];
                    storage.update(0, &[world], &[i as f32 + 1.0], i as f64, CombineMode::Maximum).unwrap();
                }
                done.store(true, Ordering::Release);
            });
            s.spawn(|| {
                let mut step = 0;
                while !done.load(Ordering::Acquire) {
                    let stage = StagePosition::new(0.25 * (step % 3) as f64, 0.0, 0.0, 0.0);
                    let volume = storage.get_display_volume_transformed(0, &stage, [29.0, 48.0, 26.0]).unwrap();
                    assert_eq!(volume.shape(), [58, 98, 54]);
                    step += 1;
                }
            });
        });

        storage.clear_reference_position();
        let volume = storage.get_display_volume(0).unwrap();
        assert_eq!(volume.nonzero_count(), samples);
        assert_eq!(volume.max_value(), samples as f32);
    }
}
