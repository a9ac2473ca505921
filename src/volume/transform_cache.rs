use super::{CoordinateTransformer, DenseVolume};
use crate::error::Result;
use crate::locks::{read, write};
use crate::model::StagePosition;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Identifies one transformed copy of a channel's display volume.
///
/// Translation is kept in whole display voxels, rotation in tenths of a degree and the rotation
/// centre in tenths of a voxel. The rounded values are also what gets applied, so a cache hit is
/// exactly what a recomputation would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformCacheKey {
    pub channel: usize,
    epoch: u64,
    translation_voxels: [i64; 3],
    rotation_decideg: [i64; 3],
    center_decivoxels: [i64; 3],
}
impl TransformCacheKey {
    fn new(channel: usize, epoch: u64, translation: [f64; 3], rotation_deg: [f64; 3], center: [f64; 3]) -> Self {
        Self {
            channel,
            epoch,
            translation_voxels: translation.map(|v| v.round() as i64),
            rotation_decideg: rotation_deg.map(|v| (v * 10.0).round() as i64),
            center_decivoxels: center.map(|v| (v * 10.0).round() as i64),
        }
    }
    pub fn translation(&self) -> [f64; 3] {
        self.translation_voxels.map(|v| v as f64)
    }
    pub fn rotation_deg(&self) -> [f64; 3] {
        self.rotation_decideg.map(|v| v as f64 / 10.0)
    }
    pub fn center(&self) -> [f64; 3] {
        self.center_decivoxels.map(|v| v as f64 / 10.0)
    }
    pub fn is_identity(&self) -> bool {
        self.translation_voxels == [0; 3] && self.rotation_decideg == [0; 3]
    }
}

struct CachedTransform {
    generation: u64,
    volume: Arc<DenseVolume>,
    last_used: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReferenceState {
    position: Option<StagePosition>,
    /// Bumped on every set/clear so entries from an older reference can never match.
    epoch: u64,
}

/// Keeps live-view display volumes aligned with stage motion relative to a reference position.
pub struct TransformCache {
    display_voxel_size_um: f64,
    max_entries: usize,
    reference: RwLock<ReferenceState>,
    entries: DashMap<TransformCacheKey, CachedTransform>,
    hits: AtomicU64,
    misses: AtomicU64,
    clock: AtomicU64,
}
impl TransformCache {
    pub fn new(display_voxel_size_um: f64, max_entries: usize) -> Self {
        Self {
            display_voxel_size_um,
            max_entries,
            reference: RwLock::new(ReferenceState::default()),
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock: AtomicU64::new(0),
        }
    }

    /// Origin for relative placement. Meant to be called once, with the first live-view frame.
    pub fn set_reference_position(&self, position: StagePosition) {
        {
            let mut state = write(&self.reference);
            if let Some(old) = state.position {
                warn!("replacing reference position {:?} without clearing it first", old);
            }
            state.position = Some(position);
            state.epoch += 1;
        }
        info!("reference position set to {:?}", position);
        self.invalidate_transform_cache();
    }

    /// Returns the storage to absolute placement. Returns the reference that was set, if any.
    pub fn clear_reference_position(&self) -> Option<StagePosition> {
        let old = {
            let mut state = write(&self.reference);
            state.epoch += 1;
            state.position.take()
        };
        if old.is_some() {
            info!("reference position cleared");
        }
        self.invalidate_transform_cache();
        old
    }

    pub fn reference_position(&self) -> Option<StagePosition> {
        read(&self.reference).position
    }

    pub fn invalidate_transform_cache(&self) {
        self.entries.clear();
    }

    /// Drops the cached copies of one channel.
    pub fn invalidate_channel(&self, channel: usize) {
        self.entries.retain(|k, _| k.channel != channel);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn size_in_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.value().volume.size_in_bytes()).sum()
    }
    /// `(hits, misses)` since construction.
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    /// Cache key for the given stage position, `None` in absolute placement (no reference).
    ///
    /// The data follows the stage: moving by `delta` shifts the volume by `+delta`. The stage `r`
    /// delta is added to `base_rotation_deg` as a rotation about the y axis.
    pub fn key_for(
        &self,
        channel: usize,
        current: &StagePosition,
        holder_position_voxels: [f64; 3],
        base_rotation_deg: [f64; 3],
    ) -> Option<TransformCacheKey> {
        let state = *read(&self.reference);
        let reference = state.position?;
        let (delta_mm, delta_r) = current.delta_zyx(&reference);
        let translation = delta_mm.map(|d| d * 1000.0 / self.display_voxel_size_um);
        let rotation = [base_rotation_deg[0], base_rotation_deg[1] + delta_r, base_rotation_deg[2]];
        Some(TransformCacheKey::new(channel, state.epoch, translation, rotation, holder_position_voxels))
    }

    /// `source` repositioned for `current`. In absolute placement `source` is returned unchanged.
    ///
    /// `generation` identifies the contents of `source`; cached copies made from another generation
    /// are recomputed.
    ///
    /// The caller must clear the reference before absolute (tile) acquisition; a stale reference
    /// shifts every returned volume by `current - reference`, and this is not detected here.
    pub fn get_display_volume_transformed(
        &self,
        channel: usize,
        source: Arc<DenseVolume>,
        generation: u64,
        current: &StagePosition,
        holder_position_voxels: [f64; 3],
        base_rotation_deg: [f64; 3],
    ) -> Result<Arc<DenseVolume>> {
        let Some(key) = self.key_for(channel, current, holder_position_voxels, base_rotation_deg) else {
            return Ok(source);
        };
        if key.is_identity() {
            return Ok(source);
        }
        if let Some(hit) = self.entries.get(&key) {
            if hit.generation == generation {
                hit.last_used.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit.volume.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(
            "transforming channel {} by {:?} voxels, rotation {:?}",
            channel,
            key.translation(),
            key.rotation_deg()
        );
        let volume = Arc::new(CoordinateTransformer::transform_voxel_volume_affine(
            source.as_ref(),
            key.translation(),
            key.rotation_deg(),
            key.center(),
        )?);
        self.insert(key, generation, volume.clone());
        Ok(volume)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Stores a fresh copy, dropping the channel's stale copies and then the least recently used
    /// entries of any channel while full.
    fn insert(&self, key: TransformCacheKey, generation: u64, volume: Arc<DenseVolume>) {
        if self.max_entries == 0 {
            return;
        }
        self.entries
            .retain(|k, v| k.channel != key.channel || v.generation == generation);
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_used.load(Ordering::Relaxed))
                .map(|e| *e.key());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
        let last_used = AtomicU64::new(self.tick());
        self.entries.insert(
            key,
            CachedTransform {
                generation,
                volume,
                last_used,
            },
        );
    }
}
