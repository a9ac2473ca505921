use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Stage coordinates as reported by the positioning hardware: millimetres, `r` in degrees.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: f64,
}
impl StagePosition {
    pub fn new(x: f64, y: f64, z: f64, r: f64) -> Self {
        Self { x, y, z, r }
    }
    /// Per-axis difference `self - other` in millimetres, ordered `[z, y, x]`, plus the `r` delta.
    pub fn delta_zyx(&self, other: &StagePosition) -> ([f64; 3], f64) {
        ([self.z - other.z, self.y - other.y, self.x - other.x], self.r - other.r)
    }
}

/// How a new sample is merged into an existing voxel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    Latest,
    #[default]
    Maximum,
    Average,
    Additive,
}
impl CombineMode {
    /// Entry for a voxel seen for the first time.
    pub fn first(self, value: f32, timestamp: f64, max_value: f32) -> VoxelEntry {
        let value = match self {
            CombineMode::Additive => value.min(max_value),
            _ => value,
        };
        VoxelEntry {
            value,
            timestamp,
            count: 1,
        }
    }

    pub fn combine(self, entry: &mut VoxelEntry, value: f32, timestamp: f64, max_value: f32) {
        entry.count = entry.count.saturating_add(1);
        match self {
            CombineMode::Latest => {
                entry.value = value;
                entry.timestamp = timestamp;
            }
            CombineMode::Maximum => {
                if value > entry.value {
                    entry.value = value;
                    entry.timestamp = timestamp;
                }
            }
            CombineMode::Average => {
                entry.value += (value - entry.value) / entry.count as f32;
                entry.timestamp = timestamp;
            }
            CombineMode::Additive => {
                entry.value = (entry.value + value).min(max_value);
                entry.timestamp = timestamp;
            }
        }
    }

    /// Folds an already accumulated entry into `into`, e.g. several storage voxels into one display voxel.
    pub fn merge(self, into: &mut VoxelEntry, other: &VoxelEntry, max_value: f32) {
        match self {
            CombineMode::Latest => {
                // same timestamp: the brighter voxel wins, independent of merge order
                let newer = other.timestamp > into.timestamp
                    || (other.timestamp == into.timestamp && other.value > into.value);
                if newer {
                    into.value = other.value;
                    into.timestamp = other.timestamp;
                }
            }
            CombineMode::Maximum => {
                if other.value > into.value {
                    into.value = other.value;
                    into.timestamp = other.timestamp;
                }
            }
            CombineMode::Average => {
                let total = into.count as f64 + other.count as f64;
                if total > 0.0 {
                    into.value =
                        ((into.value as f64 * into.count as f64 + other.value as f64 * other.count as f64) / total) as f32;
                }
                into.timestamp = into.timestamp.max(other.timestamp);
            }
            CombineMode::Additive => {
                into.value = (into.value + other.value).min(max_value);
                into.timestamp = into.timestamp.max(other.timestamp);
            }
        }
        into.count = into.count.saturating_add(other.count);
    }

    pub fn name(self) -> &'static str {
        match self {
            CombineMode::Latest => "latest",
            CombineMode::Maximum => "maximum",
            CombineMode::Average => "average",
            CombineMode::Additive => "additive",
        }
    }
}
impl FromStr for CombineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(CombineMode::Latest),
            "maximum" | "max" => Ok(CombineMode::Maximum),
            "average" | "mean" => Ok(CombineMode::Average),
            "additive" | "sum" => Ok(CombineMode::Additive),
            other => Err(format!("unknown combine mode '{}'", other)),
        }
    }
}

/// Accumulated state of one stored voxel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VoxelEntry {
    pub value: f32,
    pub timestamp: f64,
    pub count: u32,
}

/// Outcome of a single `update` call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub accepted: usize,
    pub rejected: usize,
}
impl UpdateReport {
    pub fn total(&self) -> usize {
        self.accepted + self.rejected
    }
    pub fn rejected_fraction(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.rejected as f64 / self.total() as f64
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub voxel_count: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub rebuilds: u64,
    pub generation: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChannelMemory {
    pub channel: usize,
    pub sparse_entries: usize,
    pub sparse_bytes: usize,
    pub dense_bytes: usize,
}

/// Approximate memory footprint, for status reporting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub channels: Vec<ChannelMemory>,
    pub sparse_bytes: usize,
    pub dense_bytes: usize,
    pub cached_transforms: usize,
    pub transform_cache_bytes: usize,
}
impl MemoryUsage {
    pub fn total_bytes(&self) -> usize {
        self.sparse_bytes + self.dense_bytes + self.transform_cache_bytes
    }
    pub fn total_mb(&self) -> f64 {
        self.total_bytes() as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(mode: CombineMode, values: &[f32]) -> VoxelEntry {
        let mut entry = mode.first(values[0], 0.0, 65535.0);
        for (i, v) in values.iter().enumerate().skip(1) {
            mode.combine(&mut entry, *v, i as f64, 65535.0);
        }
        entry
    }

    #[test]
    fn combine_modes() {
        assert_eq!(run(CombineMode::Maximum, &[10.0, 50.0, 30.0]).value, 50.0);
        assert_eq!(run(CombineMode::Latest, &[10.0, 50.0, 30.0]).value, 30.0);
        assert_eq!(run(CombineMode::Additive, &[10.0, 50.0, 30.0]).value, 90.0);
        assert_eq!(run(CombineMode::Average, &[10.0, 50.0, 30.0]).value, 30.0);
        assert_eq!(run(CombineMode::Average, &[10.0, 50.0, 30.0]).count, 3);
    }

    #[test]
    fn maximum_keeps_timestamp_of_max() {
        let entry = run(CombineMode::Maximum, &[10.0, 50.0, 30.0]);
        assert_eq!(entry.timestamp, 1.0);
    }

    #[test]
    fn additive_saturates() {
        let mut entry = CombineMode::Additive.first(300.0, 0.0, 255.0);
        assert_eq!(entry.value, 255.0);
        entry = CombineMode::Additive.first(200.0, 0.0, 255.0);
        CombineMode::Additive.combine(&mut entry, 100.0, 1.0, 255.0);
        assert_eq!(entry.value, 255.0);
    }

    #[test]
    fn merge_weights_average_by_count() {
        let mut a = VoxelEntry {
            value: 10.0,
            timestamp: 1.0,
            count: 3,
        };
        let b = VoxelEntry {
            value: 30.0,
            timestamp: 2.0,
            count: 1,
        };
        CombineMode::Average.merge(&mut a, &b, 65535.0);
        assert_eq!(a.value, 15.0);
        assert_eq!(a.count, 4);
        assert_eq!(a.timestamp, 2.0);
    }

    #[test]
    fn merge_latest_prefers_newer_timestamp() {
        let mut a = VoxelEntry {
            value: 10.0,
            timestamp: 5.0,
            count: 1,
        };
        let older = VoxelEntry {
            value: 99.0,
            timestamp: 1.0,
            count: 1,
        };
        CombineMode::Latest.merge(&mut a, &older, 65535.0);
        assert_eq!(a.value, 10.0);
        CombineMode::Maximum.merge(&mut a, &older, 65535.0);
        assert_eq!(a.value, 99.0);
    }

    #[test]
    fn merge_latest_tie_is_order_independent() {
        let dim = VoxelEntry {
            value: 10.0,
            timestamp: 3.0,
            count: 1,
        };
        let bright = VoxelEntry {
            value: 40.0,
            timestamp: 3.0,
            count: 1,
        };
        let (mut a, mut b) = (dim, bright);
        CombineMode::Latest.merge(&mut a, &bright, 65535.0);
        CombineMode::Latest.merge(&mut b, &dim, 65535.0);
        assert_eq!(a.value, 40.0);
        assert_eq!(b.value, 40.0);
    }

    #[test]
    fn parse_modes() {
        assert_eq!("Maximum".parse::<CombineMode>(), Ok(CombineMode::Maximum));
        assert_eq!("sum".parse::<CombineMode>(), Ok(CombineMode::Additive));
        assert!("median".parse::<CombineMode>().is_err());
    }

    #[test]
    fn stage_delta_is_zyx() {
        let current = StagePosition::new(1.0, 2.0, 3.0, 10.0);
        let reference = StagePosition::new(0.5, 0.0, 1.0, 0.0);
        assert_eq!(current.delta_zyx(&reference), ([2.0, 2.0, 0.5], 10.0));
    }
}
