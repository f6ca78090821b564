//! Compaction signaling.
//!
//! The compactor itself is an external collaborator; this module carries
//! what ingestion needs from it: the registry entry describing an
//! in-progress compaction (consumed by the target-level picker to avoid
//! its output range) and the score-based should-compact check consulted
//! after a version edit lands.

use std::collections::BTreeMap;

use bytes::Bytes;

/// An in-progress compaction, as visible to the target-level picker. Only
/// the output level and the output key range matter for ingestion.
#[derive(Debug, Clone)]
pub struct CompactionInfo {
    pub output_level: usize,
    pub smallest: Bytes,
    pub largest: Bytes,
}

impl CompactionInfo {
    /// Boundary intersection with an inclusive user-key interval.
    pub fn overlaps_user_range(&self, smallest: &[u8], largest: &[u8]) -> bool {
        smallest <= self.largest.as_ref() && largest >= self.smallest.as_ref()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelMetrics {
    pub file_count: usize,
    pub bytes: u64,
    pub bytes_ingested: u64,
    pub tables_ingested: u64,
}

impl LevelMetrics {
    pub fn merge(&mut self, other: &LevelMetrics) {
        self.file_count += other.file_count;
        self.bytes += other.bytes;
        self.bytes_ingested += other.bytes_ingested;
        self.tables_ingested += other.tables_ingested;
    }
}

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    pub target_level_bytes: BTreeMap<usize, u64>,
    pub l0_file_trigger: usize,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        let mut target_level_bytes = BTreeMap::new();
        target_level_bytes.insert(0, 256 * 1024 * 1024);
        target_level_bytes.insert(1, 512 * 1024 * 1024);
        target_level_bytes.insert(2, 2 * 1024 * 1024 * 1024);
        Self {
            target_level_bytes,
            l0_file_trigger: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactionScore {
    pub level: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionPicker;

impl CompactionPicker {
    pub fn level_score(level: usize, metrics: &LevelMetrics, options: &CompactionOptions) -> f64 {
        if level == 0 {
            let by_files = metrics.file_count as f64 / options.l0_file_trigger.max(1) as f64;
            let target = options
                .target_level_bytes
                .get(&0)
                .copied()
                .unwrap_or(256 * 1024 * 1024);
            let by_bytes = metrics.bytes as f64 / target as f64;
            by_files.max(by_bytes)
        } else {
            let target = options.target_level_bytes.get(&level).copied().unwrap_or(1);
            metrics.bytes as f64 / target as f64
        }
    }

    pub fn pick_highest_score(
        level_metrics: &BTreeMap<usize, LevelMetrics>,
        options: &CompactionOptions,
    ) -> Option<CompactionScore> {
        level_metrics
            .iter()
            .map(|(level, metrics)| CompactionScore {
                level: *level,
                score: Self::level_score(*level, metrics, options),
            })
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    pub fn should_compact(
        level_metrics: &BTreeMap<usize, LevelMetrics>,
        options: &CompactionOptions,
    ) -> bool {
        Self::pick_highest_score(level_metrics, options)
            .map(|s| s.score >= 1.0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picker_prefers_overfull_level() {
        let opts = CompactionOptions::default();
        let mut levels = BTreeMap::new();
        levels.insert(
            0,
            LevelMetrics {
                file_count: 6,
                bytes: 20,
                ..Default::default()
            },
        );
        levels.insert(
            1,
            LevelMetrics {
                file_count: 1,
                bytes: 10,
                ..Default::default()
            },
        );

        let pick = CompactionPicker::pick_highest_score(&levels, &opts).expect("pick");
        assert_eq!(pick.level, 0);
        assert!(pick.score >= 1.0);
        assert!(CompactionPicker::should_compact(&levels, &opts));
    }

    #[test]
    fn compaction_range_overlap_is_inclusive() {
        let c = CompactionInfo {
            output_level: 4,
            smallest: Bytes::from("f"),
            largest: Bytes::from("m"),
        };
        assert!(c.overlaps_user_range(b"a", b"f"));
        assert!(c.overlaps_user_range(b"m", b"z"));
        assert!(!c.overlaps_user_range(b"n", b"z"));
        assert!(!c.overlaps_user_range(b"a", b"e"));
    }
}
