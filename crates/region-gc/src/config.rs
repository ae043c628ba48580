//! Collector configuration.

use crate::error::GcError;
use crate::heap::card_table::CARD_SIZE;

/// Default region size (256 KiB).
pub const DEFAULT_REGION_SIZE: usize = 256 * 1024;

/// Default maximum heap size (64 MiB).
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Default size of the pre-reserved region block (32 MiB).
pub const DEFAULT_INIT_HEAP_SIZE: usize = 32 * 1024 * 1024;

/// Default maximum eden size (4 MiB).
pub const DEFAULT_YOUNG_SIZE: usize = 4 * 1024 * 1024;

/// Default TLAB size (16 KiB).
pub const DEFAULT_TLAB_SIZE: usize = 16 * 1024;

/// Default garbage fraction above which a tenured region is a mixed candidate.
pub const DEFAULT_REGION_GARBAGE_RATE_THRESHOLD: f64 = 0.8;

/// Default alive fraction at or above which a young region is promoted in place.
pub const DEFAULT_PROMOTION_REGION_ALIVE_RATE: f64 = 0.5;

/// Default budget of tenured regions per mixed collection.
pub const DEFAULT_NUMBER_OF_MIXED_TENURED_REGIONS: usize = 2;

/// Default tenured occupancy that starts concurrent marking.
pub const DEFAULT_HEAP_USAGE_THRESHOLD: f64 = 0.7;

/// Default number of GC worker threads.
pub const DEFAULT_WORKERS_COUNT: usize = 2;

/// Default number of pending cards that wakes the update-remset thread.
pub const DEFAULT_MIN_CONCURRENT_CARDS_TO_PROCESS: usize = 2;

/// Settings for a [`GcHeap`](crate::GcHeap).
///
/// # Example
///
/// ```
/// use region_gc::GcSettings;
///
/// let settings = GcSettings {
///     heap_size: 16 * 1024 * 1024,
///     init_heap_size: 8 * 1024 * 1024,
///     ..GcSettings::default()
/// };
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcSettings {
    /// Size of one region. Power of two, multiple of the page and card size.
    pub region_size: usize,
    /// Maximum reserved heap size.
    pub heap_size: usize,
    /// Size of the pre-reserved region block.
    pub init_heap_size: usize,
    /// Allow regions beyond the pre-reserved block.
    pub extend_heap: bool,
    /// Maximum bytes of eden regions.
    pub young_size: usize,
    /// Size of a thread-local allocation buffer.
    pub tlab_size: usize,
    /// Garbage fraction (`garbage / size`) that makes a tenured region a mixed candidate.
    pub region_garbage_rate_threshold: f64,
    /// Alive fraction (`live / size`) that makes a young region promoted in place.
    /// Values above `1.0` disable in-place promotion.
    pub promotion_region_alive_rate: f64,
    /// Maximum tenured regions added to a mixed collection set.
    pub number_of_mixed_tenured_regions: usize,
    /// Fraction of the tenured budget in use that starts concurrent marking.
    pub heap_usage_threshold: f64,
    /// Walk every object during compaction so freed counts are exact.
    pub track_freed_objects: bool,
    /// Number of GC worker threads.
    pub workers_count: usize,
    /// Compact collection-set regions on the worker threads.
    pub parallel_compacting: bool,
    /// Drain mark stacks on the worker threads during pauses.
    pub parallel_marking: bool,
    /// Digest cards on a background thread between pauses.
    pub concurrent_update_remset: bool,
    /// Pending cards that wake the update-remset thread.
    pub min_concurrent_cards_to_process: usize,
    /// Serve asynchronous collection requests on a dedicated thread.
    pub enable_gc_thread: bool,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            init_heap_size: DEFAULT_INIT_HEAP_SIZE,
            extend_heap: true,
            young_size: DEFAULT_YOUNG_SIZE,
            tlab_size: DEFAULT_TLAB_SIZE,
            region_garbage_rate_threshold: DEFAULT_REGION_GARBAGE_RATE_THRESHOLD,
            promotion_region_alive_rate: DEFAULT_PROMOTION_REGION_ALIVE_RATE,
            number_of_mixed_tenured_regions: DEFAULT_NUMBER_OF_MIXED_TENURED_REGIONS,
            heap_usage_threshold: DEFAULT_HEAP_USAGE_THRESHOLD,
            track_freed_objects: true,
            workers_count: DEFAULT_WORKERS_COUNT,
            parallel_compacting: true,
            parallel_marking: true,
            concurrent_update_remset: true,
            min_concurrent_cards_to_process: DEFAULT_MIN_CONCURRENT_CARDS_TO_PROCESS,
            enable_gc_thread: true,
        }
    }
}

impl GcSettings {
    /// Checks the settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidSettings`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), GcError> {
        let page = sys_alloc::page_size();
        let rs = self.region_size;
        if !rs.is_power_of_two() || rs % page != 0 || rs % CARD_SIZE != 0 {
            return Err(GcError::InvalidSettings(
                "region_size must be a power of two and a multiple of the page and card size",
            ));
        }
        if self.heap_size == 0 || self.heap_size % rs != 0 {
            return Err(GcError::InvalidSettings(
                "heap_size must be a non-zero multiple of region_size",
            ));
        }
        if self.init_heap_size == 0
            || self.init_heap_size % rs != 0
            || self.init_heap_size > self.heap_size
        {
            return Err(GcError::InvalidSettings(
                "init_heap_size must be a non-zero multiple of region_size not above heap_size",
            ));
        }
        let usable = if self.extend_heap {
            self.heap_size
        } else {
            self.init_heap_size
        };
        if self.young_size < rs || self.young_size % rs != 0 || self.young_size >= usable {
            return Err(GcError::InvalidSettings(
                "young_size must be a multiple of region_size below the usable heap",
            ));
        }
        if self.tlab_size == 0 || self.tlab_size > rs || self.tlab_size % 8 != 0 {
            return Err(GcError::InvalidSettings(
                "tlab_size must be a non-zero multiple of 8 not above region_size",
            ));
        }
        if !(0.0..=1.0).contains(&self.region_garbage_rate_threshold)
            || !(0.0..=1.0).contains(&self.heap_usage_threshold)
            || self.promotion_region_alive_rate < 0.0
        {
            return Err(GcError::InvalidSettings(
                "rates must be fractions between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    /// Number of worker threads actually used.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers_count.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(GcSettings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_region_size() {
        let settings = GcSettings {
            region_size: 300 * 1024,
            ..GcSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(GcError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_rejects_young_larger_than_heap() {
        let settings = GcSettings {
            extend_heap: false,
            young_size: DEFAULT_INIT_HEAP_SIZE,
            ..GcSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_rates() {
        let settings = GcSettings {
            region_garbage_rate_threshold: 1.5,
            ..GcSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
