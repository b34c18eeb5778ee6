//! Process memory guard.
//!
//! Samples the resident set size of the current process and flushes the
//! response cache when it crosses `high_water_ratio × ceiling_bytes`. This is
//! a reactive safety valve: it never throttles writes, it only frees memory
//! after the fact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MemorySettings;
use crate::error::CacheResult;
use crate::invalidation::CacheInvalidator;
use crate::metrics;

/// Reason passed to `clear_all` when memory crosses the high-water mark.
pub const MEMORY_PRESSURE_REASON: &str = "memory pressure";

/// Source of resident memory readings.
pub trait MemorySampler: Send + Sync {
    /// Resident bytes of the process, or `None` if unavailable.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the current process RSS through `sysinfo`.
pub struct ProcessMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemorySampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot determine current pid, memory guard disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    resident_bytes: Option<u64>,
}

/// Latest memory guard reading, for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReading {
    pub resident_bytes: Option<u64>,
    pub ceiling_bytes: u64,
    pub high_water_bytes: u64,
    pub under_pressure: bool,
    pub sample_age_ms: Option<u64>,
    pub pressure_clears: u64,
}

pub struct MemoryGuard {
    sampler: Box<dyn MemorySampler>,
    ceiling_bytes: u64,
    high_water_bytes: u64,
    check_interval: Duration,
    min_sample_interval: Duration,
    last: Mutex<Option<Sample>>,
    pressure_clears: AtomicU64,
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("ceiling_bytes", &self.ceiling_bytes)
            .field("high_water_bytes", &self.high_water_bytes)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl MemoryGuard {
    /// Guard sampling the current process.
    pub fn new(settings: &MemorySettings) -> CacheResult<Self> {
        Self::with_sampler(settings, Box::new(ProcessMemorySampler::new()))
    }

    pub fn with_sampler(
        settings: &MemorySettings,
        sampler: Box<dyn MemorySampler>,
    ) -> CacheResult<Self> {
        settings.validate()?;
        let high_water_bytes = (settings.ceiling_bytes as f64 * settings.high_water_ratio) as u64;
        Ok(Self {
            sampler,
            ceiling_bytes: settings.ceiling_bytes,
            high_water_bytes,
            check_interval: settings.check_interval(),
            min_sample_interval: settings.min_sample_interval(),
            last: Mutex::new(None),
            pressure_clears: AtomicU64::new(0),
        })
    }

    pub fn high_water_bytes(&self) -> u64 {
        self.high_water_bytes
    }

    /// Takes a fresh sample.
    pub fn sample(&self) -> Option<u64> {
        let resident_bytes = self.sampler.resident_bytes();
        if let Some(bytes) = resident_bytes {
            metrics::set_resident_memory(bytes);
        }
        *self.last.lock() = Some(Sample {
            at: Instant::now(),
            resident_bytes,
        });
        resident_bytes
    }

    /// Whether resident memory is above the high-water mark. Reuses the last
    /// sample when it is younger than `min_sample_interval`, so this is cheap
    /// enough for the write path.
    pub fn is_under_pressure(&self) -> bool {
        let recent = (*self.last.lock())
            .filter(|sample| sample.at.elapsed() < self.min_sample_interval);
        let resident = match recent {
            Some(sample) => sample.resident_bytes,
            None => self.sample(),
        };
        self.exceeds(resident)
    }

    /// Flushes `cache` if under pressure, using the rate-limited reading.
    pub fn relieve_if_needed(&self, cache: &dyn CacheInvalidator) -> bool {
        if !self.is_under_pressure() {
            return false;
        }
        self.relieve(cache);
        true
    }

    /// Takes a fresh sample and flushes `cache` if it is over the mark.
    pub fn check_and_relieve(&self, cache: &dyn CacheInvalidator) -> bool {
        let resident = self.sample();
        if !self.exceeds(resident) {
            return false;
        }
        self.relieve(cache);
        true
    }

    pub fn reading(&self) -> MemoryReading {
        let last = *self.last.lock();
        let resident_bytes = last.and_then(|s| s.resident_bytes);
        MemoryReading {
            resident_bytes,
            ceiling_bytes: self.ceiling_bytes,
            high_water_bytes: self.high_water_bytes,
            under_pressure: self.exceeds(resident_bytes),
            sample_age_ms: last.map(|s| s.at.elapsed().as_millis() as u64),
            pressure_clears: self.pressure_clears.load(Ordering::Relaxed),
        }
    }

    /// Spawns the periodic check.
    pub fn spawn(
        self: Arc<Self>,
        cache: Arc<dyn CacheInvalidator>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                ceiling_bytes = self.ceiling_bytes,
                high_water_bytes = self.high_water_bytes,
                interval_secs = self.check_interval.as_secs(),
                "Memory guard started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.check_and_relieve(cache.as_ref());
                    }
                }
            }

            tracing::info!("Memory guard stopped");
        })
    }

    fn exceeds(&self, resident: Option<u64>) -> bool {
        resident.is_some_and(|bytes| bytes > self.high_water_bytes)
    }

    fn relieve(&self, cache: &dyn CacheInvalidator) {
        let removed = cache.clear_all(MEMORY_PRESSURE_REASON);
        self.pressure_clears.fetch_add(1, Ordering::Relaxed);
        metrics::record_memory_pressure_clear();
        tracing::warn!(
            high_water_bytes = self.high_water_bytes,
            removed,
            "Memory above high-water mark, response cache flushed"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::invalidation::KeyPattern;

    /// Sampler returning whatever the test stores in it.
    #[derive(Clone, Default)]
    pub(crate) struct FixedSampler(pub Arc<AtomicU64>);

    impl FixedSampler {
        pub(crate) fn set(&self, bytes: u64) {
            self.0.store(bytes, Ordering::Relaxed);
        }
    }

    impl MemorySampler for FixedSampler {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    #[derive(Default)]
    struct CountingCache {
        clears: Mutex<Vec<String>>,
    }

    impl CacheInvalidator for CountingCache {
        fn clear_by_table(
            &self,
            _table: &str,
            _record_id: Option<&str>,
            _patterns: Option<&[KeyPattern]>,
        ) -> usize {
            0
        }

        fn clear_all(&self, reason: &str) -> usize {
            self.clears.lock().push(reason.to_string());
            7
        }
    }

    pub(crate) fn settings(min_sample_interval_ms: u64) -> MemorySettings {
        MemorySettings {
            ceiling_bytes: 1000,
            high_water_ratio: 0.8,
            check_interval_secs: 1,
            min_sample_interval_ms,
        }
    }

    #[test]
    fn test_guard_requires_ceiling() {
        let result = MemoryGuard::with_sampler(
            &MemorySettings::default(),
            Box::new(FixedSampler::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pressure_threshold() {
        let sampler = FixedSampler::default();
        let guard = MemoryGuard::with_sampler(&settings(0), Box::new(sampler.clone())).unwrap();
        assert_eq!(guard.high_water_bytes(), 800);

        sampler.set(800);
        assert!(!guard.is_under_pressure());
        sampler.set(801);
        assert!(guard.is_under_pressure());
    }

    #[test]
    fn test_write_path_reuses_recent_sample() {
        let sampler = FixedSampler::default();
        let guard =
            MemoryGuard::with_sampler(&settings(60_000), Box::new(sampler.clone())).unwrap();

        sampler.set(100);
        assert!(!guard.is_under_pressure());
        // Within the sampling interval the old reading is still used.
        sampler.set(900);
        assert!(!guard.is_under_pressure());
        // A forced sample sees the new value.
        assert_eq!(guard.sample(), Some(900));
        assert!(guard.is_under_pressure());
    }

    #[test]
    fn test_check_and_relieve_clears_cache() {
        let sampler = FixedSampler::default();
        let guard = MemoryGuard::with_sampler(&settings(0), Box::new(sampler.clone())).unwrap();
        let cache = CountingCache::default();

        sampler.set(10);
        assert!(!guard.check_and_relieve(&cache));
        assert!(cache.clears.lock().is_empty());

        sampler.set(999);
        assert!(guard.check_and_relieve(&cache));
        assert_eq!(cache.clears.lock().as_slice(), [MEMORY_PRESSURE_REASON]);

        let reading = guard.reading();
        assert_eq!(reading.resident_bytes, Some(999));
        assert!(reading.under_pressure);
        assert_eq!(reading.pressure_clears, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_runs_until_cancelled() {
        let sampler = FixedSampler::default();
        sampler.set(999);
        let guard =
            Arc::new(MemoryGuard::with_sampler(&settings(0), Box::new(sampler.clone())).unwrap());
        let cache = Arc::new(CountingCache::default());
        let cancel = CancellationToken::new();

        let handle = Arc::clone(&guard).spawn(cache.clone(), cancel.clone());

        // First tick fires immediately, then once per second.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(cache.clears.lock().len(), 3);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(guard.reading().pressure_clears, 3);
    }
}
