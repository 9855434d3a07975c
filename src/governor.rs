//! Memory instrumentation and scoped cache release.
//!
//! Large buffers in this crate are plain owned values and are freed when
//! their scope ends. What is left here is observability (resident-memory
//! samples around each stage) and returning pooled accelerator memory when
//! a top-level entry point exits. Neither ever changes the outcome of a call.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DEFAULT_MEMORY_CEILING_MB;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// How many recent samples a governor keeps.
pub const DEFAULT_RETAINED_SAMPLES: usize = 64;

/// Reports resident set size.
pub trait MemoryProbe: Send + Sync {
    fn resident_mb(&self) -> Option<f64>;
}

/// Resident set size of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_mb(&self) -> Option<f64> {
        memory_stats::memory_stats().map(|stats| stats.physical_mem as f64 / BYTES_PER_MB)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Start,
    End,
}

/// A resident-memory reading tagged with the stage it was taken at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub stage: &'static str,
    pub phase: StagePhase,
    pub resident_mb: f64,
}

impl fmt::Display for MemorySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            StagePhase::Start => "start",
            StagePhase::End => "end",
        };
        write!(f, "{}:{phase}", self.stage)
    }
}

#[derive(Debug, Default)]
struct SampleLog {
    recent: VecDeque<MemorySample>,
    peak_mb: Option<f64>,
}

pub struct ResourceGovernor {
    probe: Box<dyn MemoryProbe>,
    ceiling_mb: f64,
    retained: usize,
    log: Mutex<SampleLog>,
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new(Box::new(ProcessMemoryProbe), DEFAULT_MEMORY_CEILING_MB)
    }
}

impl ResourceGovernor {
    pub fn new(probe: Box<dyn MemoryProbe>, ceiling_mb: f64) -> Self {
        Self {
            probe,
            ceiling_mb,
            retained: DEFAULT_RETAINED_SAMPLES,
            log: Mutex::new(SampleLog::default()),
        }
    }

    /// Keep at most `retained` recent samples (at least one).
    pub fn with_retained(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    pub fn ceiling_mb(&self) -> f64 {
        self.ceiling_mb
    }

    /// Take and record one sample. Returns `None` when the probe has no reading.
    pub fn sample(&self, stage: &'static str, phase: StagePhase) -> Option<f64> {
        let resident_mb = self.probe.resident_mb()?;
        let sample = MemorySample {
            stage,
            phase,
            resident_mb,
        };
        if resident_mb > self.ceiling_mb {
            warn!(
                stage = %sample,
                resident_mb,
                ceiling_mb = self.ceiling_mb,
                "resident memory above ceiling"
            );
        }

        let mut log = self.log.lock();
        if log.recent.len() >= self.retained {
            log.recent.pop_front();
        }
        log.recent.push_back(sample);
        log.peak_mb = Some(log.peak_mb.map_or(resident_mb, |peak| peak.max(resident_mb)));
        Some(resident_mb)
    }

    /// The most recent samples, oldest first.
    pub fn samples(&self) -> Vec<MemorySample> {
        self.log.lock().recent.iter().copied().collect()
    }

    /// Highest reading since construction, including evicted samples.
    pub fn peak_mb(&self) -> Option<f64> {
        self.log.lock().peak_mb
    }

    /// Sample now and again when the returned scope is dropped.
    pub fn stage(&self, label: &'static str) -> StageScope<'_> {
        let before = self.sample(label, StagePhase::Start);
        StageScope {
            governor: self,
            label,
            before,
        }
    }
}

/// Samples memory again on drop, whichever way the stage exits.
pub struct StageScope<'a> {
    governor: &'a ResourceGovernor,
    label: &'static str,
    before: Option<f64>,
}

impl Drop for StageScope<'_> {
    fn drop(&mut self) {
        let after = self.governor.sample(self.label, StagePhase::End);
        if let (Some(before), Some(after)) = (self.before, after) {
            debug!(
                stage = self.label,
                before_mb = before,
                after_mb = after,
                delta_mb = after - before,
                "stage memory"
            );
        }
    }
}

/// Anything that may hold pooled memory it can hand back.
pub trait ReleaseCache {
    fn release_cache(&self) {}
}

/// Calls `release_cache` on drop, so every exit path returns pooled memory.
pub struct CacheRelease<'a> {
    target: &'a dyn ReleaseCache,
}

impl<'a> CacheRelease<'a> {
    pub fn new(target: &'a dyn ReleaseCache) -> Self {
        Self { target }
    }
}

impl Drop for CacheRelease<'_> {
    fn drop(&mut self) {
        self.target.release_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(f64);

    impl MemoryProbe for FixedProbe {
        fn resident_mb(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    struct Counter(AtomicUsize);

    impl ReleaseCache for Counter {
        fn release_cache(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stage_scope_samples_on_both_ends() {
        let governor = ResourceGovernor::new(Box::new(FixedProbe(120.0)), 500.0);
        {
            let _scope = governor.stage("segment");
        }
        let stages: Vec<_> = governor.samples().iter().map(|s| s.to_string()).collect();
        assert_eq!(stages, vec!["segment:start", "segment:end"]);
        assert_eq!(governor.peak_mb(), Some(120.0));
    }

    #[test]
    fn test_stage_scope_samples_on_early_return() {
        fn failing(governor: &ResourceGovernor) -> Result<(), ()> {
            let _scope = governor.stage("classify");
            Err(())
        }
        let governor = ResourceGovernor::new(Box::new(FixedProbe(900.0)), 500.0);
        assert!(failing(&governor).is_err());
        assert_eq!(governor.samples().len(), 2);
    }

    struct CountingProbe(AtomicUsize);

    impl MemoryProbe for CountingProbe {
        fn resident_mb(&self) -> Option<f64> {
            Some(self.0.fetch_add(1, Ordering::SeqCst) as f64)
        }
    }

    #[test]
    fn test_sample_log_is_bounded() {
        let governor =
            ResourceGovernor::new(Box::new(CountingProbe(AtomicUsize::new(0))), 1e9)
                .with_retained(8);
        for _ in 0..100 {
            let _scope = governor.stage("segment");
        }

        let samples = governor.samples();
        assert_eq!(samples.len(), 8);
        assert_eq!(samples.last().map(|s| s.resident_mb), Some(199.0));
        assert_eq!(samples[0].phase, StagePhase::Start);
        assert_eq!(governor.peak_mb(), Some(199.0));
    }

    struct ScriptedProbe(Mutex<Vec<f64>>);

    impl MemoryProbe for ScriptedProbe {
        fn resident_mb(&self) -> Option<f64> {
            self.0.lock().pop()
        }
    }

    #[test]
    fn test_peak_survives_eviction() {
        let probe = ScriptedProbe(Mutex::new(vec![10.0, 90.0]));
        let governor = ResourceGovernor::new(Box::new(probe), 500.0).with_retained(1);
        governor.sample("classify", StagePhase::Start);
        governor.sample("classify", StagePhase::End);

        assert_eq!(governor.samples().len(), 1);
        assert_eq!(governor.samples()[0].resident_mb, 10.0);
        assert_eq!(governor.peak_mb(), Some(90.0));
        assert_eq!(governor.sample("classify", StagePhase::End), None);
    }

    #[test]
    fn test_cache_release_runs_on_drop() {
        let counter = Counter(AtomicUsize::new(0));
        {
            let _guard = CacheRelease::new(&counter);
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process_probe_reports_something() {
        if let Some(mb) = ProcessMemoryProbe.resident_mb() {
            assert!(mb > 0.0);
        }
    }
}
