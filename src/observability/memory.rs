//! Memory Pressure Guard
//!
//! Samples the process RSS against total system memory. The primary's
//! health loop refreshes the sample; the write path only consults the
//! cached flag, so no sampling happens per request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sysinfo::{get_current_pid, Pid, System};
use tracing::warn;

/// Refused-writes threshold as a percentage of total memory.
pub struct MemoryGuard {
    threshold_percent: f64,
    over: AtomicBool,
    sampler: Mutex<Sampler>,
}

struct Sampler {
    system: System,
    pid: Option<Pid>,
}

impl MemoryGuard {
    pub fn new(threshold_percent: f64) -> Self {
        let pid = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "cannot resolve own pid, memory guard disabled");
                None
            }
        };
        Self {
            threshold_percent,
            over: AtomicBool::new(false),
            sampler: Mutex::new(Sampler {
                system: System::new(),
                pid,
            }),
        }
    }

    /// Re-sample RSS and total memory, updating the cached flag.
    pub fn refresh(&self) {
        let mut sampler = match self.sampler.lock() {
            Ok(sampler) => sampler,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(pid) = sampler.pid else { return };
        sampler.system.refresh_memory();
        sampler.system.refresh_process(pid);
        let total = sampler.system.total_memory();
        if total == 0 {
            return;
        }
        let rss = sampler
            .system
            .process(pid)
            .map(|process| process.memory())
            .unwrap_or(0);
        let percent = rss as f64 / total as f64 * 100.0;
        let over = percent > self.threshold_percent;
        if over && !self.over.load(Ordering::Relaxed) {
            warn!(
                rss_percent = percent,
                threshold_percent = self.threshold_percent,
                "memory pressure, refusing writes"
            );
        }
        self.over.store(over, Ordering::Relaxed);
    }

    /// Whether writes must currently be refused.
    pub fn is_over_threshold(&self) -> bool {
        self.over.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_threshold_never_trips() {
        let guard = MemoryGuard::new(100.0);
        guard.refresh();
        assert!(!guard.is_over_threshold());
    }

    #[test]
    fn test_zero_threshold_trips_after_refresh() {
        let guard = MemoryGuard::new(0.0);
        assert!(!guard.is_over_threshold());
        guard.refresh();
        assert!(guard.is_over_threshold());
    }
}
