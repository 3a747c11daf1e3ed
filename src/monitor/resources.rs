//! Host resource sampling for the memory and CPU alert rules.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// One reading of process resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU usage since the previous sample, in percent of one core.
    pub cpu_percent: f64,
}

/// Source of resource readings.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Samples the current process from `/proc` on Linux; reports zeros
/// elsewhere.
///
/// CPU usage is the delta of user+system ticks between two consecutive
/// samples, so the first sample always reports 0%.
#[derive(Debug, Default)]
pub struct ProcessSampler {
    last_cpu: Mutex<Option<(Instant, u64)>>,
}

/// Kernel clock ticks per second (`CLK_TCK`), 100 on every mainstream Linux.
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

impl ProcessSampler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn memory_mb() -> f64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_rss_kb(&status))
            .map_or(0.0, |kb| kb as f64 / 1024.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn memory_mb() -> f64 {
        0.0
    }

    #[cfg(target_os = "linux")]
    fn cpu_ticks() -> Option<u64> {
        std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|stat| parse_cpu_ticks(&stat))
    }

    #[cfg(target_os = "linux")]
    fn cpu_percent(&self) -> f64 {
        let Some(ticks) = Self::cpu_ticks() else {
            return 0.0;
        };
        let now = Instant::now();

        let mut last = self.last_cpu.lock().expect("lock not poisoned");
        let percent = match *last {
            Some((at, prev)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    ticks.saturating_sub(prev) as f64 / CLOCK_TICKS_PER_SEC / elapsed * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, ticks));
        percent
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_percent(&self) -> f64 {
        0.0
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            memory_mb: Self::memory_mb(),
            cpu_percent: self.cpu_percent(),
        }
    }
}

/// Sampler that returns a fixed, adjustable reading.
#[derive(Debug, Default)]
pub struct StaticSampler {
    sample: Mutex<ResourceSample>,
}

impl StaticSampler {
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        Self {
            sample: Mutex::new(ResourceSample {
                memory_mb,
                cpu_percent,
            }),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock().expect("lock not poisoned") = sample;
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> ResourceSample {
        *self.sample.lock().expect("lock not poisoned")
    }
}

/// `VmRSS` value in kB from `/proc/<pid>/status`.
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// `utime + stime` from `/proc/<pid>/stat`.
///
/// The command name may contain spaces, so fields are counted from the last
/// closing parenthesis: field 3 (state) is index 0, utime (14) is index 11.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}
