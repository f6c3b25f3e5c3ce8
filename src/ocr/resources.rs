//! Adaptive worker sizing from sampled system load.
//!
//! The controller reads CPU and memory usage through a [`ResourceProbe`],
//! caches the sample behind a short TTL, and computes the worker count for
//! the next OCR batch: exceeding either ceiling halves the count (minimum 1)
//! and asks dispatch to pause briefly; dropping back below restores the
//! configured size.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Point-in-time system load.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Probe backed by `sysinfo`. CPU usage needs two refreshes a beat apart.
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        std::thread::sleep(Duration::from_millis(100));
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory_percent = if total > 0 {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };
        ResourceSample {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }
}

/// Sizing decision for the next batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlan {
    pub workers: usize,
    /// Pause dispatch for this long before handing out the batch.
    pub backoff: Option<Duration>,
}

struct ControllerState {
    cached: Option<(Instant, ResourceSample)>,
    effective: usize,
}

pub struct ResourceController {
    probe: Box<dyn ResourceProbe>,
    cpu_ceiling: f32,
    memory_ceiling: f32,
    max_workers: usize,
    cache_ttl: Duration,
    backoff: Duration,
    state: Mutex<ControllerState>,
}

impl ResourceController {
    pub fn new(
        probe: Box<dyn ResourceProbe>,
        cpu_ceiling: f32,
        memory_ceiling: f32,
        max_workers: usize,
    ) -> Self {
        Self {
            probe,
            cpu_ceiling,
            memory_ceiling,
            max_workers: max_workers.max(1),
            cache_ttl: Duration::from_secs(3),
            backoff: Duration::from_millis(500),
            state: Mutex::new(ControllerState {
                cached: None,
                effective: max_workers.max(1),
            }),
        }
    }

    /// Compute the worker count for the next batch.
    pub fn next_batch(&self) -> BatchPlan {
        let sample = self.current_sample();
        let mut state = self.state.lock().unwrap();
        let over = sample.cpu_percent > self.cpu_ceiling
            || sample.memory_percent > self.memory_ceiling;
        if over {
            state.effective = (state.effective / 2).max(1);
            BatchPlan {
                workers: state.effective,
                backoff: Some(self.backoff),
            }
        } else {
            state.effective = self.max_workers;
            BatchPlan {
                workers: state.effective,
                backoff: None,
            }
        }
    }

    fn current_sample(&self) -> ResourceSample {
        {
            let state = self.state.lock().unwrap();
            if let Some((taken, sample)) = state.cached {
                if taken.elapsed() < self.cache_ttl {
                    return sample;
                }
            }
        }
        // Sampling sleeps ~100ms, so it happens outside the lock.
        let sample = self.probe.sample();
        let mut state = self.state.lock().unwrap();
        state.cached = Some((Instant::now(), sample));
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedProbe {
        cpu: AtomicU32,
        memory: AtomicU32,
        calls: AtomicU32,
    }

    impl FixedProbe {
        fn new(cpu: f32, memory: f32) -> Self {
            Self {
                cpu: AtomicU32::new(cpu as u32),
                memory: AtomicU32::new(memory as u32),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl ResourceProbe for FixedProbe {
        fn sample(&self) -> ResourceSample {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResourceSample {
                cpu_percent: self.cpu.load(Ordering::SeqCst) as f32,
                memory_percent: self.memory.load(Ordering::SeqCst) as f32,
            }
        }
    }

    #[test]
    fn below_ceiling_keeps_configured_size() {
        let controller =
            ResourceController::new(Box::new(FixedProbe::new(10.0, 20.0)), 75.0, 85.0, 4);
        let plan = controller.next_batch();
        assert_eq!(plan.workers, 4);
        assert!(plan.backoff.is_none());
    }

    #[test]
    fn over_ceiling_halves_down_to_one() {
        let controller =
            ResourceController::new(Box::new(FixedProbe::new(95.0, 20.0)), 75.0, 85.0, 4);
        assert_eq!(controller.next_batch().workers, 2);
        assert_eq!(controller.next_batch().workers, 1);
        let plan = controller.next_batch();
        assert_eq!(plan.workers, 1);
        assert!(plan.backoff.is_some());
    }

    #[test]
    fn memory_pressure_also_halves() {
        let controller =
            ResourceController::new(Box::new(FixedProbe::new(10.0, 99.0)), 75.0, 85.0, 4);
        assert_eq!(controller.next_batch().workers, 2);
    }

    struct SharedProbe(std::sync::Arc<FixedProbe>);

    impl ResourceProbe for SharedProbe {
        fn sample(&self) -> ResourceSample {
            self.0.sample()
        }
    }

    #[test]
    fn recovery_restores_configured_size() {
        let probe = std::sync::Arc::new(FixedProbe::new(95.0, 20.0));
        let controller = ResourceController::new(
            Box::new(SharedProbe(probe.clone())),
            75.0,
            85.0,
            4,
        );
        assert_eq!(controller.next_batch().workers, 2);

        // Load falls back under the ceiling; expire the cache so the next
        // batch sees the calm sample.
        probe.cpu.store(10, Ordering::SeqCst);
        controller.state.lock().unwrap().cached = None;
        assert_eq!(controller.next_batch().workers, 4);
    }

    #[test]
    fn samples_are_cached_behind_ttl() {
        let probe = std::sync::Arc::new(FixedProbe::new(10.0, 20.0));
        let controller =
            ResourceController::new(Box::new(SharedProbe(probe.clone())), 75.0, 85.0, 4);
        let _ = controller.next_batch();
        let _ = controller.next_batch();
        let _ = controller.next_batch();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
