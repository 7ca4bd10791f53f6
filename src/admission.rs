#![forbid(unsafe_code)]

//! Admission control: per-client sliding-window rate limiting plus a memory
//! health gate. `admit` never awaits; it only takes short mutex sections.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub memory_threshold_bytes: u64,
    pub memory_threshold_percent: f32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 100,
            memory_threshold_bytes: 400 * MIB,
            memory_threshold_percent: 85.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    RateLimited { retry_after: Duration },
    Overloaded { detail: String },
}

impl From<RejectReason> for FetchError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::RateLimited { retry_after } => FetchError::RateLimited { retry_after },
            RejectReason::Overloaded { detail } => FetchError::Overloaded(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Reject(RejectReason),
}

/// Point-in-time memory reading.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemorySnapshot {
    pub process_bytes: u64,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
}

impl MemorySnapshot {
    pub fn system_percent(&self) -> f32 {
        if self.system_total_bytes == 0 {
            return 0.0;
        }
        (self.system_used_bytes as f64 / self.system_total_bytes as f64 * 100.0) as f32
    }

    pub fn process_mb(&self) -> u64 {
        self.process_bytes / MIB
    }
}

/// Source of memory readings. Tests substitute fixed values.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemorySnapshot;
}

/// `sysinfo`-backed probe. Refreshing reads `/proc`, so a sample is reused
/// for `refresh_every` before the next refresh.
pub struct SysinfoProbe {
    state: Mutex<SysinfoState>,
    refresh_every: Duration,
}

struct SysinfoState {
    system: System,
    pid: Option<sysinfo::Pid>,
    last: Option<(Instant, MemorySnapshot)>,
}

impl SysinfoProbe {
    pub fn new(refresh_every: Duration) -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|err| warn!(%err, "cannot determine own pid; process memory reads as 0"))
            .ok();
        Self {
            state: Mutex::new(SysinfoState {
                system: System::new(),
                pid,
                last: None,
            }),
            refresh_every,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl MemoryProbe for SysinfoProbe {
    fn sample(&self) -> MemorySnapshot {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some((taken, snapshot)) = state.last
            && now.duration_since(taken) < self.refresh_every
        {
            return snapshot;
        }

        state.system.refresh_memory();
        let process_bytes = match state.pid {
            Some(pid) => {
                state
                    .system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                state
                    .system
                    .process(pid)
                    .map(|process| process.memory())
                    .unwrap_or(0)
            }
            None => 0,
        };
        let snapshot = MemorySnapshot {
            process_bytes,
            system_used_bytes: state.system.used_memory(),
            system_total_bytes: state.system.total_memory(),
        };
        state.last = Some((now, snapshot));
        snapshot
    }
}

/// Admission timestamps of a single client, oldest first.
#[derive(Debug, Default)]
struct RateLimitWindow {
    hits: VecDeque<Instant>,
}

impl RateLimitWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct AdmissionController {
    config: AdmissionConfig,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
    probe: Box<dyn MemoryProbe>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            probe,
        }
    }

    /// Decides whether a request may enter the queues. Only allowed requests
    /// are recorded in the client's window.
    pub fn admit(&self, client_id: &str, estimated_cost: usize) -> Admission {
        let now = Instant::now();
        let window = self.config.rate_limit_window;
        let cost = estimated_cost.max(1);
        // Sampling may refresh from /proc; keep that out of the client lock.
        let overload = self.overload_detail();

        let mut windows = self.windows.lock();
        let entry = windows.entry(client_id.to_string()).or_default();
        entry.prune(now, window);
        if entry.hits.len() + cost > self.config.rate_limit_max {
            let retry_after = entry
                .hits
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            debug!(client = client_id, retry_after_secs = retry_after.as_secs(), "rate limited");
            return Admission::Reject(RejectReason::RateLimited { retry_after });
        }

        if let Some(detail) = overload {
            warn!(client = client_id, %detail, "rejecting request under memory pressure");
            return Admission::Reject(RejectReason::Overloaded { detail });
        }

        entry.hits.extend(std::iter::repeat_n(now, cost));
        Admission::Allow
    }

    /// Describes why the process counts as overloaded, if it does.
    pub fn overload_detail(&self) -> Option<String> {
        let snapshot = self.probe.sample();
        if snapshot.process_bytes > self.config.memory_threshold_bytes {
            return Some(format!(
                "process memory {} MiB exceeds {} MiB",
                snapshot.process_mb(),
                self.config.memory_threshold_bytes / MIB
            ));
        }
        let percent = snapshot.system_percent();
        if percent > self.config.memory_threshold_percent {
            return Some(format!(
                "system memory at {percent:.1}% exceeds {:.1}%",
                self.config.memory_threshold_percent
            ));
        }
        None
    }

    pub fn memory(&self) -> MemorySnapshot {
        self.probe.sample()
    }

    /// Prunes every window and forgets clients with no recent requests.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.config.rate_limit_window;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, entry| {
            entry.prune(now, window);
            !entry.hits.is_empty()
        });
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    };

    /// Probe with an adjustable process footprint.
    #[derive(Clone, Default)]
    pub(crate) struct FixedProbe {
        pub process_bytes: Arc<AtomicU64>,
    }

    impl MemoryProbe for FixedProbe {
        fn sample(&self) -> MemorySnapshot {
            MemorySnapshot {
                process_bytes: self.process_bytes.load(Ordering::Relaxed),
                system_used_bytes: 4 * 1024 * MIB,
                system_total_bytes: 16 * 1024 * MIB,
            }
        }
    }

    fn controller(max: usize, probe: FixedProbe) -> AdmissionController {
        AdmissionController::new(
            AdmissionConfig {
                rate_limit_window: Duration::from_secs(60),
                rate_limit_max: max,
                ..AdmissionConfig::default()
            },
            Box::new(probe),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn window_rejects_then_recovers() {
        let admission = controller(3, FixedProbe::default());
        for _ in 0..3 {
            assert_eq!(admission.admit("1.2.3.4", 1), Admission::Allow);
        }
        tokio::time::advance(Duration::from_secs(20)).await;
        match admission.admit("1.2.3.4", 1) {
            Admission::Reject(RejectReason::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Other clients have their own window.
        assert_eq!(admission.admit("5.6.7.8", 1), Admission::Allow);

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(admission.admit("1.2.3.4", 1), Admission::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_do_not_consume_budget() {
        let admission = controller(2, FixedProbe::default());
        assert_eq!(admission.admit("c", 1), Admission::Allow);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(admission.admit("c", 1), Admission::Allow);
        for _ in 0..5 {
            assert!(matches!(admission.admit("c", 1), Admission::Reject(_)));
        }
        // Only the first admission has aged out; the rejections left no trace.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(admission.admit("c", 1), Admission::Allow);
    }

    #[test]
    fn cost_counts_against_the_window() {
        let admission = controller(3, FixedProbe::default());
        assert_eq!(admission.admit("c", 2), Admission::Allow);
        assert!(matches!(
            admission.admit("c", 2),
            Admission::Reject(RejectReason::RateLimited { .. })
        ));
        assert_eq!(admission.admit("c", 1), Admission::Allow);
    }

    #[test]
    fn memory_pressure_rejects_everyone() {
        let probe = FixedProbe::default();
        let admission = controller(100, probe.clone());
        assert_eq!(admission.admit("c", 1), Admission::Allow);

        probe.process_bytes.store(512 * MIB, Ordering::Relaxed);
        match admission.admit("c", 1) {
            Admission::Reject(RejectReason::Overloaded { detail }) => {
                assert!(detail.contains("512 MiB"));
            }
            other => panic!("unexpected {other:?}"),
        }

        probe.process_bytes.store(10 * MIB, Ordering::Relaxed);
        assert_eq!(admission.admit("c", 1), Admission::Allow);
    }

    #[test]
    fn system_percentage_threshold_applies() {
        struct Busy;
        impl MemoryProbe for Busy {
            fn sample(&self) -> MemorySnapshot {
                MemorySnapshot {
                    process_bytes: MIB,
                    system_used_bytes: 95,
                    system_total_bytes: 100,
                }
            }
        }
        let admission = AdmissionController::new(AdmissionConfig::default(), Box::new(Busy));
        assert!(admission.overload_detail().unwrap().contains("95.0%"));
    }

    #[test]
    fn memory_is_sampled_outside_the_client_lock() {
        #[derive(Default)]
        struct Observed {
            controller: OnceLock<Weak<AdmissionController>>,
            lock_free: AtomicBool,
        }
        struct Watching(Arc<Observed>);
        impl MemoryProbe for Watching {
            fn sample(&self) -> MemorySnapshot {
                if let Some(controller) = self.0.controller.get().and_then(Weak::upgrade) {
                    let free = controller.windows.try_lock().is_some();
                    self.0.lock_free.store(free, Ordering::SeqCst);
                }
                MemorySnapshot::default()
            }
        }

        let observed = Arc::new(Observed::default());
        let admission = Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            Box::new(Watching(observed.clone())),
        ));
        observed
            .controller
            .set(Arc::downgrade(&admission))
            .unwrap_or_else(|_| panic!("controller set twice"));

        assert_eq!(admission.admit("c", 1), Admission::Allow);
        assert!(observed.lock_free.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_idle_clients() {
        let admission = controller(10, FixedProbe::default());
        admission.admit("a", 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        admission.admit("b", 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(admission.sweep(), 1);
        assert_eq!(admission.tracked_clients(), 1);
    }

    #[test]
    fn sysinfo_probe_reports_nonzero_totals() {
        let probe = SysinfoProbe::default();
        let snapshot = probe.sample();
        assert!(snapshot.system_total_bytes > 0);
    }
}
