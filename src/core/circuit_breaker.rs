use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker configuration. `0` thresholds are invalid and rejected
/// by `GatewayConfig::validate` — there is always at least one failure to
/// trip on.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_secs: 30,
        }
    }
}

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-backend granularity — each tool server gets its own breaker, so an
/// unhealthy backend is isolated without affecting calls routed elsewhere.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<BackendBreaker>>,
}

struct BackendBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    /// True while a half-open probe has been admitted and not yet
    /// resolved by `record_success`/`record_failure` — guards against
    /// admitting more than one probe per half-open window.
    probe_in_flight: AtomicBool,
    opened_at: std::sync::Mutex<Option<Instant>>,
    total_failures: AtomicU32,
    total_successes: AtomicU32,
    total_rejections: AtomicU32,
    config: CircuitBreakerConfig,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the circuit breaker before a request.
#[derive(Debug, PartialEq, Eq)]
pub enum BreakerCheck {
    Allowed,
    Probe,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    pub failures: u32,
    pub successes: u32,
    pub rejections: u32,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        CircuitBreakerRegistry {
            breakers: DashMap::new(),
        }
    }

    pub fn check(&self, backend: &str, config: &CircuitBreakerConfig) -> BreakerCheck {
        let breaker = self.get_or_create(backend, config);
        let result = breaker.check();
        if result == BreakerCheck::Rejected {
            breaker.total_rejections.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn record_success(&self, backend: &str, config: &CircuitBreakerConfig) {
        let breaker = self.get_or_create(backend, config);
        breaker.total_successes.fetch_add(1, Ordering::Relaxed);
        breaker.record_success();
    }

    pub fn record_failure(&self, backend: &str, config: &CircuitBreakerConfig) {
        let breaker = self.get_or_create(backend, config);
        breaker.total_failures.fetch_add(1, Ordering::Relaxed);
        breaker.record_failure();
    }

    pub fn is_open(&self, backend: &str, config: &CircuitBreakerConfig) -> bool {
        let breaker = self.get_or_create(backend, config);
        let state = breaker.state.load(Ordering::Acquire);
        if state == STATE_OPEN {
            let opened_at = breaker.opened_at.lock().unwrap();
            if let Some(at) = *opened_at {
                if at.elapsed() >= Duration::from_secs(config.open_duration_secs) {
                    return false;
                }
            }
            return true;
        }
        false
    }

    pub fn stats(&self, backend: &str) -> Option<BreakerStats> {
        self.breakers.get(backend).map(|b| BreakerStats {
            failures: b.total_failures.load(Ordering::Relaxed),
            successes: b.total_successes.load(Ordering::Relaxed),
            rejections: b.total_rejections.load(Ordering::Relaxed),
        })
    }

    fn get_or_create(&self, backend: &str, config: &CircuitBreakerConfig) -> Arc<BackendBreaker> {
        if let Some(entry) = self.breakers.get(backend) {
            return entry.value().clone();
        }
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| {
                Arc::new(BackendBreaker {
                    state: AtomicU8::new(STATE_CLOSED),
                    consecutive_failures: AtomicU32::new(0),
                    half_open_successes: AtomicU32::new(0),
                    probe_in_flight: AtomicBool::new(false),
                    opened_at: std::sync::Mutex::new(None),
                    total_failures: AtomicU32::new(0),
                    total_successes: AtomicU32::new(0),
                    total_rejections: AtomicU32::new(0),
                    config: config.clone(),
                })
            })
            .clone()
    }

    pub fn retain_backends(&self, active: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| active.contains(k));
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendBreaker {
    fn check(&self) -> BreakerCheck {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= Duration::from_secs(self.config.open_duration_secs) {
                        drop(opened_at);
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Relaxed);
                            self.probe_in_flight.store(true, Ordering::Release);
                            return BreakerCheck::Probe;
                        }
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => {
                // §4.7: exactly one probe in flight per half-open window —
                // concurrent callers while it's outstanding are rejected,
                // not admitted as additional probes.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
            _ => BreakerCheck::Allowed,
        }
    }

    fn record_success(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    tracing::info!("circuit_breaker: closed (recovered after {} successes)", count);
                }
                self.probe_in_flight.store(false, Ordering::Release);
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    tracing::warn!("circuit_breaker: opened (after {} consecutive failures)", count);
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                self.probe_in_flight.store(false, Ordering::Release);
                tracing::warn!("circuit_breaker: re-opened (probe failed in half-open)");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration_secs: 1,
        }
    }

    #[test]
    fn starts_closed() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = default_config();
        assert!(matches!(reg.check("search-tool", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn trips_after_failures() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = default_config();
        for _ in 0..3 {
            assert!(matches!(reg.check("search-tool", &cfg), BreakerCheck::Allowed));
            reg.record_failure("search-tool", &cfg);
        }
        assert!(matches!(reg.check("search-tool", &cfg), BreakerCheck::Rejected));
    }

    #[test]
    fn success_resets_failure_count() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = default_config();
        reg.record_failure("search-tool", &cfg);
        reg.record_failure("search-tool", &cfg);
        reg.record_success("search-tool", &cfg);
        reg.record_failure("search-tool", &cfg);
        reg.record_failure("search-tool", &cfg);
        assert!(matches!(reg.check("search-tool", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn half_open_after_timeout() {
        let reg = CircuitBreakerRegistry::new();
        let cfg_fast = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 0,
        };
        reg.record_failure("b", &cfg_fast);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(matches!(reg.check("b", &cfg_fast), BreakerCheck::Probe));
    }

    #[test]
    fn half_open_success_closes() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 0,
        };
        reg.record_failure("a", &cfg);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = reg.check("a", &cfg);
        reg.record_success("a", &cfg);
        assert!(matches!(reg.check("a", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_duration_secs: 0,
        };
        reg.record_failure("a", &cfg);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = reg.check("a", &cfg);
        reg.record_failure("a", &cfg);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(matches!(reg.check("a", &cfg), BreakerCheck::Probe));
        reg.record_success("a", &cfg);
        assert!(matches!(reg.check("a", &cfg), BreakerCheck::Probe));
        reg.record_success("a", &cfg);
        assert!(matches!(reg.check("a", &cfg), BreakerCheck::Allowed));
    }

    #[test]
    fn half_open_admits_exactly_one_concurrent_probe() {
        let reg = Arc::new(CircuitBreakerRegistry::new());
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 0,
        };
        reg.record_failure("b", &cfg);
        std::thread::sleep(std::time::Duration::from_millis(10));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                let cfg = cfg.clone();
                std::thread::spawn(move || reg.check("b", &cfg))
            })
            .collect();
        let probes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| matches!(r, BreakerCheck::Probe))
            .count();
        assert_eq!(probes, 1);
    }

    #[test]
    fn is_open_reports_current_state() {
        let reg = CircuitBreakerRegistry::new();
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_secs: 60,
        };
        assert!(!reg.is_open("a", &cfg));
        reg.record_failure("a", &cfg);
        assert!(reg.is_open("a", &cfg));
    }
}
