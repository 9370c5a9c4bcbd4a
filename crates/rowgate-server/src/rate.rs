//! Request rate counter: requests/sec and slow calls/sec.
//!
//! Counters are lock-free atomics bumped on every call; a background loop
//! converts them into per-second rates every interval and resets them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

pub struct RequestRateCounter {
    /// Requests since the last tick.
    requests: AtomicU64,
    /// Calls slower than the warning threshold since the last tick.
    slow_calls: AtomicU64,
    warning_threshold_ms: AtomicU64,
    /// Last computed rates, stored as `f64` bits.
    requests_per_second: AtomicU64,
    slow_calls_per_second: AtomicU64,
    last_tick: Mutex<Instant>,
    interval: Duration,
}

impl RequestRateCounter {
    pub fn new(interval: Duration, warning_threshold: Duration) -> Self {
        Self {
            requests: AtomicU64::new(0),
            slow_calls: AtomicU64::new(0),
            warning_threshold_ms: AtomicU64::new(warning_threshold.as_millis() as u64),
            requests_per_second: AtomicU64::new(0f64.to_bits()),
            slow_calls_per_second: AtomicU64::new(0f64.to_bits()),
            last_tick: Mutex::new(Instant::now()),
            interval,
        }
    }

    pub fn increment_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_slow_call(&self) {
        self.slow_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one completed call, flagging it slow when it took longer than
    /// the warning threshold.
    pub fn record_call(&self, elapsed: Duration) {
        self.increment_request();
        if elapsed > self.warning_threshold() {
            self.increment_slow_call();
        }
    }

    pub fn warning_threshold(&self) -> Duration {
        Duration::from_millis(self.warning_threshold_ms.load(Ordering::Relaxed))
    }

    pub fn set_warning_threshold(&self, threshold: Duration) {
        self.warning_threshold_ms
            .store(threshold.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn requests_per_second(&self) -> f64 {
        f64::from_bits(self.requests_per_second.load(Ordering::Relaxed))
    }

    pub fn slow_calls_per_second(&self) -> f64 {
        f64::from_bits(self.slow_calls_per_second.load(Ordering::Relaxed))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Convert the counters into rates over the time since the last tick,
    /// then reset them. Rates are kept until the next tick.
    pub fn tick(&self) {
        let mut last_tick = self.last_tick.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(*last_tick).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        *last_tick = now;

        let requests = self.requests.swap(0, Ordering::Relaxed);
        let slow_calls = self.slow_calls.swap(0, Ordering::Relaxed);
        let rps = requests as f64 / elapsed;
        let slow = slow_calls as f64 / elapsed;
        self.requests_per_second.store(rps.to_bits(), Ordering::Relaxed);
        self.slow_calls_per_second.store(slow.to_bits(), Ordering::Relaxed);
        debug!(requests, slow_calls, rps, "request rates updated");
    }

    /// Tick every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "request rate counter started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => self.tick(),
                _ = shutdown.changed() => {
                    info!("request rate counter shutting down");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for RequestRateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRateCounter")
            .field("interval", &self.interval)
            .field("requests_per_second", &self.requests_per_second())
            .field("slow_calls_per_second", &self.slow_calls_per_second())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counter() -> RequestRateCounter {
        RequestRateCounter::new(Duration::from_millis(2500), Duration::from_millis(60))
    }

    #[tokio::test(start_paused = true)]
    async fn tick_computes_rates_and_resets() {
        let counter = counter();
        for _ in 0..50 {
            counter.increment_request();
        }
        for _ in 0..5 {
            counter.increment_slow_call();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        counter.tick();
        assert!((counter.requests_per_second() - 10.0).abs() < 1e-9);
        assert!((counter.slow_calls_per_second() - 1.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(1)).await;
        counter.tick();
        assert_eq!(counter.requests_per_second(), 0.0);
    }

    #[test]
    fn record_call_uses_threshold() {
        let counter = counter();
        counter.record_call(Duration::from_millis(60));
        counter.record_call(Duration::from_millis(61));
        assert_eq!(counter.requests.load(Ordering::Relaxed), 2);
        assert_eq!(counter.slow_calls.load(Ordering::Relaxed), 1);

        counter.set_warning_threshold(Duration::from_millis(10));
        assert_eq!(counter.warning_threshold(), Duration::from_millis(10));
        counter.record_call(Duration::from_millis(30));
        assert_eq!(counter.slow_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_converges_to_request_rate() {
        let counter = Arc::new(counter());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Arc::clone(&counter);
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        // 20 requests per second for 10 seconds.
        for _ in 0..200 {
            counter.increment_request();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let rps = counter.requests_per_second();
        assert!((rps - 20.0).abs() < 1.0, "rps = {rps}");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
