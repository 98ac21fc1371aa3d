//! Synthetic traffic against a target's invocation endpoint
//!
//! Requests are issued window by window. Each `(wait, duration)` window
//! sends one request per `wait` for `duration`; the window list repeats
//! until the overall run duration elapses or the run is cancelled.

use crate::error::{TargetError, TunerError};
use crate::observability::TunerMetrics;
use crate::target::{InvocationTransport, PayloadGenerator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How requests within a window are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One request in flight; `wait` separates a response from the next request
    #[default]
    Sequential,
    /// One request per `wait` tick regardless of responses, capped at
    /// `max_in_flight`
    Concurrent,
}

/// One phase of the load shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadWindow {
    pub wait_ms: u64,
    pub duration_ms: u64,
}

impl LoadWindow {
    pub fn new(wait: Duration, duration: Duration) -> Self {
        Self {
            wait_ms: wait.as_millis() as u64,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Load generator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default)]
    pub mode: DispatchMode,

    #[serde(default = "default_windows")]
    pub windows: Vec<LoadWindow>,

    /// Overall run duration in milliseconds
    #[serde(default = "default_duration")]
    pub duration_ms: u64,

    /// Concurrent mode only
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_windows() -> Vec<LoadWindow> {
    vec![LoadWindow {
        wait_ms: 100,
        duration_ms: default_duration(),
    }]
}

fn default_duration() -> u64 {
    5_000
}

fn default_max_in_flight() -> usize {
    16
}

fn default_request_timeout() -> u64 {
    30_000
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            windows: default_windows(),
            duration_ms: default_duration(),
            max_in_flight: default_max_in_flight(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl LoadConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), TunerError> {
        if self.windows.is_empty() {
            return Err(TunerError::FatalConfig("load needs at least one window".to_string()));
        }
        if let Some(w) = self
            .windows
            .iter()
            .find(|w| w.wait_ms == 0 || w.duration_ms == 0)
        {
            return Err(TunerError::FatalConfig(format!(
                "load window wait and duration must be positive, got {w:?}"
            )));
        }
        if self.duration_ms == 0 {
            return Err(TunerError::FatalConfig("load duration must be positive".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(TunerError::FatalConfig("request timeout must be positive".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(TunerError::FatalConfig("max_in_flight must be positive".to_string()));
        }
        Ok(())
    }
}

/// Outcome of a load run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Requests dispatched
    pub sent: u64,
    /// Requests that failed after retries, timed out or were cut off
    pub failed: u64,
    /// Windows started
    pub windows: u64,
}

impl LoadReport {
    fn record(&mut self, ok: bool) {
        if !ok {
            self.failed += 1;
        }
    }
}

pub struct LoadGenerator {
    target: String,
    endpoint: String,
    transport: Arc<dyn InvocationTransport>,
    payloads: Arc<dyn PayloadGenerator>,
    config: LoadConfig,
    metrics: TunerMetrics,
}

impl LoadGenerator {
    pub fn new(
        target: impl Into<String>,
        endpoint: impl Into<String>,
        transport: Arc<dyn InvocationTransport>,
        payloads: Arc<dyn PayloadGenerator>,
        config: LoadConfig,
    ) -> Self {
        Self {
            target: target.into(),
            endpoint: endpoint.into(),
            transport,
            payloads,
            config,
            metrics: TunerMetrics::new(),
        }
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Send load until the overall duration elapses or `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<LoadReport, TunerError> {
        self.config.validate()?;

        let started = Instant::now();
        let deadline = started + self.config.duration();
        let mut report = LoadReport::default();
        info!(
            target = %self.target,
            endpoint = %self.endpoint,
            mode = ?self.config.mode,
            windows = self.config.windows.len(),
            duration_ms = self.config.duration_ms,
            "Starting load"
        );

        'run: loop {
            for window in &self.config.windows {
                let now = Instant::now();
                if cancel.is_cancelled() || now >= deadline {
                    break 'run;
                }
                let window_end = (now + window.duration()).min(deadline);
                report.windows += 1;
                debug!(target = %self.target, wait_ms = window.wait_ms, "Load window");

                match self.config.mode {
                    DispatchMode::Sequential => {
                        self.run_sequential(window, window_end, &cancel, &mut report)
                            .await
                    }
                    DispatchMode::Concurrent => {
                        self.run_concurrent(window, window_end, &cancel, &mut report)
                            .await
                    }
                }
            }
        }

        info!(
            target = %self.target,
            sent = report.sent,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            cancelled = cancel.is_cancelled(),
            "Load finished"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        window: &LoadWindow,
        end: Instant,
        cancel: &CancellationToken,
        report: &mut LoadReport,
    ) {
        while Instant::now() < end && !cancel.is_cancelled() {
            report.sent += 1;
            let payload = self.payloads.generate();
            let ok = tokio::select! {
                ok = self.request().send(payload) => ok,
                _ = cancel.cancelled() => false,
            };
            report.record(ok);

            // never wait past the window, which never outlasts the run
            let next = (Instant::now() + window.wait()).min(end);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(next) => {}
            }
        }
    }

    async fn run_concurrent(
        &self,
        window: &LoadWindow,
        end: Instant,
        cancel: &CancellationToken,
        report: &mut LoadReport,
    ) {
        let slots = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut tasks = JoinSet::new();
        let mut ticker = interval(window.wait());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(end) => break,
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    report.record(done.unwrap_or(false));
                }
                _ = ticker.tick() => {
                    // at the cap the tick waits for a free slot
                    let permit = tokio::select! {
                        permit = slots.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                        _ = sleep_until(end) => break,
                    };
                    report.sent += 1;
                    let request = self.request();
                    let payload = self.payloads.generate();
                    tasks.spawn(async move {
                        let ok = request.send(payload).await;
                        drop(permit);
                        ok
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            tasks.abort_all();
        }
        while let Some(done) = tasks.join_next().await {
            // aborted requests count as failed
            report.record(done.unwrap_or(false));
        }
    }

    fn request(&self) -> Request {
        Request {
            target: self.target.clone(),
            endpoint: self.endpoint.clone(),
            transport: self.transport.clone(),
            timeout: self.config.request_timeout(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Everything one request needs, owned so it can run on its own task
struct Request {
    target: String,
    endpoint: String,
    transport: Arc<dyn InvocationTransport>,
    timeout: Duration,
    metrics: TunerMetrics,
}

impl Request {
    /// Send one payload; failures are logged and reported as `false`
    async fn send(self, payload: Value) -> bool {
        let start = Instant::now();
        self.metrics.inc_load_requests_sent();

        // the transport owns retries; the timeout bounds all of its attempts
        let result = match tokio::time::timeout(
            self.timeout,
            self.transport.invoke(&self.endpoint, &payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TargetError::Timeout(self.timeout)),
        };

        self.metrics
            .observe_request_latency(start.elapsed().as_secs_f64());
        match result {
            Ok(_) => true,
            Err(e) => {
                self.metrics.inc_load_requests_failed();
                warn!(target = %self.target, endpoint = %self.endpoint, error = %e, "Load request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryRecordQueue, RecordQueue};
    use crate::target::{FixedPayload, SimulatedTarget, SimulationProfile};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn windows(wait_ms: u64, duration_ms: u64) -> Vec<LoadWindow> {
        vec![LoadWindow {
            wait_ms,
            duration_ms,
        }]
    }

    fn fixed() -> Arc<dyn PayloadGenerator> {
        Arc::new(FixedPayload::new(json!({"payload_size": 2048})))
    }

    /// Transport that takes a while and tracks its peak concurrency
    #[derive(Default)]
    struct SlowTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InvocationTransport for SlowTransport {
        async fn invoke(&self, _endpoint: &str, _payload: &Value) -> Result<Value, TargetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(500)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"statusCode": 200}))
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(LoadConfig::default().validate().is_ok());

        let config = LoadConfig {
            windows: vec![],
            ..LoadConfig::default()
        };
        assert!(matches!(config.validate(), Err(TunerError::FatalConfig(_))));

        let config = LoadConfig {
            windows: windows(0, 1_000),
            ..LoadConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LoadConfig {
            max_in_flight: 0,
            ..LoadConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: LoadConfig =
            serde_json::from_value(json!({"mode": "concurrent", "max_in_flight": 4})).unwrap();
        assert_eq!(config.mode, DispatchMode::Concurrent);
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.windows, default_windows());
        assert_eq!(config.duration(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_load_reaches_queue() {
        let queue = Arc::new(InMemoryRecordQueue::new());
        let sim = Arc::new(SimulatedTarget::new(
            queue.clone(),
            SimulationProfile::default(),
            Some(5),
        ));
        let config = LoadConfig {
            windows: windows(100, 1_000),
            duration_ms: 1_000,
            ..LoadConfig::default()
        };
        let generator = LoadGenerator::new(
            "resize",
            SimulatedTarget::endpoint("resize"),
            sim.clone(),
            fixed(),
            config,
        );

        let report = generator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.sent, 10);
        assert_eq!(report.failed, 0);
        assert_eq!(sim.invocations(), 10);
        assert_eq!(queue.unprocessed("resize").await.unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_repeat_until_duration() {
        let sim = Arc::new(SimulatedTarget::new(
            Arc::new(InMemoryRecordQueue::new()),
            SimulationProfile::default(),
            Some(5),
        ));
        let config = LoadConfig {
            windows: vec![
                LoadWindow::new(Duration::from_millis(100), Duration::from_millis(500)),
                LoadWindow::new(Duration::from_millis(250), Duration::from_millis(500)),
            ],
            duration_ms: 2_000,
            ..LoadConfig::default()
        };
        let generator = LoadGenerator::new("resize", "sim://resize", sim, fixed(), config);

        let report = generator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.windows, 4);
        // 5 + 2 per pass, two passes
        assert_eq!(report.sent, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_wait_stops_at_duration() {
        let sim = Arc::new(SimulatedTarget::new(
            Arc::new(InMemoryRecordQueue::new()),
            SimulationProfile::default(),
            Some(5),
        ));
        let config = LoadConfig {
            windows: windows(300, 500),
            duration_ms: 500,
            ..LoadConfig::default()
        };
        let generator = LoadGenerator::new("resize", "sim://resize", sim, fixed(), config);

        let started = Instant::now();
        let report = generator.run(CancellationToken::new()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.sent, 2);
        assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_mode_respects_cap() {
        let transport = Arc::new(SlowTransport::default());
        let config = LoadConfig {
            mode: DispatchMode::Concurrent,
            windows: windows(10, 1_000),
            duration_ms: 1_000,
            max_in_flight: 3,
            ..LoadConfig::default()
        };
        let generator =
            LoadGenerator::new("resize", "http://fn/resize", transport.clone(), fixed(), config);

        let report = generator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(transport.peak.load(Ordering::SeqCst), 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.sent, transport.calls.load(Ordering::SeqCst) as u64);
        // every launched request finished before the window closed out
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_run() {
        let profile = SimulationProfile {
            failure_rate: 1.0,
            ..SimulationProfile::default()
        };
        let sim = Arc::new(SimulatedTarget::new(
            Arc::new(InMemoryRecordQueue::new()),
            profile,
            Some(1),
        ));
        let config = LoadConfig {
            windows: windows(100, 500),
            duration_ms: 500,
            ..LoadConfig::default()
        };
        let generator = LoadGenerator::new("resize", "sim://resize", sim.clone(), fixed(), config);

        let report = generator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.sent, 5);
        assert_eq!(report.failed, 5);
        // one attempt per request; the transport owns retries
        assert_eq!(sim.invocations(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts_as_failure() {
        let transport = Arc::new(SlowTransport::default());
        let config = LoadConfig {
            windows: windows(100, 300),
            duration_ms: 300,
            request_timeout_ms: 50,
            ..LoadConfig::default()
        };
        let generator = LoadGenerator::new("resize", "http://fn/resize", transport, fixed(), config);

        let report = generator.run(CancellationToken::new()).await.unwrap();
        assert!(report.sent > 0);
        assert_eq!(report.failed, report.sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_load() {
        let sim = Arc::new(SimulatedTarget::new(
            Arc::new(InMemoryRecordQueue::new()),
            SimulationProfile::default(),
            Some(5),
        ));
        let config = LoadConfig {
            windows: windows(100, 60_000),
            duration_ms: 60_000,
            ..LoadConfig::default()
        };
        let generator = Arc::new(LoadGenerator::new("resize", "sim://resize", sim, fixed(), config));

        let cancel = CancellationToken::new();
        let handle = {
            let generator = generator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { generator.run(cancel).await })
        };
        sleep(Duration::from_millis(450)).await;
        cancel.cancel();

        let report = handle.await.unwrap().unwrap();
        assert!(report.sent >= 4 && report.sent <= 6, "sent {}", report.sent);
    }
}
