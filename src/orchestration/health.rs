//! Health monitoring for workers.
//!
//! The `HealthMonitor` probes every running worker on a fixed interval. A
//! probe checks that the worker's session still exists, whether its output
//! changed since the last probe (which counts as activity), and whether the
//! output shows one of the known stuck patterns.
//!
//! ## Recovery
//!
//! A worker that is idle too long or shows a stuck pattern is nudged first:
//! Enter is pressed in its session, which submits input that was typed but
//! never sent, and the worker is probed again after a short settle time. If
//! its output moved, nothing else happens.
//!
//! Otherwise, and straight away for a lost session, the worker is restarted
//! (a fresh session in the same working directory, with its context
//! re-sent) until it has been restarted
//! `max_restarts` times. After that it is escalated: its status becomes
//! `error` and a `HealthEvent::Escalated` is emitted for a human or a
//! higher-level policy to pick up.
//!
//! The monitor runs on its own task and never holds locks that workflow
//! runs wait on.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::HealthSettings;
use crate::coordinator::Coordinator;
use crate::core::{Worker, WorkerId, WorkerStatus};
use crate::registry::WorkerFilter;
use crate::util::blocking_with_timeout;
use crate::{clog, clog_debug, clog_warn, clog_error};

/// Default time without activity before a worker is considered stuck.
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 300; // 5 minutes

/// Default number of restarts before a worker is escalated.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Configuration for health monitoring.
///
/// Controls how often workers are probed and when they count as stuck.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between probe rounds.
    pub probe_interval: Duration,
    /// Upper bound on a single session probe.
    pub probe_timeout: Duration,
    /// Time without activity before a worker is considered stuck.
    pub stuck_threshold: Duration,
    /// Restarts allowed before escalating.
    pub max_restarts: u32,
    /// Wait between a nudge and the probe that judges it.
    pub nudge_settle: Duration,
    /// Patterns in worker output that indicate a stuck state.
    pub stuck_patterns: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            stuck_threshold: Duration::from_secs(DEFAULT_STUCK_THRESHOLD_SECS),
            max_restarts: DEFAULT_MAX_RESTARTS,
            nudge_settle: Duration::from_secs(2),
            stuck_patterns: vec![
                "rate limit".to_string(),
                "rate_limit".to_string(),
                "too many requests".to_string(),
                "quota exceeded".to_string(),
                "connection refused".to_string(),
                "api error".to_string(),
            ],
        }
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            probe_interval: Duration::from_secs(settings.probe_interval_secs.max(1)),
            probe_timeout: Duration::from_secs(settings.probe_timeout_secs.max(1)),
            stuck_threshold: Duration::from_secs(settings.stuck_threshold_secs),
            max_restarts: settings.max_restarts,
            nudge_settle: Duration::from_millis(settings.nudge_settle_ms),
            stuck_patterns: settings.stuck_patterns.clone(),
        }
    }
}

impl HealthConfig {
    /// Create a new health config with the specified stuck threshold.
    pub fn with_stuck_threshold(threshold: Duration) -> Self {
        Self {
            stuck_threshold: threshold,
            ..Default::default()
        }
    }

    /// Add a stuck pattern to detect.
    pub fn add_stuck_pattern(&mut self, pattern: &str) {
        self.stuck_patterns.push(pattern.to_string());
    }
}

/// What a single probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Session is up. `changed` is true when output moved since last probe.
    Healthy { changed: bool },
    /// The worker's session no longer exists.
    SessionMissing,
    /// No activity for longer than the stuck threshold.
    Stuck { idle: Duration },
    /// Output matched a known stuck pattern.
    PatternMatched { pattern: String },
    /// The probe itself did not finish in time.
    ProbeTimedOut,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy { .. })
    }

    /// The session is there but the worker is not moving; Enter may be
    /// enough.
    pub fn may_be_nudged(&self) -> bool {
        matches!(
            self,
            ProbeResult::Stuck { .. } | ProbeResult::PatternMatched { .. }
        )
    }

    fn reason(&self) -> String {
        match self {
            ProbeResult::Healthy { .. } => "healthy".to_string(),
            ProbeResult::SessionMissing => "session is gone".to_string(),
            ProbeResult::Stuck { idle } => format!("no activity for {}s", idle.as_secs()),
            ProbeResult::PatternMatched { pattern } => {
                format!("detected stuck pattern: {}", pattern)
            }
            ProbeResult::ProbeTimedOut => "probe timed out".to_string(),
        }
    }
}

/// Events emitted by the health monitor.
///
/// These events inform other components about worker health issues
/// and recovery actions taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    /// A worker failed its probe.
    Unresponsive {
        /// The worker that failed.
        worker: WorkerId,
        /// What the probe found.
        reason: String,
    },
    /// A recovery action was triggered for a worker.
    RecoveryTriggered {
        /// The worker that recovery was triggered for.
        worker: WorkerId,
        /// The recovery action taken.
        action: RecoveryAction,
    },
    /// A worker ran out of restarts and was marked `error`.
    Escalated {
        worker: WorkerId,
        message: String,
    },
    /// Recovery was attempted but failed.
    RecoveryFailed {
        worker: WorkerId,
        error: String,
    },
}

/// Recovery actions for unhealthy workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Press Enter in the session and probe again.
    Nudge,
    /// Recreate the session and re-send the worker's context.
    Restart,
    /// Give up on the worker and hand it to a human.
    Escalate {
        /// Message explaining why escalation is needed.
        message: String,
    },
}

/// Tracks restart counts per worker for recovery decisions.
///
/// # Example
///
/// ```
/// use conductor::core::WorkerId;
/// use conductor::orchestration::RestartTracker;
///
/// let mut tracker = RestartTracker::new();
/// let worker: WorkerId = "mgr_1".parse().unwrap();
///
/// assert_eq!(tracker.get(&worker), 0);
/// tracker.increment(&worker);
/// assert_eq!(tracker.get(&worker), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    restarts: HashMap<WorkerId, u32>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts recorded for `worker` (0 if never restarted).
    pub fn get(&self, worker: &WorkerId) -> u32 {
        self.restarts.get(worker).copied().unwrap_or(0)
    }

    /// Returns the new count.
    pub fn increment(&mut self, worker: &WorkerId) -> u32 {
        let count = self.restarts.entry(worker.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, worker: &WorkerId) {
        self.restarts.remove(worker);
    }

    pub fn clear(&mut self) {
        self.restarts.clear();
    }

    pub fn len(&self) -> usize {
        self.restarts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty()
    }
}

fn fingerprint(output: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    output.hash(&mut hasher);
    hasher.finish()
}

/// Return the first stuck pattern found in `output`, compared
/// case-insensitively.
pub fn match_stuck_pattern<'a>(output: &str, patterns: &'a [String]) -> Option<&'a str> {
    let lower = output.to_lowercase();
    patterns
        .iter()
        .find(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
        .map(String::as_str)
}

/// Health monitor for workers.
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = tokio::sync::mpsc::channel(64);
/// let monitor = HealthMonitor::new(HealthConfig::default(), coordinator.clone(), tx);
/// let cancel = CancellationToken::new();
/// tokio::spawn(monitor.run(cancel.clone()));
/// while let Some(event) = rx.recv().await {
///     println!("{:?}", event);
/// }
/// ```
pub struct HealthMonitor {
    config: HealthConfig,
    coordinator: Arc<Coordinator>,
    event_tx: mpsc::Sender<HealthEvent>,
    restarts: Mutex<RestartTracker>,
    /// Output fingerprint per worker from the previous probe.
    last_output: Mutex<HashMap<WorkerId, u64>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        coordinator: Arc<Coordinator>,
        event_tx: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            config,
            coordinator,
            event_tx,
            restarts: Mutex::new(RestartTracker::new()),
            last_output: Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the health config.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub async fn restarts(&self, worker: &WorkerId) -> u32 {
        self.restarts.lock().await.get(worker)
    }

    /// Probe until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        clog!(
            "Health monitor started (interval {:?}, stuck after {:?})",
            self.config.probe_interval,
            self.config.stuck_threshold
        );
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.check_all().await;
                }
            }
        }
        clog!("Health monitor stopped");
    }

    /// Probe every active or blocked worker once and recover the unhealthy
    /// ones. Returns the events emitted during this round.
    pub async fn check_all(&self) -> Vec<HealthEvent> {
        let workers: Vec<Worker> = self
            .coordinator
            .registry()
            .list(&WorkerFilter::live())
            .await
            .into_iter()
            .filter(|w| matches!(w.status, WorkerStatus::Active | WorkerStatus::Blocked))
            .filter(|w| w.session_id.is_some())
            .collect();

        let mut events = Vec::new();
        for worker in workers {
            let result = self.probe(&worker).await;
            if result.is_healthy() {
                continue;
            }
            clog_warn!("Worker {} unhealthy: {}", worker.id, result.reason());
            events.push(HealthEvent::Unresponsive {
                worker: worker.id.clone(),
                reason: result.reason(),
            });
            events.extend(self.recover(&worker, &result).await);
        }

        for event in &events {
            let _ = self.event_tx.send(event.clone()).await;
        }
        events
    }

    /// Probe one worker.
    pub async fn probe(&self, worker: &Worker) -> ProbeResult {
        let Some(session) = worker.session_id.clone() else {
            return ProbeResult::SessionMissing;
        };
        let transport = self.coordinator.transport().clone();
        let read = blocking_with_timeout(self.config.probe_timeout, move || {
            if !transport.exists(&session)? {
                return Ok(None);
            }
            transport.read(&session, Some(200)).map(Some)
        })
        .await;

        let output = match read {
            Ok(Some(output)) => output,
            Ok(None) => return ProbeResult::SessionMissing,
            Err(e) if e.kind() == crate::ErrorKind::Timeout => return ProbeResult::ProbeTimedOut,
            Err(e) if e.kind() == crate::ErrorKind::NotFound => return ProbeResult::SessionMissing,
            Err(e) => {
                clog_debug!("Probe read of {} failed: {}", worker.id, e);
                return ProbeResult::ProbeTimedOut;
            }
        };

        let print = fingerprint(&output);
        let changed = {
            let mut last = self.last_output.lock().await;
            last.insert(worker.id.clone(), print) != Some(print)
        };
        if changed {
            if let Err(e) = self.coordinator.registry().touch(&worker.id).await {
                clog_debug!("Recording activity of {} failed: {}", worker.id, e);
            }
            // Fresh output: check what it says rather than how old it is
            if let Some(pattern) = match_stuck_pattern(&output, &self.config.stuck_patterns) {
                return ProbeResult::PatternMatched {
                    pattern: pattern.to_string(),
                };
            }
            return ProbeResult::Healthy { changed };
        }

        let idle = worker.idle_for();
        if idle >= self.config.stuck_threshold {
            return ProbeResult::Stuck { idle };
        }
        ProbeResult::Healthy { changed }
    }

    /// Decide how to recover `worker` from what its probe found.
    pub async fn determine_recovery(&self, worker: &WorkerId, found: &ProbeResult) -> RecoveryAction {
        let restarts = self.restarts.lock().await.get(worker);
        if restarts >= self.config.max_restarts {
            return RecoveryAction::Escalate {
                message: format!(
                    "Worker has been restarted {} times (max: {}). Manual intervention required.",
                    restarts, self.config.max_restarts
                ),
            };
        }
        if found.may_be_nudged() {
            return RecoveryAction::Nudge;
        }
        RecoveryAction::Restart
    }

    /// Press Enter in `worker`'s session, wait, and probe again. True when
    /// the output moved.
    async fn nudge(&self, worker: &Worker) -> bool {
        if let Err(e) = self.coordinator.nudge(&worker.id).await {
            clog_warn!("Nudging {} failed: {}", worker.id, e);
            return false;
        }
        tokio::time::sleep(self.config.nudge_settle).await;
        match self.probe(worker).await {
            ProbeResult::Healthy { changed: true } => {
                clog!("Worker {} resumed after a nudge", worker.id);
                true
            }
            other => {
                clog_debug!("Nudge did not move {}: {}", worker.id, other.reason());
                false
            }
        }
    }

    async fn recover(&self, worker: &Worker, found: &ProbeResult) -> Vec<HealthEvent> {
        let mut action = self.determine_recovery(&worker.id, found).await;
        let mut events = vec![HealthEvent::RecoveryTriggered {
            worker: worker.id.clone(),
            action: action.clone(),
        }];

        if action == RecoveryAction::Nudge {
            if self.nudge(worker).await {
                return events;
            }
            action = RecoveryAction::Restart;
            events.push(HealthEvent::RecoveryTriggered {
                worker: worker.id.clone(),
                action: action.clone(),
            });
        }

        match action {
            RecoveryAction::Nudge => {}
            RecoveryAction::Restart => {
                self.restarts.lock().await.increment(&worker.id);
                match self.coordinator.restart_session(&worker.id).await {
                    Ok(_) => {
                        self.last_output.lock().await.remove(&worker.id);
                    }
                    Err(e) => {
                        clog_error!("Restarting {} failed: {}", worker.id, e);
                        events.push(HealthEvent::RecoveryFailed {
                            worker: worker.id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            RecoveryAction::Escalate { message } => {
                clog_error!("Escalating {}: {}", worker.id, message);
                if let Err(e) = self
                    .coordinator
                    .registry()
                    .update_status_with_retry(&worker.id, WorkerStatus::Error)
                    .await
                {
                    clog_warn!("Could not mark {} as error: {}", worker.id, e);
                }
                self.restarts.lock().await.reset(&worker.id);
                events.push(HealthEvent::Escalated {
                    worker: worker.id.clone(),
                    message,
                });
            }
        }
        events
    }
}
