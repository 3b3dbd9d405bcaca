use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log::LogLevel;
use crate::workflow::FailurePolicy;
use crate::{clog_debug, clog_warn, Error, Result};

/// Overrides the state directory (`~/.conductor` by default). Also exported
/// into every worker session so nested CLI calls share the same state.
pub const STATE_DIR_ENV: &str = "CONDUCTOR_STATE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Command launched inside every worker session.
    pub worker_command: String,
    pub transport: TransportConfig,
    pub detector: DetectorConfig,
    pub workflow: WorkflowConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthSettings,
    pub isolation: IsolationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            worker_command: "claude".to_string(),
            transport: TransportConfig::default(),
            detector: DetectorConfig::default(),
            workflow: WorkflowConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthSettings::default(),
            isolation: IsolationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub session_prefix: String,
    /// Dispatches arriving within this window share one transport call.
    pub batch_window_ms: u64,
    pub max_batch: usize,
    /// Pause between typing a prompt and pressing Enter.
    pub enter_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session_prefix: "conductor".to_string(),
            batch_window_ms: 25,
            max_batch: 16,
            enter_delay_ms: 150,
        }
    }
}

impl TransportConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn enter_delay(&self) -> Duration {
        Duration::from_millis(self.enter_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Leading glyph of a worker-authored response block.
    pub response_cue: String,
    /// Leading glyph of the operator input line (where prompts are echoed).
    pub input_cue: String,
    pub poll_interval_ms: u64,
    /// Lines kept as the tail reported with a timeout.
    pub tail_lines: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            response_cue: "⏺".to_string(),
            input_cue: ">".to_string(),
            poll_interval_ms: 500,
            tail_lines: 40,
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Timeouts tolerated per stage before the run fails.
    pub max_timeout_retries: u32,
    pub default_failure_policy: FailurePolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_timeout_retries: 2,
            default_failure_policy: FailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_specialists_per_manager: usize,
    pub spawn_wait_secs: u64,
    pub lock_wait_secs: u64,
    pub claim_ttl_secs: u64,
    pub cache_ttl_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_specialists_per_manager: 4,
            spawn_wait_secs: 300,
            lock_wait_secs: 30,
            claim_ttl_secs: 600,
            cache_ttl_ms: 2_000,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn spawn_wait(&self) -> Duration {
        Duration::from_secs(self.spawn_wait_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub stuck_threshold_secs: u64,
    pub max_restarts: u32,
    pub nudge_settle_ms: u64,
    pub stuck_patterns: Vec<String>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
            stuck_threshold_secs: 300,
            max_restarts: 3,
            nudge_settle_ms: 2000,
            stuck_patterns: vec![
                "rate limit".to_string(),
                "too many requests".to_string(),
                "quota exceeded".to_string(),
                "connection refused".to_string(),
                "api error".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub worktree_dir: Option<String>,
    pub base_branch: String,
    /// Extensions whose overlapping edits may be merged automatically.
    pub auto_resolvable: Vec<String>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            worktree_dir: None,
            base_branch: "main".to_string(),
            auto_resolvable: ["txt", "md", "markdown", "rst", "adoc", "csv", "tsv", "log"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Locations of everything the coordinator persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$CONDUCTOR_STATE_DIR`, falling back to `~/.conductor`.
    pub fn discover() -> Result<Self> {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Ok(Self::new(expand_tilde(&dir)));
            }
        }
        Ok(Self::new(
            dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"),
        ))
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("conductor.toml")
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    pub fn runs(&self) -> PathBuf {
        self.root.join("runs.json")
    }

    pub fn leases(&self) -> PathBuf {
        self.root.join("leases.json")
    }

    pub fn locks(&self) -> PathBuf {
        self.root.join("locks.json")
    }

    pub fn ensure(&self) -> Result<()> {
        if !self.root.exists() {
            clog_debug!("Creating state directory: {}", self.root.display());
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }
}

impl Config {
    pub fn load(paths: &StatePaths) -> Result<Self> {
        Self::load_from(&paths.config())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        if LogLevel::parse(&config.log_level).is_none() {
            clog_warn!(
                "Unknown log_level '{}' in {}, using info",
                config.log_level,
                path.display()
            );
        }
        Ok(config)
    }

    pub fn save(&self, paths: &StatePaths) -> Result<()> {
        paths.ensure()?;
        let path = paths.config();
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level).unwrap_or(LogLevel::Info)
    }

    /// The worker launch command split into argv.
    pub fn worker_argv(&self) -> Vec<String> {
        self.worker_command
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    pub fn worktrees_dir(&self, paths: &StatePaths) -> PathBuf {
        match &self.isolation.worktree_dir {
            Some(dir) => expand_tilde(dir),
            None => paths.root.join("worktrees"),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
