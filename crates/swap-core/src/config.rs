use crate::error::Result;
use crate::paths;
use crate::policy::{Backoff, RetryPolicy};
use crate::types::{ActionType, OperationKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ConfirmationConfig
// ---------------------------------------------------------------------------

/// Which actions pause in `Confirming` before anything is sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default)]
    pub accept: bool,
    #[serde(default)]
    pub reject: bool,
}

// ---------------------------------------------------------------------------
// TimeoutConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_accept_timeout")]
    pub accept_ms: u64,
    #[serde(default = "default_reject_timeout")]
    pub reject_ms: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_ms: u64,
}

fn default_accept_timeout() -> u64 {
    45_000
}

fn default_reject_timeout() -> u64 {
    30_000
}

fn default_refresh_timeout() -> u64 {
    20_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            accept_ms: default_accept_timeout(),
            reject_ms: default_reject_timeout(),
            refresh_ms: default_refresh_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        #[serde(default = "default_retry_delay")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_retry_delay")]
        base_ms: u64,
        #[serde(default = "default_backoff_factor")]
        factor: u32,
        #[serde(default = "default_backoff_max")]
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

fn default_retry_delay() -> u64 {
    2_000
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_backoff_max() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Fixed {
            delay_ms: default_retry_delay(),
        }
    }
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> Backoff {
        match *self {
            BackoffConfig::Fixed { delay_ms } => Backoff::Fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Exponential {
                base_ms,
                factor,
                max_ms,
                jitter,
            } => Backoff::Exponential {
                base: Duration::from_millis(base_ms),
                factor,
                max: Duration::from_millis(max_ms),
                jitter,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for interactive submissions (accept / reject).
    #[serde(default = "default_submission_attempts")]
    pub submission_max_attempts: u32,
    /// Total attempts for fetch-type operations (refresh).
    #[serde(default = "default_fetch_attempts")]
    pub fetch_max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_submission_attempts() -> u32 {
    3
}

fn default_fetch_attempts() -> u32 {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            submission_max_attempts: default_submission_attempts(),
            fetch_max_attempts: default_fetch_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// WatchdogConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_max_loading_time")]
    pub max_loading_time_ms: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
}

fn default_max_loading_time() -> u64 {
    45_000
}

fn default_check_interval() -> u64 {
    1_000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_loading_time_ms: default_max_loading_time(),
            check_interval_ms: default_check_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconciliationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Hold a successful submission in `AwaitingReconciliation` until a push
    /// confirms it or `grace_ms` passes.
    #[serde(default)]
    pub await_push_confirmation: bool,
    #[serde(default = "default_grace")]
    pub grace_ms: u64,
    /// Automatic refreshes allowed per session after validation failures.
    #[serde(default = "default_max_auto_refreshes")]
    pub max_auto_refreshes: u32,
}

fn default_grace() -> u64 {
    5_000
}

fn default_max_auto_refreshes() -> u32 {
    3
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            await_push_confirmation: false,
            grace_ms: default_grace(),
            max_auto_refreshes: default_max_auto_refreshes(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Latency at or above this marks a connected channel unhealthy.
    #[serde(default = "default_healthy_latency")]
    pub healthy_latency_ms: u64,
}

fn default_healthy_latency() -> u64 {
    1_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            healthy_latency_ms: default_healthy_latency(),
        }
    }
}

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Window after a submission attempt in which new intents are dropped.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

fn default_debounce() -> u64 {
    1_000
}

impl CoordinatorConfig {
    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Load `.swap/config.yaml` under `root`. A missing file yields defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: CoordinatorConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn requires_confirmation(&self, action: ActionType) -> bool {
        match action {
            ActionType::Accept => self.confirmation.accept,
            ActionType::Reject => self.confirmation.reject,
        }
    }

    pub fn timeout_for(&self, op: OperationKind) -> Duration {
        let ms = match op {
            OperationKind::Accept => self.timeouts.accept_ms,
            OperationKind::Reject => self.timeouts.reject_ms,
            OperationKind::Refresh => self.timeouts.refresh_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn policy_for(&self, op: OperationKind) -> RetryPolicy {
        let max_attempts = if op.is_fetch() {
            self.retry.fetch_max_attempts
        } else {
            self.retry.submission_max_attempts
        };
        RetryPolicy::new(max_attempts, self.timeout_for(op), self.retry.backoff.to_backoff())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_loading_time(&self) -> Duration {
        Duration::from_millis(self.watchdog.max_loading_time_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog.check_interval_ms.max(1))
    }

    pub fn reconciliation_grace(&self) -> Duration {
        Duration::from_millis(self.reconciliation.grace_ms)
    }

    /// Divide every duration by `speed`. Used to replay scenarios quickly.
    pub fn scaled(&self, speed: u32) -> Self {
        let speed = u64::from(speed.max(1));
        let s = |ms: u64| ms / speed;
        let mut out = self.clone();
        out.timeouts.accept_ms = s(self.timeouts.accept_ms);
        out.timeouts.reject_ms = s(self.timeouts.reject_ms);
        out.timeouts.refresh_ms = s(self.timeouts.refresh_ms);
        out.retry.backoff = match self.retry.backoff {
            BackoffConfig::Fixed { delay_ms } => BackoffConfig::Fixed {
                delay_ms: s(delay_ms),
            },
            BackoffConfig::Exponential {
                base_ms,
                factor,
                max_ms,
                jitter,
            } => BackoffConfig::Exponential {
                base_ms: s(base_ms),
                factor,
                max_ms: s(max_ms),
                jitter,
            },
        };
        out.watchdog.max_loading_time_ms = s(self.watchdog.max_loading_time_ms);
        out.watchdog.check_interval_ms = s(self.watchdog.check_interval_ms).max(1);
        out.reconciliation.grace_ms = s(self.reconciliation.grace_ms);
        out.debounce_ms = s(self.debounce_ms);
        out
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for (op, ms) in [
            (OperationKind::Accept, self.timeouts.accept_ms),
            (OperationKind::Reject, self.timeouts.reject_ms),
            (OperationKind::Refresh, self.timeouts.refresh_ms),
        ] {
            if ms == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("timeouts.{op}_ms is 0: every {op} attempt would time out"),
                });
            }
        }

        if self.retry.submission_max_attempts == 0 || self.retry.fetch_max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "max attempts of 0 is treated as 1".to_string(),
            });
        }

        if self.retry.submission_max_attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retry.submission_max_attempts={} (>10 is unusual)",
                    self.retry.submission_max_attempts
                ),
            });
        }

        if let BackoffConfig::Exponential { factor: 0, .. } = self.retry.backoff {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "retry.backoff.factor is 0; treated as 1 (fixed delay)".to_string(),
            });
        }

        // A watchdog threshold below the accept deadline flags healthy attempts.
        if self.watchdog.max_loading_time_ms < self.timeouts.accept_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "watchdog.max_loading_time_ms ({}) is below timeouts.accept_ms ({})",
                    self.watchdog.max_loading_time_ms, self.timeouts.accept_ms
                ),
            });
        }

        if self.debounce_ms > 10_000 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!("debounce_ms={} will drop deliberate retries", self.debounce_ms),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.timeout_for(OperationKind::Accept), Duration::from_secs(45));
        assert_eq!(cfg.timeout_for(OperationKind::Reject), Duration::from_secs(30));
        assert_eq!(cfg.timeout_for(OperationKind::Refresh), Duration::from_secs(20));
        assert_eq!(cfg.policy_for(OperationKind::Accept).max_attempts, 3);
        assert_eq!(cfg.policy_for(OperationKind::Refresh).max_attempts, 2);
        assert_eq!(
            cfg.policy_for(OperationKind::Reject).delay_for(1),
            Duration::from_secs(2)
        );
        assert_eq!(cfg.debounce(), Duration::from_millis(1000));
        assert_eq!(cfg.max_loading_time(), Duration::from_secs(45));
        assert!(!cfg.requires_confirmation(ActionType::Accept));
        assert!(!cfg.reconciliation.await_push_confirmation);
        assert_eq!(cfg.reconciliation.max_auto_refreshes, 3);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = CoordinatorConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.debounce_ms, 1000);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
confirmation:
  reject: true
timeouts:
  accept_ms: 10000
retry:
  backoff:
    type: exponential
    base_ms: 500
    jitter: true
"#;
        let cfg: CoordinatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.requires_confirmation(ActionType::Reject));
        assert!(!cfg.requires_confirmation(ActionType::Accept));
        assert_eq!(cfg.timeouts.accept_ms, 10_000);
        assert_eq!(cfg.timeouts.reject_ms, 30_000);
        assert_eq!(
            cfg.retry.backoff,
            BackoffConfig::Exponential {
                base_ms: 500,
                factor: 2,
                max_ms: 30_000,
                jitter: true,
            }
        );
        assert_eq!(cfg.retry.submission_max_attempts, 3);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = CoordinatorConfig::default();
        cfg.debounce_ms = 250;
        cfg.confirmation.accept = true;
        cfg.save(dir.path()).unwrap();
        assert!(dir.path().join(".swap/config.yaml").exists());

        let loaded = CoordinatorConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.debounce_ms, 250);
        assert!(loaded.confirmation.accept);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".swap")).unwrap();
        std::fs::write(dir.path().join(".swap/config.yaml"), "debounce_ms: [nope").unwrap();
        assert!(CoordinatorConfig::load(dir.path()).is_err());
    }

    #[test]
    fn scaled_divides_durations() {
        let cfg = CoordinatorConfig::default().scaled(100);
        assert_eq!(cfg.timeouts.accept_ms, 450);
        assert_eq!(cfg.debounce_ms, 10);
        assert_eq!(cfg.retry.backoff, BackoffConfig::Fixed { delay_ms: 20 });
        assert_eq!(cfg.watchdog.check_interval_ms, 10);
        // Attempt budgets are not time and stay put
        assert_eq!(cfg.retry.submission_max_attempts, 3);
    }

    #[test]
    fn validate_flags_zero_timeout_and_low_watchdog() {
        let mut cfg = CoordinatorConfig::default();
        cfg.timeouts.refresh_ms = 0;
        cfg.watchdog.max_loading_time_ms = 5_000;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("refresh")));
        assert!(warnings.iter().any(|w| w.message.contains("watchdog")));
    }
}
