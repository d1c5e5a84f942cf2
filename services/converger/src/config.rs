//! Configuration for the converger.

use std::time::Duration;

use vmlife_reconcile::PlanPolicy;

/// Converger configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Management-plane API URL.
    pub endpoint: String,

    /// Datastore probed for files of machines missing from the inventory.
    pub datastore: String,

    /// Interval between task status polls.
    pub task_poll_interval: Duration,

    /// Upper bound on a single task wait.
    pub task_timeout: Duration,

    /// Power on registered machines that are off when `ensure=present`.
    pub power_on_present: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8989".to_string(),
            datastore: "datastore1".to_string(),
            task_poll_interval: Duration::from_millis(500),
            task_timeout: Duration::from_secs(600),
            power_on_present: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let endpoint = get("VMLIFE_ENDPOINT").unwrap_or(defaults.endpoint);

        let datastore = get("VMLIFE_DATASTORE").unwrap_or(defaults.datastore);

        let task_poll_interval = get("VMLIFE_TASK_POLL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.task_poll_interval);

        let task_timeout = get("VMLIFE_TASK_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.task_timeout);

        let power_on_present = get("VMLIFE_POWER_ON_PRESENT")
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.power_on_present);

        let log_level = get("VMLIFE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Self {
            endpoint,
            datastore,
            task_poll_interval,
            task_timeout,
            power_on_present,
            log_level,
        }
    }

    pub fn plan_policy(&self) -> PlanPolicy {
        PlanPolicy {
            power_on_present: self.power_on_present,
        }
    }
}
