use std::time::Duration;

use clap::Parser;

use gwtls_common::telemetry::{LogFormat, TelemetryConfig};
use gwtls_policy::backoff::{
    ControllerSettings, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_RETRIES,
    DEFAULT_RESYNC_INTERVAL,
};

/// Smallest requeue delay accepted from the command line
const MIN_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// gwtls - binds TLSPolicies to Gateway listeners and keeps cert-manager Certificates in sync
#[derive(Parser, Debug)]
#[command(name = "gwtls", version, about, long_about = None)]
pub struct Cli {
    /// Print the TLSPolicy CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Only watch this namespace (all namespaces when empty)
    #[arg(long, env = "GWTLS_WATCH_NAMESPACE", default_value = "")]
    pub watch_namespace: String,

    /// Retryable failures tolerated before a policy waits for its next change
    #[arg(long, env = "GWTLS_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// First requeue delay after a failure, in seconds (at least 1)
    #[arg(long, env = "GWTLS_BACKOFF_BASE_SECS", default_value_t = DEFAULT_BACKOFF_BASE.as_secs())]
    pub backoff_base_secs: u64,

    /// Cap on the requeue delay, in seconds
    #[arg(long, env = "GWTLS_BACKOFF_MAX_SECS", default_value_t = DEFAULT_BACKOFF_MAX.as_secs())]
    pub backoff_max_secs: u64,

    /// Log output format: text or json
    #[arg(long, env = "GWTLS_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Namespace to restrict watches to, `None` for cluster-wide
    pub fn namespace(&self) -> Option<&str> {
        let ns = self.watch_namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    /// Requeue tuning for the policy controller
    pub fn controller_settings(&self) -> ControllerSettings {
        // a zero base would requeue failures immediately
        let backoff_base = Duration::from_secs(self.backoff_base_secs).max(MIN_BACKOFF_BASE);
        ControllerSettings {
            max_retries: self.max_retries,
            backoff_base,
            // a cap below the base would make every delay the cap
            backoff_max: Duration::from_secs(self.backoff_max_secs).max(backoff_base),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Logging setup
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "gwtls-operator".to_string(),
            format: self.log_format,
        }
    }
}
