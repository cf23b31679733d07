//! Agent configuration, read once from the environment at startup.
use models::constants::{
    DEFAULT_DRAIN_GRACE_PERIOD_SECONDS, DEFAULT_NOTICE_REQUEST_TIMEOUT_SECONDS,
    DEFAULT_POLL_INTERVAL_SECONDS, DEFAULT_STATUS_REPORT_INTERVAL_SECONDS, KUBECTL,
    METADATA_ENDPOINT, SPOT_TERMINATION_TIME_PATH,
};
use models::node::{DrainBackend, DrainOptions};

use snafu::{ensure, OptionExt, ResultExt};
use std::env;
use tokio::time::Duration;

const NODE_NAME_ENV_VAR: &str = "NODE_NAME";
const NOTICE_ENDPOINT_ENV_VAR: &str = "NOTICE_ENDPOINT";
const NOTICE_PATH_ENV_VAR: &str = "NOTICE_PATH";
const POLL_INTERVAL_ENV_VAR: &str = "POLL_INTERVAL_SECONDS";
const STATUS_REPORT_INTERVAL_ENV_VAR: &str = "STATUS_REPORT_INTERVAL_SECONDS";
const DRAIN_GRACE_PERIOD_ENV_VAR: &str = "DRAIN_GRACE_PERIOD_SECONDS";
const NOTICE_REQUEST_TIMEOUT_ENV_VAR: &str = "NOTICE_REQUEST_TIMEOUT_SECONDS";
const IMDS_V2_ENABLED_ENV_VAR: &str = "IMDS_V2_ENABLED";
const DRAIN_BACKEND_ENV_VAR: &str = "DRAIN_BACKEND";
const KUBECTL_PATH_ENV_VAR: &str = "KUBECTL_PATH";
const TERMINATION_LOG_ENV_VAR: &str = "TERMINATION_LOG";

const DEFAULT_TERMINATION_LOG: &str = "/dev/termination-log";

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    /// Name of the node this agent watches, as known to the cluster.
    pub node_name: String,
    /// Base URL of the instance metadata service.
    pub notice_endpoint: String,
    pub notice_path: String,
    pub poll_interval: Duration,
    /// Quiet period after which the agent logs that it is still watching.
    pub status_report_interval: Duration,
    pub drain_grace_period: Duration,
    pub notice_request_timeout: Duration,
    pub imds_v2_enabled: bool,
    pub drain_backend: DrainBackend,
    pub kubectl_path: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from a variable lookup, so that it can be built without touching the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_name = lookup(NODE_NAME_ENV_VAR).context(error::MissingNodeNameSnafu)?;
        let node_name = node_name.trim().to_string();
        ensure!(!node_name.is_empty(), error::EmptyNodeNameSnafu);

        let poll_interval = seconds(&lookup, POLL_INTERVAL_ENV_VAR, DEFAULT_POLL_INTERVAL_SECONDS)?;
        let status_report_interval = seconds(
            &lookup,
            STATUS_REPORT_INTERVAL_ENV_VAR,
            DEFAULT_STATUS_REPORT_INTERVAL_SECONDS,
        )?;
        let notice_request_timeout = seconds(
            &lookup,
            NOTICE_REQUEST_TIMEOUT_ENV_VAR,
            DEFAULT_NOTICE_REQUEST_TIMEOUT_SECONDS,
        )?;
        for (var, interval) in [
            (POLL_INTERVAL_ENV_VAR, poll_interval),
            (STATUS_REPORT_INTERVAL_ENV_VAR, status_report_interval),
            (NOTICE_REQUEST_TIMEOUT_ENV_VAR, notice_request_timeout),
        ] {
            ensure!(!interval.is_zero(), error::ZeroIntervalSnafu { var });
        }

        // Evictions carry the grace period as a 32-bit count of seconds.
        let drain_grace_period = seconds(
            &lookup,
            DRAIN_GRACE_PERIOD_ENV_VAR,
            DEFAULT_DRAIN_GRACE_PERIOD_SECONDS,
        )?;
        ensure!(
            drain_grace_period.as_secs() <= u64::from(u32::MAX),
            error::GracePeriodOutOfRangeSnafu {
                seconds: drain_grace_period.as_secs()
            }
        );

        let imds_v2_enabled = lookup(IMDS_V2_ENABLED_ENV_VAR)
            .map(|value| {
                value.to_lowercase().parse::<bool>().context(error::ParseBoolSnafu {
                    var: IMDS_V2_ENABLED_ENV_VAR,
                    value,
                })
            })
            .transpose()?
            .unwrap_or(false);

        let drain_backend = lookup(DRAIN_BACKEND_ENV_VAR)
            .map(|value| {
                value
                    .parse::<DrainBackend>()
                    .context(error::ParseDrainBackendSnafu { value })
            })
            .transpose()?
            .unwrap_or_default();

        Ok(AgentConfig {
            node_name,
            notice_endpoint: lookup(NOTICE_ENDPOINT_ENV_VAR)
                .unwrap_or_else(|| METADATA_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            notice_path: lookup(NOTICE_PATH_ENV_VAR)
                .unwrap_or_else(|| SPOT_TERMINATION_TIME_PATH.to_string()),
            poll_interval,
            status_report_interval,
            drain_grace_period,
            notice_request_timeout,
            imds_v2_enabled,
            drain_backend,
            kubectl_path: lookup(KUBECTL_PATH_ENV_VAR).unwrap_or_else(|| KUBECTL.to_string()),
        })
    }

    /// The options handed to every drain: the configured grace period, forced and ignoring DaemonSets.
    pub fn drain_options(&self) -> DrainOptions {
        DrainOptions::with_grace_period(self.drain_grace_period)
    }
}

/// Where a fatal error is recorded before the agent exits. This is read apart from [`AgentConfig`] so that it is
/// available even when the rest of the configuration cannot be loaded.
pub fn termination_log_path<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(TERMINATION_LOG_ENV_VAR).unwrap_or_else(|| DEFAULT_TERMINATION_LOG.to_string())
}

fn seconds<F>(lookup: &F, var: &'static str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .context(error::ParseSecondsSnafu { var, value })
        })
        .transpose()
        .map(|secs| Duration::from_secs(secs.unwrap_or(default)))
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum ConfigError {
        #[snafu(display("Unable to get associated node name: NODE_NAME is not set"))]
        MissingNodeName,

        #[snafu(display("Unable to get associated node name: NODE_NAME is empty"))]
        EmptyNodeName,

        #[snafu(display(
            "Could not parse seconds from environment variable '{}={}': '{}'",
            var,
            value,
            source
        ))]
        ParseSeconds {
            var: String,
            value: String,
            source: std::num::ParseIntError,
        },

        #[snafu(display("Environment variable '{}' must be greater than zero", var))]
        ZeroInterval { var: String },

        #[snafu(display(
            "Drain grace period of {} seconds exceeds the maximum of {} seconds",
            seconds,
            u32::MAX
        ))]
        GracePeriodOutOfRange { seconds: u64 },

        #[snafu(display(
            "Could not parse boolean from environment variable '{}={}': '{}'",
            var,
            value,
            source
        ))]
        ParseBool {
            var: String,
            value: String,
            source: std::str::ParseBoolError,
        },

        #[snafu(display(
            "Could not parse drain backend from environment variable 'DRAIN_BACKEND={}': '{}'",
            value,
            source
        ))]
        ParseDrainBackend {
            value: String,
            source: serde_plain::Error,
        },
    }
}

pub use error::ConfigError;

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("NODE_NAME", "spot-7")]).unwrap();
        assert_eq!(
            config,
            AgentConfig {
                node_name: "spot-7".to_string(),
                notice_endpoint: "http://169.254.169.254".to_string(),
                notice_path: "/latest/meta-data/spot/termination-time".to_string(),
                poll_interval: Duration::from_secs(5),
                status_report_interval: Duration::from_secs(60),
                drain_grace_period: Duration::from_secs(120),
                notice_request_timeout: Duration::from_secs(2),
                imds_v2_enabled: false,
                drain_backend: DrainBackend::Kubectl,
                kubectl_path: "kubectl".to_string(),
            }
        );
        assert_eq!(config.drain_options(), DrainOptions::default());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("NODE_NAME", "spot-7"),
            ("NOTICE_ENDPOINT", "http://127.0.0.1:8080/"),
            ("POLL_INTERVAL_SECONDS", "1"),
            ("STATUS_REPORT_INTERVAL_SECONDS", "30"),
            ("DRAIN_GRACE_PERIOD_SECONDS", "45"),
            ("IMDS_V2_ENABLED", "True"),
            ("DRAIN_BACKEND", "api"),
            ("KUBECTL_PATH", "/usr/local/bin/kubectl"),
        ])
        .unwrap();

        assert_eq!(config.notice_endpoint, "http://127.0.0.1:8080");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.status_report_interval, Duration::from_secs(30));
        assert_eq!(config.drain_options().grace_period, Duration::from_secs(45));
        assert!(config.imds_v2_enabled);
        assert_eq!(config.drain_backend, DrainBackend::Api);
        assert_eq!(config.kubectl_path, "/usr/local/bin/kubectl");
    }

    #[test]
    fn test_node_name_is_required() {
        assert!(matches!(config_from(&[]), Err(ConfigError::MissingNodeName)));
        assert!(matches!(
            config_from(&[("NODE_NAME", "  ")]),
            Err(ConfigError::EmptyNodeName)
        ));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("NODE_NAME", "spot-7"), ("POLL_INTERVAL_SECONDS", "five")]),
            Err(ConfigError::ParseSeconds { .. })
        ));
        assert!(matches!(
            config_from(&[("NODE_NAME", "spot-7"), ("POLL_INTERVAL_SECONDS", "0")]),
            Err(ConfigError::ZeroInterval { .. })
        ));
        match config_from(&[
            ("NODE_NAME", "spot-7"),
            ("NOTICE_REQUEST_TIMEOUT_SECONDS", "0"),
        ]) {
            Err(ConfigError::ZeroInterval { var }) => {
                assert_eq!(var, "NOTICE_REQUEST_TIMEOUT_SECONDS")
            }
            other => panic!("unexpected config result: {:?}", other),
        }
        assert!(matches!(
            config_from(&[
                ("NODE_NAME", "spot-7"),
                ("DRAIN_GRACE_PERIOD_SECONDS", "4294967416"),
            ]),
            Err(ConfigError::GracePeriodOutOfRange {
                seconds: 4294967416
            })
        ));
        assert!(matches!(
            config_from(&[("NODE_NAME", "spot-7"), ("IMDS_V2_ENABLED", "yes")]),
            Err(ConfigError::ParseBool { .. })
        ));
        assert!(matches!(
            config_from(&[("NODE_NAME", "spot-7"), ("DRAIN_BACKEND", "helm")]),
            Err(ConfigError::ParseDrainBackend { .. })
        ));
    }

    #[test]
    fn test_upper_bounds_are_accepted() {
        let config = config_from(&[
            ("NODE_NAME", "spot-7"),
            ("NOTICE_REQUEST_TIMEOUT_SECONDS", "1"),
            ("DRAIN_GRACE_PERIOD_SECONDS", "4294967295"),
        ])
        .unwrap();
        assert_eq!(config.notice_request_timeout, Duration::from_secs(1));
        assert_eq!(config.drain_grace_period, Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn test_termination_log_path() {
        assert_eq!(termination_log_path(|_| None), "/dev/termination-log");
        assert_eq!(
            termination_log_path(|name| {
                (name == "TERMINATION_LOG").then(|| "/tmp/agent-log".to_string())
            }),
            "/tmp/agent-log"
        );
    }
}
