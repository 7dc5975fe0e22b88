use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Target port assumed for flows accepted on the SNI listener when the
/// packet filter gave us no original destination.
pub const DEFAULT_HTTPS_PORT: u16 = 443;
/// Same, for the Host-header listener.
pub const DEFAULT_HTTP_PORT: u16 = 80;
/// Size of the initial peek read and of each relay copy buffer.
pub const BUFFER_SIZE: usize = 4096;

const DEFAULT_BIND_HOST: &str = "127.0.0.1";
const DEFAULT_SNI_LISTEN_PORT: u16 = 3130;
const DEFAULT_HOST_LISTEN_PORT: u16 = 3131;
const DEFAULT_TIMEOUT_SECS: u64 = 900;

/// How the per-connection I/O timeout is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// One absolute deadline armed when the connection is accepted. Idle
    /// long-lived tunnels are torn down when it passes.
    Fixed,
    /// The budget is renewed by every relay read and write.
    Idle,
}

#[serde_with::serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenSettings {
    pub host: String,
    pub https_port: u16,
    pub http_port: u16,
    /// Per-connection I/O timeout, in seconds on the wire.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_BIND_HOST.to_string(),
            https_port: DEFAULT_SNI_LISTEN_PORT,
            http_port: DEFAULT_HOST_LISTEN_PORT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            timeout_policy: TimeoutPolicy::Fixed,
        }
    }
}

/// One routing rule as written in the configuration file. Order matters:
/// the first pattern matching a host name decides the action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleSettings {
    pub pattern: String,
    /// `"DIRECT"`, `"DROP"`, or an upstream proxy `host[:port]`.
    pub proxy: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub listen: ListenSettings,
    pub rules: Vec<RuleSettings>,
}

impl Settings {
    /// Load settings from a YAML file. A missing file is not an error: the
    /// proxy runs with defaults and a catch-all DIRECT rule.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_yaml::from_str::<Settings>(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            warn!("config file {} not found, using defaults", path.display());
            Settings::default()
        };
        settings.finalize()?;
        Ok(settings)
    }

    fn finalize(&mut self) -> anyhow::Result<()> {
        ensure!(self.listen.https_port != 0, "listen.https_port must be in 1..=65535");
        ensure!(self.listen.http_port != 0, "listen.http_port must be in 1..=65535");
        if self.rules.is_empty() {
            self.rules.push(RuleSettings {
                pattern: ".*".to_string(),
                proxy: "DIRECT".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> anyhow::Result<Settings> {
        let mut settings: Settings = serde_yaml::from_str(raw)?;
        settings.finalize()?;
        Ok(settings)
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = parse("listen:\n  https_port: 9443\n").unwrap();
        assert_eq!(settings.listen.host, "127.0.0.1");
        assert_eq!(settings.listen.https_port, 9443);
        assert_eq!(settings.listen.http_port, 3131);
        assert_eq!(settings.listen.timeout, Duration::from_secs(900));
        assert_eq!(settings.listen.timeout_policy, TimeoutPolicy::Fixed);
    }

    #[test]
    fn empty_rules_get_catch_all_direct() {
        let settings = parse("listen:\n  host: 0.0.0.0\n").unwrap();
        assert_eq!(settings.rules.len(), 1);
        assert_eq!(settings.rules[0].pattern, ".*");
        assert_eq!(settings.rules[0].proxy, "DIRECT");
    }

    #[test]
    fn full_config_parses() {
        let raw = "\
listen:
  host: 0.0.0.0
  https_port: 3130
  http_port: 3131
  timeout: 60
  timeout_policy: idle
rules:
  - pattern: '.*\\.example\\.com$'
    proxy: DIRECT
  - pattern: '.*'
    proxy: upstream.test:8080
";
        let settings = parse(raw).unwrap();
        assert_eq!(settings.listen.timeout, Duration::from_secs(60));
        assert_eq!(settings.listen.timeout_policy, TimeoutPolicy::Idle);
        assert_eq!(settings.rules.len(), 2);
        assert_eq!(settings.rules[1].proxy, "upstream.test:8080");
    }

    #[test]
    fn zero_port_is_rejected() {
        assert!(parse("listen:\n  http_port: 0\n").is_err());
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(parse("listen: [not, a, map]").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/definitely/not/here.yaml")).unwrap();
        assert_eq!(settings.listen.https_port, 3130);
        assert_eq!(settings.rules.len(), 1);
    }
}
