use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::error::BridgeError;
use crate::fault::FatalPolicy;

/// Process-level bridge settings, loadable from JSON or YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub fatal: FatalPolicy,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Set to false when the host application installs its own subscriber.
    #[serde(default = "default_true")]
    pub install_subscriber: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
            install_subscriber: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl BridgeConfig {
    pub fn from_json_str(source: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_yaml_str(source: &str) -> Result<Self, BridgeError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source),
            Some("yaml" | "yml") => Self::from_yaml_str(&source),
            other => Err(BridgeError::config(format!(
                "unsupported config extension {:?} for {}",
                other.unwrap_or(""),
                path.display()
            ))),
        }
    }
}

pub(crate) fn install_subscriber(log: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    let installed = match log.format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!(target: "vssl::config", "global subscriber already set; keeping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BridgeConfig::from_json_str("{}").expect("config");
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.fatal, FatalPolicy::Abort);
        assert_eq!(config.log.filter, "info");
        assert!(config.log.install_subscriber);
    }

    #[test]
    fn yaml_overrides_policy_and_logging() {
        let config = BridgeConfig::from_yaml_str(
            "fatal:\n  action: exit\n  code: 3\nlog:\n  filter: vssl=trace\n  format: json\n  install_subscriber: false\n",
        )
        .expect("config");
        assert_eq!(config.fatal, FatalPolicy::Exit { code: 3 });
        assert_eq!(config.log.filter, "vssl=trace");
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(!config.log.install_subscriber);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = BridgeConfig::from_json_str(r#"{"fatl": {"action": "abort"}}"#)
            .expect_err("typo must not pass");
        assert!(matches!(err, BridgeError::Json(_)));
    }

    #[test]
    fn path_loading_dispatches_on_extension() {
        let dir = std::env::temp_dir().join(format!("vssl-config-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("temp dir");

        let json = dir.join("bridge.json");
        fs::File::create(&json)
            .and_then(|mut file| file.write_all(br#"{"fatal":{"action":"exit","code":9}}"#))
            .expect("write json");
        assert_eq!(
            BridgeConfig::from_path(&json).expect("json").fatal,
            FatalPolicy::Exit { code: 9 }
        );

        let toml = dir.join("bridge.toml");
        fs::write(&toml, "fatal = 1").expect("write toml");
        assert!(matches!(
            BridgeConfig::from_path(&toml),
            Err(BridgeError::Config(_))
        ));

        let _ = fs::remove_dir_all(&dir);
    }
}
