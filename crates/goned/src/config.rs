//! Daemon configuration.
//!
//! Read from a TOML file at startup and again on every reload:
//!
//! ```toml
//! drain_timeout_secs = 30
//! sync_reload = false
//! unlink_policy = "if-socket"
//! inherit_only = false
//! fdstore = false
//!
//! [[listeners]]
//! name = "web"
//! network = "tcp"
//! address = ":8080"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gone_core::UnlinkPolicy;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::listener::Network;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "GONED_CONFIG";

/// One listener to acquire in every generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub name: String,
    pub network: String,
    pub address: String,
}

/// Parsed daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Bound on draining a retired generation. Absent means no deadline.
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,

    /// Hold a new generation until its predecessor has drained.
    #[serde(default)]
    pub sync_reload: bool,

    #[serde(default = "default_unlink_policy")]
    pub unlink_policy: String,

    /// Fail instead of binding when nothing was inherited.
    #[serde(default)]
    pub inherit_only: bool,

    /// Push listening sockets to the supervisor's descriptor store.
    #[serde(default)]
    pub fdstore: bool,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

fn default_unlink_policy() -> String {
    UnlinkPolicy::default().as_str().to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: None,
            sync_reload: false,
            unlink_policy: default_unlink_policy(),
            inherit_only: false,
            fdstore: false,
            listeners: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text).map_err(|e| match e {
            ParseFailure::Toml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Invalid(e) => e,
        })?;
        debug!(
            path = %path.display(),
            listeners = config.listeners.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn parse(text: &str) -> Result<Self, ParseFailure> {
        let config: Self = toml::from_str(text).map_err(ParseFailure::Toml)?;
        config.validate().map_err(ParseFailure::Invalid)?;
        Ok(config)
    }

    /// Checks listener names and spellings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.unlink_policy()?;

        let mut seen = HashSet::new();
        for listener in &self.listeners {
            if listener.name.is_empty() {
                return Err(ConfigError::Invalid("listener name is empty".to_string()));
            }
            if !gone_core::env::is_valid_name(&listener.name) {
                return Err(ConfigError::Invalid(format!(
                    "listener name {:?} contains a separator character",
                    listener.name
                )));
            }
            if !seen.insert(listener.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate listener name {:?}",
                    listener.name
                )));
            }
            listener
                .network
                .parse::<Network>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn unlink_policy(&self) -> Result<UnlinkPolicy, ConfigError> {
        self.unlink_policy.parse().map_err(ConfigError::Invalid)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug)]
enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(ConfigError),
}

/// Picks the configuration file: `explicit`, else `GONED_CONFIG`, else
/// `<config_dir>/gone/goned.toml`.
pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    resolve_path_with(explicit, |key| std::env::var_os(key), dirs::config_dir())
}

fn resolve_path_with<F>(
    explicit: Option<&Path>,
    lookup: F,
    config_dir: Option<PathBuf>,
) -> Result<PathBuf, ConfigError>
where
    F: Fn(&str) -> Option<std::ffi::OsString>,
{
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    config_dir
        .map(|dir| dir.join("gone").join("goned.toml"))
        .ok_or(ConfigError::NoPath)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.unlink_policy().unwrap(), UnlinkPolicy::IfSocket);
        assert_eq!(config.drain_timeout(), None);
    }

    #[test]
    fn test_full_file() {
        let text = r#"
            drain_timeout_secs = 15
            sync_reload = true
            unlink_policy = "flock"
            inherit_only = true
            fdstore = true

            [[listeners]]
            name = "web"
            network = "tcp"
            address = ":8080"

            [[listeners]]
            name = "ctl"
            network = "unix"
            address = "/run/goned.sock"
        "#;
        let config = DaemonConfig::parse(text).unwrap();
        assert_eq!(config.drain_timeout(), Some(Duration::from_secs(15)));
        assert!(config.sync_reload);
        assert!(config.inherit_only);
        assert!(config.fdstore);
        assert_eq!(config.unlink_policy().unwrap(), UnlinkPolicy::Flock);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[1].address, "/run/goned.sock");
    }

    #[test]
    fn test_rejects_bad_listeners() {
        let duplicate = r#"
            [[listeners]]
            name = "web"
            network = "tcp"
            address = ":80"
            [[listeners]]
            name = "web"
            network = "tcp"
            address = ":81"
        "#;
        assert!(matches!(
            DaemonConfig::parse(duplicate),
            Err(ParseFailure::Invalid(ConfigError::Invalid(_)))
        ));

        let colon = "[[listeners]]\nname = \"a:b\"\nnetwork = \"tcp\"\naddress = \":80\"\n";
        assert!(matches!(
            DaemonConfig::parse(colon),
            Err(ParseFailure::Invalid(_))
        ));

        let empty = "[[listeners]]\nname = \"\"\nnetwork = \"tcp\"\naddress = \":80\"\n";
        assert!(matches!(
            DaemonConfig::parse(empty),
            Err(ParseFailure::Invalid(_))
        ));

        let network = "[[listeners]]\nname = \"x\"\nnetwork = \"sctp\"\naddress = \":80\"\n";
        assert!(matches!(
            DaemonConfig::parse(network),
            Err(ParseFailure::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_keys_and_policy() {
        assert!(matches!(
            DaemonConfig::parse("drain = 3"),
            Err(ParseFailure::Toml(_))
        ));
        assert!(matches!(
            DaemonConfig::parse("unlink_policy = \"sometimes\""),
            Err(ParseFailure::Invalid(_))
        ));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goned.toml");

        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "sync_reload = \"yes\"").unwrap();
        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("goned.toml"));
    }

    #[test]
    fn test_resolve_path_order() {
        let dir = Some(PathBuf::from("/home/u/.config"));
        let env = |key: &str| (key == CONFIG_ENV).then(|| "/etc/goned.toml".into());
        let none = |_: &str| None;

        assert_eq!(
            resolve_path_with(Some(Path::new("/x.toml")), env, dir.clone()).unwrap(),
            PathBuf::from("/x.toml")
        );
        assert_eq!(
            resolve_path_with(None, env, dir.clone()).unwrap(),
            PathBuf::from("/etc/goned.toml")
        );
        assert_eq!(
            resolve_path_with(None, none, dir).unwrap(),
            PathBuf::from("/home/u/.config/gone/goned.toml")
        );
        assert!(matches!(
            resolve_path_with(None, none, None),
            Err(ConfigError::NoPath)
        ));
    }
}
