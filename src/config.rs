use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up when no path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "config/sentinel.toml";

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory scanned for dropped artifacts
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,
    /// Append-only audit log
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// Extension (including the leading dot) that marks an entry as executable
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on a single artifact run before it is killed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("./sandbox")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("sandboxwatch.log")
}

fn default_marker() -> String {
    ".exe".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            log_file: default_log_file(),
            marker: default_marker(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parses TOML content, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config to use at startup.
    ///
    /// An explicit path must exist. Without one, the default path is
    /// used when present, otherwise the built-in defaults apply.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.marker.len() < 2 || !self.marker.starts_with('.') {
            return Err(anyhow!(
                "marker must be a file extension such as \".exe\" (got {:?})",
                self.marker
            ));
        }
        if self.marker[1..].contains('.') {
            return Err(anyhow!(
                "marker must be a single extension without inner dots (got {:?})",
                self.marker
            ));
        }
        if self.interval_secs == 0 {
            return Err(anyhow!("interval_secs must be greater than zero"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_watcher_constants() {
        let config = Config::default();
        assert_eq!(config.watch_dir, PathBuf::from("./sandbox"));
        assert_eq!(config.log_file, PathBuf::from("sandboxwatch.log"));
        assert_eq!(config.marker, ".exe");
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse(
            r#"
            watch_dir = "/var/lib/sentinel/drop"
            log_file = "/var/log/sentinel.log"
            marker = ".bin"
            interval_secs = 2
            timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.watch_dir, PathBuf::from("/var/lib/sentinel/drop"));
        assert_eq!(config.log_file, PathBuf::from("/var/log/sentinel.log"));
        assert_eq!(config.marker, ".bin");
        assert_eq!(config.interval(), Duration::from_secs(2));
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_expands_env_vars() {
        std::env::set_var("SANDBOX_SENTINEL_TEST_DIR", "/tmp/drop-zone");
        let config = Config::parse(r#"watch_dir = "${SANDBOX_SENTINEL_TEST_DIR}/in""#).unwrap();
        assert_eq!(config.watch_dir, PathBuf::from("/tmp/drop-zone/in"));
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        assert!(Config::parse("watchdir = \"x\"").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_marker() {
        for marker in ["", ".", "exe", ".tar.gz"] {
            let config = Config {
                marker: marker.to_string(),
                ..Config::default()
            };
            assert!(config.validate().is_err(), "marker {marker:?} should be rejected");
        }
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = Config {
            interval_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn test_resolve_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(&path, "interval_secs = 5\n").unwrap();
        let config = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.marker, ".exe");
    }
}
