use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration, loaded from a TOML file. Every field has a
/// default, so a missing file yields a runnable config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub database_path: PathBuf,
    pub pacing: PacingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8085".into(),
            database_path: PathBuf::from("funnelgram.db"),
            pacing: PacingConfig::default(),
        }
    }
}

/// Typing-cadence delays in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub typing_ms: u64,
    pub step_ms: u64,
    pub branch_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            typing_ms: 800,
            step_ms: 500,
            branch_ms: 200,
        }
    }
}

impl From<PacingConfig> for crate::funnel::state::Pacing {
    fn from(config: PacingConfig) -> Self {
        Self {
            typing: Duration::from_millis(config.typing_ms),
            step: Duration::from_millis(config.step_ms),
            branch: Duration::from_millis(config.branch_ms),
        }
    }
}

impl Config {
    /// Load from an explicit path, `./funnelgram.toml`, or the user
    /// config directory; defaults apply when no file exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let local = PathBuf::from("funnelgram.toml");
                if local.exists() {
                    Some(local)
                } else {
                    directories::ProjectDirs::from("", "", "funnelgram")
                        .map(|dirs| dirs.config_dir().join("funnelgram.toml"))
                        .filter(|p| p.exists())
                }
            }
        };

        let Some(file) = candidate else {
            return Ok(Config::default());
        };
        if !file.exists() {
            anyhow::bail!("config file not found: {}", file.display());
        }

        let content = std::fs::read_to_string(&file)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", file.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", file.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::state::Pacing;

    #[test]
    fn defaults_when_no_file() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8085");
        assert_eq!(config.pacing.step_ms, 500);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
listen_addr = "127.0.0.1:9000"

[pacing]
step_ms = 0
"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.pacing.step_ms, 0);
        // Unspecified fields keep their defaults.
        assert_eq!(config.pacing.typing_ms, 800);
        assert_eq!(config.database_path, PathBuf::from("funnelgram.db"));
    }

    #[test]
    fn pacing_conversion() {
        let pacing: Pacing = PacingConfig {
            typing_ms: 0,
            step_ms: 100,
            branch_ms: 50,
        }
        .into();
        assert!(pacing.typing.is_zero());
        assert_eq!(pacing.step, Duration::from_millis(100));
        assert_eq!(pacing.branch, Duration::from_millis(50));
    }

    #[test]
    fn explicit_missing_path_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/funnelgram.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_from_explicit_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:1234\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:1234");
    }
}
