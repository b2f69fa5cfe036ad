use std::path::{Path, PathBuf};

use taskloom_common::{Error, Result};
use tracing::{debug, info, warn};

use crate::model::AppConfig;

const CONFIG_DIR_NAME: &str = ".taskloom";
const ENV_PREFIX: &str = "TASKLOOM_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension; anything that isn't TOML is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Loads [`AppConfig`] from disk and applies `TASKLOOM_*` environment overrides.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    /// Loader for `~/.taskloom/config.yml`.
    pub fn new() -> Self {
        Self {
            path: Self::default_config_dir().join("config.yml"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(CONFIG_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the config file (defaults when it does not exist), apply process
    /// environment overrides and validate the result.
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = if self.path.exists() {
            info!("loading config from {}", self.path.display());
            let contents = std::fs::read_to_string(&self.path)?;
            Self::parse(&contents, ConfigFormat::from_path(&self.path))?
        } else {
            debug!(
                "no config file at {}, using defaults",
                self.path.display()
            );
            AppConfig::default()
        };

        Self::apply_overrides(&mut config, std::env::vars());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str, format: ConfigFormat) -> Result<AppConfig> {
        if contents.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("invalid YAML config: {e}"))),
            ConfigFormat::Toml => toml::from_str(contents)
                .map_err(|e| Error::Config(format!("invalid TOML config: {e}"))),
        }
    }

    pub fn render(config: &AppConfig, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Yaml => serde_yaml::to_string(config)
                .map_err(|e| Error::Serialization(format!("failed to render YAML: {e}"))),
            ConfigFormat::Toml => toml::to_string_pretty(config)
                .map_err(|e| Error::Serialization(format!("failed to render TOML: {e}"))),
        }
    }

    /// Write a default config file unless one already exists.
    pub fn write_default(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = Self::render(&AppConfig::default(), ConfigFormat::from_path(&self.path))?;
        std::fs::write(&self.path, rendered)?;
        info!("wrote default config to {}", self.path.display());
        Ok(true)
    }

    /// Apply `TASKLOOM_*` variables on top of a loaded config.
    pub fn apply_overrides<I>(config: &mut AppConfig, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "MODEL" => config.provider.model = value,
                "BASE_URL" => config.provider.base_url = Some(value),
                "API_KEY_ENV" => config.provider.api_key_env = value,
                "LOG_LEVEL" => config.logging.level = value,
                "WORKING_DIR" => config.engine.working_dir = Some(PathBuf::from(value)),
                "AUTO_RUN" => match parse_bool(&value) {
                    Some(flag) => config.engine.auto_run = flag,
                    None => warn!("ignoring {key}={value}: expected a boolean"),
                },
                "MAX_REASONING_ROUNDS" => match value.parse() {
                    Ok(rounds) => config.engine.max_reasoning_rounds = rounds,
                    Err(_) => warn!("ignoring {key}={value}: expected an integer"),
                },
                _ => {}
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApprovalMode, ContinuationMode};

    #[test]
    fn parses_partial_yaml_over_defaults() {
        let yaml = r#"
provider:
  model: deepseek-chat
  base_url: https://api.deepseek.com/v1
engine:
  auto_run: true
  continuation: tool_activity
approval:
  mode: all
"#;
        let config = ConfigLoader::parse(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.provider.model, "deepseek-chat");
        assert!(config.engine.auto_run);
        assert_eq!(config.engine.continuation, ContinuationMode::ToolActivity);
        assert_eq!(config.approval.mode, ApprovalMode::All);
        // untouched sections keep their defaults
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.engine.max_reasoning_rounds, 3);
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
[retry]
max_retries = 5
base_delay_ms = 10
max_delay_ms = 100

[[context.profiles]]
model = "local-llm"
max_tokens = 8192
buffer_tokens = 1024
"#;
        let config = ConfigLoader::parse(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.context.profiles.len(), 1);
        assert_eq!(config.context.profiles[0].max_tokens, 8192);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = ConfigLoader::parse("engine: [unclosed", ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("a/config.toml")),
            ConfigFormat::Toml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("a/config.yml")),
            ConfigFormat::Yaml
        );
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        ConfigLoader::apply_overrides(
            &mut config,
            vec![
                ("TASKLOOM_MODEL".to_string(), "local".to_string()),
                ("TASKLOOM_AUTO_RUN".to_string(), "yes".to_string()),
                ("TASKLOOM_MAX_REASONING_ROUNDS".to_string(), "7".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ],
        );
        assert_eq!(config.provider.model, "local");
        assert!(config.engine.auto_run);
        assert_eq!(config.engine.max_reasoning_rounds, 7);
    }

    #[test]
    fn bad_env_values_are_ignored() {
        let mut config = AppConfig::default();
        ConfigLoader::apply_overrides(
            &mut config,
            vec![("TASKLOOM_AUTO_RUN".to_string(), "maybe".to_string())],
        );
        assert!(!config.engine.auto_run);
    }

    #[test]
    fn missing_file_loads_defaults_and_write_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yml");
        let loader = ConfigLoader::with_path(&path);

        let config = loader.load().unwrap();
        assert!(!config.logging.level.is_empty());

        assert!(loader.write_default().unwrap());
        assert!(!loader.write_default().unwrap());
        let contents = std::fs::read_to_string(&path).unwrap();
        let reparsed = ConfigLoader::parse(&contents, ConfigFormat::Yaml).unwrap();
        assert_eq!(reparsed.provider.model, AppConfig::default().provider.model);
    }
}
