//! Skill configuration loaded from YAML.
//!
//! A config path may be a single YAML file or a directory; for a directory
//! every `*.yaml`/`*.yml` file is read in file-name order and top-level keys
//! of later files override earlier ones. Missing keys take defaults.

use crate::context::ContextSettings;
use crate::topic::{TopicError, TopicPattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("no yaml files found in {0}")]
    NoYamlFiles(PathBuf),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid topic: {0}")]
    Topic(#[from] TopicError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillConfig {
    // Broker connection
    pub mqtt_server_host: String,
    pub mqtt_server_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub client_id: String,

    // Topics
    pub base_topic: String,

    // Runtime tuning
    pub intent_cache_size: usize,
    pub retry_interval_secs: u64,
    /// Threshold used for supported intents that do not set their own.
    pub certainty_threshold: f64,
    pub context: ContextSettings,

    // Registry and observability
    pub database_path: PathBuf,
    pub http_port: Option<u16>,
}

impl Default for SkillConfig {
    fn default() -> Self {
        Self {
            mqtt_server_host: "localhost".to_string(),
            mqtt_server_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            client_id: "default_skill".to_string(),
            base_topic: "assistant".to_string(),
            intent_cache_size: 1000,
            retry_interval_secs: 5,
            certainty_threshold: 0.8,
            context: ContextSettings::default(),
            database_path: dirs::data_local_dir().map_or_else(
                || PathBuf::from("skilld/registry.db"),
                |d| d.join("skilld").join("registry.db"),
            ),
            http_port: None,
        }
    }
}

impl SkillConfig {
    /// Load from a YAML file or a directory of YAML files, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let merged = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.is_file()
                        && p.extension()
                            .is_some_and(|ext| ext == "yaml" || ext == "yml")
                })
                .collect();
            if files.is_empty() {
                return Err(ConfigError::NoYamlFiles(path.to_path_buf()));
            }
            files.sort();

            let mut merged = serde_yaml::Mapping::new();
            for file in &files {
                if let serde_yaml::Value::Mapping(map) = read_yaml(file)? {
                    merged.extend(map);
                }
            }
            serde_yaml::Value::Mapping(merged)
        } else {
            read_yaml(path)?
        };

        let config: Self = match merged {
            serde_yaml::Value::Null => Self::default(),
            value => serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.intent_cache_size == 0 {
            return Err(invalid("intent_cache_size", "must be greater than zero"));
        }
        if self.retry_interval_secs == 0 {
            return Err(invalid("retry_interval_secs", "must be greater than zero"));
        }
        if self.client_id.is_empty() {
            return Err(invalid("client_id", "must not be empty"));
        }
        check_unit("certainty_threshold", self.certainty_threshold)?;
        check_unit(
            "context.confidence_threshold_default",
            self.context.confidence_threshold_default,
        )?;
        check_unit(
            "context.confidence_threshold_recent",
            self.context.confidence_threshold_recent,
        )?;

        for topic in [
            self.intent_analysis_result_topic(),
            self.broadcast_topic(),
            self.feedback_topic(),
            self.device_update_topic(),
        ] {
            if TopicPattern::parse(&topic)?.has_wildcards() {
                return Err(invalid("base_topic", "must not contain wildcards"));
            }
        }
        Ok(())
    }

    pub fn skill_id(&self) -> &str {
        &self.client_id
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn intent_analysis_result_topic(&self) -> String {
        format!("{}/intent_engine/result", self.base_topic)
    }

    pub fn broadcast_topic(&self) -> String {
        format!("{}/broadcast", self.base_topic)
    }

    pub fn feedback_topic(&self) -> String {
        format!("{}/{}/feedback", self.base_topic, self.client_id)
    }

    pub fn device_update_topic(&self) -> String {
        format!("{}/global_device_update", self.base_topic)
    }
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn check_unit(key: &'static str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            reason: format!("{value} is outside [0, 1]"),
        })
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
    }
}
