//! AlarmSrv configuration
//!
//! Loaded with figment from a YAML file, overridden by `ALARMSRV_` environment
//! variables (`__` separates nested keys, e.g. `ALARMSRV_STORE__URL`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;
use voltage_alarm_store::{AlarmState, Handle};

use crate::algorithm::AlgorithmConfig;
use crate::error::{invalid_input, AlarmError, Result};

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite URL, e.g. `sqlite://data/alarms.db`
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default)]
    pub external_access: bool,
}

fn default_store_url() -> String {
    "sqlite://data/alarms.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: default_store_url(),
            external_access: false,
        }
    }
}

/// Longest retention age a class accepts, in days
pub const MAX_AGE_DAYS_LIMIT: u32 = 36_500;

/// Retention and acknowledgement policy of a class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSettings {
    /// 0 keeps every record
    pub max_records: usize,
    /// 0 keeps records forever
    pub max_age_days: u32,
    pub ack_required: bool,
}

impl ClassSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_age_days > MAX_AGE_DAYS_LIMIT {
            return Err(invalid_input(format!(
                "max_age_days {} exceeds {}",
                self.max_age_days, MAX_AGE_DAYS_LIMIT
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    pub algorithm: AlgorithmConfig,
    /// Cached state persisted across restarts
    #[serde(default)]
    pub alarm_state: AlarmState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_alarm_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    #[serde(default)]
    pub max_records: usize,
    #[serde(default)]
    pub max_age_days: u32,
    #[serde(default)]
    pub ack_required: bool,
    #[serde(default)]
    pub watches: Vec<WatchConfig>,
}

impl ClassConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: None,
            max_records: 0,
            max_age_days: 0,
            ack_required: false,
            watches: Vec::new(),
        }
    }

    pub fn settings(&self) -> ClassSettings {
        ClassSettings {
            max_records: self.max_records,
            max_age_days: self.max_age_days,
            ack_required: self.ack_required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    /// Records scanned between cooperative yields while recomputing counts
    #[serde(default = "default_count_yield_every")]
    pub count_yield_every: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Next handle to assign to a registered class or watch
    #[serde(default = "default_next_handle")]
    pub next_handle: u32,
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

fn default_housekeeping_interval() -> u64 {
    10
}

fn default_count_yield_every() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_next_handle() -> u32 {
    1
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            count_yield_every: default_count_yield_every(),
            log_level: default_log_level(),
            next_handle: default_next_handle(),
            classes: Vec::new(),
        }
    }
}

impl AlarmConfig {
    /// Load from `path` (if present) plus `ALARMSRV_` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AlarmConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(AlarmError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: AlarmConfig = figment
            .merge(Env::prefixed("ALARMSRV_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without consulting the environment
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AlarmConfig = Figment::from(Serialized::defaults(AlarmConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.housekeeping_interval_secs == 0 {
            return Err(AlarmError::Config(
                "housekeeping_interval_secs must be positive".to_string(),
            ));
        }
        if self.count_yield_every == 0 {
            return Err(AlarmError::Config(
                "count_yield_every must be positive".to_string(),
            ));
        }
        if self.next_handle == 0 {
            return Err(AlarmError::Config("next_handle must be positive".to_string()));
        }
        let mut names = std::collections::HashSet::new();
        for class in &self.classes {
            if class.name.trim().is_empty() {
                return Err(AlarmError::Config("class name must not be empty".to_string()));
            }
            if !names.insert(class.name.as_str()) {
                return Err(AlarmError::Config(format!(
                    "duplicate class name: {}",
                    class.name
                )));
            }
            class
                .settings()
                .validate()
                .map_err(|e| AlarmError::Config(format!("{}: {}", class.name, e)))?;
            for watch in &class.watches {
                watch
                    .algorithm
                    .validate()
                    .map_err(|e| AlarmError::Config(format!("{}: {}", watch.source_path, e)))?;
            }
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| AlarmError::Config(e.to_string()))
    }

    /// Commented starting configuration
    pub fn default_yaml() -> String {
        r#"# AlarmSrv configuration
store:
  backend: sqlite          # memory | sqlite
  url: sqlite://data/alarms.db
  external_access: false
housekeeping_interval_secs: 10
count_yield_every: 100
log_level: info
next_handle: 1
classes:
  - name: bms
    max_records: 10000
    max_age_days: 30
    ack_required: true
    watches:
      - source_path: /bms/rack1/soc
        algorithm:
          type: out_of_range
          min: 10.0
          max: 95.0
          alarm_type: ALERT
      - source_path: /bms/rack1/comms
        algorithm:
          type: stale
          stale_secs: 60
          alarm_type: FAULT
"#
        .to_string()
    }
}
