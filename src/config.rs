//! Configuration (spec.md §7, SPEC_FULL.md §4.7).
//!
//! YAML file plus environment variable overrides, following the teacher's
//! `Config::load()`/`apply_env_overrides()` split in `src/config.rs`.
//! Missing or empty required fields surface as a fatal [`ConfigError`].

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cloud: CloudConfig,
    pub timers: TimerConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/kiosk.db".to_string(),
        }
    }
}

/// One cloud REST endpoint. `url_template` may reference `$deviceId` and
/// `$customerId`, substituted at call time (spec.md §6).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url_template: String,
    pub api_key: Option<String>,
}

/// Cloud endpoint table (spec.md §6): one entry per cloud-facing API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub product: EndpointConfig,
    pub collection: EndpointConfig,
    pub brand: EndpointConfig,
    pub planogram: EndpointConfig,
    pub transaction: EndpointConfig,
    pub prereservation: EndpointConfig,
    /// Device identifier substituted for `$deviceId` in URL templates.
    pub device_id: String,
}

/// Timer windows, in seconds, driving the three reservation timer sets
/// (spec.md §4.4) and the bus dispatch/sweep ticks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub prereservation_window_secs: u64,
    pub checkout_window_secs: u64,
    pub reservation_window_secs: u64,
    pub order_history_window_secs: u64,
    pub dispatch_tick_millis: u64,
    pub sweep_tick_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            prereservation_window_secs: 60,
            checkout_window_secs: 120,
            reservation_window_secs: 300,
            order_history_window_secs: 86_400,
            dispatch_tick_millis: 100,
            sweep_tick_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local directory that cached product/collection images are written to.
    pub local_dir: String,
    /// URL prefix exposed to the UI model for locally-cached media.
    pub url_prefix: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            local_dir: "./data/media".to_string(),
            url_prefix: "/media".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest): environment variables, config file,
    /// defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("KIOSK_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("reading '{path}': {e}")))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("KIOSK_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Ok(device_id) = std::env::var("KIOSK_DEVICE_ID") {
            self.cloud.device_id = device_id;
        }
        if let Ok(dir) = std::env::var("KIOSK_MEDIA_DIR") {
            self.media.local_dir = dir;
        }
        if let Ok(level) = std::env::var("KIOSK_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Reject configurations the rest of the crate cannot run with
    /// (spec.md §7: missing/empty required fields are fatal at startup).
    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.path.trim().is_empty() {
            return Err(ConfigError::Empty("storage.path".to_string()));
        }
        if self.cloud.device_id.trim().is_empty() {
            return Err(ConfigError::Missing("cloud.device_id".to_string()));
        }
        for (name, endpoint) in [
            ("cloud.product", &self.cloud.product),
            ("cloud.collection", &self.cloud.collection),
            ("cloud.brand", &self.cloud.brand),
            ("cloud.planogram", &self.cloud.planogram),
            ("cloud.transaction", &self.cloud.transaction),
            ("cloud.prereservation", &self.cloud.prereservation),
        ] {
            if endpoint.url_template.trim().is_empty() {
                return Err(ConfigError::Missing(format!("{name}.url_template")));
            }
        }
        Ok(())
    }
}

/// Substitute `$deviceId`/`$customerId` placeholders in a URL template
/// (spec.md §6).
pub fn render_endpoint(template: &str, device_id: &str, customer_id: Option<&str>) -> String {
    let mut rendered = template.replace("$deviceId", device_id);
    if let Some(customer_id) = customer_id {
        rendered = rendered.replace("$customerId", customer_id);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.cloud.device_id = "kiosk-1".to_string();
        for endpoint in [
            &mut config.cloud.product,
            &mut config.cloud.collection,
            &mut config.cloud.brand,
            &mut config.cloud.planogram,
            &mut config.cloud.transaction,
            &mut config.cloud.prereservation,
        ] {
            endpoint.url_template = "https://cloud.example/api".to_string();
        }
        config
    }

    #[test]
    fn default_config_has_expected_timer_windows() {
        let config = Config::default();
        assert_eq!(config.timers.reservation_window_secs, 300);
        assert_eq!(config.timers.dispatch_tick_millis, 100);
    }

    #[test]
    fn validate_rejects_missing_device_id() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn validate_accepts_fully_populated_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_storage_path() {
        let mut config = valid_config();
        config.storage.path = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Empty(_))));
    }

    #[test]
    fn render_endpoint_substitutes_both_placeholders() {
        let rendered = render_endpoint(
            "https://cloud.example/devices/$deviceId/customers/$customerId",
            "kiosk-1",
            Some("cust-9"),
        );
        assert_eq!(rendered, "https://cloud.example/devices/kiosk-1/customers/cust-9");
    }

    #[test]
    fn parse_yaml_overrides_defaults() {
        let yaml = r#"
storage:
  path: /tmp/test.db
cloud:
  device_id: kiosk-42
  product:
    url_template: "https://cloud.example/products"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.path, "/tmp/test.db");
        assert_eq!(config.cloud.device_id, "kiosk-42");
        assert_eq!(config.cloud.product.url_template, "https://cloud.example/products");
    }
}
