use crate::error::{Result, TradeError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

static DEFAULT_DIMENSION_WEIGHTS: Lazy<HashMap<String, f64>> = Lazy::new(|| {
    HashMap::from([
        ("item_condition".to_string(), 0.4),
        ("communication".to_string(), 0.35),
        ("punctuality".to_string(), 0.25),
    ])
});

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub trade: TradeConfig,
    pub sweeper: SweeperConfig,
    pub reputation: ReputationConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct TradeConfig {
    /// Pending proposals allowed against the same requested garment.
    pub max_pending_per_garment: u32,
    /// Days an unanswered proposal stays pending before the sweeper closes it.
    pub expiry_days: i64,
    /// Reminder lead time before the expiry deadline.
    pub warning_hours: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Weight of the direct overall score against the dimension composite.
    pub overall_blend: f64,
    pub dimension_weights: HashMap<String, f64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            trade: TradeConfig::default(),
            sweeper: SweeperConfig::default(),
            reputation: ReputationConfig::default(),
            notifications: NotificationsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://trueque.db".to_string(),
            max_connections: Some(10),
        }
    }
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            max_pending_per_garment: 3,
            expiry_days: 7,
            warning_hours: 48,
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3600,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            overall_blend: 0.5,
            dimension_weights: DEFAULT_DIMENSION_WEIGHTS.clone(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self { webhook_url: None }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| TradeError::Config(format!("Failed to read config file: {e}")))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| TradeError::Config(format!("Failed to parse config file: {e}")))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TRUEQUE_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(webhook) = std::env::var("TRUEQUE_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(webhook);
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(TradeError::Config("Server port cannot be 0".to_string()));
        }
        if self.database.url.is_empty() {
            return Err(TradeError::Config(
                "Database URL cannot be empty".to_string(),
            ));
        }
        if self.trade.max_pending_per_garment == 0 {
            return Err(TradeError::Config(
                "max_pending_per_garment must be at least 1".to_string(),
            ));
        }
        if self.trade.expiry_days < 1 {
            return Err(TradeError::Config(
                "expiry_days must be at least 1".to_string(),
            ));
        }
        if self.trade.warning_hours < 1 || self.trade.warning_hours >= self.trade.expiry_days * 24 {
            return Err(TradeError::Config(
                "warning_hours must fall inside the expiry window".to_string(),
            ));
        }
        if self.sweeper.interval_seconds == 0 {
            return Err(TradeError::Config(
                "Sweeper interval cannot be 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reputation.overall_blend) {
            return Err(TradeError::Config(
                "overall_blend must be between 0 and 1".to_string(),
            ));
        }
        if self.reputation.dimension_weights.is_empty() {
            return Err(TradeError::Config(
                "At least one evaluation dimension is required".to_string(),
            ));
        }
        for (dimension, weight) in &self.reputation.dimension_weights {
            if *weight <= 0.0 {
                return Err(TradeError::Config(format!(
                    "Weight for dimension '{dimension}' must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| TradeError::Config(format!("Failed to serialize default config: {e}")))?;

    std::fs::write(path, toml_str)
        .map_err(|e| TradeError::Config(format!("Failed to write default config file: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.trade.max_pending_per_garment, 3);
        assert_eq!(config.trade.expiry_days, 7);
        assert_eq!(config.trade.warning_hours, 48);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reputation.overall_blend = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.trade.warning_hours = 24 * 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [trade]
            max_pending_per_garment = 5
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.trade.max_pending_per_garment, 5);
        assert_eq!(parsed.trade.expiry_days, 7);
        assert_eq!(parsed.database.url, "sqlite://trueque.db");
    }

    #[test]
    fn test_config_file_round_trip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load(path).unwrap();
        assert_eq!(loaded.server.port, 8080);
        assert_eq!(loaded.reputation.overall_blend, 0.5);
    }
}
