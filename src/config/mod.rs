//! Configuration loading and storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::Credentials;
use crate::budget::BudgetPolicy;
use crate::coordinator::Settings;
use crate::scheduler::SchedulePolicy;

/// Application configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub limits: LimitsConfig,
    pub schedule: ScheduleConfig,
    /// State document location (defaults to `state.json` in the data dir)
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Secret id from the provider dashboard
    pub secret_id: Option<String>,
    /// Secret key from the provider dashboard
    pub secret_key: Option<String>,
    /// Where the bank sends the user after authorization
    pub redirect_url: String,
    pub request_timeout_secs: u64,
    /// Refresh the access token this long before it expires
    pub token_refresh_margin_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://bankaccountdata.gocardless.com".to_string(),
            secret_id: None,
            secret_key: None,
            redirect_url: "http://localhost:8080/callback".to_string(),
            request_timeout_secs: 30,
            token_refresh_margin_secs: 60,
        }
    }
}

/// Documented per-account daily limits; ceilings are derived with `safety_factor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub balances_per_day: u32,
    pub details_per_day: u32,
    pub transactions_per_day: u32,
    pub safety_factor: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let policy = BudgetPolicy::default();
        Self {
            balances_per_day: policy.balances_per_day,
            details_per_day: policy.details_per_day,
            transactions_per_day: policy.transactions_per_day,
            safety_factor: policy.safety_factor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub balances_interval_secs: u64,
    pub details_interval_secs: u64,
    pub transactions_interval_secs: u64,
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
    /// Period of the `run` loop
    pub refresh_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let policy = SchedulePolicy::default();
        Self {
            balances_interval_secs: policy.balances_interval.as_secs(),
            details_interval_secs: policy.details_interval.as_secs(),
            transactions_interval_secs: policy.transactions_interval.as_secs(),
            jitter_min_secs: policy.jitter_min.as_secs(),
            jitter_max_secs: policy.jitter_max.as_secs(),
            refresh_interval_secs: 3600,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "bankdata", "bankdata")
            .context("Could not determine config directory")
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk. Returns where it was written.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains the secret key)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Store secrets so later runs need no command-line or environment override.
    pub fn remember_credentials(&mut self, credentials: &Credentials) {
        self.api.secret_id = Some(credentials.secret_id.clone());
        self.api.secret_key = Some(credentials.secret_key.clone());
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("state.json")),
        }
    }

    /// Secrets from the config file, each overridable from the command line or environment.
    pub fn credentials(
        &self,
        secret_id: Option<String>,
        secret_key: Option<String>,
    ) -> Option<Credentials> {
        Some(Credentials {
            secret_id: secret_id.or_else(|| self.api.secret_id.clone())?,
            secret_key: secret_key.or_else(|| self.api.secret_key.clone())?,
        })
    }

    pub fn budget_policy(&self) -> BudgetPolicy {
        BudgetPolicy {
            balances_per_day: self.limits.balances_per_day,
            details_per_day: self.limits.details_per_day,
            transactions_per_day: self.limits.transactions_per_day,
            safety_factor: self.limits.safety_factor,
        }
    }

    pub fn schedule_policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            balances_interval: Duration::from_secs(self.schedule.balances_interval_secs),
            details_interval: Duration::from_secs(self.schedule.details_interval_secs),
            transactions_interval: Duration::from_secs(self.schedule.transactions_interval_secs),
            jitter_min: Duration::from_secs(self.schedule.jitter_min_secs),
            jitter_max: Duration::from_secs(self.schedule.jitter_max_secs),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.refresh_interval_secs.max(60))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            redirect_url: self.api.redirect_url.clone(),
            request_timeout: Duration::from_secs(self.api.request_timeout_secs.max(1)),
            token_refresh_margin: Duration::from_secs(self.api.token_refresh_margin_secs),
            budget: self.budget_policy(),
            schedule: self.schedule_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.budget_policy(), BudgetPolicy::default());
        assert_eq!(config.schedule_policy(), SchedulePolicy::default());
        assert_eq!(config.refresh_interval(), Duration::from_secs(3600));
        assert!(config.credentials(None, None).is_none());
    }

    #[test]
    fn test_partial_tables_and_overrides() {
        let config = Config::parse(
            r#"
            state_path = "/tmp/bankdata/state.json"

            [api]
            secret_id = "id-from-file"
            secret_key = "key-from-file"
            request_timeout_secs = 10

            [limits]
            transactions_per_day = 10
            safety_factor = 0.5
            "#,
        )
        .unwrap();

        let settings = config.settings();
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.budget.ceiling(Category::Transactions), 5);
        assert_eq!(settings.budget.ceiling(Category::Balances), 1);
        assert_eq!(
            config.state_path().unwrap(),
            PathBuf::from("/tmp/bankdata/state.json")
        );

        let creds = config
            .credentials(Some("id-from-env".into()), None)
            .unwrap();
        assert_eq!(creds.secret_id, "id-from-env");
        assert_eq!(creds.secret_key, "key-from-file");
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = Config::default();
        config.api.secret_id = Some("abc".into());
        config.schedule.jitter_max_secs = 90;

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::parse(&text).unwrap();

        assert_eq!(parsed.api.secret_id.as_deref(), Some("abc"));
        assert_eq!(parsed.schedule_policy().jitter_max, Duration::from_secs(90));
    }

    #[test]
    fn test_saved_secrets_reload_with_private_permissions() {
        let dir = std::env::temp_dir().join(format!("bankdata-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.toml");
        assert!(Config::load_from(&path).unwrap().credentials(None, None).is_none());

        let mut config = Config::default();
        config.limits.transactions_per_day = 8;
        config.remember_credentials(&Credentials {
            secret_id: "id-1".into(),
            secret_key: "key-1".into(),
        });
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        let creds = loaded.credentials(None, None).unwrap();
        assert_eq!(creds.secret_id, "id-1");
        assert_eq!(creds.secret_key, "key-1");
        assert_eq!(loaded.limits.transactions_per_day, 8);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let _ = fs::remove_dir_all(dir);
    }
}
