use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crawl::{CrawlOptions, FailurePolicy, MaxDepth};
use crate::retry::RetryPolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SOCIALGRAPH_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "socialgraph.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub instagram: InstagramConfig,
}

/// Traversal settings
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: MaxDepth,
    /// Accounts to page through per node and direction; 0 means no limit.
    #[serde(default = "default_max_follow")]
    pub max_follow: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_follow: default_max_follow(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_max_depth() -> MaxDepth {
    MaxDepth::new(1)
}

fn default_max_follow() -> usize {
    100
}

/// Retry and rate-limit settings
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Wait after a rate-limit response without a Retry-After header.
    #[serde(default = "default_rate_limit_delay_secs")]
    pub rate_limit_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_delay_secs: default_rate_limit_delay_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_rate_limit_delay_secs() -> u64 {
    300
}

/// Output artifact paths
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
    #[serde(default = "default_graph_file")]
    pub graph_file: PathBuf,
    /// SQLite checkpoint; unset disables checkpointing.
    #[serde(default)]
    pub checkpoint_db: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            users_file: default_users_file(),
            graph_file: default_graph_file(),
            checkpoint_db: None,
        }
    }
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.tsv")
}

fn default_graph_file() -> PathBuf {
    PathBuf::from("graph.tsv")
}

/// Instagram API backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct InstagramConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_client_id_env")]
    pub client_id_env: String,
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Warn when X-Ratelimit-Remaining drops to this value or below.
    #[serde(default = "default_low_rate_limit_warning")]
    pub low_rate_limit_warning: u32,
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            client_id_env: default_client_id_env(),
            client_secret_env: default_client_secret_env(),
            timeout_secs: default_timeout_secs(),
            low_rate_limit_warning: default_low_rate_limit_warning(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.instagram.com/v1".to_string()
}

fn default_client_id_env() -> String {
    "INSTAGRAM_CLIENT_ID".to_string()
}

fn default_client_secret_env() -> String {
    "INSTAGRAM_CLIENT_SECRET".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_low_rate_limit_warning() -> u32 {
    5
}

impl Config {
    /// Load configuration
    ///
    /// Loads environment variables from .env file (if present) first.
    /// Looks for the config file in this order:
    /// 1. Path specified in SOCIALGRAPH_CONFIG environment variable (must exist)
    /// 2. ./socialgraph.toml in current directory (optional; defaults apply)
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    log::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Config::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!("retry.base_backoff_ms must not exceed retry.max_backoff_ms");
        }

        if self.output.users_file.as_os_str().is_empty() || self.output.graph_file.as_os_str().is_empty() {
            anyhow::bail!("output.users_file and output.graph_file must be set");
        }

        if self.output.users_file == self.output.graph_file {
            anyhow::bail!(
                "output.users_file and output.graph_file must differ (both are {})",
                self.output.users_file.display()
            );
        }

        if self.instagram.timeout_secs == 0 {
            anyhow::bail!("instagram.timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn crawl_options(&self) -> CrawlOptions {
        CrawlOptions {
            max_depth: self.crawl.max_depth,
            max_follow: (self.crawl.max_follow > 0).then_some(self.crawl.max_follow),
            failure_policy: self.crawl.failure_policy,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            rate_limit_delay: Duration::from_secs(self.retry.rate_limit_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const FULL_CONFIG: &str = r#"
[crawl]
max_depth = 2.5
max_follow = 0
failure_policy = "abort"

[retry]
max_attempts = 3
base_backoff_ms = 250
max_backoff_ms = 2000
rate_limit_delay_secs = 60

[output]
users_file = "out/users.tsv"
graph_file = "out/graph.tsv"
checkpoint_db = "out/crawl.db"

[instagram]
api_url = "http://localhost:9999/v1"
timeout_secs = 5
"#;

    fn with_config_env(config_path: &Path, f: impl FnOnce()) {
        let original = std::env::var(CONFIG_ENV).ok();
        std::env::set_var(CONFIG_ENV, config_path);
        f();
        std::env::remove_var(CONFIG_ENV);
        if let Some(val) = original {
            std::env::set_var(CONFIG_ENV, val);
        }
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("socialgraph.toml");
        fs::write(&config_path, FULL_CONFIG).unwrap();

        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.crawl.max_depth, MaxDepth::with_half_hop(2));
            assert_eq!(config.crawl.failure_policy, FailurePolicy::Abort);
            assert_eq!(config.output.checkpoint_db, Some(PathBuf::from("out/crawl.db")));
            assert_eq!(config.instagram.api_url, "http://localhost:9999/v1");
            assert_eq!(config.instagram.client_id_env, "INSTAGRAM_CLIENT_ID");
        });
    }

    #[test]
    fn test_defaults_apply_to_missing_sections() {
        let config: Config = toml::from_str("[crawl]\nmax_depth = 3\n").unwrap();
        assert_eq!(config.crawl.max_depth, MaxDepth::new(3));
        assert_eq!(config.crawl.max_follow, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.rate_limit_delay_secs, 300);
        assert_eq!(config.output.users_file, PathBuf::from("users.tsv"));
        assert!(config.output.checkpoint_db.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let config: Config = toml::from_str(FULL_CONFIG).unwrap();
        let options = config.crawl_options();
        assert_eq!(options.max_follow, None);
        assert_eq!(options.failure_policy, FailurePolicy::Abort);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_backoff, Duration::from_millis(250));
        assert_eq!(policy.rate_limit_delay, Duration::from_secs(60));

        let config = Config::default();
        assert_eq!(config.crawl_options().max_follow, Some(100));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.output.graph_file = config.output.users_file.clone();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.base_backoff_ms = 10_000;
        config.retry.max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_depth_rejected_at_parse() {
        assert!(toml::from_str::<Config>("[crawl]\nmax_depth = 1.2\n").is_err());
        assert!(toml::from_str::<Config>("[crawl]\nmax_depth = \"far\"\n").is_err());
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        with_config_env(Path::new("nonexistent.toml"), || {
            let config = Config::load();
            assert!(config.is_err());
        });
    }
}
