use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rentscan_storage::{parse_cookie_string, HttpClientConfig};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Runtime settings for one collection run. Every field has an env override.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub output_dir: PathBuf,
    pub status_file: PathBuf,
    pub stop_signal_file: PathBuf,
    pub building_cache: PathBuf,
    pub site_url: String,
    pub graphql_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workers: usize,
    pub checkpoint_interval: usize,
    pub excluded_status: String,
    pub cookies: String,
    pub challenge_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let http = HttpClientConfig::default();
        Self {
            output_dir: PathBuf::from("."),
            status_file: PathBuf::from("scraper_status.json"),
            stop_signal_file: PathBuf::from("scraper_stop_signal.txt"),
            building_cache: PathBuf::from("building_info.json"),
            site_url: http.site_url,
            graphql_url: http.graphql_url,
            user_agent: http.user_agent,
            http_timeout_secs: 15,
            workers: 4,
            checkpoint_interval: 100,
            excluded_status: "DELISTED".to_string(),
            cookies: String::new(),
            challenge_timeout_secs: 1800,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            output_dir: std::env::var("RENTSCAN_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            status_file: std::env::var("RENTSCAN_STATUS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.status_file),
            stop_signal_file: std::env::var("RENTSCAN_STOP_SIGNAL_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.stop_signal_file),
            building_cache: std::env::var("RENTSCAN_BUILDING_CACHE")
                .map(PathBuf::from)
                .unwrap_or(defaults.building_cache),
            site_url: env_string("RENTSCAN_SITE_URL", &defaults.site_url),
            graphql_url: env_string("RENTSCAN_GRAPHQL_URL", &defaults.graphql_url),
            user_agent: env_string("RENTSCAN_USER_AGENT", &defaults.user_agent),
            http_timeout_secs: env_parse("RENTSCAN_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            workers: env_parse("RENTSCAN_WORKERS", defaults.workers).max(1),
            checkpoint_interval: env_parse("RENTSCAN_CHECKPOINT_INTERVAL", defaults.checkpoint_interval)
                .max(1),
            excluded_status: env_string("RENTSCAN_EXCLUDED_STATUS", &defaults.excluded_status),
            cookies: env_string("RENTSCAN_COOKIES", ""),
            challenge_timeout_secs: env_parse(
                "RENTSCAN_CHALLENGE_TIMEOUT_SECS",
                defaults.challenge_timeout_secs,
            ),
            workspace_root: std::env::var("RENTSCAN_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            site_url: self.site_url.clone(),
            graphql_url: self.graphql_url.clone(),
            cookies: parse_cookie_string(&self.cookies),
            global_concurrency: self.workers * 2,
        }
    }
}
