use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

/// Typed runtime configuration.
///
/// Values come from the environment, with an optional `.env` file that
/// never overrides variables already set.
#[derive(Clone, Debug)]
pub struct Config {
    // Manager bot
    pub manager_bot_token: String,
    pub superusers: Vec<i64>,

    // Persistence
    pub database_type: String,
    pub database_dsn: String,

    // Optional cache
    pub redis: RedisConfig,

    // Rate limits (per second)
    pub rate_limit_telegram_api: u32,
    pub rate_limit_guest_message: u32,

    // Retry
    pub retry_max_attempts: u32,
    pub retry_interval: Duration,

    // Logging
    pub log_level: String,
    pub log_output: String,
    pub log_file_path: Option<String>,

    // Environment + secrets
    pub environment: String,
    pub encryption_key: Option<String>,

    // Outbound proxy
    pub proxy: ProxyConfig,
}

#[derive(Clone, Debug, Default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL in the form redis://[:password@]host:port/db.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) if !pass.is_empty() => {
                format!("redis://:{}@{}/{}", pass, self.address, self.db)
            }
            _ => format!("redis://{}/{}", self.address, self.db),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let manager_bot_token = env_str("MANAGER_BOT_TOKEN").unwrap_or_default();
        if manager_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "MANAGER_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let superusers = parse_csv_i64(env_str("MANAGER_BOT_SUPERUSERS"));
        if superusers.is_empty() {
            return Err(Error::Config(
                "MANAGER_BOT_SUPERUSERS environment variable is required".to_string(),
            ));
        }

        let database_type = env_str("DATABASE_TYPE").unwrap_or_else(|| "sqlite".to_string());
        if database_type != "sqlite" {
            return Err(Error::Config(format!(
                "unsupported DATABASE_TYPE: {database_type} (only sqlite is supported)"
            )));
        }
        let database_dsn = env_str("DATABASE_DSN").unwrap_or_else(|| "fwdbot.db".to_string());

        let redis = RedisConfig {
            enabled: env_bool("REDIS_ENABLED").unwrap_or(false),
            address: env_str("REDIS_ADDRESS").unwrap_or_else(|| "127.0.0.1:6379".to_string()),
            password: env_str("REDIS_PASSWORD").and_then(non_empty),
            db: env_i64("REDIS_DB").unwrap_or(0),
        };

        let rate_limit_telegram_api = env_u32("RATE_LIMIT_TELEGRAM_API").unwrap_or(30);
        let rate_limit_guest_message = env_u32("RATE_LIMIT_GUEST_MESSAGE").unwrap_or(1);
        if rate_limit_telegram_api == 0 || rate_limit_guest_message == 0 {
            return Err(Error::Config("rate limits must be positive".to_string()));
        }

        let retry_max_attempts = env_u32("RETRY_MAX_ATTEMPTS").unwrap_or(3).max(1);
        let retry_interval = Duration::from_secs(env_u64("RETRY_INTERVAL_SECONDS").unwrap_or(5));

        let log_level = env_str("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_output = env_str("LOG_OUTPUT").unwrap_or_else(|| "stdout".to_string());
        let log_file_path = env_str("LOG_FILE_PATH").and_then(non_empty);
        if log_output == "file" && log_file_path.is_none() {
            return Err(Error::Config(
                "LOG_FILE_PATH is required when LOG_OUTPUT=file".to_string(),
            ));
        }

        let environment = env_str("ENVIRONMENT").unwrap_or_else(|| "development".to_string());
        let encryption_key = env_str("ENCRYPTION_KEY").and_then(non_empty);

        let proxy = ProxyConfig {
            enabled: env_bool("PROXY_ENABLED").unwrap_or(false),
            url: env_str("PROXY_URL").unwrap_or_default(),
            username: env_str("PROXY_USERNAME").and_then(non_empty),
            password: env_str("PROXY_PASSWORD").and_then(non_empty),
        };
        if proxy.enabled && proxy.url.trim().is_empty() {
            return Err(Error::Config(
                "PROXY_URL is required when PROXY_ENABLED=true".to_string(),
            ));
        }

        Ok(Self {
            manager_bot_token,
            superusers,
            database_type,
            database_dsn,
            redis,
            rate_limit_telegram_api,
            rate_limit_guest_message,
            retry_max_attempts,
            retry_interval,
            log_level,
            log_output,
            log_file_path,
            environment,
            encryption_key,
            proxy,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
