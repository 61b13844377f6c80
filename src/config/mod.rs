use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Config holds all application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub db_max_connections: u32,
    pub listen_addr: String,
    pub scheduler_tick: Duration,
    pub ssh_port: u16,
    pub ssh_timeout_secs: u64,
    pub shutdown_grace: Duration,
    /// Default start of a one-time task, relative to its creation
    pub one_time_start_delay: chrono::Duration,
    /// Default start of a recurring task, relative to its creation
    pub recurring_start_delay: chrono::Duration,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self {
            db_path: get_env("DB_PATH", "/data/forge-tasks.db"),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 5),
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8080"),
            scheduler_tick: Duration::from_millis(parse_positive_env("SCHEDULER_TICK_MS", 1000)),
            ssh_port: parse_env("SSH_PORT", 22),
            ssh_timeout_secs: parse_env("SSH_TIMEOUT_SECS", 30),
            shutdown_grace: Duration::from_secs(parse_env("SHUTDOWN_GRACE_SECS", 30)),
            one_time_start_delay: parse_delay_env("ONE_TIME_START_DELAY_SECS", 5),
            recurring_start_delay: parse_delay_env("RECURRING_START_DELAY_SECS", 40),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

/// Like [`parse_env`], but zero also falls back to the default
fn parse_positive_env(key: &str, default: u64) -> u64 {
    match parse_env(key, default) {
        0 => {
            tracing::warn!("Ignoring {}=0, must be at least 1, using {}", key, default);
            default
        }
        value => value,
    }
}

fn parse_delay_env(key: &str, default_secs: i64) -> chrono::Duration {
    let secs = parse_env(key, default_secs);
    chrono::Duration::try_seconds(secs).unwrap_or_else(|| {
        tracing::warn!("Ignoring out of range {}={}, using {}", key, secs, default_secs);
        chrono::Duration::seconds(default_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_falls_back_on_garbage() {
        env::set_var("FORGE_TASKS_TEST_TICK", "not-a-number");
        assert_eq!(parse_env("FORGE_TASKS_TEST_TICK", 1000u64), 1000);
        env::set_var("FORGE_TASKS_TEST_TICK", " 250 ");
        assert_eq!(parse_env("FORGE_TASKS_TEST_TICK", 1000u64), 250);
        env::remove_var("FORGE_TASKS_TEST_TICK");
        assert_eq!(parse_env("FORGE_TASKS_TEST_TICK", 1000u64), 1000);
    }

    #[test]
    fn test_zero_tick_falls_back_to_default() {
        env::set_var("FORGE_TASKS_TEST_ZERO_TICK", "0");
        assert_eq!(parse_positive_env("FORGE_TASKS_TEST_ZERO_TICK", 1000), 1000);
        env::set_var("FORGE_TASKS_TEST_ZERO_TICK", "1");
        assert_eq!(parse_positive_env("FORGE_TASKS_TEST_ZERO_TICK", 1000), 1);
        env::remove_var("FORGE_TASKS_TEST_ZERO_TICK");
    }

    #[test]
    fn test_load_never_yields_zero_tick() {
        env::set_var("SCHEDULER_TICK_MS", "0");
        let cfg = Config::load();
        env::remove_var("SCHEDULER_TICK_MS");
        assert_eq!(cfg.scheduler_tick, Duration::from_millis(1000));
    }
}
