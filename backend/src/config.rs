use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use draw_core::DEFAULT_SHUFFLE_STEPS;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    key: &'static str,
    value: String,
}

/// Service settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub admin_password: String,
    pub persist_path: Option<PathBuf>,
    pub shuffle_steps: usize,
    pub shuffle_step_delay: Duration,
    pub commit_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            admin_password: "changeme".to_string(),
            persist_path: None,
            shuffle_steps: DEFAULT_SHUFFLE_STEPS,
            shuffle_step_delay: Duration::from_millis(120),
            commit_retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            admin_password: env::var("ADMIN_PASSWORD").unwrap_or(defaults.admin_password),
            persist_path: env::var("PERSIST_PATH").ok().map(PathBuf::from),
            shuffle_steps: parsed("SHUFFLE_STEPS")?.unwrap_or(defaults.shuffle_steps),
            shuffle_step_delay: parsed("SHUFFLE_STEP_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.shuffle_step_delay),
            commit_retry: RetryPolicy {
                max_retries: parsed("COMMIT_RETRIES")?
                    .unwrap_or(defaults.commit_retry.max_retries),
                ..defaults.commit_retry
            },
        })
    }
}

fn parsed<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_reports_bad_numbers() {
        env::set_var("GIFT_DRAW_TEST_STEPS", "eight");
        let err = parsed::<usize>("GIFT_DRAW_TEST_STEPS").unwrap_err();
        assert_eq!(err.to_string(), "invalid value \"eight\" for GIFT_DRAW_TEST_STEPS");

        env::set_var("GIFT_DRAW_TEST_STEPS", " 12 ");
        assert_eq!(parsed::<usize>("GIFT_DRAW_TEST_STEPS").unwrap(), Some(12));

        env::remove_var("GIFT_DRAW_TEST_STEPS");
        assert_eq!(parsed::<usize>("GIFT_DRAW_TEST_STEPS").unwrap(), None);
    }
}
