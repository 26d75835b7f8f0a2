//! Environment configuration. Any missing required variable or malformed
//! value is a startup failure: the process exits non-zero before binding.

use airouter::{QueueConfig, RouterConfig, Vendor};
use anyhow::{bail, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub router_api_key: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub redis_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub provider_priority: Vec<Vendor>,
    pub queue_max_size: usize,
    pub queue_timeout_ms: i64,
    pub queue_async_threshold_ms: u64,
    pub cb_failure_threshold: u32,
    pub cb_cooldown_ms: i64,
    pub rate_limit_low_requests_threshold: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let router_api_key = get("ROUTER_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .context("ROUTER_API_KEY is required")?;

        let openai_api_key = get("OPENAI_API_KEY").filter(|v| !v.trim().is_empty());
        let anthropic_api_key = get("ANTHROPIC_API_KEY").filter(|v| !v.trim().is_empty());
        let google_api_key = get("GOOGLE_API_KEY").filter(|v| !v.trim().is_empty());
        if openai_api_key.is_none() && anthropic_api_key.is_none() && google_api_key.is_none() {
            bail!("at least one provider key is required (OPENAI_API_KEY, ANTHROPIC_API_KEY, GOOGLE_API_KEY)");
        }

        let provider_priority = match get("PROVIDER_PRIORITY") {
            None => vec![Vendor::OpenAi, Vendor::Anthropic, Vendor::Google],
            Some(raw) => {
                let vendors: Result<Vec<Vendor>, String> = raw
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.parse())
                    .collect();
                let vendors = vendors.map_err(|e| anyhow::anyhow!("PROVIDER_PRIORITY: {}", e))?;
                if vendors.is_empty() {
                    bail!("PROVIDER_PRIORITY must name at least one vendor");
                }
                vendors
            }
        };

        Ok(Self {
            router_api_key,
            openai_api_key,
            anthropic_api_key,
            google_api_key,
            redis_url: get("REDIS_URL").filter(|v| !v.trim().is_empty()),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "PORT", 3000)?,
            provider_priority,
            queue_max_size: parse_or(&get, "QUEUE_MAX_SIZE", 100)?,
            queue_timeout_ms: parse_or(&get, "QUEUE_TIMEOUT_MS", 30_000)?,
            queue_async_threshold_ms: parse_or(&get, "QUEUE_ASYNC_THRESHOLD_MS", 5_000)?,
            cb_failure_threshold: parse_or(&get, "CB_FAILURE_THRESHOLD", 5)?,
            cb_cooldown_ms: parse_or(&get, "CB_COOLDOWN_MS", 60_000)?,
            rate_limit_low_requests_threshold: parse_or(
                &get,
                "RATE_LIMIT_LOW_REQUESTS_THRESHOLD",
                5,
            )?,
        })
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            priority: self.provider_priority.clone(),
            cb_failure_threshold: self.cb_failure_threshold,
            cb_cooldown_ms: self.cb_cooldown_ms,
            low_requests_threshold: self.rate_limit_low_requests_threshold,
            queue: QueueConfig {
                max_size: self.queue_max_size,
                timeout_ms: self.queue_timeout_ms,
                async_threshold_ms: self.queue_async_threshold_ms,
            },
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}: {}", key, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn minimal_config_applies_defaults() {
        let config = Config::from_lookup(env(&[
            ("ROUTER_API_KEY", "secret"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(
            config.provider_priority,
            vec![Vendor::OpenAi, Vendor::Anthropic, Vendor::Google]
        );
        assert_eq!(config.queue_max_size, 100);
        assert_eq!(config.cb_failure_threshold, 5);
    }

    #[test]
    fn missing_router_key_fails() {
        assert!(Config::from_lookup(env(&[("OPENAI_API_KEY", "sk-test")])).is_err());
    }

    #[test]
    fn missing_all_provider_keys_fails() {
        assert!(Config::from_lookup(env(&[("ROUTER_API_KEY", "secret")])).is_err());
    }

    #[test]
    fn priority_list_parses_in_order() {
        let config = Config::from_lookup(env(&[
            ("ROUTER_API_KEY", "secret"),
            ("GOOGLE_API_KEY", "AIza-test"),
            ("PROVIDER_PRIORITY", "google, anthropic ,openai"),
        ]))
        .unwrap();
        assert_eq!(
            config.provider_priority,
            vec![Vendor::Google, Vendor::Anthropic, Vendor::OpenAi]
        );
    }

    #[test]
    fn malformed_priority_fails() {
        assert!(Config::from_lookup(env(&[
            ("ROUTER_API_KEY", "secret"),
            ("OPENAI_API_KEY", "sk-test"),
            ("PROVIDER_PRIORITY", "openai,azure"),
        ]))
        .is_err());
    }

    #[test]
    fn malformed_numbers_fail() {
        assert!(Config::from_lookup(env(&[
            ("ROUTER_API_KEY", "secret"),
            ("OPENAI_API_KEY", "sk-test"),
            ("QUEUE_MAX_SIZE", "many"),
        ]))
        .is_err());
    }
}
