use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fetcher::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.vokino.pro/v2";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3146";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_OVERRIDE_TTL_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub token: Option<String>,
    pub bind_addr: SocketAddr,
    pub overrides_path: Option<PathBuf>,
    pub overrides_url: Option<String>,
    pub admin_token: Option<String>,
    pub fetch: RetryPolicy,
    pub override_ttl: Duration,
    /// Image hosts `/api/palette` may download from; empty allows any public host.
    pub palette_hosts: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("Invalid BIND_ADDR '{}'", bind_addr))?;

        let timeout_ms = parse_or(get("FETCH_TIMEOUT_MS"), "FETCH_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?;
        let retries = parse_or(get("FETCH_RETRIES"), "FETCH_RETRIES", DEFAULT_RETRIES)?;
        if retries == 0 {
            return Err(anyhow!("FETCH_RETRIES must be at least 1"));
        }
        let ttl_secs = parse_or(
            get("OVERRIDE_CACHE_TTL_SECS"),
            "OVERRIDE_CACHE_TTL_SECS",
            DEFAULT_OVERRIDE_TTL_SECS,
        )?;

        Ok(Self {
            base_url: get("VOKINO_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            token: get("VOKINO_TOKEN"),
            bind_addr,
            overrides_path: get("OVERRIDES_PATH").map(PathBuf::from),
            overrides_url: get("OVERRIDES_URL"),
            admin_token: get("ADMIN_TOKEN"),
            fetch: RetryPolicy {
                timeout: Duration::from_millis(timeout_ms),
                retries,
            },
            override_ttl: Duration::from_secs(ttl_secs),
            palette_hosts: get("PALETTE_HOSTS")
                .map(|hosts| {
                    hosts
                        .split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow!("Invalid {} '{}': {}", key, value, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.bind_addr.port(), 3146);
        assert_eq!(cfg.fetch.retries, 2);
        assert_eq!(cfg.fetch.timeout, Duration::from_secs(10));
        assert_eq!(cfg.override_ttl, Duration::from_secs(600));
        assert!(cfg.token.is_none());
        assert!(cfg.admin_token.is_none());
        assert!(cfg.palette_hosts.is_empty());
    }

    #[test]
    fn reads_values_and_ignores_blanks() {
        let cfg = config(&[
            ("VOKINO_TOKEN", "abc"),
            ("VOKINO_BASE_URL", "http://localhost:9000/v2/"),
            ("ADMIN_TOKEN", "   "),
            ("FETCH_RETRIES", "4"),
            ("OVERRIDES_PATH", "/tmp/overrides.json"),
            ("PALETTE_HOSTS", "vokino.pro, , cdn.example.net"),
        ])
        .unwrap();
        assert_eq!(cfg.palette_hosts, vec!["vokino.pro", "cdn.example.net"]);
        assert_eq!(cfg.token.as_deref(), Some("abc"));
        assert_eq!(cfg.base_url, "http://localhost:9000/v2");
        assert!(cfg.admin_token.is_none());
        assert_eq!(cfg.fetch.retries, 4);
        assert_eq!(
            cfg.overrides_path,
            Some(PathBuf::from("/tmp/overrides.json"))
        );
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(config(&[("FETCH_TIMEOUT_MS", "soon")]).is_err());
        assert!(config(&[("FETCH_RETRIES", "0")]).is_err());
        assert!(config(&[("BIND_ADDR", "nowhere")]).is_err());
    }
}
