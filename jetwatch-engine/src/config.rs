//! Environment-driven configuration, loaded once at startup with
//! `anyhow::Context` attached to every parse failure.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_PLC_DIRECTORY_HOST: &str = "plc.directory";
const DEFAULT_FOLLOW_GRAPH_HOST: &str = "public.api.bsky.app";
const DEFAULT_TEMP_POOL_CAPACITY: usize = 50;
const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// `DATABASE_URL` — connection string for the SQL store.
    pub database_url: String,
    /// `JETSTREAM_HOSTS` — non-empty comma-separated firehose hostnames.
    pub upstream_hosts: Vec<String>,
    /// `ADMIN_DID` — DID permitted to invoke admin operations; enforced by
    /// the external API layer, not this engine, but threaded through so a
    /// future API layer can read it from the same config.
    pub admin_did: Option<String>,

    /// `PLC_DIRECTORY_HOST` — did:plc directory host for handle resolution.
    pub plc_directory_host: String,
    /// `FOLLOW_GRAPH_HOST` — host serving `getFollows`.
    pub follow_graph_host: String,
    /// `HTTP_TIMEOUT_SECS` — hard per-request timeout for resolver and
    /// follow-graph HTTP calls.
    pub http_timeout: Duration,
    /// `TEMP_POOL_CAPACITY` — concurrent temporary backfill stream cap.
    pub temp_pool_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let upstream_hosts: Vec<String> = env::var("JETSTREAM_HOSTS")
            .context("JETSTREAM_HOSTS must be set")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if upstream_hosts.is_empty() {
            anyhow::bail!("JETSTREAM_HOSTS must contain at least one hostname");
        }

        let admin_did = env::var("ADMIN_DID").ok();

        let plc_directory_host =
            env::var("PLC_DIRECTORY_HOST").unwrap_or_else(|_| DEFAULT_PLC_DIRECTORY_HOST.to_string());
        let follow_graph_host =
            env::var("FOLLOW_GRAPH_HOST").unwrap_or_else(|_| DEFAULT_FOLLOW_GRAPH_HOST.to_string());

        let http_timeout = env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RESOLVER_TIMEOUT_SECS);

        let temp_pool_capacity = env::var("TEMP_POOL_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_TEMP_POOL_CAPACITY);

        Ok(Self {
            database_url,
            upstream_hosts,
            admin_did,
            plc_directory_host,
            follow_graph_host,
            http_timeout: Duration::from_secs(http_timeout),
            temp_pool_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_database_url_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("DATABASE_URL");
        env::remove_var("JETSTREAM_HOSTS");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn parses_comma_separated_hosts() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://localhost/jetwatch");
        env::set_var("JETSTREAM_HOSTS", "jetstream1.example, jetstream2.example");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.upstream_hosts,
            vec!["jetstream1.example".to_string(), "jetstream2.example".to_string()]
        );
        env::remove_var("DATABASE_URL");
        env::remove_var("JETSTREAM_HOSTS");
    }
}
