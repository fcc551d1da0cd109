use std::env;
use std::time::Duration;

/// Process-wide configuration, read once at startup the way the reference
/// service reads its `Rocket.toml`/env-backed database fairing config.
///
/// The HTTP/GraphQL transport is out of scope for this crate (spec §1), so
/// there is deliberately no port/host here — only the knobs the core
/// subsystem itself needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub pool_size: u32,
    /// Grace period used by the event-scheduler collaborator for expiry
    /// detection (spec §6, "Environment inputs"). Not consulted by this
    /// crate directly; threaded through for the scheduler to read.
    pub event_grace_period: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let pool_size = env::var("CAMPAIGN_STORE_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let event_grace_period = env::var("CAMPAIGN_STORE_EVENT_GRACE_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        Ok(Config { database_url, pool_size, event_grace_period })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grace_period_is_300_seconds() {
        std::env::remove_var("CAMPAIGN_STORE_EVENT_GRACE_SECONDS");
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.event_grace_period, Duration::from_secs(300));
    }
}
