use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::credential::DescriptorProfile;
use crate::models::Strategy;
use crate::sync::SyncSettings;

/// Upper bound for subscription durations, in days.
pub const MAX_DURATION_DAYS: u64 = 36_500;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    /// Base URL printed in front of `/sub/{token}`. Falls back to localhost.
    pub public_url: Option<String>,
    pub xray_config_path: String,
    pub xray_service: String,
    pub xray_protocol: String,
    pub client_flow: String,
    /// Whole-command ssh timeout, connect included.
    pub ssh_timeout: Duration,
    pub ssh_connect_timeout: Duration,
    pub ssh_identity: Option<PathBuf>,
    /// Used by nodes without their own strategy.
    pub default_strategy: Strategy,
    /// Zero disables the in-process sweep.
    pub sweep_interval: Duration,
    pub default_duration_days: i64,
    pub reality_sni: String,
    pub fingerprint: String,
}

impl Config {
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            config_path: self.xray_config_path.clone(),
            service_name: self.xray_service.clone(),
            protocol: self.xray_protocol.clone(),
            flow: self.client_flow.clone(),
        }
    }

    pub fn descriptor_profile(&self) -> DescriptorProfile {
        DescriptorProfile {
            sni: self.reality_sni.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub fn subscription_url(&self, token: &str) -> String {
        let base = self
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port));
        format!("{}/sub/{}", base.trim_end_matches('/'), token)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from any key lookup. `load` passes the process environment.
pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let num = |key: &str, default: u64| -> anyhow::Result<u64> {
        match lookup(key) {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, v)),
            None => Ok(default),
        }
    };
    let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

    let default_strategy = match lookup("FLEET_PROVISIONING") {
        Some(v) => v.parse::<Strategy>().context("FLEET_PROVISIONING")?,
        None => Strategy::LiveSync,
    };

    let default_duration_days = num("FLEET_DEFAULT_DURATION_DAYS", 30)?;
    if !(1..=MAX_DURATION_DAYS).contains(&default_duration_days) {
        anyhow::bail!(
            "FLEET_DEFAULT_DURATION_DAYS must be between 1 and {}",
            MAX_DURATION_DAYS
        );
    }

    Ok(Config {
        port: u16::try_from(num("FLEET_HTTP_PORT", 8080)?).context("FLEET_HTTP_PORT out of range")?,
        database_url: text("DATABASE_URL", "postgres://localhost/fleet"),
        db_max_connections: u32::try_from(num("FLEET_DB_MAX_CONNECTIONS", 10)?)
            .context("FLEET_DB_MAX_CONNECTIONS out of range")?,
        public_url: lookup("FLEET_PUBLIC_URL").filter(|s| !s.trim().is_empty()),
        xray_config_path: text("FLEET_XRAY_CONFIG_PATH", "/usr/local/etc/xray/config.json"),
        xray_service: text("FLEET_XRAY_SERVICE", "xray"),
        xray_protocol: text("FLEET_XRAY_PROTOCOL", "vless"),
        client_flow: text("FLEET_CLIENT_FLOW", "xtls-rprx-vision"),
        ssh_timeout: Duration::from_secs(num("FLEET_SSH_TIMEOUT_SECS", 30)?),
        ssh_connect_timeout: Duration::from_secs(num("FLEET_SSH_CONNECT_TIMEOUT_SECS", 10)?),
        ssh_identity: lookup("FLEET_SSH_IDENTITY").map(PathBuf::from),
        default_strategy,
        sweep_interval: Duration::from_secs(num("FLEET_SWEEP_INTERVAL_SECS", 0)?),
        default_duration_days: default_duration_days as i64,
        reality_sni: text("FLEET_REALITY_SNI", "www.microsoft.com"),
        fingerprint: text("FLEET_FINGERPRINT", "chrome"),
    })
}
