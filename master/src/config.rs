use std::{collections::HashMap, env, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use common::{ResourceSummary, SubmitDefaults};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_RETRIES: i32 = 5;
pub const DEFAULT_MAX_FORSAKEN: i32 = 3;

/// Configuración del master, leída una vez desde variables de entorno.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_addr: String,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub submit_defaults: SubmitDefaults,
    /// Recursos por defecto por categoría (CATEGORY_RESOURCES, JSON)
    pub category_resources: HashMap<String, ResourceSummary>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            heartbeat_timeout: Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS),
            submit_defaults: SubmitDefaults {
                max_retries: DEFAULT_MAX_RETRIES,
                max_forsaken: DEFAULT_MAX_FORSAKEN,
            },
            category_resources: HashMap::new(),
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Result<Self> {
        let category_resources = match env::var("CATEGORY_RESOURCES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("CATEGORY_RESOURCES no es un JSON {categoria: recursos} válido")?,
            _ => HashMap::new(),
        };

        Ok(Self {
            bind_addr: env::var("MASTER_BIND_ADDR")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            heartbeat_timeout: Duration::from_secs(env_or(
                "WORKER_HEARTBEAT_TIMEOUT_SECS",
                WORKER_HEARTBEAT_TIMEOUT_SECS,
            )?),
            sweep_interval: Duration::from_secs(env_or(
                "FAILOVER_SWEEP_INTERVAL_SECS",
                FAILOVER_SWEEP_INTERVAL_SECS,
            )?),
            submit_defaults: SubmitDefaults {
                max_retries: env_or("DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                max_forsaken: env_or("DEFAULT_MAX_FORSAKEN", DEFAULT_MAX_FORSAKEN)?,
            },
            category_resources,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("valor inválido para {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_razonables() {
        let c = MasterConfig::default();
        assert_eq!(c.bind_addr, "0.0.0.0:8080");
        assert_eq!(c.heartbeat_timeout, Duration::from_secs(20));
        assert_eq!(c.submit_defaults.max_retries, 5);
        assert_eq!(c.submit_defaults.max_forsaken, 3);
    }

    #[test]
    fn category_resources_se_parsea_como_json() {
        let parsed: HashMap<String, ResourceSummary> =
            serde_json::from_str(r#"{"blast": {"cores": 2, "memory": 4096}}"#).unwrap();
        assert_eq!(parsed["blast"].cores, Some(2.0));
        assert_eq!(parsed["blast"].memory, Some(4096.0));
    }
}
