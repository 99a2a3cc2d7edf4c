// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool still reads its own `CONCORD_RELAY_DB_*`
// variables; this module covers the core server settings.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use concord_common::protocol::messages::ServiceConfiguration;

pub const DEV_TENANT_ID: &str = "local";
pub const DEV_TENANT_SECRET: &str = "concord_local_development_tenant_secret_32c";
pub const DEFAULT_MAX_CLIENTS_PER_DOCUMENT: usize = 1_000_000;

/// Which orderer backs document connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrdererKind {
    /// In-process sequencer, one per document.
    Local,
    /// Forward to a remote ordering service.
    Proxy,
}

impl OrdererKind {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "proxy" | "remote" => Self::Proxy,
            _ => Self::Local,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secrets keyed by tenant id.
    pub tenant_secrets: BTreeMap<String, String>,
    /// PostgreSQL connection string. In-memory collaborators when absent.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `concord_relay=debug`).
    pub log_filter: String,
    /// Emit JSON log lines.
    pub log_json: bool,
    pub max_clients_per_document: usize,
    pub orderer: OrdererKind,
    /// Base URL of the remote ordering service (proxy mode).
    pub orderer_url: Option<String>,
    /// Handed to writer connections.
    pub service_configuration: ServiceConfiguration,
}

impl Default for RelayConfig {
    /// Development defaults, ignoring the process environment.
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CONCORD_RELAY_HOST` | `0.0.0.0` |
    /// | `CONCORD_RELAY_PORT` | `8080` |
    /// | `CONCORD_RELAY_TENANT_SECRETS` | `local=<dev-only placeholder>` |
    /// | `CONCORD_RELAY_DATABASE_URL` | *(none)* |
    /// | `CONCORD_RELAY_LOG_FILTER` | `info` |
    /// | `CONCORD_RELAY_LOG_FORMAT` | `text` |
    /// | `CONCORD_RELAY_MAX_CLIENTS_PER_DOCUMENT` | `1000000` |
    /// | `CONCORD_RELAY_ORDERER` | `local` |
    /// | `CONCORD_RELAY_ORDERER_URL` | *(none)* |
    /// | `CONCORD_RELAY_MAX_MESSAGE_SIZE` | `16384` |
    /// | `CONCORD_RELAY_BLOCK_SIZE` | `64436` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CONCORD_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("CONCORD_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let tenant_secrets = env("CONCORD_RELAY_TENANT_SECRETS")
            .ok()
            .map(|raw| parse_tenant_secrets(&raw))
            .filter(|secrets| !secrets.is_empty())
            .unwrap_or_else(|| {
                BTreeMap::from([(DEV_TENANT_ID.to_string(), DEV_TENANT_SECRET.to_string())])
            });

        let database_url = env("CONCORD_RELAY_DATABASE_URL").ok();
        let log_filter = env("CONCORD_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("CONCORD_RELAY_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let max_clients_per_document = env("CONCORD_RELAY_MAX_CLIENTS_PER_DOCUMENT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CLIENTS_PER_DOCUMENT);

        let orderer = env("CONCORD_RELAY_ORDERER")
            .map(|value| OrdererKind::parse(&value))
            .unwrap_or(OrdererKind::Local);
        let orderer_url = env("CONCORD_RELAY_ORDERER_URL").ok();

        let mut service_configuration = ServiceConfiguration::default();
        if let Some(max_message_size) =
            env("CONCORD_RELAY_MAX_MESSAGE_SIZE").ok().and_then(|v| v.parse().ok())
        {
            service_configuration.max_message_size = max_message_size;
        }
        if let Some(block_size) = env("CONCORD_RELAY_BLOCK_SIZE").ok().and_then(|v| v.parse().ok())
        {
            service_configuration.block_size = block_size;
        }

        Self {
            listen_addr,
            tenant_secrets,
            database_url,
            log_filter,
            log_json,
            max_clients_per_document,
            orderer,
            orderer_url,
            service_configuration,
        }
    }

    /// Returns true when the dev tenant still uses the placeholder secret.
    pub fn is_dev_tenant_secret(&self) -> bool {
        self.tenant_secrets.get(DEV_TENANT_ID).is_some_and(|secret| secret == DEV_TENANT_SECRET)
    }
}

/// Parses `tenant=secret,tenant2=secret2`. Malformed pairs are skipped.
fn parse_tenant_secrets(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (tenant, secret) = pair.split_once('=')?;
            let (tenant, secret) = (tenant.trim(), secret.trim());
            (!tenant.is_empty() && !secret.is_empty())
                .then(|| (tenant.to_string(), secret.to_string()))
        })
        .collect()
}
