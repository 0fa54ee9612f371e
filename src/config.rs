//! Configuration handling for the tenant router.
//!
//! Process settings come from CLI arguments and environment variables. Tenant
//! settings are a flat key/value mapping read from a settings file (TOML or
//! properties) and `--set` overrides.

use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_PREFIX: &str = "mdb";
pub const DEFAULT_KEY_RESOLVER: &str = "domain";

/// Reserved tenant key holding defaults for every other tenant.
pub const ALL_TENANTS_KEY: &str = "all";

// Pool configuration defaults
pub const DEFAULT_POOL_MAX_SIZE: u32 = 30;
pub const DEFAULT_POOL_MIN_SIZE: u32 = 1;
pub const DEFAULT_POOL_TIMEOUT_MS: u64 = 5000;

/// Configuration for the tenant router server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tenantdb-server",
    about = "Routes each request to its tenant's database inside a unit-of-work transaction",
    version,
    author
)]
pub struct Config {
    /// Tenant settings file (.toml, otherwise key=value properties)
    #[arg(short, long = "config", value_name = "FILE", env = "TENANTDB_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Tenant setting override, e.g. "mdb.url.acme=sqlite:acme.db".
    /// Can be specified multiple times. Wins over the settings file.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub settings: Vec<String>,

    /// Prefix of tenant setting keys
    #[arg(long, default_value = DEFAULT_PREFIX, env = "TENANTDB_PREFIX")]
    pub prefix: String,

    /// Start even when no tenant database could be set up
    #[arg(long, env = "TENANTDB_ALLOW_NO_DATABASE")]
    pub allow_no_database: bool,

    /// Bind bare connections to units of work instead of transactions
    #[arg(long, env = "TENANTDB_NO_AUTO_TRANSACTIONS")]
    pub no_auto_transactions: bool,

    /// How tenant keys are read from requests: "domain" or "header:<Name>"
    #[arg(
        long,
        default_value = DEFAULT_KEY_RESOLVER,
        env = "TENANTDB_KEY_RESOLVER"
    )]
    pub key_resolver: String,

    /// Statement run on every new session, e.g. "PRAGMA foreign_keys = ON".
    /// Can be specified multiple times.
    #[arg(long = "session-init", value_name = "SQL")]
    pub session_init: Vec<String>,

    /// HTTP host to bind to
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "TENANTDB_HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "TENANTDB_HTTP_PORT")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TENANTDB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "TENANTDB_JSON_LOGS")]
    pub json_logs: bool,

    /// Bearer tokens accepted on admin endpoints.
    /// Can be specified multiple times or as comma-separated values.
    #[arg(
        long = "auth-token",
        value_name = "TOKEN",
        env = "TENANTDB_AUTH_TOKENS",
        value_delimiter = ','
    )]
    pub auth_tokens: Vec<String>,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            config_file: None,
            settings: Vec::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            allow_no_database: false,
            no_auto_transactions: false,
            key_resolver: DEFAULT_KEY_RESOLVER.to_string(),
            session_init: Vec::new(),
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            log_level: "info".to_string(),
            json_logs: false,
            auth_tokens: Vec::new(),
        }
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Read the settings file (if any) and apply `--set` overrides.
    pub fn load_settings(&self) -> Result<BTreeMap<String, String>, String> {
        let mut settings = match &self.config_file {
            Some(path) => load_settings_file(path)?,
            None => BTreeMap::new(),
        };
        for entry in &self.settings {
            let (key, value) = parse_setting(entry)?;
            settings.insert(key, value);
        }
        Ok(settings)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Parse a `KEY=VALUE` override.
pub fn parse_setting(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("Invalid setting '{}': expected KEY=VALUE", s)),
    }
}

/// Load a settings file into a flat key/value mapping.
///
/// `.toml` files have their tables flattened to dotted keys. Anything else is
/// read as a properties file.
pub fn load_settings_file(path: &Path) -> Result<BTreeMap<String, String>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read settings file {}: {}", path.display(), e))?;

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        parse_toml_settings(&content)
            .map_err(|e| format!("Invalid TOML in {}: {}", path.display(), e))
    } else {
        Ok(parse_properties(&content))
    }
}

/// Parse a properties document: `key=value` or `key: value` lines, `#` and `!`
/// comments.
pub fn parse_properties(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse a TOML document and flatten it to dotted keys.
pub fn parse_toml_settings(content: &str) -> Result<BTreeMap<String, String>, toml::de::Error> {
    let table: toml::Table = content.parse()?;
    let mut out = BTreeMap::new();
    for (key, value) in &table {
        flatten_toml(key, value, &mut out);
    }
    Ok(out)
}

fn flatten_toml(path: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (key, nested) in table {
                flatten_toml(&format!("{}.{}", path, key), nested, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(path.to_string(), s.clone());
        }
        toml::Value::Array(items) => {
            let joined: Vec<String> = items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            out.insert(path.to_string(), joined.join(","));
        }
        other => {
            out.insert(path.to_string(), other.to_string());
        }
    }
}
