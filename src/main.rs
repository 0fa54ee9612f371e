//! Tenant router - Main entry point.
//!
//! Loads tenant settings, builds one connection pool per tenant and serves
//! requests, each inside a unit of work bound to its tenant's database.

use clap::Parser;
use std::sync::Arc;
use tenantdb::auth::AdminAuth;
use tenantdb::config::Config;
use tenantdb::runtime::{RuntimeOptions, TenantRuntime};
use tenantdb::transport::HttpTransport;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Arc::new(Config::parse());

    // Initialize logging
    init_tracing(&config);

    info!(
        prefix = %config.prefix,
        resolver = %config.key_resolver,
        "Starting tenant router v{}",
        env!("CARGO_PKG_VERSION")
    );

    let settings = config.load_settings().map_err(|e| {
        error!(error = %e, "Cannot load tenant settings");
        e
    })?;
    if settings.is_empty() && !config.allow_no_database {
        eprintln!("Error: No tenant settings given.");
        eprintln!();
        eprintln!("Usage: tenantdb-server --config <FILE>");
        eprintln!("       tenantdb-server --set mdb.url.<tenant>=<url> --set mdb.driver.all=<driver>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  tenantdb-server --config tenants.properties");
        eprintln!(
            "  tenantdb-server --set mdb.driver.all=sqlite --set mdb.url.acme=sqlite:acme.db?mode=rwc"
        );
        eprintln!("  tenantdb-server --config tenants.toml --key-resolver header:X-Tenant-ID");
        std::process::exit(1);
    }

    let options = RuntimeOptions::from_config(&config)?;
    let auth = AdminAuth::from_tokens(config.auth_tokens.clone())?;
    if !auth.is_enabled() {
        info!("No admin tokens configured; admin endpoints are open");
    }

    let runtime = match TenantRuntime::start(options, &settings).await {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "Cannot start tenant runtime");
            return Err(e.into());
        }
    };

    info!(
        host = %config.http_host,
        port = config.http_port,
        admin_tokens = auth.token_count(),
        "Using HTTP transport"
    );
    let transport = HttpTransport::new(
        runtime,
        Some(Arc::clone(&config)),
        auth,
        &config.http_host,
        config.http_port,
    );

    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
