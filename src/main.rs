//! Storage-core bootstrap binary.
//!
//! There is no wire protocol or network listener here — that's an explicit
//! non-goal of this crate. What this binary does is what a postmaster's
//! startup sequence does before it ever accepts a connection: read
//! configuration, bring up the shared-memory region, the buffer pools, the
//! VFD cache, and the lock manager, then sit ready until asked to shut down.
//! An embedding process would link `rusty_db::ServerContext` directly
//! instead of running this binary; it exists mainly to prove the core boots
//! standalone and to give operators something to run under a supervisor.

use rusty_db::{DatabaseConfig, ServerContext};

fn load_config() -> DatabaseConfig {
    match std::env::var("RUSTY_DB_CONFIG") {
        Ok(path) => {
            let contents = std::fs::read_to_string(&path)
                .unwrap_or_else(|err| panic!("failed to read config file {path}: {err}"));
            serde_json::from_str(&contents).unwrap_or_else(|err| panic!("failed to parse config file {path}: {err}"))
        }
        Err(_) => DatabaseConfig::default(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!(version = rusty_db::VERSION, "starting rusty-db storage core");

    let config = load_config();
    let ctx = match ServerContext::initialize(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize server context");
            std::process::exit(1);
        }
    };

    tracing::info!(
        data_dir = %ctx.config.data_dir,
        shared_buffers = ctx.config.shared_buffers,
        local_buffers = ctx.config.local_buffers,
        max_backends = ctx.config.max_backends,
        health = ?ctx.overall_health(),
        "storage core ready"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "failed to listen for shutdown signal"),
    }

    ctx.cancel.request();
    tracing::info!("storage core shutting down");
}
