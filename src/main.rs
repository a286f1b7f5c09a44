//! scanguard entrypoint.
mod admission;
mod analysis;
mod config;
mod identity;
mod model;
mod policy;
mod quota;
mod rate_limit;
mod server;
mod signup;
mod storage;
mod telemetry;
#[cfg(test)]
mod test_support;
mod window;

use std::sync::Arc;

use admission::AdmissionController;
use analysis::{AnalysisEngine, HttpAnalysisEngine};
use anyhow::{Context, Result};
use clap::Parser;
use config::{CliOptions, ServerConfig};
use identity::ClientIpResolver;
use quota::QuotaManager;
use rate_limit::RateLimiter;
use server::{AppState, ScanGuardServer};
use signup::SignupGuard;
use storage::{AdmissionStore, ObjectStoreAdmissionStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    install_tracing();

    let cli = CliOptions::parse();
    let config = ServerConfig::from_cli(cli)?;
    let store: Arc<dyn AdmissionStore> =
        Arc::new(ObjectStoreAdmissionStore::new(config.build_store()?));

    let metrics = if config.metrics {
        Some(telemetry::install_metrics()?)
    } else {
        None
    };

    let engine: Arc<dyn AnalysisEngine> = Arc::new(
        HttpAnalysisEngine::new(config.analysis_endpoint.clone(), config.analysis_timeout)
            .context("failed to build analysis client")?,
    );
    info!(endpoint = %config.analysis_endpoint, "analysis engine configured");
    for (plan, limit) in config.quota.limits.iter() {
        info!(plan = %plan, limit, "daily plan limit");
    }

    let limiter = Arc::new(RateLimiter::new(config.rate.clone(), Arc::clone(&store)));
    let quota = Arc::new(QuotaManager::new(config.quota.clone(), Arc::clone(&store)));
    let signup = Arc::new(SignupGuard::new(config.signup.clone(), Arc::clone(&store)));
    let admission = Arc::new(AdmissionController::new(
        limiter,
        Arc::clone(&quota),
        store,
        config.input.clone(),
    ));

    let state = AppState {
        resolver: Arc::new(ClientIpResolver::new(config.trusted_ip_header.clone())),
        admission,
        quota,
        signup,
        engine,
        metrics,
        webhook_token: config.webhook_token.clone(),
        admin_token: config.admin_token.clone(),
    };

    let server = ScanGuardServer::new(Arc::new(config), state);
    server.run().await
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
