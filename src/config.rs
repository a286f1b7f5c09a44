//! Application configuration and command-line parsing.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::http::HeaderName;
use clap::Parser;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use reqwest::Url;

use crate::analysis::{DEFAULT_MAX_UPLOAD_BYTES, InputRules};
use crate::policy::FailMode;
use crate::quota::{PlanLimits, QuotaSettings};
use crate::rate_limit::RateLimitSettings;
use crate::signup::SignupSettings;

#[derive(Debug, Parser)]
#[command(name = "scanguard")]
pub struct CliOptions {
    #[arg(long, env = "SCANGUARD_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,
    #[arg(long, env = "SCANGUARD_STORE_ROOT", default_value = "./data")]
    pub store_root: PathBuf,
    /// Header set by the hosting platform with the verified client address.
    #[arg(long, env = "SCANGUARD_TRUSTED_IP_HEADER")]
    pub trusted_ip_header: Option<String>,
    #[arg(long, env = "SCANGUARD_RATE_LIMIT", default_value_t = 5)]
    pub rate_limit: u32,
    #[arg(long, env = "SCANGUARD_RATE_WINDOW_HOURS", default_value_t = 24)]
    pub rate_window_hours: u64,
    #[arg(long, env = "SCANGUARD_RATE_FAIL_MODE", value_enum, default_value_t = FailMode::Open)]
    pub rate_fail_mode: FailMode,
    #[arg(long, env = "SCANGUARD_SWEEP_PROBABILITY", default_value_t = 0.1)]
    pub sweep_probability: f64,
    #[arg(long, env = "SCANGUARD_RETENTION_DAYS", default_value_t = 7)]
    pub retention_days: u64,
    #[arg(long, env = "SCANGUARD_SIGNUP_LIMIT", default_value_t = 2)]
    pub signup_limit: u32,
    #[arg(long, env = "SCANGUARD_SIGNUP_WINDOW_HOURS", default_value_t = 24)]
    pub signup_window_hours: u64,
    #[arg(
        long,
        env = "SCANGUARD_BLOCK_TEMP_EMAILS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub block_temp_emails: bool,
    #[arg(long, env = "SCANGUARD_SIGNUP_FAIL_MODE", value_enum, default_value_t = FailMode::Open)]
    pub signup_fail_mode: FailMode,
    #[arg(long, env = "SCANGUARD_QUOTA_FAIL_MODE", value_enum, default_value_t = FailMode::Open)]
    pub quota_fail_mode: FailMode,
    /// TOML table of daily limits per plan.
    #[arg(long, env = "SCANGUARD_PLAN_LIMITS")]
    pub plan_limits: Option<PathBuf>,
    #[arg(
        long,
        env = "SCANGUARD_ANALYSIS_ENDPOINT",
        default_value = "http://127.0.0.1:8787/analyze"
    )]
    pub analysis_endpoint: String,
    #[arg(long, env = "SCANGUARD_ANALYSIS_TIMEOUT_SECS", default_value_t = 120)]
    pub analysis_timeout_secs: u64,
    #[arg(long, env = "SCANGUARD_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: u64,
    /// Bearer token expected from the identity and payment webhooks.
    #[arg(long, env = "SCANGUARD_WEBHOOK_TOKEN", hide_env_values = true)]
    pub webhook_token: Option<String>,
    #[arg(long, env = "SCANGUARD_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,
    #[arg(
        long,
        env = "SCANGUARD_METRICS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub metrics: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub store_root: PathBuf,
    pub trusted_ip_header: Option<HeaderName>,
    pub rate: RateLimitSettings,
    pub signup: SignupSettings,
    pub quota: QuotaSettings,
    pub input: InputRules,
    pub analysis_endpoint: Url,
    pub analysis_timeout: Duration,
    pub webhook_token: Option<String>,
    pub admin_token: Option<String>,
    pub metrics: bool,
}

impl ServerConfig {
    pub fn from_cli(cli: CliOptions) -> Result<Self> {
        let trusted_ip_header = cli
            .trusted_ip_header
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                    .map_err(|err| anyhow!("invalid trusted IP header '{name}': {err}"))
            })
            .transpose()?;

        let limits = match &cli.plan_limits {
            Some(path) => PlanLimits::load(path)
                .with_context(|| format!("failed to load plan limits from {}", path.display()))?,
            None => PlanLimits::default(),
        };

        let analysis_endpoint = Url::parse(&cli.analysis_endpoint)
            .with_context(|| format!("invalid analysis endpoint '{}'", cli.analysis_endpoint))?;

        let rate = RateLimitSettings {
            max_requests: cli.rate_limit.max(1),
            window: hours(cli.rate_window_hours),
            on_store_error: cli.rate_fail_mode,
            sweep_probability: cli.sweep_probability.clamp(0.0, 1.0),
            retention: Duration::from_secs(cli.retention_days.max(1) * 24 * 3600),
        };

        let signup = SignupSettings {
            max_signups: cli.signup_limit.max(1),
            window: hours(cli.signup_window_hours),
            block_temporary_domains: cli.block_temp_emails,
            domain_fail_mode: cli.signup_fail_mode,
            limit_fail_mode: cli.signup_fail_mode,
        };

        let quota = QuotaSettings {
            limits,
            quota_fail_mode: cli.quota_fail_mode,
            free_scan_fail_mode: cli.quota_fail_mode,
            ..QuotaSettings::default()
        };

        let input = InputRules {
            max_upload_bytes: cli.max_upload_bytes.max(1),
            ..InputRules::default()
        };

        Ok(Self {
            listen: cli.listen,
            store_root: cli.store_root,
            trusted_ip_header,
            rate,
            signup,
            quota,
            input,
            analysis_endpoint,
            analysis_timeout: Duration::from_secs(cli.analysis_timeout_secs.max(1)),
            webhook_token: non_empty(cli.webhook_token),
            admin_token: non_empty(cli.admin_token),
            metrics: cli.metrics,
        })
    }

    pub fn build_store(&self) -> Result<Arc<dyn ObjectStore>> {
        ensure_directory(&self.store_root)?;
        let store = LocalFileSystem::new_with_prefix(&self.store_root)
            .context("failed to initialise object store")?;
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        Ok(store)
    }
}

fn hours(count: u64) -> Duration {
    Duration::from_secs(count.max(1) * 3600)
}

fn non_empty(token: Option<String>) -> Option<String> {
    token
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(anyhow!(
            "store root must be a directory: {}",
            path.display()
        ));
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create store root {}", path.display()))?;
    Ok(())
}
