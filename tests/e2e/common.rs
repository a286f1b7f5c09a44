//! Shared fixtures and helpers for the scanguard end-to-end tests.

use anyhow::{Context, Result, anyhow, bail};
use assert_cmd::cargo::CommandCargoExt;
use axum::Router;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::routing::post;
use reqwest::multipart::{Form, Part};
use std::fs;
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{Builder, TempDir};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

pub(crate) const WEBHOOK_TOKEN: &str = "e2e-webhook-token";
pub(crate) const ADMIN_TOKEN: &str = "e2e-admin-token";
const SERVER_WARMUP_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_RETRY_DELAY: Duration = Duration::from_millis(50);
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for a spawned server.
#[derive(Debug, Clone)]
pub(crate) struct ServerOptions {
    pub(crate) rate_limit: u32,
    pub(crate) trusted_ip_header: Option<&'static str>,
    pub(crate) engine_fails: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            trusted_ip_header: None,
            engine_fails: false,
        }
    }
}

/// Stand-in analysis engine served from the test process.
struct StubEngine {
    address: SocketAddr,
    calls: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for StubEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_stub_engine(fails: bool) -> Result<StubEngine> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind stub engine")?;
    let address = listener.local_addr()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let router = Router::new().route(
        "/analyze",
        post(move |_body: Bytes| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fails {
                    return (StatusCode::SERVICE_UNAVAILABLE, "engine offline".to_owned());
                }
                (
                    StatusCode::OK,
                    r#"Analysis follows: {"verdict":"Clean","confidence":"91%","reasoning":"Natural aim."}"#
                        .to_owned(),
                )
            }
        }),
    );
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(StubEngine {
        address,
        calls,
        task,
    })
}

/// Manages the server process lifecycle for the duration of a test.
pub(crate) struct TestContext {
    server_process: Child,
    server_addr: SocketAddr,
    client: reqwest::Client,
    engine: StubEngine,
    _data_dir: TempDir,
}

impl TestContext {
    pub(crate) const fn address(&self) -> SocketAddr {
        self.server_addr
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.server_addr)
    }

    pub(crate) const fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn engine_calls(&self) -> usize {
        self.engine.calls.load(Ordering::SeqCst)
    }

    /// Posts a video upload to `/analyze` as if sent from `ip`.
    pub(crate) async fn analyze(&self, ip: &str, user: Option<&str>) -> Result<reqwest::Response> {
        self.client
            .post(self.url("/analyze"))
            .header("x-forwarded-for", ip)
            .multipart(clip_form(user)?)
            .send()
            .await
            .context("analysis request failed")
    }

    pub(crate) async fn post_json(
        &self,
        path: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.url(path))
            .header("x-forwarded-for", "198.51.100.20")
            .json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Ok(Some(_status)) = self.server_process.try_wait() {
            return;
        }

        if let Err(err) = self.server_process.kill() {
            drop(err);
        }
        if let Err(err) = self.server_process.wait() {
            drop(err);
        }
    }
}

pub(crate) fn clip_form(user: Option<&str>) -> Result<Form> {
    let part = Part::bytes(b"pretend gameplay footage".to_vec())
        .file_name("clip.mp4")
        .mime_str("video/mp4")?;
    let form = Form::new().part("file", part);
    Ok(match user {
        Some(user) => form.text("userId", user.to_owned()),
        None => form,
    })
}

/// Spawn the scanguard server with a temporary datastore.
pub(crate) async fn setup_server(options: ServerOptions) -> Result<TestContext> {
    let data_dir = Builder::new()
        .prefix("scanguard-e2e-")
        .tempdir()
        .context("failed to create temporary data directory")?;
    let root_path = data_dir.path();

    fs::create_dir_all(root_path.join("blocked-domains"))
        .context("failed to create blocklist directory")?;
    fs::write(
        root_path.join("blocked-domains/mailinator.com.json"),
        br#"{"domain":"mailinator.com","active":true}"#,
    )
    .context("failed to seed blocklist")?;

    let engine = spawn_stub_engine(options.engine_fails).await?;

    let port = portpicker::pick_unused_port().ok_or_else(|| anyhow!("no free ports"))?;
    let server_addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

    let mut cmd = Command::cargo_bin("scanguard")?;
    cmd.arg("--listen")
        .arg(server_addr.to_string())
        .arg("--store-root")
        .arg(root_path)
        .arg("--rate-limit")
        .arg(options.rate_limit.to_string())
        .arg("--sweep-probability")
        .arg("0")
        .arg("--analysis-endpoint")
        .arg(format!("http://{}/analyze", engine.address))
        .arg("--analysis-timeout-secs")
        .arg("5")
        .arg("--webhook-token")
        .arg(WEBHOOK_TOKEN)
        .arg("--admin-token")
        .arg(ADMIN_TOKEN);
    if let Some(header) = options.trusted_ip_header {
        cmd.arg("--trusted-ip-header").arg(header);
    }

    let server_process = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn scanguard")?;

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let ctx = TestContext {
        server_process,
        server_addr,
        client,
        engine,
        _data_dir: data_dir,
    };
    wait_for_server(&ctx).await?;
    Ok(ctx)
}

async fn wait_for_server(ctx: &TestContext) -> Result<()> {
    let deadline = Instant::now() + SERVER_WARMUP_TIMEOUT;
    while Instant::now() < deadline {
        match ctx.client.get(ctx.url("/healthz")).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(_) | Err(_) => sleep(SERVER_RETRY_DELAY).await,
        }
    }
    bail!("server did not become ready within {SERVER_WARMUP_TIMEOUT:?}");
}
