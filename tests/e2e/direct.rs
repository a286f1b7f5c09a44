//! HTTP interactions with the compiled scanguard binary.

use anyhow::{Context, Result, ensure};
use reqwest::StatusCode;
use rstest::rstest;
use serde_json::{Value, json};

use super::common::{ADMIN_TOKEN, ServerOptions, TestContext, WEBHOOK_TOKEN, setup_server};

async fn json_body(response: reqwest::Response) -> Result<Value> {
    response.json().await.context("response was not JSON")
}

async fn usage_logs(ctx: &TestContext, query: &str) -> Result<Vec<Value>> {
    let response = ctx
        .client()
        .get(ctx.url(&format!("/admin/usage-logs{query}")))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await?;
    ensure!(
        response.status() == StatusCode::OK,
        "usage log listing failed: {}",
        response.status()
    );
    let body = json_body(response).await?;
    Ok(body["logs"].as_array().cloned().unwrap_or_default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_anonymous_upload_returns_verdict() -> Result<()> {
    let ctx = setup_server(ServerOptions::default()).await?;

    let response = ctx.analyze("192.0.2.10", None).await?;
    ensure!(
        response.status() == StatusCode::OK,
        "unexpected status {}",
        response.status()
    );
    let body = json_body(response).await?;
    ensure!(body["verdict"] == "Clean", "unexpected verdict: {body}");
    ensure!(body["confidence"] == "91%", "unexpected confidence: {body}");
    ensure!(ctx.engine_calls() == 1, "engine should run exactly once");

    let logs = usage_logs(&ctx, "?ip_address=192.0.2.10").await?;
    ensure!(logs.len() == 1, "expected one usage log, got {logs:?}");
    ensure!(
        logs[0]["verdict"] == "Clean - 91%",
        "unexpected usage verdict: {logs:?}"
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_free_user_second_scan_requires_upgrade() -> Result<()> {
    let ctx = setup_server(ServerOptions::default()).await?;

    let first = ctx.analyze("192.0.2.11", Some("user_free")).await?;
    ensure!(first.status() == StatusCode::OK, "first scan should pass");

    let second = ctx.analyze("192.0.2.11", Some("user_free")).await?;
    ensure!(
        second.status() == StatusCode::FORBIDDEN,
        "second scan should be gated, got {}",
        second.status()
    );
    let body = json_body(second).await?;
    ensure!(body["code"] == "free_scan_used", "unexpected body: {body}");
    ensure!(body["upgradeUrl"] == "/pricing", "missing upgrade link: {body}");
    ensure!(ctx.engine_calls() == 1, "denied scan must not reach the engine");

    let quota = ctx
        .post_json("/check-quota", None, &json!({ "userId": "user_free" }))
        .await?;
    let summary = json_body(quota).await?;
    ensure!(summary["usage"] == 1, "usage should be 1: {summary}");
    ensure!(summary["canAnalyze"] == false, "free scan is spent: {summary}");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_applies_per_address() -> Result<()> {
    let ctx = setup_server(ServerOptions {
        rate_limit: 2,
        ..ServerOptions::default()
    })
    .await?;

    for attempt in 1..=2 {
        let response = ctx.analyze("192.0.2.12", None).await?;
        ensure!(
            response.status() == StatusCode::OK,
            "attempt {attempt} should pass, got {}",
            response.status()
        );
    }

    let limited = ctx.analyze("192.0.2.12", None).await?;
    ensure!(
        limited.status() == StatusCode::TOO_MANY_REQUESTS,
        "third attempt should be limited, got {}",
        limited.status()
    );
    let retry_after: u64 = limited
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .context("missing Retry-After header")?;
    ensure!(retry_after > 0, "retry after must be positive");
    let body = json_body(limited).await?;
    ensure!(body["code"] == "rate_limited", "unexpected body: {body}");

    let other = ctx.analyze("192.0.2.13", None).await?;
    ensure!(
        other.status() == StatusCode::OK,
        "a different address has its own budget"
    );

    let blocked = usage_logs(&ctx, "?verdict=blocked").await?;
    ensure!(blocked.len() == 1, "expected one blocked log: {blocked:?}");
    ensure!(
        blocked[0]["verdict"] == "BLOCKED: Rate limit",
        "unexpected blocked verdict: {blocked:?}"
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_failure_consumes_no_quota() -> Result<()> {
    let ctx = setup_server(ServerOptions {
        engine_fails: true,
        ..ServerOptions::default()
    })
    .await?;

    let response = ctx.analyze("192.0.2.14", Some("user_unlucky")).await?;
    ensure!(
        response.status() == StatusCode::INTERNAL_SERVER_ERROR,
        "engine failure should surface as 500, got {}",
        response.status()
    );
    let body = json_body(response).await?;
    ensure!(body["code"] == "analysis_failed", "unexpected body: {body}");
    ensure!(
        body["details"] == "analysis service unavailable",
        "unexpected detail: {body}"
    );
    ensure!(
        !body.to_string().contains("engine offline"),
        "upstream detail must not leak: {body}"
    );

    let quota = ctx
        .post_json("/check-quota", None, &json!({ "userId": "user_unlucky" }))
        .await?;
    let summary = json_body(quota).await?;
    ensure!(summary["usage"] == 0, "failed scan must not count: {summary}");
    ensure!(summary["canAnalyze"] == true, "user may retry: {summary}");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signup_webhook_throttles_and_blocks_domains() -> Result<()> {
    let ctx = setup_server(ServerOptions::default()).await?;

    let blocked = ctx
        .post_json(
            "/identity/user-created",
            Some(WEBHOOK_TOKEN),
            &json!({ "userId": "user_temp", "email": "burner@mailinator.com" }),
        )
        .await?;
    let body = json_body(blocked).await?;
    ensure!(body["blocked"] == true, "temporary domain should block: {body}");
    ensure!(body["code"] == "blocked_domain", "unexpected code: {body}");

    for index in 1..=2 {
        let response = ctx
            .post_json(
                "/identity/user-created",
                Some(WEBHOOK_TOKEN),
                &json!({ "userId": format!("user_{index}"), "email": format!("p{index}@example.com") }),
            )
            .await?;
        let body = json_body(response).await?;
        ensure!(body["blocked"] == false, "signup {index} should pass: {body}");
    }

    let verify = ctx
        .post_json("/signup-verify", None, &json!({ "email": "p3@example.com" }))
        .await?;
    let body = json_body(verify).await?;
    ensure!(body["allowed"] == false, "third signup should be refused: {body}");
    ensure!(body["code"] == "signup_rate_limited", "unexpected code: {body}");
    ensure!(body["count"] == 2, "blocked signups do not count: {body}");

    Ok(())
}

#[rstest]
#[case::no_token(None)]
#[case::wrong_token(Some("guess"))]
#[case::admin_token(Some(ADMIN_TOKEN))]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_webhooks_reject_bad_tokens(#[case] token: Option<&str>) -> Result<()> {
    let ctx = setup_server(ServerOptions::default()).await?;

    let response = ctx
        .post_json(
            "/billing/plan-assignments",
            token,
            &json!({ "userId": "user_sneaky", "planType": "lifetime" }),
        )
        .await?;
    ensure!(
        response.status() == StatusCode::UNAUTHORIZED,
        "expected 401, got {}",
        response.status()
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paid_plan_lifts_free_scan_gate() -> Result<()> {
    let ctx = setup_server(ServerOptions::default()).await?;

    let first = ctx.analyze("192.0.2.15", Some("user_upgrader")).await?;
    ensure!(first.status() == StatusCode::OK, "first scan should pass");

    let assign = ctx
        .post_json(
            "/billing/plan-assignments",
            Some(WEBHOOK_TOKEN),
            &json!({ "userId": "user_upgrader", "planType": "gamer" }),
        )
        .await?;
    ensure!(assign.status() == StatusCode::OK, "plan assignment failed");

    let second = ctx.analyze("192.0.2.15", Some("user_upgrader")).await?;
    ensure!(
        second.status() == StatusCode::OK,
        "paid user should pass, got {}",
        second.status()
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_metrics_and_admin_auth() -> Result<()> {
    let ctx = setup_server(ServerOptions::default()).await?;

    ctx.analyze("192.0.2.16", None).await?;
    let metrics = ctx.client().get(ctx.url("/metrics")).send().await?;
    ensure!(metrics.status() == StatusCode::OK, "metrics should be served");
    let text = metrics.text().await?;
    ensure!(
        text.contains("scanguard_admissions_total"),
        "admission counter missing from metrics: {text}"
    );

    let denied = ctx
        .client()
        .get(ctx.url("/admin/usage-logs"))
        .send()
        .await?;
    ensure!(
        denied.status() == StatusCode::UNAUTHORIZED,
        "usage logs must require the admin token"
    );

    Ok(())
}
