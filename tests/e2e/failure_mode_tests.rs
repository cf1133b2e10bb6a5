use super::{mint_token, TestHarness};
use anyhow::Result;
use std::time::{Duration, Instant};
use wiremock::matchers::method;
use wiremock::{Mock, ResponseTemplate};

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_upstream_returns_gateway_timeout() -> Result<()> {
    let mut harness = TestHarness::new().await?;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&harness.upstreams.payments)
        .await;

    harness.start_gateway(&[("UPSTREAM_TIMEOUT_MS", "500")]).await?;

    let start = Instant::now();
    let response = harness
        .http_client()
        .get(harness.gateway_url("/pagos/historial"))
        .bearer_auth(mint_token("paciente-9", "PACIENTE", 600))
        .header("X-Correlation-Id", "slow-1")
        .send()
        .await?;

    assert_eq!(response.status(), 504);
    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(response.headers()["x-correlation-id"], "slow-1");
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"]["kind"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(body["error"]["correlationId"], "slow-1");

    harness.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_path_and_oversized_body() -> Result<()> {
    let mut harness = TestHarness::new().await?;
    harness.start_gateway(&[("MAX_BODY_SIZE_BYTES", "1024")]).await?;
    let client = harness.http_client();

    let response = client
        .get(harness.gateway_url("/laboratorio/resultados"))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    let response = client
        .post(harness.gateway_url("/auth/registro"))
        .body(vec![b'a'; 8 * 1024])
        .send()
        .await?;
    assert_eq!(response.status(), 413);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"]["kind"], "PAYLOAD_TOO_LARGE");

    harness.cleanup().await?;
    Ok(())
}
