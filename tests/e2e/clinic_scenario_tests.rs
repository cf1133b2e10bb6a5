use super::{mint_token, random_subject, TestHarness};
use anyhow::Result;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test(flavor = "multi_thread")]
async fn test_payments_require_token_and_receive_identity() -> Result<()> {
    let mut harness = TestHarness::new().await?;

    Mock::given(method("GET"))
        .and(path("/paciente/123"))
        .and(header("x-user-id", "paciente-123"))
        .and(header("x-user-role", "PACIENTE"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "paciente": 123,
            "pendiente": 80.5,
        })))
        .expect(1)
        .mount(&harness.upstreams.payments)
        .await;

    harness.start_gateway(&[]).await?;

    // No token: rejected before any upstream call.
    let response = harness
        .http_client()
        .get(harness.gateway_url("/pagos/paciente/123"))
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"]["kind"], "AUTH_MISSING_TOKEN");

    let response = harness
        .http_client()
        .get(harness.gateway_url("/pagos/paciente/123"))
        .bearer_auth(mint_token("paciente-123", "PACIENTE", 600))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body, json!({ "paciente": 123, "pendiente": 80.5 }));

    harness.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_admin_subtree_uses_longest_prefix() -> Result<()> {
    let mut harness = TestHarness::new().await?;

    Mock::given(method("GET"))
        .and(path("/admin/auditoria"))
        .respond_with(ResponseTemplate::new(200).set_body_string("audit"))
        .expect(1)
        .mount(&harness.upstreams.patients)
        .await;
    Mock::given(method("GET"))
        .and(path("/ficha/77"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ficha"))
        .expect(1)
        .mount(&harness.upstreams.patients)
        .await;

    harness.start_gateway(&[]).await?;
    let client = harness.http_client();
    let medico = mint_token(&random_subject("medico"), "MEDICO", 600);

    // Any authenticated role reaches the general patients route...
    let response = client
        .get(harness.gateway_url("/pacientes/ficha/77"))
        .bearer_auth(&medico)
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "ficha");

    // ...but the longer admin prefix wins and enforces its own roles.
    let response = client
        .get(harness.gateway_url("/pacientes/admin/auditoria"))
        .bearer_auth(&medico)
        .send()
        .await?;
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"]["kind"], "AUTH_ROLE_NOT_ALLOWED");

    let response = client
        .get(harness.gateway_url("/pacientes/admin/auditoria"))
        .bearer_auth(mint_token("admin-1", "ADMIN", 600))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    harness.cleanup().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_is_rate_limited() -> Result<()> {
    let mut harness = TestHarness::new().await?;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "abc" })))
        .expect(5)
        .mount(&harness.upstreams.auth)
        .await;

    harness.start_gateway(&[]).await?;

    for _ in 0..5 {
        let response = harness
            .http_client()
            .post(harness.gateway_url("/auth/login"))
            .json(&json!({ "email": "paciente@clinica.test", "password": "x" }))
            .send()
            .await?;
        assert_eq!(response.status(), 200);
    }

    let response = harness
        .http_client()
        .post(harness.gateway_url("/auth/login"))
        .json(&json!({ "email": "paciente@clinica.test", "password": "x" }))
        .send()
        .await?;
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));

    harness.cleanup().await?;
    Ok(())
}
