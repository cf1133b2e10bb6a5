use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, error, info};
use wiremock::MockServer;

pub const TEST_JWT_SECRET: &str = "e2e-clinic-secret";
pub const HEALTH_PATH: &str = "/__gateway/health";

/// The clinic's backends, each stood in for by a wiremock server.
pub struct ClinicUpstreams {
    pub auth: MockServer,
    pub payments: MockServer,
    pub patients: MockServer,
}

impl ClinicUpstreams {
    pub async fn start() -> Self {
        Self {
            auth: MockServer::start().await,
            payments: MockServer::start().await,
            patients: MockServer::start().await,
        }
    }

    /// `/auth` public on the strict class, `/pagos` for PACIENTE/ADMIN,
    /// `/pacientes` for any authenticated role, `/pacientes/admin` for ADMIN.
    pub fn routes_document(&self) -> Value {
        json!({
            "routes": [
                { "prefix": "/auth", "target": self.auth.uri(), "rate_class": "auth" },
                {
                    "prefix": "/pagos",
                    "target": self.payments.uri(),
                    "requires_auth": true,
                    "allowed_roles": ["PACIENTE", "ADMIN"]
                },
                { "prefix": "/pacientes", "target": self.patients.uri(), "requires_auth": true },
                {
                    "prefix": "/pacientes/admin",
                    "target": format!("{}/admin", self.patients.uri()),
                    "requires_auth": true,
                    "allowed_roles": ["ADMIN"]
                }
            ]
        })
    }
}

#[derive(Debug)]
pub struct GatewayProcess {
    pub port: u16,
    pub child: Child,
}

/// Runs the real `clinic-gateway` binary against wiremock backends.
pub struct TestHarness {
    workspace_dir: PathBuf,
    temp_dir: TempDir,
    http_client: Client,
    pub upstreams: ClinicUpstreams,
    pub gateway: Option<GatewayProcess>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let workspace_dir =
            PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
        let temp_dir = TempDir::new().context("creating harness tempdir")?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            workspace_dir,
            temp_dir,
            http_client,
            upstreams: ClinicUpstreams::start().await,
            gateway: None,
        })
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub fn gateway_url(&self, path: &str) -> String {
        let port = self.gateway.as_ref().map(|g| g.port).unwrap_or_default();
        format!("http://127.0.0.1:{}{}", port, path)
    }

    /// Start the gateway with the clinic routes and any extra environment.
    pub async fn start_gateway(&mut self, extra_env: &[(&str, &str)]) -> Result<()> {
        tracing_subscriber::fmt::try_init().ok();

        let routes_path = self.temp_dir.path().join("routes.json");
        tokio::fs::write(&routes_path, self.upstreams.routes_document().to_string())
            .await
            .context("writing routes file")?;

        let port = find_free_port()?;
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert(
            "RUST_LOG".into(),
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        );
        env.insert("GATEWAY_HOST".into(), "127.0.0.1".into());
        env.insert("GATEWAY_PORT".into(), port.to_string());
        env.insert(
            "GATEWAY_ROUTES_FILE".into(),
            routes_path.display().to_string(),
        );
        env.insert("JWT_SECRET".into(), TEST_JWT_SECRET.into());
        env.insert("HEALTH_PATH".into(), HEALTH_PATH.into());
        for (key, value) in extra_env {
            env.insert((*key).to_string(), (*value).to_string());
        }

        let child = self.spawn_gateway(&env).await?;
        self.gateway = Some(GatewayProcess { port, child });

        self.wait_for_service_health(&self.gateway_url(HEALTH_PATH), Duration::from_secs(60))
            .await
            .context("waiting for gateway health")?;
        Ok(())
    }

    async fn spawn_gateway(&self, env: &HashMap<String, String>) -> Result<Child> {
        info!("Starting clinic-gateway");
        let mut command = Command::new("cargo");
        command
            .current_dir(&self.workspace_dir)
            .arg("run")
            .arg("--quiet")
            .arg("--package")
            .arg("clinic-gateway")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }
        command.spawn().context("spawning clinic-gateway")
    }

    pub async fn wait_for_service_health(&self, url: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.http_client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    debug!("health check for {url} returned {}", response.status());
                }
                Err(err) => {
                    debug!("health check for {url} failed: {err}");
                }
            };
            sleep(Duration::from_millis(250)).await;
        }
        Err(anyhow!("timeout waiting for service health at {url}"))
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        if let Some(mut gateway) = self.gateway.take() {
            info!("Stopping clinic-gateway");
            if let Err(err) = gateway.child.start_kill() {
                error!("failed to send kill to gateway: {err:#}");
            }
            if let Err(err) = gateway.child.wait().await {
                error!("failed to await gateway shutdown: {err:#}");
            }
        }
        Ok(())
    }
}

/// HS256 token for `sub` with `role`, valid for `ttl_secs` (negative for expired).
pub fn mint_token(sub: &str, role: &str, ttl_secs: i64) -> String {
    let claims = json!({
        "sub": sub,
        "role": role,
        "exp": chrono::Utc::now().timestamp() + ttl_secs,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()),
    )
    .unwrap_or_default()
}

pub fn random_subject(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

pub fn find_free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").context("binding ephemeral port")?;
    Ok(listener.local_addr()?.port())
}
