use clinic_gateway::auth::{Role, TokenVerifier};
use clinic_gateway::config::GatewayConfig;
use clinic_gateway::ratelimit::RateLimiter;
use clinic_gateway::routing::{RouteSpec, RouteTable};
use clinic_gateway::server::GatewayServer;
use reqwest::header::HeaderValue;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub use clinic_gateway;

// Re-export the e2e harness module
#[path = "../tests/e2e/harness.rs"]
pub mod e2e_harness;

pub use e2e_harness::{
    find_free_port, mint_token, random_subject, ClinicUpstreams, TestHarness, TEST_JWT_SECRET,
};

const SERVICES: &[&str] = &[
    "auth", "pagos", "pacientes", "citas", "farmacia", "laboratorio", "facturas", "medicos",
];

/// `count` routes spread over the clinic services, two levels deep, all
/// pointing at `upstream`.
pub fn clinic_route_specs(count: usize, upstream: &str) -> Vec<RouteSpec> {
    let admin: Role = "ADMIN".parse().expect("valid role");
    (0..count)
        .map(|i| {
            let service = SERVICES[i % SERVICES.len()];
            let prefix = if i < SERVICES.len() {
                format!("/{}", service)
            } else {
                format!("/{}/v{}", service, i / SERVICES.len())
            };
            let spec = RouteSpec::new(prefix, format!("{}/{}", upstream, service));
            if i % 3 == 0 {
                spec
            } else {
                spec.with_auth([admin.clone()])
            }
        })
        .collect()
}

pub fn bench_config(routes: Vec<RouteSpec>) -> GatewayConfig {
    let mut config = GatewayConfig::with_routes(routes);
    config.host = "127.0.0.1".to_string();
    config.jwt_secret = Some(TEST_JWT_SECRET.to_string());
    config.log_level = "error".to_string();
    config
}

/// In-memory pieces of the request pipeline, without any I/O.
pub struct GatewayBenchFixture {
    pub table: RouteTable,
    pub limiter: RateLimiter,
    pub verifier: TokenVerifier,
    pub admin_token: HeaderValue,
    pub paths: Vec<String>,
}

impl GatewayBenchFixture {
    pub fn new(route_count: usize) -> Self {
        let config = bench_config(clinic_route_specs(route_count, "http://127.0.0.1:9"));
        let table =
            RouteTable::from_specs(config.routes.iter().cloned()).expect("route table builds");
        let paths = config
            .routes
            .iter()
            .map(|r| format!("{}/recurso/42", r.prefix))
            .collect();
        let limiter = RateLimiter::new(&config.rate_classes, config.rate_limit_max_keys);
        let verifier = TokenVerifier::new(&config).expect("verifier");
        let admin_token =
            HeaderValue::from_str(&format!("Bearer {}", mint_token("admin-bench", "ADMIN", 3600)))
                .expect("header value");

        Self {
            table,
            limiter,
            verifier,
            admin_token,
            paths,
        }
    }
}

/// Serve `config` on an ephemeral port inside the current runtime.
pub async fn spawn_in_process_gateway(
    config: GatewayConfig,
) -> anyhow::Result<(JoinHandle<anyhow::Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = GatewayServer::new(config)?;
    Ok((tokio::spawn(server.serve(listener)), addr))
}
