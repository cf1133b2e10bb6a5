use std::time::Duration;

use clinic_gateway_hub::bench_support::{
    bench_config, clinic_route_specs, mint_token, spawn_in_process_gateway,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use reqwest::Client;
use tokio::runtime::Runtime;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn bench_gateway_latency(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("e2e_latency");
    group
        .sample_size(200)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3));

    let (upstream, handle, addr) = runtime.block_on(async {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&upstream)
            .await;

        let mut config = bench_config(clinic_route_specs(16, &upstream.uri()));
        // Benchmarks hammer a single client; keep the limiter out of the way.
        for class in config.rate_classes.values_mut() {
            class.capacity = u32::MAX;
            class.refill_per_second = 1e9;
        }
        let (handle, addr) = spawn_in_process_gateway(config).await.expect("gateway");
        (upstream, handle, addr)
    });

    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("client");
    let admin = mint_token("admin-bench", "ADMIN", 3600);

    group.bench_function(BenchmarkId::new("proxy", "public_route"), |b| {
        let url = format!("http://{}/auth/recurso", addr);
        b.iter(|| {
            runtime.block_on(async {
                let response = client.get(&url).send().await.expect("response");
                assert_eq!(response.status(), 200, "Expected 200 OK from public route");
                response.bytes().await.expect("bytes");
            });
        });
    });

    group.bench_function(BenchmarkId::new("proxy", "authenticated_route"), |b| {
        let url = format!("http://{}/pagos/recurso", addr);
        b.iter(|| {
            runtime.block_on(async {
                let response = client
                    .get(&url)
                    .bearer_auth(&admin)
                    .send()
                    .await
                    .expect("response");
                assert_eq!(response.status(), 200, "Expected 200 OK for ADMIN token");
                response.bytes().await.expect("bytes");
            });
        });
    });

    group.bench_function(BenchmarkId::new("reject", "missing_token"), |b| {
        let url = format!("http://{}/pagos/recurso", addr);
        b.iter(|| {
            runtime.block_on(async {
                let response = client.get(&url).send().await.expect("response");
                assert_eq!(response.status(), 401);
            });
        });
    });

    group.finish();

    handle.abort();
    drop(upstream);
}

criterion_group!(end_to_end_latency, bench_gateway_latency);
criterion_main!(end_to_end_latency);
