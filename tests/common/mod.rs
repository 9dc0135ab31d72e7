// tests/common/mod.rs
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use tcp_mux_proxy::config::{BackendConfig, Config, ProxyConfig};
use tcp_mux_proxy::health::HealthMonitor;
use tcp_mux_proxy::metrics::MetricsRegistry;
use tcp_mux_proxy::proxy::Backend;
use tcp_mux_proxy::server::ProxyServer;

/// In-process backend with a toggleable health endpoint, a hit counter, and
/// an adjustable response delay.
pub struct MockBackend {
    pub port: u16,
    pub hits: Arc<AtomicU64>,
    pub health_status: Arc<AtomicU16>,
    pub delay_ms: Arc<AtomicU64>,
}

pub async fn spawn_backend() -> MockBackend {
    let hits = Arc::new(AtomicU64::new(0));
    let health_status = Arc::new(AtomicU16::new(200));
    let delay_ms = Arc::new(AtomicU64::new(0));

    let state = (hits.clone(), health_status.clone(), delay_ms.clone());
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let (hits, health_status, delay_ms) = state.clone();
                async move {
                    if req.uri().path() == "/health" {
                        let status = health_status.load(Ordering::SeqCst);
                        return Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Body::from("OK"))
                                .unwrap(),
                        );
                    }

                    hits.fetch_add(1, Ordering::SeqCst);
                    let wait = delay_ms.load(Ordering::SeqCst);
                    if wait > 0 {
                        sleep(Duration::from_millis(wait)).await;
                    }
                    Ok(Response::builder()
                        .status(StatusCode::OK)
                        .body(Body::from("hello from backend"))
                        .unwrap())
                }
            }))
        }
    });

    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let server = Server::bind(&addr).serve(make_svc);
    let port = server.local_addr().port();
    tokio::spawn(async move {
        let _ = server.await;
    });

    MockBackend {
        port,
        hits,
        health_status,
        delay_ms,
    }
}

pub fn build_config(
    backend_ports: &[u16],
    bind: &str,
    max_conn: u32,
    min_alive: usize,
    health_check_interval_ms: u64,
) -> Config {
    Config {
        proxy: ProxyConfig {
            bind: bind.to_string(),
            metrics_server_port: ":0".to_string(),
            max_conn,
            min_alive,
            recovery_sleep_time_ms: 20,
            name: "test-proxy".to_string(),
        },
        backend: backend_ports
            .iter()
            .enumerate()
            .map(|(i, &port)| BackendConfig {
                name: format!("backend-{}", i),
                host: "http://127.0.0.1".to_string(),
                port,
                health_check_endpoint: "/health".to_string(),
                health_check_interval_ms,
            })
            .collect(),
    }
}

pub struct TestStack {
    pub proxy: Arc<ProxyServer>,
    pub monitor: Arc<HealthMonitor>,
}

/// Wire the stack the way `main` does: metrics, server, monitor, one probe
/// task per backend, and the supervisor loop on its own task.
pub async fn spawn_stack(config: &Config) -> TestStack {
    let registry = Arc::new(MetricsRegistry::new().unwrap());
    let metrics = registry.metrics();

    let backends: Vec<Backend> = config
        .backend
        .iter()
        .enumerate()
        .map(|(id, backend)| Backend::from_config(id as u16, backend).unwrap())
        .collect();
    let backends = Arc::new(backends);

    let proxy = Arc::new(ProxyServer::new(config, backends.clone(), metrics.clone()).unwrap());
    let monitor = Arc::new(HealthMonitor::new(
        config,
        backends.clone(),
        proxy.clone(),
        metrics,
    ));

    for id in 0..backends.len() as u16 {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            monitor.run(id).await;
        });
    }

    let supervisor_proxy = proxy.clone();
    let supervisor_monitor = monitor.clone();
    let recovery_sleep = config.proxy.recovery_sleep_time();
    tokio::spawn(async move {
        loop {
            if supervisor_proxy.start().await.is_err() {
                break;
            }
            while supervisor_monitor.is_aggregate_unhealthy() || supervisor_proxy.is_in_shutdown()
            {
                sleep(recovery_sleep).await;
            }
        }
    });

    TestStack { proxy, monitor }
}

/// Poll the proxy's `/status/` endpoint until it answers 200.
pub async fn wait_until_accepting(client: &reqwest::Client, base: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(response) = client.get(format!("{}/status/", base)).send().await {
                if response.status().as_u16() == 200 {
                    return;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("proxy never started accepting");
}

/// Poll until the proxy port stops answering.
pub async fn wait_until_refusing(client: &reqwest::Client, base: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if client.get(format!("{}/status/", base)).send().await.is_err() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("proxy never stopped accepting");
}
