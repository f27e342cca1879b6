//! Prometheus metrics

use crate::config::MonitoringConfig;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Global metrics instance
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub connections_total: IntCounter,
    pub messages_delivered: IntCounter,
    pub messages_offline: IntCounter,
    pub delivery_failures: IntCounter,
    pub malformed_envelopes: IntCounter,
    pub pushes: IntCounter,

    // Gauges
    pub online_users: IntGauge,

    // Histograms
    pub message_size: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let connections_total = counter(
            "imserver_connections_total",
            "Total number of accepted WebSocket connections",
        );
        let messages_delivered = counter(
            "imserver_messages_delivered_total",
            "Total messages written to a recipient",
        );
        let messages_offline = counter(
            "imserver_messages_offline_total",
            "Total messages dropped because the recipient was offline",
        );
        let delivery_failures = counter(
            "imserver_delivery_failures_total",
            "Total messages whose transport write failed",
        );
        let malformed_envelopes = counter(
            "imserver_malformed_envelopes_total",
            "Total inbound frames dropped as malformed",
        );
        let pushes = counter(
            "imserver_pushes_total",
            "Total server-side push requests",
        );

        let online_users = IntGauge::with_opts(Opts::new(
            "imserver_online_users",
            "Number of users currently connected",
        ))
        .expect("valid gauge opts");

        let message_size = Histogram::with_opts(
            HistogramOpts::new("imserver_message_size_bytes", "Relayed message size in bytes")
                .buckets(vec![64.0, 256.0, 512.0, 1024.0, 4096.0, 16384.0, 65536.0]),
        )
        .expect("valid histogram opts");

        // Register metrics
        REGISTRY.register(Box::new(connections_total.clone())).ok();
        REGISTRY.register(Box::new(messages_delivered.clone())).ok();
        REGISTRY.register(Box::new(messages_offline.clone())).ok();
        REGISTRY.register(Box::new(delivery_failures.clone())).ok();
        REGISTRY.register(Box::new(malformed_envelopes.clone())).ok();
        REGISTRY.register(Box::new(pushes.clone())).ok();
        REGISTRY.register(Box::new(online_users.clone())).ok();
        REGISTRY.register(Box::new(message_size.clone())).ok();

        Self {
            connections_total,
            messages_delivered,
            messages_offline,
            delivery_failures,
            malformed_envelopes,
            pushes,
            online_users,
            message_size,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

/// Render every registered metric in the text exposition format
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    buffer
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .header("Content-Type", "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(render())))
                            .unwrap_or_default(),
                    )
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}
