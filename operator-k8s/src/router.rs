use axum::Extension;
use prometheus::{Encoder, Registry};
use tracing::error;

/// Encode the families of `registry` then the default ones
fn encode(registry: &Registry) -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    for families in [registry.gather(), prometheus::gather()] {
        if let Err(err) = encoder.encode(&families, &mut buf) {
            error!("failed to encode metrics: {err}");
            return String::new();
        }
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// metrics handler
#[allow(clippy::unused_async)] // require by axum
pub(crate) async fn metrics(Extension(registry): Extension<Registry>) -> String {
    encode(&registry)
}

/// healthz handler
#[allow(clippy::unused_async)] // require by axum
pub(crate) async fn healthz() -> &'static str {
    "healthy"
}

#[cfg(test)]
mod test {
    use prometheus::{IntCounter, Opts};

    use super::*;

    #[tokio::test]
    async fn registered_metrics_are_served() {
        let registry = Registry::new();
        let counter = IntCounter::with_opts(Opts::new("mysqlcluster_test_total", "test")).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();
        let body = metrics(Extension(registry)).await;
        assert!(body.contains("mysqlcluster_test_total 1"));
        assert_eq!(healthz().await, "healthy");
    }
}
