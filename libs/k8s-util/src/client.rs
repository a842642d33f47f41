use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::Result;
use kube::{client::ConfigExt, Client, Config};
use prometheus_client::registry::Registry;
use tower::ServiceBuilder;

/// Build the kube [`Client`] every controller pass goes through,
/// with a [`MetricsLayer`] wrapped around the HTTP stack so API
/// traffic lands in the scrape registry, labeled by templated
/// endpoint and method.
pub fn instrumented_client(config: Config, registry: &mut Registry) -> Result<Client> {
    let https = config.rustls_https_connector()?;
    let inner = hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https);
    let stack = ServiceBuilder::new()
        .layer(MetricsLayer::new(registry))
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .service(inner);
    Ok(Client::new(stack, config.default_namespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_from_a_plain_config_and_registers_metrics() {
        let mut registry = Registry::default();
        let config = Config::new("https://127.0.0.1:6443".parse::<http::Uri>().unwrap());
        let client = instrumented_client(config, &mut registry).unwrap();
        assert_eq!(client.default_namespace(), "default");

        // the request families register even before any call is made
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains("kubernetes_client_request_duration"));
        assert!(out.contains("kubernetes_client_requests"));
    }
}
