use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::client::Client;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::alerts::PrometheusGateway;
use crate::config::Settings;
use crate::error::Result;
use crate::k8s::K8sGateway;
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::people::PeopleGateway;
use crate::schedule::TaskScheduler;

pub type ControllerId = &'static str;

pub const COLLECT_CONTROLLER: ControllerId = "collect";
pub const ACTION_CONTROLLER: ControllerId = "action";

/// Diagnostics exposed by the web server.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_pass: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_pass: Utc::now(),
        }
    }
}

/// State shared between the controllers and the web server.
#[derive(Clone)]
pub struct State {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    pub fn new(mut registry: Registry) -> Self {
        let metrics = Arc::new(Metrics::new(&mut registry));
        Self {
            registry: Arc::new(registry),
            metrics,
            diagnostics: Arc::default(),
        }
    }

    pub fn metrics_text(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Wire up the gateways and hand the controllers their context.
    pub fn to_context(&self, client: Client, settings: Arc<Settings>) -> Result<Arc<Context>> {
        let gateway = K8sGateway::new(client.clone(), settings.context.namespace.clone());
        let scheduler = TaskScheduler::new(gateway.clone(), settings.context.clone());
        let prometheus = settings
            .prometheus
            .as_ref()
            .map(PrometheusGateway::new)
            .transpose()?;
        let notifier = settings.notifier.as_ref().map(Notifier::new).transpose()?;
        let people = settings.people_api.as_ref().map(PeopleGateway::new).transpose()?;
        Ok(Arc::new(Context {
            client,
            settings,
            gateway,
            scheduler,
            prometheus,
            notifier,
            people,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

/// Context injected into every controller pass and child-job action.
pub struct Context {
    pub client: Client,
    pub settings: Arc<Settings>,
    pub gateway: K8sGateway,
    pub scheduler: TaskScheduler,
    pub prometheus: Option<PrometheusGateway>,
    pub notifier: Option<Notifier>,
    pub people: Option<PeopleGateway>,
    pub metrics: Arc<Metrics>,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}
