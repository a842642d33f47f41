use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Deserialize;

use crate::config::PrometheusConfig;
use crate::error::{Error, Result};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One firing alert attributed to a watched namespace.
#[derive(Clone, Debug)]
pub struct FiringAlert {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub reason: String,
    pub message: String,
    pub severity: String,
}

#[derive(Deserialize)]
struct AlertsResponse {
    status: String,
    data: AlertsData,
}

#[derive(Deserialize)]
struct AlertsData {
    alerts: Vec<ApiAlert>,
}

#[derive(Deserialize)]
struct ApiAlert {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    state: String,
}

/// Read-only client for the Prometheus alerts endpoint. One query per
/// pass covers every watched namespace; scoping happens client-side.
pub struct PrometheusGateway {
    http: reqwest::Client,
    base_url: String,
}

impl PrometheusGateway {
    pub fn new(config: &PrometheusConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(QUERY_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn firing_alerts(
        &self,
        namespaces: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<FiringAlert>>> {
        let url = format!("{}/api/v1/alerts", self.base_url);
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let parsed: AlertsResponse = response.json().await?;
        if parsed.status != "success" {
            return Err(Error::Prometheus(parsed.status));
        }
        Ok(collect_firing(parsed, namespaces))
    }
}

fn collect_firing(
    parsed: AlertsResponse,
    namespaces: &BTreeSet<String>,
) -> BTreeMap<String, Vec<FiringAlert>> {
    let mut by_namespace: BTreeMap<String, Vec<FiringAlert>> = BTreeMap::new();
    for alert in parsed.data.alerts {
        if alert.state != "firing" {
            continue;
        }
        let Some(namespace) = alert.labels.get("namespace").cloned() else {
            continue;
        };
        if !namespaces.contains(&namespace) {
            continue;
        }
        by_namespace
            .entry(namespace.clone())
            .or_default()
            .push(convert(alert, namespace));
    }
    by_namespace
}

fn convert(alert: ApiAlert, namespace: String) -> FiringAlert {
    let labels = &alert.labels;
    let alertname = labels
        .get("alertname")
        .cloned()
        .unwrap_or_else(|| "AlertFiring".to_string());

    // explicit kind/name labels win; otherwise the workload labels the
    // usual kube-state-metrics rules attach
    let (kind, name) = if let (Some(kind), Some(name)) = (labels.get("kind"), labels.get("name")) {
        (kind.clone(), name.clone())
    } else if let Some(pod) = labels.get("pod") {
        ("Pod".to_string(), pod.clone())
    } else if let Some(deployment) = labels.get("deployment") {
        ("Deployment".to_string(), deployment.clone())
    } else if let Some(statefulset) = labels.get("statefulset") {
        ("StatefulSet".to_string(), statefulset.clone())
    } else if let Some(job) = labels.get("job_name") {
        ("Job".to_string(), job.clone())
    } else {
        ("Namespace".to_string(), namespace.clone())
    };

    let message = alert
        .annotations
        .get("message")
        .or_else(|| alert.annotations.get("description"))
        .or_else(|| alert.annotations.get("summary"))
        .cloned()
        .unwrap_or_else(|| alertname.clone());

    FiringAlert {
        namespace,
        kind,
        name,
        reason: alertname,
        message,
        severity: labels.get("severity").cloned().unwrap_or_default(),
    }
}
