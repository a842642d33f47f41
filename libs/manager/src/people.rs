use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::PeopleApiConfig;
use crate::error::{Error, Result};
use crate::k8s::K8sGateway;
use crate::record::{AUTHOR_LABEL, OWNER_ANNOTATION};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Contact record returned by the people API.
#[derive(Clone, Debug, Deserialize)]
pub struct Owner {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub slack_id: Option<String>,
}

/// REST client for the people API. Supports a private CA bundle or,
/// for lab clusters, skipping verification entirely.
pub struct PeopleGateway {
    http: reqwest::Client,
    base_url: String,
}

impl PeopleGateway {
    pub fn new(config: &PeopleApiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT);
        if let Some(ca) = &config.ca {
            let pem = std::fs::read(ca)
                .map_err(|e| Error::Config(format!("cannot read CA bundle {}: {e}", ca.display())))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a CI user identifier to a contact; `None` when unknown.
    pub async fn resolve(&self, user_id: &str) -> Result<Option<Owner>> {
        let url = format!("{}/people", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("user_id", user_id)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}

/// The identity written into the owner annotation, by preference:
/// chat handle, then email, then the raw user id.
pub fn owner_identity(owner: Owner) -> String {
    owner.slack_id.or(owner.email).unwrap_or(owner.id)
}

/// `get-owner-info` child-job entrypoint: look up the namespace author
/// and publish the resolved contact as the owner annotation.
pub async fn resolve_and_annotate(
    gateway: &K8sGateway,
    people: &PeopleGateway,
    target_namespace: &str,
) -> Result<()> {
    let Some(ns) = gateway.get_namespace(target_namespace).await? else {
        debug!(namespace = %target_namespace, "namespace is gone, nothing to resolve");
        return Ok(());
    };
    let Some(author) = ns
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(AUTHOR_LABEL))
        .cloned()
    else {
        debug!(namespace = %target_namespace, "no author label, owner stays unresolved");
        return Ok(());
    };
    let Some(owner) = people.resolve(&author).await? else {
        info!(namespace = %target_namespace, %author, "people API does not know this author");
        return Ok(());
    };
    let identity = owner_identity(owner);
    info!(namespace = %target_namespace, %identity, "resolved namespace owner");
    gateway
        .annotate_namespace(
            target_namespace,
            &json!({"metadata": {"annotations": {(OWNER_ANNOTATION): identity}}}),
        )
        .await
}
