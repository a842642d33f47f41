use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Event, Namespace, Pod};
use kube::api::{Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::client::Client;
use tracing::debug;

use crate::error::{classify_kube, is_not_found, Error, Result};
use crate::record::{MANAGED_BY_LABEL, MANAGER_NAME};
use ns_manager_k8s_util::retry::{retry, RetryClass};

pub const FIELD_MANAGER: &str = "ns-manager";

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the classifier needs to know about one namespace's
/// workloads, fetched in a single gateway call per pass.
#[derive(Clone, Debug, Default)]
pub struct WorkloadSnapshot {
    pub deployments: Vec<Deployment>,
    pub stateful_sets: Vec<StatefulSet>,
    pub replica_sets: Vec<ReplicaSet>,
    pub pods: Vec<Pod>,
    pub events: Vec<Event>,
}

/// Typed wrapper over the Kubernetes API. All calls carry their own
/// timeout and are retried per the gateway contract: transient faults
/// back off up to 30s, write conflicts walk the re-read ladder, 404
/// is surfaced untouched for the caller to interpret.
#[derive(Clone)]
pub struct K8sGateway {
    client: Client,
    manager_namespace: String,
}

fn retry_class(err: &Error) -> RetryClass {
    match err {
        Error::Kube { source } => classify_kube(source),
        Error::Timeout(_) => RetryClass::Transient,
        _ => RetryClass::Fatal,
    }
}

fn surface_conflict(err: Error, what: &str) -> Error {
    match &err {
        Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 => {
            Error::Conflict(what.to_string())
        }
        _ => err,
    }
}

async fn timed<T>(
    budget: Duration,
    what: &'static str,
    fut: impl Future<Output = kube::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout(what)),
    }
}

impl K8sGateway {
    pub fn new(client: Client, manager_namespace: impl Into<String>) -> Self {
        Self {
            client,
            manager_namespace: manager_namespace.into(),
        }
    }

    /// All namespaces in the cluster; the caller intersects with the
    /// configured match rules. The list metadata carries the snapshot's
    /// `resource_version` for staleness checks.
    pub async fn list_namespaces(&self) -> Result<ObjectList<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        retry(
            || {
                let api = api.clone();
                async move { timed(READ_TIMEOUT, "namespace list", api.list(&ListParams::default())).await }
            },
            retry_class,
        )
        .await
    }

    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = retry(
            || {
                let api = api.clone();
                async move { timed(READ_TIMEOUT, "namespace get", api.get(name)).await }
            },
            retry_class,
        )
        .await;
        match result {
            Ok(ns) => Ok(Some(ns)),
            Err(Error::Kube { source }) if is_not_found(&source) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// JSON merge patch against a namespace's metadata. A vanished
    /// namespace is not an error: it was deleted externally and the
    /// pass simply drops it.
    pub async fn annotate_namespace(&self, name: &str, patch: &serde_json::Value) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = retry(
            || {
                let api = api.clone();
                let patch = patch.clone();
                async move {
                    timed(
                        WRITE_TIMEOUT,
                        "namespace annotate",
                        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)),
                    )
                    .await
                }
            },
            retry_class,
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(Error::Kube { source }) if is_not_found(&source) => {
                debug!(namespace = %name, "annotate skipped, namespace is gone");
                Ok(())
            }
            Err(e) => Err(surface_conflict(e, name)),
        }
    }

    /// Foreground deletion so child resources are reaped before the
    /// namespace object disappears. Already-gone namespaces succeed.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let result = retry(
            || {
                let api = api.clone();
                async move {
                    timed(
                        WRITE_TIMEOUT,
                        "namespace delete",
                        api.delete(name, &DeleteParams::foreground()),
                    )
                    .await
                }
            },
            retry_class,
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(Error::Kube { source }) if is_not_found(&source) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// One snapshot of a namespace's workload state.
    pub async fn workloads(&self, namespace: &str) -> Result<WorkloadSnapshot> {
        Ok(WorkloadSnapshot {
            deployments: self.list_in::<Deployment>(namespace, "deployment list").await?,
            stateful_sets: self.list_in::<StatefulSet>(namespace, "statefulset list").await?,
            replica_sets: self.list_in::<ReplicaSet>(namespace, "replicaset list").await?,
            pods: self.list_in::<Pod>(namespace, "pod list").await?,
            events: self.list_in::<Event>(namespace, "event list").await?,
        })
    }

    async fn list_in<K>(&self, namespace: &str, what: &'static str) -> Result<Vec<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = retry(
            || {
                let api = api.clone();
                async move { timed(READ_TIMEOUT, what, api.list(&ListParams::default())).await }
            },
            retry_class,
        )
        .await?;
        Ok(list.items)
    }

    // -- child workloads, always in the manager's own namespace --

    pub async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        self.get_child::<Job>(name, "job get").await
    }

    pub async fn get_cronjob(&self, name: &str) -> Result<Option<CronJob>> {
        self.get_child::<CronJob>(name, "cronjob get").await
    }

    pub async fn create_job(&self, job: &Job) -> Result<()> {
        self.create_child(job, "job create").await
    }

    pub async fn create_cronjob(&self, cronjob: &CronJob) -> Result<()> {
        self.create_child(cronjob, "cronjob create").await
    }

    pub async fn delete_job(&self, name: &str) -> Result<()> {
        self.delete_child::<Job>(name, "job delete").await
    }

    pub async fn delete_cronjob(&self, name: &str) -> Result<()> {
        self.delete_child::<CronJob>(name, "cronjob delete").await
    }

    pub async fn list_managed_jobs(&self) -> Result<Vec<Job>> {
        self.list_managed::<Job>("job list").await
    }

    pub async fn list_managed_cronjobs(&self) -> Result<Vec<CronJob>> {
        self.list_managed::<CronJob>("cronjob list").await
    }

    async fn get_child<K>(&self, name: &str, what: &'static str) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.manager_namespace);
        let result = retry(
            || {
                let api = api.clone();
                async move { timed(READ_TIMEOUT, what, api.get(name)).await }
            },
            retry_class,
        )
        .await;
        match result {
            Ok(obj) => Ok(Some(obj)),
            Err(Error::Kube { source }) if is_not_found(&source) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_child<K>(&self, obj: &K, what: &'static str) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::Serialize
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.manager_namespace);
        let result = retry(
            || {
                let api = api.clone();
                let obj = obj.clone();
                async move { timed(WRITE_TIMEOUT, what, api.create(&PostParams::default(), &obj)).await }
            },
            retry_class,
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            // deterministic names make double-creation benign
            Err(Error::Kube { source: kube::Error::Api(ae) }) if ae.code == 409 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_child<K>(&self, name: &str, what: &'static str) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.manager_namespace);
        let result = retry(
            || {
                let api = api.clone();
                async move {
                    timed(WRITE_TIMEOUT, what, api.delete(name, &DeleteParams::background())).await
                }
            },
            retry_class,
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(Error::Kube { source }) if is_not_found(&source) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_managed<K>(&self, what: &'static str) -> Result<Vec<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.manager_namespace);
        let params = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGER_NAME}"));
        let list = retry(
            || {
                let api = api.clone();
                let params = params.clone();
                async move { timed(READ_TIMEOUT, what, api.list(&params)).await }
            },
            retry_class,
        )
        .await?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{mock_client, serve_one};
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    #[tokio::test]
    async fn annotate_sends_merge_patch() {
        let (client, mut handle) = mock_client();
        let gateway = K8sGateway::new(client, "ns-manager");
        let patch = json!({"metadata": {"annotations": {"manager.cicd.skao.int/status": "OK"}}});

        let server = tokio::spawn(async move {
            let (request, body) = serve_one(
                &mut handle,
                http::Method::PATCH,
                "/api/v1/namespaces/ci-abc",
                json!({"kind": "Namespace"}),
            )
            .await;
            assert_eq!(
                request.headers.get(http::header::CONTENT_TYPE).unwrap(),
                "application/merge-patch+json"
            );
            assert_json_include!(
                actual: body,
                expected: json!({"metadata": {"annotations": {"manager.cicd.skao.int/status": "OK"}}})
            );
        });

        gateway.annotate_namespace("ci-abc", &patch).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn delete_namespace_is_foreground() {
        let (client, mut handle) = mock_client();
        let gateway = K8sGateway::new(client, "ns-manager");

        let server = tokio::spawn(async move {
            let (_, body) = serve_one(
                &mut handle,
                http::Method::DELETE,
                "/api/v1/namespaces/ci-abc",
                json!({"kind": "Status", "status": "Success"}),
            )
            .await;
            assert_eq!(body["propagationPolicy"], "Foreground");
        });

        gateway.delete_namespace("ci-abc").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn vanished_namespace_is_not_an_error() {
        let (client, mut handle) = mock_client();
        let gateway = K8sGateway::new(client, "ns-manager");

        let server = tokio::spawn(async move {
            crate::testing::serve_error(&mut handle, 404, "NotFound").await;
        });

        let patch = json!({"metadata": {"annotations": {}}});
        gateway.annotate_namespace("ci-gone", &patch).await.unwrap();
        server.await.unwrap();
    }
}
