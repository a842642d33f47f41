use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, info};

use crate::config::{ManagerContext, MatchRule, Settings, TaskConfig, TaskKind};
use crate::error::Result;
use crate::k8s::K8sGateway;
use crate::record::{SPEC_HASH_ANNOTATION, TARGET_NAMESPACE_ANNOTATION};
use crate::templates::{self, child_name, spec_hash};

/// Reconciles "a child workload exists for (namespace, task)" against
/// Kubernetes. Scheduled tasks materialize as CronJobs, unscheduled
/// ones as one-shot Jobs, all in the manager's own namespace. Job
/// specs are immutable, so drift is resolved by delete-and-recreate,
/// never by an in-place patch.
pub struct TaskScheduler {
    gateway: K8sGateway,
    context: ManagerContext,
}

impl TaskScheduler {
    pub fn new(gateway: K8sGateway, context: ManagerContext) -> Self {
        Self { gateway, context }
    }

    /// Earliest upcoming cron tick across every scheduled task, used
    /// by the collect controller to pace its passes.
    pub fn next_tick(settings: &Settings, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        settings
            .namespaces
            .iter()
            .flat_map(|rule| rule.tasks.values())
            .filter_map(|task| task.schedule.as_deref())
            // expressions were validated at config load
            .filter_map(|expr| cron::Schedule::from_str(expr).ok())
            .filter_map(|schedule| schedule.after(&now).next())
            .min()
    }

    /// Bring the children of one matched namespace up to date.
    pub async fn reconcile(&self, target_namespace: &str, rule: &MatchRule) -> Result<()> {
        for (kind, task) in &rule.tasks {
            if !kind.is_child_task() {
                continue;
            }
            match task.schedule.as_deref() {
                Some(schedule) => {
                    self.reconcile_cronjob(*kind, task, schedule, target_namespace)
                        .await?
                }
                None => self.reconcile_job(*kind, task, target_namespace).await?,
            }
        }
        Ok(())
    }

    async fn reconcile_cronjob(
        &self,
        kind: TaskKind,
        task: &TaskConfig,
        schedule: &str,
        target_namespace: &str,
    ) -> Result<()> {
        let mut desired =
            templates::render_cronjob(&self.context, kind, target_namespace, task, schedule)?;
        let hash = spec_hash(&desired.spec);
        desired
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());
        let name = child_name(kind, target_namespace);

        match self.gateway.get_cronjob(&name).await? {
            None => {
                info!(%name, namespace = %target_namespace, "creating child cronjob");
                self.gateway.create_cronjob(&desired).await
            }
            Some(live) if live_hash(&live.metadata) != Some(hash.as_str()) => {
                info!(%name, namespace = %target_namespace, "child cronjob drifted, recreating");
                self.gateway.delete_cronjob(&name).await?;
                self.gateway.create_cronjob(&desired).await
            }
            Some(_) => Ok(()),
        }
    }

    async fn reconcile_job(
        &self,
        kind: TaskKind,
        task: &TaskConfig,
        target_namespace: &str,
    ) -> Result<()> {
        let mut desired = templates::render_job(&self.context, kind, target_namespace, task)?;
        let hash = spec_hash(&desired.spec);
        desired
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());
        let name = child_name(kind, target_namespace);

        match self.gateway.get_job(&name).await? {
            None => {
                info!(%name, namespace = %target_namespace, "creating child job");
                self.gateway.create_job(&desired).await
            }
            Some(live) if job_finished(&live) => {
                // ran to completion; pruning belongs to the action controller
                Ok(())
            }
            Some(live) if live_hash(&live.metadata) != Some(hash.as_str()) => {
                info!(%name, namespace = %target_namespace, "child job drifted, recreating");
                self.gateway.delete_job(&name).await?;
                self.gateway.create_job(&desired).await
            }
            Some(_) => Ok(()),
        }
    }

    /// Delete children whose target namespace is no longer matched, or
    /// whose task configuration no longer calls for that child shape.
    pub async fn collect_garbage(
        &self,
        matched: &BTreeSet<String>,
        settings: &Settings,
    ) -> Result<()> {
        for cronjob in self.gateway.list_managed_cronjobs().await? {
            if let Some((name, target, kind)) = child_identity(&cronjob.metadata) {
                let wanted = matched.contains(&target)
                    && settings
                        .rule_for(&target)
                        .and_then(|r| r.tasks.get(&kind))
                        .is_some_and(|t| t.schedule.is_some());
                if !wanted {
                    debug!(%name, namespace = %target, "garbage-collecting child cronjob");
                    self.gateway.delete_cronjob(&name).await?;
                }
            }
        }
        for job in self.gateway.list_managed_jobs().await? {
            if let Some((name, target, kind)) = child_identity(&job.metadata) {
                let wanted = matched.contains(&target)
                    && settings
                        .rule_for(&target)
                        .and_then(|r| r.tasks.get(&kind))
                        .is_some_and(|t| t.schedule.is_none());
                if !wanted && !job_owned_by_cronjob(&job) {
                    debug!(%name, namespace = %target, "garbage-collecting child job");
                    self.gateway.delete_job(&name).await?;
                }
            }
        }
        Ok(())
    }
}

fn live_hash(meta: &kube::api::ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

fn child_identity(meta: &kube::api::ObjectMeta) -> Option<(String, String, TaskKind)> {
    let name = meta.name.clone()?;
    let annotations = meta.annotations.as_ref()?;
    let target = annotations.get(TARGET_NAMESPACE_ANNOTATION)?.clone();
    let kind = annotations
        .get(crate::record::ACTION_ANNOTATION)?
        .parse()
        .ok()?;
    Some((name, target, kind))
}

pub fn job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.completion_time.as_ref())
        .is_some()
        || job
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
            })
}

pub(crate) fn job_owned_by_cronjob(job: &Job) -> bool {
    job.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "CronJob"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{mock_client, serve_error, serve_one};
    use chrono::TimeZone;
    use serde_json::json;

    const SETTINGS: &str = r#"
namespaces:
  - name_globs: ["ci-*"]
    ttl: 30m
    tasks:
      check-namespace:
        schedule: "0 */2 * * * *"
      get-owner-info: {}
  - name_globs: ["staging-*"]
    ttl: 2h
    tasks:
      check-namespace:
        schedule: "0 */5 * * * *"
context:
  namespace: ns-manager
  service_account: ns-manager
  config_secret: cfg
  config_path: /etc/ns-manager/config.yaml
  image: img
"#;

    fn settings() -> Settings {
        Settings::parse(SETTINGS).unwrap()
    }

    fn scheduler(client: kube::Client) -> TaskScheduler {
        let settings = settings();
        TaskScheduler::new(
            K8sGateway::new(client, "ns-manager"),
            settings.context.clone(),
        )
    }

    #[test]
    fn next_tick_is_the_earliest_schedule() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
        let tick = TaskScheduler::next_tick(&settings(), now).unwrap();
        // the */2 schedule fires at 12:02:00, well before the */5 one
        assert_eq!(tick, Utc.with_ymd_and_hms(2026, 3, 1, 12, 2, 0).unwrap());
        assert!(tick > now);
    }

    #[tokio::test]
    async fn missing_cronjob_is_created_with_spec_hash() {
        let (client, mut handle) = mock_client();
        let scheduler = scheduler(client);
        let settings = settings();
        let rule = settings.namespaces[0].clone();

        let server = tokio::spawn(async move {
            // check-namespace cronjob: absent, created
            serve_error(&mut handle, 404, "NotFound").await;
            let (_, body) = serve_one(
                &mut handle,
                http::Method::POST,
                "/apis/batch/v1/namespaces/ns-manager/cronjobs",
                json!({"kind": "CronJob"}),
            )
            .await;
            assert_eq!(body["spec"]["schedule"], "0 */2 * * * *");
            assert!(body["metadata"]["annotations"][SPEC_HASH_ANNOTATION].is_string());
            assert_eq!(
                body["metadata"]["annotations"][TARGET_NAMESPACE_ANNOTATION],
                "ci-abc"
            );
            // get-owner-info one-shot job: absent, created
            serve_error(&mut handle, 404, "NotFound").await;
            let (_, body) = serve_one(
                &mut handle,
                http::Method::POST,
                "/apis/batch/v1/namespaces/ns-manager/jobs",
                json!({"kind": "Job"}),
            )
            .await;
            assert_eq!(
                body["metadata"]["annotations"]["manager.cicd.skao.int/action"],
                "get-owner-info"
            );
        });

        scheduler.reconcile("ci-abc", &rule).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn drifted_cronjob_is_deleted_and_recreated() {
        let (client, mut handle) = mock_client();
        let scheduler = scheduler(client);
        let settings = settings();
        let rule = settings.namespaces[1].clone();
        let name = child_name(TaskKind::CheckNamespace, "staging-web");

        let expected_path = format!("/apis/batch/v1/namespaces/ns-manager/cronjobs/{name}");
        let server = tokio::spawn(async move {
            let live = json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {
                    "name": name,
                    "namespace": "ns-manager",
                    "annotations": {(SPEC_HASH_ANNOTATION): "stale-hash"}
                },
                "spec": {"schedule": "0 */5 * * * *", "jobTemplate": {}}
            });
            serve_one(&mut handle, http::Method::GET, &expected_path, live).await;
            serve_one(
                &mut handle,
                http::Method::DELETE,
                &expected_path,
                json!({"kind": "Status", "status": "Success"}),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::POST,
                "/apis/batch/v1/namespaces/ns-manager/cronjobs",
                json!({"kind": "CronJob"}),
            )
            .await;
        });

        scheduler.reconcile("staging-web", &rule).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_children_are_garbage_collected() {
        let (client, mut handle) = mock_client();
        let scheduler = scheduler(client);
        let settings = settings();
        let matched: BTreeSet<String> = ["ci-live".to_string()].into();

        let gone_name = child_name(TaskKind::CheckNamespace, "ci-gone");
        let live_name = child_name(TaskKind::CheckNamespace, "ci-live");
        let server = tokio::spawn(async move {
            let cronjobs = json!({
                "kind": "CronJobList",
                "apiVersion": "batch/v1",
                "metadata": {},
                "items": [
                    {
                        "metadata": {
                            "name": gone_name,
                            "namespace": "ns-manager",
                            "annotations": {
                                "manager.cicd.skao.int/action": "check-namespace",
                                (TARGET_NAMESPACE_ANNOTATION): "ci-gone"
                            }
                        }
                    },
                    {
                        "metadata": {
                            "name": live_name,
                            "namespace": "ns-manager",
                            "annotations": {
                                "manager.cicd.skao.int/action": "check-namespace",
                                (TARGET_NAMESPACE_ANNOTATION): "ci-live"
                            }
                        }
                    }
                ]
            });
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/batch/v1/namespaces/ns-manager/cronjobs",
                cronjobs,
            )
            .await;
            // only the unmatched child is deleted
            let (request, _) = serve_one(
                &mut handle,
                http::Method::DELETE,
                "/apis/batch/v1/namespaces/ns-manager/cronjobs/",
                json!({"kind": "Status", "status": "Success"}),
            )
            .await;
            assert!(request.uri.path().ends_with(&gone_name));
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/batch/v1/namespaces/ns-manager/jobs",
                json!({"kind": "JobList", "apiVersion": "batch/v1", "metadata": {}, "items": []}),
            )
            .await;
        });

        scheduler.collect_garbage(&matched, &settings).await.unwrap();
        server.await.unwrap();
    }
}
