use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::alerts::FiringAlert;
use crate::classify;
use crate::config::MatchRule;
use crate::context::{Context, COLLECT_CONTROLLER};
use crate::error::{Error, Result};
use crate::leader::Leadership;
use crate::record::{NamespaceRecord, Status};
use crate::schedule::TaskScheduler;
use crate::state::{self, Windows};
use crate::telemetry;

/// Upper bound on concurrent namespace reconciliations within a pass.
const FANOUT: usize = 16;
/// A pass running longer than this is logged as saturated.
const PASS_BUDGET: Duration = Duration::from_secs(60);
/// Fallback pacing when no cron tick is due sooner.
const IDLE_INTERVAL: Duration = Duration::from_secs(30);
const STANDBY_INTERVAL: Duration = Duration::from_secs(1);

pub struct PassStats {
    pub reconciled: usize,
    pub errors: usize,
}

/// Observe-and-classify loop. Runs passes only while this replica
/// leads the collect controller; on leadership loss the current pass
/// is abandoned at the next suspension point.
pub async fn run(ctx: Arc<Context>, leadership: Leadership, shutdown: CancellationToken) {
    info!(msg = "starting collect controller");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if !leadership.is_leader() {
            ctx.metrics.leader_set(COLLECT_CONTROLLER, false);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(STANDBY_INTERVAL) => continue,
            }
        }
        ctx.metrics.leader_set(COLLECT_CONTROLLER, true);

        match pass(&ctx, &leadership).await {
            Ok(stats) => {
                debug!(reconciled = stats.reconciled, errors = stats.errors, "collect pass complete")
            }
            Err(Error::StaleLeadership) => warn!("collect pass aborted: leadership lost"),
            Err(e) => {
                error!(%e, "collect pass failed");
                ctx.metrics.failure_inc(COLLECT_CONTROLLER, &e);
            }
        }
        ctx.diagnostics.write().await.last_pass = Utc::now();

        let delay = next_pass_delay(&ctx);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!(msg = "collect controller stopped");
}

/// Sleep until the earliest of the next cron tick and the idle interval.
fn next_pass_delay(ctx: &Context) -> Duration {
    let now = Utc::now();
    TaskScheduler::next_tick(&ctx.settings, now)
        .and_then(|tick| (tick - now).to_std().ok())
        .map_or(IDLE_INTERVAL, |until_tick| until_tick.min(IDLE_INTERVAL))
}

#[instrument(skip_all, fields(trace_id))]
pub async fn pass(ctx: &Arc<Context>, leadership: &Leadership) -> Result<PassStats> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    leadership.check_fresh()?;
    let _timer = ctx.metrics.pass_started(COLLECT_CONTROLLER, &trace_id);
    let started = tokio::time::Instant::now();

    let namespaces = ctx.gateway.list_namespaces().await?;
    let matched: Vec<(Namespace, &MatchRule)> = namespaces
        .items
        .into_iter()
        .filter_map(|ns| {
            let name = ns.metadata.name.clone()?;
            let rule = ctx.settings.rule_for(&name)?;
            Some((ns, rule))
        })
        .collect();
    let matched_names: BTreeSet<String> = matched
        .iter()
        .filter_map(|(ns, _)| ns.metadata.name.clone())
        .collect();

    // One batched query covers every watched namespace; a failure
    // engages the per-namespace workload fallback instead.
    let alerts = match &ctx.prometheus {
        Some(gateway) => match gateway.firing_alerts(&matched_names).await {
            Ok(map) => Some(map),
            Err(e) => {
                warn!(%e, "Prometheus query failed, falling back to workload signals");
                None
            }
        },
        None => None,
    };

    let results = stream::iter(matched.into_iter().map(|(ns, rule)| {
        let alerts_for = alerts
            .as_ref()
            .and_then(|map| ns.metadata.name.as_ref().and_then(|name| map.get(name)))
            .map(Vec::as_slice);
        async move {
            if !leadership.is_leader() {
                return Err(Error::StaleLeadership);
            }
            reconcile_namespace(ctx, ns, rule, alerts_for).await
        }
    }))
    .buffer_unordered(FANOUT)
    .collect::<Vec<_>>()
    .await;

    if started.elapsed() > PASS_BUDGET {
        warn!(elapsed_secs = started.elapsed().as_secs(), "collect pass exceeded its budget");
    }

    let mut status_counts: BTreeMap<Status, i64> = [
        Status::Ok,
        Status::Unstable,
        Status::Failing,
        Status::Failed,
        Status::Stale,
        Status::Terminating,
    ]
    .into_iter()
    .map(|s| (s, 0))
    .collect();

    let mut stats = PassStats {
        reconciled: 0,
        errors: 0,
    };
    let mut leadership_lost = false;
    for result in results {
        match result {
            Ok(Some(status)) => {
                stats.reconciled += 1;
                *status_counts.entry(status).or_insert(0) += 1;
            }
            Ok(None) => {}
            Err(Error::StaleLeadership) => leadership_lost = true,
            Err(e) => {
                stats.errors += 1;
                warn!(%e, "namespace reconciliation failed");
                ctx.metrics.failure_inc(COLLECT_CONTROLLER, &e);
            }
        }
    }
    for (status, count) in &status_counts {
        ctx.metrics.namespaces_set(&status.to_string(), *count);
    }
    if leadership_lost {
        return Err(Error::StaleLeadership);
    }

    ctx.scheduler
        .collect_garbage(&matched_names, &ctx.settings)
        .await?;
    Ok(stats)
}

async fn reconcile_namespace(
    ctx: &Context,
    ns: Namespace,
    rule: &MatchRule,
    alerts: Option<&[FiringAlert]>,
) -> Result<Option<Status>> {
    let status = classify_and_annotate(ctx, &ns, rule, alerts).await?;
    if let Some(status) = status {
        if status != Status::Terminating {
            if let Some(name) = ns.metadata.name.as_deref() {
                ctx.scheduler.reconcile(name, rule).await?;
            }
        }
    }
    Ok(status)
}

/// Classify one namespace and write the result back. Shared between
/// the collect pass and the `check-namespace` child-job entrypoint.
async fn classify_and_annotate(
    ctx: &Context,
    ns: &Namespace,
    rule: &MatchRule,
    alerts: Option<&[FiringAlert]>,
) -> Result<Option<Status>> {
    let Some(record) = NamespaceRecord::from_namespace(ns) else {
        return Ok(None);
    };
    if ns.metadata.deletion_timestamp.is_some() || record.status == Status::Terminating {
        // deletion in flight; the action controller owns it now
        return Ok(Some(Status::Terminating));
    }

    let workloads = ctx.gateway.workloads(&record.name).await?;
    let now = Utc::now();
    let verdict = classify::classify(&record, rule, alerts, &workloads, now);
    let (next, transition) = state::advance(&record, &verdict, &Windows::from_rule(rule), now);
    if let Some(transition) = &transition {
        info!(
            namespace = %transition.namespace,
            from = %transition.from,
            to = %transition.to,
            "namespace status changed"
        );
    }
    if next != record {
        ctx.gateway
            .annotate_namespace(&next.name, &next.status_patch())
            .await?;
    }
    Ok(Some(next.status))
}

/// `check-namespace` child-job entrypoint: a one-shot classification
/// pass over a single namespace, without task scheduling.
pub async fn check_namespace_once(ctx: &Context, target_namespace: &str) -> Result<()> {
    let Some(ns) = ctx.gateway.get_namespace(target_namespace).await? else {
        info!(namespace = %target_namespace, "namespace is gone, nothing to check");
        return Ok(());
    };
    let Some(rule) = ctx.settings.rule_for(target_namespace) else {
        info!(namespace = %target_namespace, "namespace matches no rule, nothing to check");
        return Ok(());
    };
    let alerts = match &ctx.prometheus {
        Some(gateway) => {
            let scope: BTreeSet<String> = [target_namespace.to_string()].into();
            match gateway.firing_alerts(&scope).await {
                Ok(mut map) => map.remove(target_namespace),
                Err(e) => {
                    warn!(%e, "Prometheus query failed, falling back to workload signals");
                    None
                }
            }
        }
        None => None,
    };
    classify_and_annotate(ctx, &ns, rule, alerts.as_deref()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Settings;
    use crate::context::State;
    use crate::testing::{mock_client, serve_one};
    use prometheus_client::registry::Registry;
    use serde_json::json;

    const SETTINGS: &str = r#"
namespaces:
  - name_globs: ["ci-*"]
    ttl: 5m
    settling_period: 1m
context:
  namespace: ns-manager
  service_account: ns-manager
  config_secret: cfg
  config_path: /etc/ns-manager/config.yaml
  image: img
"#;

    fn context_with_mock() -> (Arc<Context>, crate::testing::ApiServerHandle) {
        let (client, handle) = mock_client();
        let settings = Arc::new(Settings::parse(SETTINGS).unwrap());
        let state = State::new(Registry::default());
        (state.to_context(client, settings).unwrap(), handle)
    }

    fn empty_list(kind: &str) -> serde_json::Value {
        json!({"kind": kind, "apiVersion": "v1", "metadata": {}, "items": []})
    }

    async fn serve_empty_workloads(handle: &mut crate::testing::ApiServerHandle, ns: &str) {
        serve_one(
            handle,
            http::Method::GET,
            &format!("/apis/apps/v1/namespaces/{ns}/deployments"),
            empty_list("DeploymentList"),
        )
        .await;
        serve_one(
            handle,
            http::Method::GET,
            &format!("/apis/apps/v1/namespaces/{ns}/statefulsets"),
            empty_list("StatefulSetList"),
        )
        .await;
        serve_one(
            handle,
            http::Method::GET,
            &format!("/apis/apps/v1/namespaces/{ns}/replicasets"),
            empty_list("ReplicaSetList"),
        )
        .await;
        serve_one(
            handle,
            http::Method::GET,
            &format!("/api/v1/namespaces/{ns}/pods"),
            empty_list("PodList"),
        )
        .await;
        serve_one(
            handle,
            http::Method::GET,
            &format!("/api/v1/namespaces/{ns}/events"),
            empty_list("EventList"),
        )
        .await;
    }

    #[tokio::test]
    async fn ttl_expired_namespace_is_annotated_stale() {
        let (ctx, mut handle) = context_with_mock();
        let created = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();

        let server = tokio::spawn(async move {
            let namespaces = json!({
                "kind": "NamespaceList",
                "apiVersion": "v1",
                "metadata": {"resourceVersion": "100"},
                "items": [
                    {"metadata": {"name": "ci-abc", "creationTimestamp": created}},
                    {"metadata": {"name": "kube-system", "creationTimestamp": created}}
                ]
            });
            serve_one(&mut handle, http::Method::GET, "/api/v1/namespaces", namespaces).await;
            serve_empty_workloads(&mut handle, "ci-abc").await;
            let (_, body) = serve_one(
                &mut handle,
                http::Method::PATCH,
                "/api/v1/namespaces/ci-abc",
                json!({"kind": "Namespace"}),
            )
            .await;
            assert_eq!(
                body["metadata"]["annotations"]["manager.cicd.skao.int/status"],
                "STALE"
            );
            assert_eq!(
                body["metadata"]["annotations"]["manager.cicd.skao.int/failing-resources"],
                serde_json::Value::Null
            );
            // child garbage collection runs even with no tasks configured
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/batch/v1/namespaces/ns-manager/cronjobs",
                json!({"kind": "CronJobList", "metadata": {}, "items": []}),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/batch/v1/namespaces/ns-manager/jobs",
                json!({"kind": "JobList", "metadata": {}, "items": []}),
            )
            .await;
        });

        let stats = pass(&ctx, &Leadership::Standalone).await.unwrap();
        assert_eq!(stats.reconciled, 1, "only the matched namespace is touched");
        assert_eq!(stats.errors, 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn settling_namespace_stays_ok_despite_failures() {
        let (ctx, mut handle) = context_with_mock();
        let created = (Utc::now() - chrono::Duration::seconds(30)).to_rfc3339();

        let server = tokio::spawn(async move {
            let namespaces = json!({
                "kind": "NamespaceList",
                "apiVersion": "v1",
                "metadata": {},
                "items": [{"metadata": {"name": "ci-xyz", "creationTimestamp": created}}]
            });
            serve_one(&mut handle, http::Method::GET, "/api/v1/namespaces", namespaces).await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/apps/v1/namespaces/ci-xyz/deployments",
                empty_list("DeploymentList"),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/apps/v1/namespaces/ci-xyz/statefulsets",
                empty_list("StatefulSetList"),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/apps/v1/namespaces/ci-xyz/replicasets",
                empty_list("ReplicaSetList"),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/api/v1/namespaces/ci-xyz/pods",
                json!({
                    "kind": "PodList", "metadata": {}, "items": [{
                        "metadata": {"name": "boom"},
                        "status": {
                            "phase": "Pending",
                            "containerStatuses": [{
                                "name": "main",
                                "image": "img",
                                "imageID": "",
                                "ready": false,
                                "restartCount": 4,
                                "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                            }]
                        }
                    }]
                }),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/api/v1/namespaces/ci-xyz/events",
                empty_list("EventList"),
            )
            .await;
            let (_, body) = serve_one(
                &mut handle,
                http::Method::PATCH,
                "/api/v1/namespaces/ci-xyz",
                json!({"kind": "Namespace"}),
            )
            .await;
            // still settling: OK, and no failing-resources annotation
            assert_eq!(
                body["metadata"]["annotations"]["manager.cicd.skao.int/status"],
                "OK"
            );
            assert_eq!(
                body["metadata"]["annotations"]["manager.cicd.skao.int/failing-resources"],
                serde_json::Value::Null
            );
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/batch/v1/namespaces/ns-manager/cronjobs",
                json!({"kind": "CronJobList", "metadata": {}, "items": []}),
            )
            .await;
            serve_one(
                &mut handle,
                http::Method::GET,
                "/apis/batch/v1/namespaces/ns-manager/jobs",
                json!({"kind": "JobList", "metadata": {}, "items": []}),
            )
            .await;
        });

        let stats = pass(&ctx, &Leadership::Standalone).await.unwrap();
        assert_eq!(stats.reconciled, 1);
        server.await.unwrap();
    }
}
