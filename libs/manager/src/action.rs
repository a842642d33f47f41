use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::config::MatchRule;
use crate::context::{Context, ACTION_CONTROLLER};
use crate::error::{Error, Result};
use crate::leader::Leadership;
use crate::notify;
use crate::record::{
    notified_for_patch, NamespaceRecord, Status, DELETE_ATTEMPTS_ANNOTATION,
    DELETE_REQUESTED_AT_ANNOTATION, DELETE_STUCK_ANNOTATION, FAILING_RESOURCES_ANNOTATION,
    STATUS_ANNOTATION, STATUS_LAST_SEEN_ANNOTATION, STATUS_SINCE_ANNOTATION,
};
use crate::schedule::{job_finished, job_owned_by_cronjob};
use crate::telemetry;

const ACTION_INTERVAL: Duration = Duration::from_secs(30);
const STANDBY_INTERVAL: Duration = Duration::from_secs(1);
/// A namespace must be gone this long after a delete was issued before
/// the delete is re-issued (once) and then declared stuck.
const DELETE_TIMEOUT_SECS: i64 = 5 * 60;
/// Finished one-shot children older than this are pruned.
const FINISHED_JOB_TTL_SECS: i64 = 60 * 60;

/// Enforcement loop: TTL eviction, terminal-status deletion, owner
/// notifications and child-job cleanup. Leader-gated independently of
/// the collect controller.
pub async fn run(ctx: Arc<Context>, leadership: Leadership, shutdown: CancellationToken) {
    info!(msg = "starting action controller");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        if !leadership.is_leader() {
            ctx.metrics.leader_set(ACTION_CONTROLLER, false);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(STANDBY_INTERVAL) => continue,
            }
        }
        ctx.metrics.leader_set(ACTION_CONTROLLER, true);

        match pass(&ctx, &leadership).await {
            Ok(()) => debug!("action pass complete"),
            Err(Error::StaleLeadership) => warn!("action pass aborted: leadership lost"),
            Err(e) => {
                error!(%e, "action pass failed");
                ctx.metrics.failure_inc(ACTION_CONTROLLER, &e);
            }
        }
        ctx.diagnostics.write().await.last_pass = Utc::now();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(ACTION_INTERVAL) => {}
        }
    }
    info!(msg = "action controller stopped");
}

#[instrument(skip_all, fields(trace_id))]
pub async fn pass(ctx: &Arc<Context>, leadership: &Leadership) -> Result<()> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    leadership.check_fresh()?;
    let _timer = ctx.metrics.pass_started(ACTION_CONTROLLER, &trace_id);

    let namespaces = ctx.gateway.list_namespaces().await?;
    for ns in namespaces.items {
        if !leadership.is_leader() {
            return Err(Error::StaleLeadership);
        }
        let Some(name) = ns.metadata.name.as_deref() else {
            continue;
        };
        let Some(rule) = ctx.settings.rule_for(name) else {
            continue;
        };
        let Some(record) = NamespaceRecord::from_namespace(&ns) else {
            continue;
        };
        let externally_deleting = ns.metadata.deletion_timestamp.is_some();
        if let Err(e) = handle_namespace(ctx, &record, rule, externally_deleting).await {
            warn!(namespace = %record.name, %e, "action on namespace failed");
            ctx.metrics.failure_inc(ACTION_CONTROLLER, &e);
        }
    }

    prune_finished_jobs(ctx).await
}

async fn handle_namespace(
    ctx: &Context,
    record: &NamespaceRecord,
    rule: &MatchRule,
    externally_deleting: bool,
) -> Result<()> {
    // owners hear about STALE/FAILED before the namespace disappears
    process_notifications(ctx, record).await?;

    let now = Utc::now();
    if record.delete_requested_at.is_some() || record.status == Status::Terminating {
        return confirm_deletion(ctx, record, now).await;
    }
    if externally_deleting {
        // someone else is tearing it down; nothing to enforce
        return Ok(());
    }

    let ttl = chrono::Duration::from_std(rule.ttl).unwrap_or_else(|_| chrono::Duration::max_value());
    let ttl_expired = now - record.created_at > ttl;
    if matches!(record.status, Status::Failed | Status::Stale) || ttl_expired {
        return start_deletion(ctx, record, now).await;
    }
    Ok(())
}

/// The message for a transition is keyed to the status entered; the
/// monotonic failure track pins down where it came from.
fn prior(status: Status) -> Status {
    match status {
        Status::Failing => Status::Unstable,
        Status::Failed => Status::Failing,
        _ => Status::Ok,
    }
}

async fn process_notifications(ctx: &Context, record: &NamespaceRecord) -> Result<()> {
    let Some(notifier) = &ctx.notifier else {
        return Ok(());
    };
    let status = record.status;
    if !status.is_notifiable() || record.notified_for.contains(&status) {
        return Ok(());
    }
    if !notify::should_notify(status, record.owner.as_deref()) {
        debug!(namespace = %record.name, %status, "notification skipped, owner unresolved");
        ctx.metrics.notification_inc("skipped");
        return Ok(());
    }

    // write-ahead: the dedup key lands before the send, so a crash in
    // between cannot double-notify on replay
    ctx.gateway
        .annotate_namespace(&record.name, &record.notified_patch(status))
        .await?;
    match notifier
        .notify(&record.name, prior(status), status, record.owner.as_deref())
        .await
    {
        Ok(true) => {
            info!(namespace = %record.name, %status, "owner notified");
            ctx.metrics.notification_inc("sent");
        }
        Ok(false) => {}
        Err(e) => {
            warn!(namespace = %record.name, %e, "notification failed, will retry next pass");
            ctx.metrics.notification_inc("failed");
            // roll the key back so the next pass retries
            ctx.gateway
                .annotate_namespace(&record.name, &notified_for_patch(&record.notified_for))
                .await?;
        }
    }
    Ok(())
}

async fn start_deletion(ctx: &Context, record: &NamespaceRecord, now: DateTime<Utc>) -> Result<()> {
    info!(namespace = %record.name, status = %record.status, "deleting namespace");
    let patch = json!({
        "metadata": {
            "annotations": {
                (STATUS_ANNOTATION): Status::Terminating.to_string(),
                (STATUS_SINCE_ANNOTATION): now.to_rfc3339(),
                (STATUS_LAST_SEEN_ANNOTATION): now.to_rfc3339(),
                (FAILING_RESOURCES_ANNOTATION): serde_json::Value::Null,
                (DELETE_REQUESTED_AT_ANNOTATION): now.to_rfc3339(),
                (DELETE_ATTEMPTS_ANNOTATION): "1",
            }
        }
    });
    ctx.gateway.annotate_namespace(&record.name, &patch).await?;
    ctx.gateway.delete_namespace(&record.name).await?;
    ctx.metrics.deletions.inc();
    Ok(())
}

/// The namespace is still listed after a delete was issued: wait out
/// the confirmation window, re-issue once, then record `DeleteStuck`.
async fn confirm_deletion(ctx: &Context, record: &NamespaceRecord, now: DateTime<Utc>) -> Result<()> {
    let Some(requested) = record.delete_requested_at else {
        // TERMINATING without our stamp: adopt it and (re)issue
        return start_deletion(ctx, record, now).await;
    };
    if now - requested <= chrono::Duration::seconds(DELETE_TIMEOUT_SECS) {
        debug!(namespace = %record.name, "waiting for namespace to terminate");
        return Ok(());
    }
    if record.delete_attempts < 2 {
        warn!(namespace = %record.name, "delete unconfirmed after timeout, re-issuing");
        let patch = json!({
            "metadata": {
                "annotations": {
                    (DELETE_REQUESTED_AT_ANNOTATION): now.to_rfc3339(),
                    (DELETE_ATTEMPTS_ANNOTATION): "2",
                }
            }
        });
        ctx.gateway.annotate_namespace(&record.name, &patch).await?;
        ctx.gateway.delete_namespace(&record.name).await?;
        ctx.metrics.deletions.inc();
        return Ok(());
    }

    error!(namespace = %record.name, "namespace refuses to terminate");
    ctx.gateway
        .annotate_namespace(
            &record.name,
            &json!({"metadata": {"annotations": {(DELETE_STUCK_ANNOTATION): "true"}}}),
        )
        .await?;
    ctx.metrics.delete_stuck.inc();
    Err(Error::DeleteStuck(record.name.clone()))
}

/// One-shot children that ran to completion are kept for a while for
/// debugging, then pruned. CronJob-owned jobs are excluded: their
/// history limits already bound them.
async fn prune_finished_jobs(ctx: &Arc<Context>) -> Result<()> {
    let now = Utc::now();
    for job in ctx.gateway.list_managed_jobs().await? {
        if !job_finished(&job) || job_owned_by_cronjob(&job) {
            continue;
        }
        let finished_at = job
            .status
            .as_ref()
            .and_then(|s| s.completion_time.as_ref().map(|t| t.0))
            .or_else(|| {
                job.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .and_then(|conditions| {
                        conditions
                            .iter()
                            .filter_map(|c| c.last_transition_time.as_ref().map(|t| t.0))
                            .max()
                    })
            });
        let Some(finished_at) = finished_at else {
            continue;
        };
        if now - finished_at > chrono::Duration::seconds(FINISHED_JOB_TTL_SECS) {
            if let Some(name) = job.metadata.name.as_deref() {
                debug!(job = %name, "pruning finished child job");
                ctx.gateway.delete_job(name).await?;
            }
        }
    }
    Ok(())
}
