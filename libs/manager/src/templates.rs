//! Child workloads are kept as data: a single parameterized Job
//! document rendered by textual substitution and parsed back into a
//! typed object. Deterministic naming is what makes re-rendering safe:
//! the same (action, target namespace) always collapses onto the same
//! child.

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobTemplateSpec};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{ManagerContext, TaskConfig, TaskKind};
use crate::error::Result;

const CHILD_JOB_TEMPLATE: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: "{{name}}"
  namespace: "{{manager_namespace}}"
  labels:
    app.kubernetes.io/managed-by: ns-manager
  annotations:
    manager.cicd.skao.int/action: "{{action}}"
    manager.cicd.skao.int/namespace: "{{target_namespace}}"
spec:
  template:
    metadata:
      labels:
        app.kubernetes.io/managed-by: ns-manager
    spec:
      serviceAccountName: "{{service_account}}"
      restartPolicy: Never
      containers:
        - name: "{{action}}"
          image: "{{image}}"
          args:
            - "{{action}}"
            - "--target-namespace"
            - "{{target_namespace}}"
          env:
            - name: CONFIG_PATH
              value: "{{config_path}}"
          volumeMounts:
            - name: config
              mountPath: "{{config_mount}}"
              readOnly: true
      volumes:
        - name: config
          secret:
            secretName: "{{config_secret}}"
"#;

/// Substitute `{{key}}` placeholders.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Deterministic child name: `{action}-{sha256(target_namespace)[:8]}`.
pub fn child_name(kind: TaskKind, target_namespace: &str) -> String {
    let digest = hex::encode(Sha256::digest(target_namespace.as_bytes()));
    format!("{kind}-{}", &digest[..8])
}

/// Content hash of a rendered spec, stamped on the live object so
/// drift is detected without field-by-field comparison.
pub fn spec_hash<T: Serialize>(spec: &T) -> String {
    // plain generated structs cannot fail to serialize
    let bytes = serde_json::to_vec(spec).unwrap();
    hex::encode(Sha256::digest(&bytes))
}

/// Render the one-shot Job for `(kind, target_namespace)`.
pub fn render_job(
    context: &ManagerContext,
    kind: TaskKind,
    target_namespace: &str,
    task: &TaskConfig,
) -> Result<Job> {
    let name = child_name(kind, target_namespace);
    let action = kind.to_string();
    let config_mount = std::path::Path::new(&context.config_path)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/etc/ns-manager".to_string());
    let rendered = render(
        CHILD_JOB_TEMPLATE,
        &[
            ("name", name.as_str()),
            ("manager_namespace", context.namespace.as_str()),
            ("action", action.as_str()),
            ("target_namespace", target_namespace),
            ("service_account", context.service_account.as_str()),
            ("image", context.image.as_str()),
            ("config_path", context.config_path.as_str()),
            ("config_mount", config_mount.as_str()),
            ("config_secret", context.config_secret.as_str()),
        ],
    );
    let mut job: Job = serde_yaml::from_str(&rendered)?;

    if let Some(labels) = job.metadata.labels.as_mut() {
        labels.extend(context.match_labels.clone());
    }
    if let Some(spec) = job.spec.as_mut() {
        spec.backoff_limit = task.backoff_limit;
        spec.active_deadline_seconds = task.deadline.map(|d| d.as_secs() as i64);
    }
    Ok(job)
}

/// Render the CronJob wrapper for a scheduled task: same Job payload,
/// plus the cron schedule and history knobs from the rule.
pub fn render_cronjob(
    context: &ManagerContext,
    kind: TaskKind,
    target_namespace: &str,
    task: &TaskConfig,
    schedule: &str,
) -> Result<CronJob> {
    let job = render_job(context, kind, target_namespace, task)?;
    Ok(CronJob {
        metadata: job.metadata.clone(),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some(
                task.concurrency_policy
                    .clone()
                    .unwrap_or_else(|| "Forbid".to_string()),
            ),
            successful_jobs_history_limit: task.successful_jobs_history_limit,
            failed_jobs_history_limit: task.failed_jobs_history_limit,
            job_template: JobTemplateSpec {
                metadata: None,
                spec: job.spec,
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
