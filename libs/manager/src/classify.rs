use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::alerts::FiringAlert;
use crate::config::MatchRule;
use crate::k8s::WorkloadSnapshot;
use crate::record::{FailingResource, NamespaceRecord};

/// Classifier output candidate; the state machine decides how a
/// failing candidate maps onto `UNSTABLE`/`FAILING`/`FAILED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Candidate {
    Ok,
    Failing,
    Stale,
}

#[derive(Clone, Debug)]
pub struct Verdict {
    pub candidate: Candidate,
    pub failing: Vec<FailingResource>,
}

impl Verdict {
    fn ok() -> Self {
        Verdict {
            candidate: Candidate::Ok,
            failing: Vec::new(),
        }
    }

    fn stale() -> Self {
        Verdict {
            candidate: Candidate::Stale,
            failing: Vec::new(),
        }
    }
}

/// Container waiting reasons treated as failure signals.
const FAILING_POD_REASONS: [&str; 3] = ["CrashLoopBackOff", "ImagePullBackOff", "ErrImagePull"];

struct Signal {
    kind: String,
    name: String,
    reason: String,
    message: String,
    severity: u8,
}

/// Classify a namespace from its observations. Pure: all Kubernetes
/// and Prometheus state arrives as arguments, nothing is fetched here.
///
/// `alerts` is `None` when the Prometheus query failed; `None` or an
/// empty slice both engage the Kubernetes fallback signals.
pub fn classify(
    record: &NamespaceRecord,
    rule: &MatchRule,
    alerts: Option<&[FiringAlert]>,
    workloads: &WorkloadSnapshot,
    now: DateTime<Utc>,
) -> Verdict {
    let age = now - record.created_at;
    if age < chrono_duration(rule.settling_period) {
        // newborn grace
        return Verdict::ok();
    }
    if age > chrono_duration(rule.ttl) {
        return Verdict::stale();
    }

    let signals = match alerts {
        Some(alerts) if !alerts.is_empty() => alert_signals(alerts),
        _ => fallback_signals(workloads, rule, now),
    };
    if signals.is_empty() {
        return Verdict::ok();
    }

    // Dedup by (kind, name), keeping the highest-severity reason.
    let mut by_key: BTreeMap<(String, String), Signal> = BTreeMap::new();
    for signal in signals {
        let key = (signal.kind.clone(), signal.name.clone());
        match by_key.get(&key) {
            Some(existing) if existing.severity >= signal.severity => {}
            _ => {
                by_key.insert(key, signal);
            }
        }
    }

    // first_seen is sticky across passes: a resource already reported
    // in the annotation keeps its original timestamp.
    let previous: BTreeMap<(&str, &str), DateTime<Utc>> = record
        .failing_resources
        .iter()
        .map(|f| ((f.kind.as_str(), f.name.as_str()), f.first_seen))
        .collect();

    let mut failing: Vec<FailingResource> = by_key
        .into_values()
        .map(|s| {
            let first_seen = previous
                .get(&(s.kind.as_str(), s.name.as_str()))
                .copied()
                .unwrap_or(now);
            FailingResource {
                kind: s.kind,
                name: s.name,
                reason: s.reason,
                message: s.message,
                first_seen,
            }
        })
        .collect();
    failing.sort_by(|a, b| {
        a.first_seen
            .cmp(&b.first_seen)
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.name.cmp(&b.name))
    });

    Verdict {
        candidate: Candidate::Failing,
        failing,
    }
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::max_value())
}

fn severity_label_rank(severity: &str) -> u8 {
    match severity {
        "critical" => 5,
        "warning" => 3,
        "info" => 1,
        _ => 2,
    }
}

fn reason_rank(reason: &str) -> u8 {
    match reason {
        "CrashLoopBackOff" => 5,
        "Failed" => 4,
        "ErrImagePull" | "ImagePullBackOff" => 3,
        _ => 2,
    }
}

fn alert_signals(alerts: &[FiringAlert]) -> Vec<Signal> {
    alerts
        .iter()
        .map(|a| Signal {
            kind: a.kind.clone(),
            name: a.name.clone(),
            reason: a.reason.clone(),
            message: a.message.clone(),
            severity: severity_label_rank(&a.severity),
        })
        .collect()
}

fn fallback_signals(workloads: &WorkloadSnapshot, rule: &MatchRule, now: DateTime<Utc>) -> Vec<Signal> {
    let settling = chrono_duration(rule.settling_period);
    let settled = |created: Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>| {
        created.map(|t| now - t.0 > settling).unwrap_or(true)
    };

    let mut signals = Vec::new();

    for d in &workloads.deployments {
        let unavailable = d
            .status
            .as_ref()
            .and_then(|s| s.unavailable_replicas)
            .unwrap_or(0);
        if unavailable > 0 && settled(d.metadata.creation_timestamp.as_ref()) {
            let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            signals.push(Signal {
                kind: "Deployment".to_string(),
                name: d.metadata.name.clone().unwrap_or_default(),
                reason: "UnavailableReplicas".to_string(),
                message: format!("{unavailable} of {replicas} replicas unavailable"),
                severity: reason_rank("UnavailableReplicas"),
            });
        }
    }

    for sts in &workloads.stateful_sets {
        let (ready, replicas) = sts
            .status
            .as_ref()
            .map(|s| (s.ready_replicas.unwrap_or(0), s.replicas))
            .unwrap_or((0, 0));
        if ready < replicas && settled(sts.metadata.creation_timestamp.as_ref()) {
            signals.push(Signal {
                kind: "StatefulSet".to_string(),
                name: sts.metadata.name.clone().unwrap_or_default(),
                reason: "UnreadyReplicas".to_string(),
                message: format!("{ready} of {replicas} replicas ready"),
                severity: reason_rank("UnreadyReplicas"),
            });
        }
    }

    // ReplicaSets still owned by a Deployment whose pods are failing.
    for rs in &workloads.replica_sets {
        let owned_by_deployment = rs
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.kind == "Deployment" && r.controller == Some(true)));
        if !owned_by_deployment {
            continue;
        }
        let rs_name = rs.metadata.name.clone().unwrap_or_default();
        let failed_pod = workloads
            .pods
            .iter()
            .filter(|p| {
                p.metadata.owner_references.as_ref().is_some_and(|refs| {
                    refs.iter().any(|r| r.kind == "ReplicaSet" && r.name == rs_name)
                })
            })
            .find_map(|p| pod_failure(p, &workloads.events));
        if let Some((reason, message)) = failed_pod {
            signals.push(Signal {
                kind: "ReplicaSet".to_string(),
                name: rs_name,
                severity: reason_rank(&reason),
                message,
                reason,
            });
        }
    }

    for pod in &workloads.pods {
        if let Some((reason, message)) = pod_failure(pod, &workloads.events) {
            signals.push(Signal {
                kind: "Pod".to_string(),
                name: pod.metadata.name.clone().unwrap_or_default(),
                severity: reason_rank(&reason),
                message,
                reason,
            });
        }
    }

    signals
}

fn pod_failure(
    pod: &k8s_openapi::api::core::v1::Pod,
    events: &[k8s_openapi::api::core::v1::Event],
) -> Option<(String, String)> {
    let status = pod.status.as_ref()?;

    if status.phase.as_deref() == Some("Failed") {
        let message = status
            .message
            .clone()
            .or_else(|| last_event_message(pod, events))
            .unwrap_or_else(|| "pod failed".to_string());
        return Some(("Failed".to_string(), message));
    }

    for cs in status.container_statuses.as_deref().unwrap_or_default() {
        let waiting = cs.state.as_ref().and_then(|s| s.waiting.as_ref());
        if let Some(waiting) = waiting {
            if let Some(reason) = waiting.reason.as_deref() {
                if FAILING_POD_REASONS.contains(&reason) {
                    let message = waiting
                        .message
                        .clone()
                        .or_else(|| last_event_message(pod, events))
                        .unwrap_or_else(|| format!("container {} is {}", cs.name, reason));
                    return Some((reason.to_string(), message));
                }
            }
        }
    }
    None
}

fn last_event_message(
    pod: &k8s_openapi::api::core::v1::Pod,
    events: &[k8s_openapi::api::core::v1::Event],
) -> Option<String> {
    events
        .iter()
        .filter(|e| e.involved_object.name.as_deref() == pod.metadata.name.as_deref())
        .max_by_key(|e| e.last_timestamp.as_ref().map(|t| t.0))
        .and_then(|e| e.message.clone())
}
