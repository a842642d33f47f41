use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Namespace;
use serde::{Deserialize, Serialize};
use serde_json::json;

// Everything the system persists on a namespace lives under the
// manager.cicd.skao.int/ prefix.
pub const STATUS_ANNOTATION: &str = "manager.cicd.skao.int/status";
pub const STATUS_SINCE_ANNOTATION: &str = "manager.cicd.skao.int/status-since";
pub const STATUS_LAST_SEEN_ANNOTATION: &str = "manager.cicd.skao.int/status-last-seen";
pub const FAILING_RESOURCES_ANNOTATION: &str = "manager.cicd.skao.int/failing-resources";
pub const OWNER_ANNOTATION: &str = "manager.cicd.skao.int/owner";
pub const NOTIFIED_FOR_ANNOTATION: &str = "manager.cicd.skao.int/notified-for";
pub const DELETE_REQUESTED_AT_ANNOTATION: &str = "manager.cicd.skao.int/delete-requested-at";
pub const DELETE_ATTEMPTS_ANNOTATION: &str = "manager.cicd.skao.int/delete-attempts";
pub const DELETE_STUCK_ANNOTATION: &str = "manager.cicd.skao.int/delete-stuck";

/// Child job metadata, same prefix.
pub const ACTION_ANNOTATION: &str = "manager.cicd.skao.int/action";
pub const TARGET_NAMESPACE_ANNOTATION: &str = "manager.cicd.skao.int/namespace";
pub const SPEC_HASH_ANNOTATION: &str = "manager.cicd.skao.int/spec-hash";

/// Label the CI machinery stamps on pipeline namespaces; resolved to a
/// contact through the people API by the `get-owner-info` child job.
pub const AUTHOR_LABEL: &str = "cicd.skao.int/author";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "ns-manager";

/// Lifecycle status of a managed namespace.
///
/// `Failed`, `Stale` and `Terminating` are terminal for classification:
/// only deletion moves a namespace out of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Unstable,
    Failing,
    Failed,
    Stale,
    Terminating,
}

impl Status {
    /// Statuses whose entry triggers an owner notification.
    pub fn is_notifiable(&self) -> bool {
        matches!(self, Status::Failing | Status::Failed | Status::Stale)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::Unstable => "UNSTABLE",
            Status::Failing => "FAILING",
            Status::Failed => "FAILED",
            Status::Stale => "STALE",
            Status::Terminating => "TERMINATING",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Status::Ok),
            "UNSTABLE" => Ok(Status::Unstable),
            "FAILING" => Ok(Status::Failing),
            "FAILED" => Ok(Status::Failed),
            "STALE" => Ok(Status::Stale),
            "TERMINATING" => Ok(Status::Terminating),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// One unhealthy resource inside a namespace, as published in the
/// `failing-resources` annotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingResource {
    pub kind: String,
    pub name: String,
    pub reason: String,
    pub message: String,
    pub first_seen: DateTime<Utc>,
}

/// In-memory view of a managed namespace. The durable store is the
/// namespace object itself: this is parsed from its annotations on
/// every pass and written back as a JSON merge patch.
#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: Status,
    pub status_since: DateTime<Utc>,
    pub status_last_seen: DateTime<Utc>,
    pub failing_resources: Vec<FailingResource>,
    pub owner: Option<String>,
    pub notified_for: BTreeSet<Status>,
    pub delete_requested_at: Option<DateTime<Utc>>,
    pub delete_attempts: u32,
}

impl NamespaceRecord {
    /// Parse a namespace into a record. Returns `None` when the object
    /// has no name or creation timestamp (never observed in practice,
    /// but the API makes both optional). Unparsable annotation values
    /// fall back to a fresh `OK` record: the next pass rewrites them.
    pub fn from_namespace(ns: &Namespace) -> Option<Self> {
        let name = ns.metadata.name.clone()?;
        let created_at = ns.metadata.creation_timestamp.as_ref()?.0;

        let get = |key: &str| {
            ns.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(key))
                .map(String::as_str)
        };

        let status = get(STATUS_ANNOTATION)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Status::Ok);
        let status_since = get(STATUS_SINCE_ANNOTATION)
            .and_then(parse_rfc3339)
            .unwrap_or(created_at);
        let status_last_seen = get(STATUS_LAST_SEEN_ANNOTATION)
            .and_then(parse_rfc3339)
            .unwrap_or(status_since);
        let failing_resources = get(FAILING_RESOURCES_ANNOTATION)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let notified_for = get(NOTIFIED_FOR_ANNOTATION)
            .and_then(|s| serde_json::from_str::<Vec<Status>>(s).ok())
            .map(|v| v.into_iter().collect())
            .unwrap_or_default();
        let delete_requested_at = get(DELETE_REQUESTED_AT_ANNOTATION).and_then(parse_rfc3339);
        let delete_attempts = get(DELETE_ATTEMPTS_ANNOTATION)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Some(NamespaceRecord {
            name,
            created_at,
            status,
            status_since,
            status_last_seen,
            failing_resources,
            owner: get(OWNER_ANNOTATION).map(str::to_owned),
            notified_for,
            delete_requested_at,
            delete_attempts,
        })
    }

    /// Merge-patch body publishing the classification state. Structured
    /// values are serialized as compact JSON strings; an empty failing
    /// list removes the annotation so `OK`/`STALE` namespaces carry none.
    pub fn status_patch(&self) -> serde_json::Value {
        let failing = if self.failing_resources.is_empty() {
            serde_json::Value::Null
        } else {
            // serializing a Vec of plain structs cannot fail
            serde_json::Value::String(serde_json::to_string(&self.failing_resources).unwrap())
        };
        json!({
            "metadata": {
                "annotations": {
                    (STATUS_ANNOTATION): self.status.to_string(),
                    (STATUS_SINCE_ANNOTATION): self.status_since.to_rfc3339(),
                    (STATUS_LAST_SEEN_ANNOTATION): self.status_last_seen.to_rfc3339(),
                    (FAILING_RESOURCES_ANNOTATION): failing,
                }
            }
        })
    }

    /// Merge-patch body recording a notified transition.
    pub fn notified_patch(&self, extra: Status) -> serde_json::Value {
        let mut set = self.notified_for.clone();
        set.insert(extra);
        notified_for_patch(&set)
    }
}

/// Merge-patch body for an explicit `notified-for` set; used to roll
/// the dedup key back when a send fails after the write-ahead.
pub fn notified_for_patch(set: &BTreeSet<Status>) -> serde_json::Value {
    let list: Vec<String> = set.iter().map(Status::to_string).collect();
    json!({
        "metadata": {
            "annotations": {
                // to_string of a Vec<String> cannot fail
                (NOTIFIED_FOR_ANNOTATION): serde_json::to_string(&list).unwrap(),
            }
        }
    })
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
