use ns_manager_k8s_util::retry::RetryClass;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("write conflict persisted after retries: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("leadership is stale, aborting pass")]
    StaleLeadership,

    #[error("lease I/O error: {source}")]
    Lease {
        #[from]
        source: std::io::Error,
    },

    #[error("namespace {0} did not terminate within the delete timeout")]
    DeleteStuck(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),

    #[error("HTTP request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Prometheus query failed: {0}")]
    Prometheus(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("JSON serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("invalid cron expression: {source}")]
    Cron {
        #[from]
        source: cron::error::Error,
    },

    #[error("template error: {source}")]
    Template {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("invalid trace id")]
    InvalidTraceId,

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Stable low-cardinality label for the failure counters.
    pub fn metric_label(&self) -> String {
        match self {
            Error::Kube { .. } => "kube",
            Error::Conflict(_) => "conflict",
            Error::Config(_) => "config",
            Error::StaleLeadership => "stale_leadership",
            Error::Lease { .. } => "lease",
            Error::DeleteStuck(_) => "delete_stuck",
            Error::Notification(_) => "notification",
            Error::Http { .. } => "http",
            Error::Prometheus(_) => "prometheus",
            Error::Timeout(_) => "timeout",
            Error::Serialization { .. } => "serialization",
            Error::Cron { .. } => "cron",
            Error::Template { .. } => "template",
            Error::InvalidTraceId => "invalid_trace_id",
            Error::Runtime(_) => "runtime",
        }
        .to_string()
    }

    /// Process exit code when the error escapes to `main`.
    /// 1: configuration, 3: leader-election infrastructure, 2: the rest.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Lease { .. } => 3,
            _ => 2,
        }
    }
}

/// Retry classification for raw kube client errors, per the gateway
/// contract: 409 re-reads on the conflict ladder, 5xx/429 and transport
/// faults back off, 404 is never retried.
pub fn classify_kube(err: &kube::Error) -> RetryClass {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => RetryClass::Conflict,
        kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => RetryClass::Transient,
        kube::Error::Api(_) => RetryClass::Fatal,
        kube::Error::HyperError(_) | kube::Error::Service(_) => RetryClass::Transient,
        _ => RetryClass::Fatal,
    }
}

/// True when the error is a plain 404. Namespace-level callers treat
/// this as "deleted externally" and drop the item from the pass.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
