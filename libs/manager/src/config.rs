use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Serde adapter for human-readable durations (`5s`, `2m`, `1h`).
pub mod human_duration {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Same, for optional fields.
pub mod human_duration_opt {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The task kinds a namespace rule may schedule. `CheckNamespace` and
/// `GetOwnerInfo` materialize as child workloads; `DeleteNamespace` and
/// `Notify` are executed in-process by the action controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    CheckNamespace,
    GetOwnerInfo,
    DeleteNamespace,
    Notify,
}

impl TaskKind {
    /// Kinds delegated to child jobs.
    pub fn is_child_task(&self) -> bool {
        matches!(self, TaskKind::CheckNamespace | TaskKind::GetOwnerInfo)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::CheckNamespace => "check-namespace",
            TaskKind::GetOwnerInfo => "get-owner-info",
            TaskKind::DeleteNamespace => "delete-namespace",
            TaskKind::Notify => "notify",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "check-namespace" => Ok(TaskKind::CheckNamespace),
            "get-owner-info" => Ok(TaskKind::GetOwnerInfo),
            "delete-namespace" => Ok(TaskKind::DeleteNamespace),
            "notify" => Ok(TaskKind::Notify),
            other => Err(format!("unknown task kind {other:?}")),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Cron expression. Set: reconcile a CronJob. Unset: a one-shot Job.
    pub schedule: Option<String>,
    #[serde(with = "human_duration_opt")]
    pub deadline: Option<Duration>,
    pub backoff_limit: Option<i32>,
    pub concurrency_policy: Option<String>,
    pub successful_jobs_history_limit: Option<i32>,
    pub failed_jobs_history_limit: Option<i32>,
}

fn default_settling() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_recovery() -> Duration {
    Duration::from_secs(2 * 60)
}

/// Binds a set of namespaces (by name glob) to lifecycle parameters and
/// task schedules. Rules are tried in declaration order; the first rule
/// whose glob set matches wins.
#[derive(Clone, Debug, Deserialize)]
pub struct MatchRule {
    pub name_globs: Vec<String>,
    #[serde(with = "human_duration")]
    pub ttl: Duration,
    #[serde(default = "default_settling", with = "human_duration")]
    pub settling_period: Duration,
    #[serde(default = "default_grace", with = "human_duration")]
    pub grace_period: Duration,
    #[serde(default = "default_recovery", with = "human_duration")]
    pub recovery_window: Duration,
    #[serde(default)]
    pub tasks: BTreeMap<TaskKind, TaskConfig>,

    #[serde(skip)]
    compiled: Vec<Pattern>,
}

impl MatchRule {
    pub fn matches(&self, namespace: &str) -> bool {
        self.compiled.iter().any(|p| p.matches(namespace))
    }

    fn compile(&mut self) -> Result<()> {
        self.compiled = self
            .name_globs
            .iter()
            .map(|g| {
                Pattern::new(g).map_err(|e| Error::Config(format!("invalid glob {g:?}: {e}")))
            })
            .collect::<Result<_>>()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub path: PathBuf,
    #[serde(with = "human_duration")]
    pub lease_ttl: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/var/run/ns-manager"),
            lease_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub registry_path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            registry_path: "/metrics".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NotifierConfig {
    pub url: String,
    pub token: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PeopleApiConfig {
    pub url: String,
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PrometheusConfig {
    pub url: String,
}

/// Where the manager itself runs and how child jobs are stamped.
#[derive(Clone, Debug, Deserialize)]
pub struct ManagerContext {
    pub namespace: String,
    pub service_account: String,
    pub config_secret: String,
    pub config_path: String,
    pub image: String,
    #[serde(default, rename = "matchLabels")]
    pub match_labels: BTreeMap<String, String>,
}

/// Process-wide configuration, immutable after boot. Loaded once from
/// `$CONFIG_PATH` and shared by reference everywhere else.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub namespaces: Vec<MatchRule>,
    pub notifier: Option<NotifierConfig>,
    pub people_api: Option<PeopleApiConfig>,
    pub prometheus: Option<PrometheusConfig>,
    pub context: ManagerContext,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&mut self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(Error::Config("no namespace match rules configured".into()));
        }
        let mut seen_globs: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, rule) in self.namespaces.iter_mut().enumerate() {
            rule.compile()?;
            for (kind, task) in &rule.tasks {
                if let Some(schedule) = &task.schedule {
                    schedule
                        .parse::<cron::Schedule>()
                        .map_err(|e| Error::Config(format!("task {kind}: bad schedule: {e}")))?;
                }
            }
            for g in &rule.name_globs {
                if let Some(first) = seen_globs.insert(g.as_str(), i) {
                    warn!(
                        glob = %g,
                        first_rule = first,
                        shadowed_rule = i,
                        "overlapping match rules: first declaration wins"
                    );
                }
            }
        }
        Ok(())
    }

    /// First rule matching the namespace name, in declaration order.
    pub fn rule_for(&self, namespace: &str) -> Option<&MatchRule> {
        self.namespaces.iter().find(|r| r.matches(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
leader_election:
  enabled: true
  path: /var/run/ns-manager
  lease_ttl: 5s
metrics:
  enabled: true
  registry_path: /metrics
namespaces:
  - name_globs: ["ci-dev-*"]
    ttl: 30m
    settling_period: 2m
    grace_period: 2m
    tasks:
      check-namespace:
        schedule: "*/2 * * * * *"
      get-owner-info: {}
  - name_globs: ["ci-*"]
    ttl: 1h
notifier:
  url: https://chat.example.com/hooks/abc
  token: secret
people_api:
  url: https://people.example.com
  insecure: true
prometheus:
  url: http://prometheus.monitoring:9090
context:
  namespace: ns-manager
  service_account: ns-manager
  config_secret: ns-manager-config
  config_path: /etc/ns-manager/config.yaml
  image: registry.example.com/ns-manager:0.1.0
  matchLabels:
    app.kubernetes.io/name: ns-manager
"#;

    #[test]
    fn parses_full_document() {
        let settings = Settings::parse(EXAMPLE).unwrap();
        assert!(settings.leader_election.enabled);
        assert_eq!(settings.leader_election.lease_ttl, Duration::from_secs(5));
        assert_eq!(settings.namespaces.len(), 2);
        assert_eq!(settings.namespaces[0].ttl, Duration::from_secs(30 * 60));
        assert_eq!(
            settings.namespaces[1].settling_period,
            Duration::from_secs(120),
            "settling period defaults when omitted"
        );
        assert!(settings.namespaces[0]
            .tasks
            .contains_key(&TaskKind::CheckNamespace));
        assert_eq!(settings.context.namespace, "ns-manager");
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let settings = Settings::parse(EXAMPLE).unwrap();
        let rule = settings.rule_for("ci-dev-42").unwrap();
        assert_eq!(rule.ttl, Duration::from_secs(30 * 60));
        let rule = settings.rule_for("ci-main-7").unwrap();
        assert_eq!(rule.ttl, Duration::from_secs(3600));
        assert!(settings.rule_for("kube-system").is_none());
    }

    #[test]
    fn rejects_invalid_glob() {
        let raw = EXAMPLE.replace("ci-dev-*", "ci-[dev");
        assert!(matches!(Settings::parse(&raw), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_invalid_schedule() {
        let raw = EXAMPLE.replace("*/2 * * * * *", "not a cron line");
        assert!(matches!(Settings::parse(&raw), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_rule_list() {
        let raw = "namespaces: []\ncontext:\n  namespace: a\n  service_account: a\n  config_secret: a\n  config_path: /c\n  image: i\n";
        assert!(matches!(Settings::parse(raw), Err(Error::Config(_))));
    }

    #[test]
    fn duration_suffixes() {
        let raw = EXAMPLE.replace("ttl: 30m", "ttl: 90s");
        let settings = Settings::parse(&raw).unwrap();
        assert_eq!(settings.namespaces[0].ttl, Duration::from_secs(90));
    }
}
