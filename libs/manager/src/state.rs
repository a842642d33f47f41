use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::classify::{Candidate, Verdict};
use crate::config::MatchRule;
use crate::record::{NamespaceRecord, Status};

/// Hysteresis windows driving the transition table. All three come
/// from the namespace's match rule; `unstable_to_failing` reuses the
/// rule's settling period.
#[derive(Clone, Copy, Debug)]
pub struct Windows {
    pub recovery_window: Duration,
    pub unstable_to_failing: Duration,
    pub grace_period: Duration,
}

impl Windows {
    pub fn from_rule(rule: &MatchRule) -> Self {
        Self {
            recovery_window: rule.recovery_window,
            unstable_to_failing: rule.settling_period,
            grace_period: rule.grace_period,
        }
    }
}

/// A status change, the unit of notification and action queueing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub namespace: String,
    pub from: Status,
    pub to: Status,
}

/// Apply one classifier verdict to the persisted status.
///
/// `FAILED`, `STALE` and `TERMINATING` are terminal here: nothing but
/// deletion moves a namespace out of them, except that TTL expiry
/// (`STALE`) outranks `FAILED` so eviction stays unconditional.
pub fn advance(
    record: &NamespaceRecord,
    verdict: &Verdict,
    windows: &Windows,
    now: DateTime<Utc>,
) -> (NamespaceRecord, Option<Transition>) {
    let dwell = (now - record.status_since).to_std().unwrap_or_default();
    let candidate = verdict.candidate;

    let next_status = match (record.status, candidate) {
        (Status::Terminating, _) => Status::Terminating,
        (Status::Stale, _) => Status::Stale,
        (Status::Failed, Candidate::Stale) => Status::Stale,
        (Status::Failed, _) => Status::Failed,
        (_, Candidate::Stale) => Status::Stale,

        (Status::Ok, Candidate::Ok) => Status::Ok,
        (Status::Ok, Candidate::Failing) => Status::Unstable,

        (Status::Unstable, Candidate::Ok) if dwell >= windows.recovery_window => Status::Ok,
        (Status::Unstable, Candidate::Ok) => Status::Unstable,
        (Status::Unstable, Candidate::Failing) if dwell >= windows.unstable_to_failing => {
            Status::Failing
        }
        (Status::Unstable, Candidate::Failing) => Status::Unstable,

        (Status::Failing, Candidate::Ok) if dwell >= windows.recovery_window => Status::Ok,
        (Status::Failing, Candidate::Ok) => Status::Failing,
        (Status::Failing, Candidate::Failing) if dwell >= windows.grace_period => Status::Failed,
        (Status::Failing, Candidate::Failing) => Status::Failing,
    };

    let mut next = record.clone();
    if next_status != record.status {
        next.status = next_status;
        next.status_since = now;
        next.status_last_seen = now;
        next.failing_resources = match next_status {
            Status::Ok | Status::Stale => Vec::new(),
            _ => verdict.failing.clone(),
        };
        let transition = Transition {
            namespace: record.name.clone(),
            from: record.status,
            to: next_status,
        };
        return (next, Some(transition));
    }

    // No change: refresh agreement bookkeeping only.
    let agrees = matches!(
        (record.status, candidate),
        (Status::Ok, Candidate::Ok)
            | (Status::Unstable, Candidate::Failing)
            | (Status::Failing, Candidate::Failing)
            | (Status::Failed, Candidate::Failing)
            | (Status::Stale, Candidate::Stale)
    );
    if agrees {
        next.status_last_seen = now;
    }
    if matches!(record.status, Status::Unstable | Status::Failing)
        && candidate == Candidate::Failing
    {
        // keep messages fresh; first_seen is preserved by the classifier
        next.failing_resources = verdict.failing.clone();
    }
    (next, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::record::FailingResource;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn windows() -> Windows {
        Windows {
            recovery_window: Duration::from_secs(120),
            unstable_to_failing: Duration::from_secs(120),
            grace_period: Duration::from_secs(120),
        }
    }

    fn record(status: Status, since: DateTime<Utc>) -> NamespaceRecord {
        NamespaceRecord {
            name: "ci-job-42".to_string(),
            created_at: t0() - chrono::Duration::minutes(30),
            status,
            status_since: since,
            status_last_seen: since,
            failing_resources: match status {
                Status::Ok | Status::Stale | Status::Terminating => Vec::new(),
                _ => vec![failing_resource()],
            },
            owner: None,
            notified_for: BTreeSet::new(),
            delete_requested_at: None,
            delete_attempts: 0,
        }
    }

    fn failing_resource() -> FailingResource {
        FailingResource {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            reason: "UnavailableReplicas".to_string(),
            message: "1 replica unavailable".to_string(),
            first_seen: t0(),
        }
    }

    fn verdict(candidate: Candidate) -> Verdict {
        Verdict {
            candidate,
            failing: match candidate {
                Candidate::Failing => vec![failing_resource()],
                _ => Vec::new(),
            },
        }
    }

    #[test]
    fn ok_with_failure_signal_becomes_unstable() {
        let (next, transition) = advance(
            &record(Status::Ok, t0()),
            &verdict(Candidate::Failing),
            &windows(),
            t0() + chrono::Duration::seconds(30),
        );
        assert_eq!(next.status, Status::Unstable);
        assert!(!next.failing_resources.is_empty());
        let transition = transition.unwrap();
        assert_eq!((transition.from, transition.to), (Status::Ok, Status::Unstable));
    }

    #[test]
    fn unstable_escalates_only_after_dwell() {
        let early = advance(
            &record(Status::Unstable, t0()),
            &verdict(Candidate::Failing),
            &windows(),
            t0() + chrono::Duration::seconds(60),
        );
        assert_eq!(early.0.status, Status::Unstable);
        assert!(early.1.is_none());

        let late = advance(
            &record(Status::Unstable, t0()),
            &verdict(Candidate::Failing),
            &windows(),
            t0() + chrono::Duration::seconds(121),
        );
        assert_eq!(late.0.status, Status::Failing);
    }

    #[test]
    fn failing_becomes_failed_only_after_grace_period() {
        let early = advance(
            &record(Status::Failing, t0()),
            &verdict(Candidate::Failing),
            &windows(),
            t0() + chrono::Duration::seconds(30),
        );
        assert_eq!(early.0.status, Status::Failing);

        let late = advance(
            &record(Status::Failing, t0()),
            &verdict(Candidate::Failing),
            &windows(),
            t0() + chrono::Duration::seconds(121),
        );
        assert_eq!(late.0.status, Status::Failed);
        assert!(!late.0.failing_resources.is_empty());
    }

    #[test]
    fn failing_recovers_after_recovery_window() {
        let early = advance(
            &record(Status::Failing, t0()),
            &verdict(Candidate::Ok),
            &windows(),
            t0() + chrono::Duration::seconds(60),
        );
        assert_eq!(early.0.status, Status::Failing, "recovery has hysteresis");

        let (next, transition) = advance(
            &record(Status::Failing, t0()),
            &verdict(Candidate::Ok),
            &windows(),
            t0() + chrono::Duration::seconds(130),
        );
        assert_eq!(next.status, Status::Ok);
        assert!(next.failing_resources.is_empty());
        assert_eq!(transition.unwrap().to, Status::Ok);
    }

    #[test]
    fn failed_never_recovers() {
        for candidate in [Candidate::Ok, Candidate::Failing] {
            let (next, transition) = advance(
                &record(Status::Failed, t0()),
                &verdict(candidate),
                &windows(),
                t0() + chrono::Duration::hours(10),
            );
            assert_eq!(next.status, Status::Failed);
            assert!(transition.is_none());
        }
    }

    #[test]
    fn stale_outranks_failed() {
        let (next, transition) = advance(
            &record(Status::Failed, t0()),
            &verdict(Candidate::Stale),
            &windows(),
            t0() + chrono::Duration::minutes(1),
        );
        assert_eq!(next.status, Status::Stale);
        assert!(next.failing_resources.is_empty());
        assert_eq!(transition.unwrap().to, Status::Stale);
    }

    #[test]
    fn stale_and_terminating_are_absorbing() {
        for status in [Status::Stale, Status::Terminating] {
            for candidate in [Candidate::Ok, Candidate::Failing, Candidate::Stale] {
                let (next, _) = advance(
                    &record(status, t0()),
                    &verdict(candidate),
                    &windows(),
                    t0() + chrono::Duration::hours(1),
                );
                assert_eq!(next.status, status);
            }
        }
    }

    #[test]
    fn status_since_never_decreases() {
        let statuses = [
            Status::Ok,
            Status::Unstable,
            Status::Failing,
            Status::Failed,
            Status::Stale,
            Status::Terminating,
        ];
        let candidates = [Candidate::Ok, Candidate::Failing, Candidate::Stale];
        for status in statuses {
            for candidate in candidates {
                for offset in [0i64, 30, 121, 600] {
                    let now = t0() + chrono::Duration::seconds(offset);
                    let (next, _) = advance(&record(status, t0()), &verdict(candidate), &windows(), now);
                    assert!(next.status_since >= t0());
                }
            }
        }
    }

    #[test]
    fn failing_resources_empty_iff_ok_or_stale_or_terminating() {
        let statuses = [
            Status::Ok,
            Status::Unstable,
            Status::Failing,
            Status::Failed,
            Status::Stale,
        ];
        let candidates = [Candidate::Ok, Candidate::Failing, Candidate::Stale];
        for status in statuses {
            for candidate in candidates {
                for offset in [0i64, 30, 121, 600] {
                    let now = t0() + chrono::Duration::seconds(offset);
                    let (next, _) = advance(&record(status, t0()), &verdict(candidate), &windows(), now);
                    match next.status {
                        Status::Ok | Status::Stale | Status::Terminating => {
                            assert!(next.failing_resources.is_empty(), "{status:?} -> {:?}", next.status)
                        }
                        _ => assert!(
                            !next.failing_resources.is_empty(),
                            "{status:?} -> {:?} with {candidate:?}",
                            next.status
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn agreement_refreshes_last_seen() {
        let now = t0() + chrono::Duration::seconds(30);
        let (next, _) = advance(&record(Status::Ok, t0()), &verdict(Candidate::Ok), &windows(), now);
        assert_eq!(next.status_last_seen, now);
        assert_eq!(next.status_since, t0());
    }
}
