use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::config::NotifierConfig;
use crate::error::{Error, Result};
use crate::record::Status;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers owner notifications through a token-authenticated chat
/// webhook. The durable dedup is the `notified-for` annotation owned
/// by the action controller; the in-memory set only prevents duplicate
/// sends while a pass is in flight.
pub struct Notifier {
    http: reqwest::Client,
    url: String,
    token: String,
    sent: Mutex<BTreeSet<(String, Status)>>,
}

impl Notifier {
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: config.url.clone(),
            token: config.token.clone(),
            sent: Mutex::new(BTreeSet::new()),
        })
    }

    /// Send the notification for one transition. Returns `false` when
    /// the transition is skipped (not notifiable, owner unresolved for
    /// a non-STALE transition, or already sent by this process).
    pub async fn notify(
        &self,
        namespace: &str,
        old: Status,
        new: Status,
        owner: Option<&str>,
    ) -> Result<bool> {
        if !should_notify(new, owner) {
            debug!(%namespace, %new, "notification skipped");
            return Ok(false);
        }
        let key = (namespace.to_string(), new);
        {
            let mut sent = self.sent.lock().unwrap();
            if !sent.insert(key.clone()) {
                return Ok(false);
            }
        }

        let body = json!({"text": format_message(namespace, old, new, owner)});
        let result = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                // leave the key unclaimed so the next pass retries
                self.sent.lock().unwrap().remove(&key);
                Err(Error::Notification(e.to_string()))
            }
        }
    }
}

/// Notifications are keyed to the transition kind; a transition without
/// a resolved owner is only worth sending when the namespace is about
/// to be evicted anyway.
pub fn should_notify(new: Status, owner: Option<&str>) -> bool {
    new.is_notifiable() && (owner.is_some() || new == Status::Stale)
}

pub fn format_message(namespace: &str, old: Status, new: Status, owner: Option<&str>) -> String {
    let mention = owner.map(|o| format!("<{o}> ")).unwrap_or_default();
    match new {
        Status::Failing => format!(
            "{mention}namespace `{namespace}` is failing (was {old}); \
             it will be deleted unless it recovers within its grace period"
        ),
        Status::Failed => format!(
            "{mention}namespace `{namespace}` is broken beyond its grace period \
             and is scheduled for deletion"
        ),
        Status::Stale => format!(
            "{mention}namespace `{namespace}` exceeded its TTL and is scheduled for deletion"
        ),
        _ => String::new(),
    }
}
