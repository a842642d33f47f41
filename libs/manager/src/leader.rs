use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// On-disk lease record. Cross-replica correctness relies on the shared
/// filesystem's rename atomicity; fencing is advisory, so every action
/// taken under a lease must itself be idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    /// Seconds the lease stays valid without renewal.
    pub ttl: u64,
}

impl LeaseRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.renewed_at > chrono::Duration::seconds(self.ttl as i64)
    }
}

/// Shared leadership flag, read by the controllers on every unit of
/// work. Cheap to clone; the arbiter is the only writer.
#[derive(Clone, Default)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn set(&self, value: bool) {
        self.is_leader.store(value, Ordering::SeqCst);
    }
}

/// File-backed leader election: one lease file per controller kind on a
/// volume shared by all replicas.
pub struct LeaderArbiter {
    path: PathBuf,
    holder_id: String,
    ttl: Duration,
    state: LeaderState,
    last_renewal: Mutex<Option<DateTime<Utc>>>,
}

impl LeaderArbiter {
    pub fn new(dir: &Path, controller: &str, ttl: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "ns-manager".to_string());
        let token: u32 = rand::random();
        Ok(Self {
            path: dir.join(format!("{controller}-lease")),
            holder_id: format!("{host}-{token:08x}"),
            ttl,
            state: LeaderState::default(),
            last_renewal: Mutex::new(None),
        })
    }

    pub fn state(&self) -> LeaderState {
        self.state.clone()
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// One election round. Acquires when the lease file is absent,
    /// corrupt, expired, or already ours; otherwise demotes.
    pub fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();

        if let Some(last) = *self.last_renewal.lock().unwrap() {
            if now < last {
                // clock jumped backward: our lease arithmetic is void
                warn!(holder_id = %self.holder_id, "clock jumped backward, self-demoting");
                self.demote();
                return Ok(false);
            }
        }

        let existing = match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice::<LeaseRecord>(&bytes).ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(lease) if lease.holder_id == self.holder_id => {
                self.write_lease(lease.acquired_at, now)?;
            }
            Some(lease) if !lease.expired(now) => {
                debug!(holder = %lease.holder_id, "lease held by another replica");
                self.demote();
                return Ok(false);
            }
            _ => {
                self.write_lease(now, now)?;
            }
        }

        *self.last_renewal.lock().unwrap() = Some(now);
        self.state.set(true);
        Ok(true)
    }

    /// `StaleLeadership` when the lease has not been renewed within
    /// `ttl/2`: a pass that suspended that long must abort rather than
    /// keep writing on a lease another replica may already hold.
    pub fn check_fresh(&self) -> Result<()> {
        if !self.state.is_leader() {
            return Err(Error::StaleLeadership);
        }
        let last = self.last_renewal.lock().unwrap();
        match *last {
            Some(renewed)
                if Utc::now() - renewed
                    <= chrono::Duration::from_std(self.ttl / 2)
                        .unwrap_or_else(|_| chrono::Duration::zero()) =>
            {
                Ok(())
            }
            _ => Err(Error::StaleLeadership),
        }
    }

    /// Best-effort release: delete the lease file if we still hold it.
    pub fn release(&self) {
        if let Ok(bytes) = std::fs::read(&self.path) {
            if let Ok(lease) = serde_json::from_slice::<LeaseRecord>(&bytes) {
                if lease.holder_id == self.holder_id {
                    let _ = std::fs::remove_file(&self.path);
                }
            }
        }
        self.demote();
    }

    fn demote(&self) {
        self.state.set(false);
        *self.last_renewal.lock().unwrap() = None;
    }

    fn write_lease(&self, acquired_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let record = LeaseRecord {
            holder_id: self.holder_id.clone(),
            acquired_at,
            renewed_at: now,
            ttl: self.ttl.as_secs(),
        };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&tmp, &record)?;
        tmp.persist(&self.path).map_err(|e| Error::Lease { source: e.error })?;
        Ok(())
    }

    /// Renewal loop: one election round every `ttl/3` until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = (self.ttl / 3).max(Duration::from_millis(100));
        let mut tick = tokio::time::interval(period);
        info!(holder_id = %self.holder_id, lease = %self.path.display(), "starting leader election");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.release();
                    break;
                }
                _ = tick.tick() => {
                    let was_leader = self.state.is_leader();
                    match self.try_acquire_or_renew() {
                        Ok(true) if !was_leader => {
                            info!(holder_id = %self.holder_id, "acquired leadership");
                        }
                        Ok(false) if was_leader => {
                            warn!(holder_id = %self.holder_id, "lost leadership");
                        }
                        Err(e) => {
                            // cannot read or write the shared volume:
                            // assume we are not safe to lead
                            warn!(%e, "lease renewal failed, self-demoting");
                            self.demote();
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// How a controller is gated: by an elected lease, or not at all when
/// leader election is disabled for single-replica deployments.
#[derive(Clone)]
pub enum Leadership {
    Elected(Arc<LeaderArbiter>),
    Standalone,
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        match self {
            Leadership::Elected(arbiter) => arbiter.state().is_leader(),
            Leadership::Standalone => true,
        }
    }

    pub fn check_fresh(&self) -> Result<()> {
        match self {
            Leadership::Elected(arbiter) => arbiter.check_fresh(),
            Leadership::Standalone => Ok(()),
        }
    }
}
