//! Leases pinning content against garbage collection.
//!
//! A [`Lease`] is acquired at the start of a pull and covers every digest
//! the manifest references, fetched or not. It is persisted as
//! `leases/<id>.json` under the content root so a `gc` running in another
//! process honors it, and reference counted in memory so overlapping pulls
//! in one process can pin the same digest independently.
//!
//! Release happens in `Drop`, which covers early returns, errors and a
//! cancelled (dropped) pull future alike. Leases also carry an expiry so
//! that files left behind by a crashed process stop pinning content.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ctr_remote_core::error::{RemoteError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::digest::Digest;
use super::store::ContentStore;

/// Persisted form of a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    digests: BTreeSet<Digest>,
}

struct LeaseShared {
    store: Arc<ContentStore>,
    dir: PathBuf,
    ttl: chrono::Duration,
    pins: Mutex<HashMap<Digest, usize>>,
}

impl LeaseShared {
    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn write_record(&self, record: &LeaseRecord) -> std::io::Result<()> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(&tmp, &path)
    }

    fn pin(&self, digests: &[Digest]) {
        let mut pins = self.pins.lock();
        for d in digests {
            *pins.entry(d.clone()).or_insert(0) += 1;
        }
    }

    fn unpin(&self, digests: &BTreeSet<Digest>) {
        let mut pins = self.pins.lock();
        for d in digests {
            if let Some(count) = pins.get_mut(d) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(d);
                }
            }
        }
    }
}

/// Hands out leases over one content store.
#[derive(Clone)]
pub struct LeaseManager {
    shared: Arc<LeaseShared>,
}

impl LeaseManager {
    pub fn new(store: Arc<ContentStore>, ttl: std::time::Duration) -> Self {
        let dir = store.root().join("leases");
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            shared: Arc::new(LeaseShared {
                store,
                dir,
                ttl,
                pins: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquire an empty lease.
    ///
    /// Fails with `LeaseUnavailable` when the content store cannot be used;
    /// callers must acquire before starting any fetch.
    pub fn acquire(&self) -> Result<Lease> {
        if !self.shared.store.is_available() {
            return Err(RemoteError::LeaseUnavailable(format!(
                "content store at {} is not available",
                self.shared.store.root().display()
            )));
        }
        std::fs::create_dir_all(&self.shared.dir).map_err(|e| {
            RemoteError::LeaseUnavailable(format!(
                "failed to create lease directory {}: {}",
                self.shared.dir.display(),
                e
            ))
        })?;

        let now = Utc::now();
        let record = LeaseRecord {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: now + self.shared.ttl,
            digests: BTreeSet::new(),
        };
        self.shared.write_record(&record).map_err(|e| {
            RemoteError::LeaseUnavailable(format!("failed to persist lease {}: {}", record.id, e))
        })?;

        tracing::debug!(lease = %record.id, expires_at = %record.expires_at, "Acquired lease");
        Ok(Lease {
            shared: self.shared.clone(),
            record,
            released: false,
        })
    }

    /// Whether any live lease in this process pins `digest`.
    pub fn is_pinned(&self, digest: &Digest) -> bool {
        self.shared.pins.lock().contains_key(digest)
    }

    /// Number of in-process holders pinning `digest`.
    pub fn pin_count(&self, digest: &Digest) -> usize {
        self.shared.pins.lock().get(digest).copied().unwrap_or(0)
    }

    /// Every digest pinned by an unexpired lease, in any process.
    ///
    /// Expired lease files are deleted along the way.
    pub fn live_digests(&self) -> Result<HashSet<Digest>> {
        let mut live: HashSet<Digest> = self.shared.pins.lock().keys().cloned().collect();

        let entries = match std::fs::read_dir(&self.shared.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(live),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: LeaseRecord = match std::fs::read(&path)
                .map_err(RemoteError::from)
                .and_then(|data| Ok(serde_json::from_slice(&data)?))
            {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable lease");
                    continue;
                }
            };
            if record.expires_at <= now {
                tracing::info!(lease = %record.id, "Removing expired lease");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            live.extend(record.digests);
        }

        Ok(live)
    }
}

/// A claim keeping a set of digests out of garbage collection.
///
/// Released when dropped.
pub struct Lease {
    shared: Arc<LeaseShared>,
    record: LeaseRecord,
    released: bool,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn digests(&self) -> &BTreeSet<Digest> {
        &self.record.digests
    }

    /// Extend the lease to cover more digests.
    pub fn add<I>(&mut self, digests: I) -> Result<()>
    where
        I: IntoIterator<Item = Digest>,
    {
        let new: Vec<Digest> = digests
            .into_iter()
            .filter(|d| !self.record.digests.contains(d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if new.is_empty() {
            return Ok(());
        }

        self.record.digests.extend(new.iter().cloned());
        self.shared.pin(&new);
        self.shared.write_record(&self.record).map_err(|e| {
            RemoteError::LeaseUnavailable(format!(
                "failed to persist lease {}: {}",
                self.record.id, e
            ))
        })
    }

    /// Release explicitly. Dropping the lease has the same effect.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.unpin(&self.record.digests);
        if let Err(e) = std::fs::remove_file(self.shared.record_path(&self.record.id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(lease = %self.record.id, error = %e, "Failed to remove lease file");
            }
        }
        tracing::debug!(lease = %self.record.id, digests = self.record.digests.len(), "Released lease");
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
