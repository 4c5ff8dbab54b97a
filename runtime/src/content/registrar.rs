//! Single write path into the content store.
//!
//! All puts and label updates go through [`ContentRegistrar`], which
//! serializes operations on the same digest. Concurrent pulls that need the
//! same bootstrap therefore fetch it once: the second caller waits on the
//! digest lock and then finds the object present.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use ctr_remote_core::error::Result;
use ctr_remote_core::labels::LABEL_GC_ROOT;

use super::digest::Digest;
use super::lease::LeaseManager;
use super::store::ContentStore;
use super::Labels;
use crate::locks::KeyedLocks;

/// Outcome of [`ContentRegistrar::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The object was already stored; nothing was fetched.
    Present,
    /// The object was fetched and stored; carries its size.
    Fetched(u64),
}

impl Ensured {
    pub fn was_fetched(&self) -> bool {
        matches!(self, Ensured::Fetched(_))
    }
}

/// Serializing front end over a [`ContentStore`].
pub struct ContentRegistrar {
    store: Arc<ContentStore>,
    locks: KeyedLocks<Digest>,
}

impl ContentRegistrar {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// The underlying store, for reads.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Verify and store `data` under `digest`.
    pub async fn put(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.with_digest_lock(digest, self.store.write(digest, data))
            .await
    }

    /// Attach or overwrite one label.
    pub async fn label(&self, digest: &Digest, key: &str, value: &str) -> Result<()> {
        let mut labels = Labels::new();
        labels.insert(key.to_string(), value.to_string());
        self.label_all(digest, &labels).await.map(|_| ())
    }

    /// Attach or overwrite a set of labels; returns the merged label set.
    pub async fn label_all(&self, digest: &Digest, labels: &Labels) -> Result<Labels> {
        self.with_digest_lock(digest, self.store.update_labels(digest, labels))
            .await
    }

    /// Existence check. Never touches the network.
    pub async fn has(&self, digest: &Digest) -> bool {
        self.store.has(digest).await
    }

    /// Read an object back, re-verifying its digest.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.store.get(digest).await
    }

    /// Make sure `digest` is stored, calling `fetch` only if it is absent.
    ///
    /// The check and the fetch run under the digest lock, so concurrent
    /// callers for the same digest trigger at most one fetch.
    pub async fn ensure<F, Fut>(&self, digest: &Digest, fetch: F) -> Result<Ensured>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        self.with_digest_lock(digest, async {
            if self.store.has(digest).await {
                return Ok(Ensured::Present);
            }
            let data = fetch().await?;
            self.store.write(digest, &data).await?;
            Ok(Ensured::Fetched(data.len() as u64))
        })
        .await
    }

    /// Delete every object that is not in `live` and not labeled as a GC
    /// root. Returns the removed digests.
    ///
    /// Each delete runs under the digest lock and re-checks the in-process
    /// pins first, so an object a pull pinned after `live` was computed is
    /// kept, and an `ensure` never reports an object that is then deleted.
    pub async fn collect(&self, live: &HashSet<Digest>, leases: &LeaseManager) -> Result<Vec<Digest>> {
        let mut removed = Vec::new();
        for info in self.store.list().await? {
            if live.contains(&info.digest) || info.labels.contains_key(LABEL_GC_ROOT) {
                continue;
            }
            let _guard = self.locks.lock(&info.digest).await;
            if leases.is_pinned(&info.digest) {
                tracing::debug!(digest = %info.digest, "Keeping object pinned during collection");
                continue;
            }
            self.store.delete(&info.digest).await?;
            tracing::debug!(digest = %info.digest, size = info.size, "Collected content object");
            removed.push(info.digest);
        }
        self.store.clear_ingest().await?;
        Ok(removed)
    }

    async fn with_digest_lock<T, Fut>(&self, digest: &Digest, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.locks.lock(digest).await;
        op.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctr_remote_core::error::RemoteError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn registrar(tmp: &TempDir) -> ContentRegistrar {
        let store = Arc::new(ContentStore::open(tmp.path()).unwrap());
        ContentRegistrar::new(store)
    }

    #[tokio::test]
    async fn test_put_get_has() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let digest = Digest::of(b"data");

        assert!(!reg.has(&digest).await);
        reg.put(&digest, b"data").await.unwrap();
        assert!(reg.has(&digest).await);
        assert_eq!(reg.get(&digest).await.unwrap(), b"data");
        assert_eq!(reg.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_put_mismatch() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let digest = Digest::of(b"data");

        let err = reg.put(&digest, b"other").await.unwrap_err();
        assert!(matches!(err, RemoteError::DigestMismatch { .. }));
        assert!(!reg.has(&digest).await);
    }

    #[tokio::test]
    async fn test_label_missing_object() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let err = reg
            .label(&Digest::of(b"x"), "k", "v")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ensure_fetches_once() {
        let tmp = TempDir::new().unwrap();
        let reg = Arc::new(registrar(&tmp));
        let data = b"bootstrap".to_vec();
        let digest = Digest::of(&data);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let reg = reg.clone();
            let digest = digest.clone();
            let data = data.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                reg.ensure(&digest, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    Ok(data)
                })
                .await
            }));
        }

        let mut fetched = 0;
        for h in handles {
            if h.await.unwrap().unwrap().was_fetched() {
                fetched += 1;
            }
        }
        assert_eq!(fetched, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_present_skips_fetch() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let digest = Digest::of(b"cached");
        reg.put(&digest, b"cached").await.unwrap();

        let outcome = reg
            .ensure(&digest, || async {
                Err::<Vec<u8>, _>(RemoteError::Snapshot("must not fetch".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(outcome, Ensured::Present);
    }

    #[tokio::test]
    async fn test_ensure_propagates_fetch_error() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let digest = Digest::of(b"absent");

        let err = reg
            .ensure(&digest, || async {
                Err::<Vec<u8>, _>(RemoteError::BootstrapNotFound {
                    digest: "sha256:x".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::BootstrapNotFound { .. }));
        assert!(!reg.has(&digest).await);
    }

    fn gc_root_labels() -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_GC_ROOT.to_string(), "true".to_string());
        labels
    }

    #[tokio::test]
    async fn test_collect_keeps_live_and_roots() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let leases = LeaseManager::new(reg.store().clone(), std::time::Duration::from_secs(60));
        let live = Digest::of(b"live");
        let root = Digest::of(b"root");
        let dead = Digest::of(b"dead");
        reg.put(&live, b"live").await.unwrap();
        reg.put(&root, b"root").await.unwrap();
        reg.put(&dead, b"dead").await.unwrap();
        reg.label_all(&root, &gc_root_labels()).await.unwrap();

        let removed = reg.collect(&HashSet::from([live.clone()]), &leases).await.unwrap();
        assert_eq!(removed, vec![dead.clone()]);
        assert!(reg.has(&live).await);
        assert!(reg.has(&root).await);
        assert!(!reg.has(&dead).await);
    }

    #[tokio::test]
    async fn test_collect_keeps_object_pinned_after_live_set() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let leases = LeaseManager::new(reg.store().clone(), std::time::Duration::from_secs(60));
        let bootstrap = Digest::of(b"bootstrap");
        reg.put(&bootstrap, b"bootstrap").await.unwrap();

        // The live set was computed before the pull pinned the bootstrap.
        let live = HashSet::new();
        let mut lease = leases.acquire().unwrap();
        lease.add([bootstrap.clone()]).unwrap();
        let outcome = reg
            .ensure(&bootstrap, || async {
                Err::<Vec<u8>, _>(RemoteError::Snapshot("must not fetch".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(outcome, Ensured::Present);

        let removed = reg.collect(&live, &leases).await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(reg.get(&bootstrap).await.unwrap(), b"bootstrap");

        lease.release();
        let removed = reg.collect(&live, &leases).await.unwrap();
        assert_eq!(removed, vec![bootstrap]);
    }

    #[tokio::test]
    async fn test_cancelled_ensure_releases_lock_entry() {
        let tmp = TempDir::new().unwrap();
        let reg = registrar(&tmp);
        let digest = Digest::of(b"slow");

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            reg.ensure(&digest, || std::future::pending::<Result<Vec<u8>>>()),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(reg.locks.len(), 0);
        assert!(!reg.has(&digest).await);
    }
}
