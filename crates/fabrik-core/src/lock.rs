//! Annotation-based distributed lock.
//!
//! The lock lives in a single well-known annotation on the resource being
//! processed. It uses:
//! - **CAS**: acquisition and release are conditional patches that expect the
//!   annotation's previous raw value
//! - **Lease staleness**: a holder whose acquisition is older than the lease
//!   timeout is treated as crashed and may be taken over
//! - **Fencing**: every takeover increments a sequence number
//!
//! # How It Works
//!
//! 1. Read the resource and parse the lock annotation, if any
//! 2. A live holder (any holder, including ourselves) means "not acquired"
//! 3. Otherwise patch the annotation to our [`LockInfo`], expecting the value we read
//! 4. A `Conflict` on that patch means another broker won the race
//!
//! Release removes the annotation only while we still hold it. Release
//! failures never propagate past [`ResourceLock::release`].
//!
//! The same mechanism backs longer-lived claims under other annotation keys
//! (see [`POLL_ANNOTATION`]). Such a claim is held as a [`LockInfo`] value:
//! [`ResourceLock::renew`] extends its lease and [`ResourceLock::release_held`]
//! clears it, both only while the stored annotation is still exactly that value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::Result;
use crate::resource::{Resource, ResourceRef};
use crate::store::{PatchPrecondition, ResourcePatch, ResourceStore};

/// Annotation key holding the lock.
pub const LOCK_ANNOTATION: &str = "lockedByManager";

/// Annotation key claiming the background poll of a dispatched operation.
pub const POLL_ANNOTATION: &str = "polledByManager";

/// Default lease timeout after which a lock is considered stale.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(120);

const TAKE_OVER_ATTEMPTS: u32 = 3;

/// Generates a unique owner id for a broker process.
#[must_use]
pub fn generate_owner_id() -> String {
    format!("fabrik-{}", Ulid::new())
}

/// Lock annotation contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Identity of the broker process holding the lock.
    pub holder_id: String,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Incremented on each acquisition of this resource's lock.
    #[serde(default)]
    pub sequence_number: u64,

    /// Optional description of the operation being processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Parses a raw annotation value.
    ///
    /// Plain-string values written by older brokers carry only the holder id;
    /// their age is taken from the resource's last update.
    #[must_use]
    pub fn parse(raw: &str, resource: &Resource) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            holder_id: raw.to_string(),
            acquired_at: resource.metadata.update_timestamp,
            sequence_number: 0,
            operation: None,
        })
    }

    /// Returns whether `other` is the same acquisition as this one.
    #[must_use]
    pub fn same_claim(&self, other: &Self) -> bool {
        self.holder_id == other.holder_id && self.sequence_number == other.sequence_number
    }

    /// Returns whether the lease has elapsed at `now`.
    #[must_use]
    pub fn is_stale(&self, lease_timeout: Duration, now: DateTime<Utc>) -> bool {
        let lease = chrono::Duration::from_std(lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        now.signed_duration_since(self.acquired_at) >= lease
    }
}

/// A per-broker handle on resource locks.
pub struct ResourceLock<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    owner_id: String,
    lease_timeout: Duration,
    annotation: String,
}

impl<S: ResourceStore + ?Sized> Clone for ResourceLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            owner_id: self.owner_id.clone(),
            lease_timeout: self.lease_timeout,
            annotation: self.annotation.clone(),
        }
    }
}

impl<S: ResourceStore + ?Sized> std::fmt::Debug for ResourceLock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock")
            .field("owner_id", &self.owner_id)
            .field("lease_timeout", &self.lease_timeout)
            .field("annotation", &self.annotation)
            .finish_non_exhaustive()
    }
}

impl<S: ResourceStore + ?Sized> ResourceLock<S> {
    /// Creates a lock handle for the given owner.
    #[must_use]
    pub fn new(store: Arc<S>, owner_id: impl Into<String>, lease_timeout: Duration) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            lease_timeout,
            annotation: LOCK_ANNOTATION.to_string(),
        }
    }

    /// Keeps the lock under a different annotation key.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>) -> Self {
        self.annotation = key.into();
        self
    }

    /// Returns the annotation key holding the lock.
    #[must_use]
    pub fn annotation(&self) -> &str {
        &self.annotation
    }

    /// Reads the current holder of the lock, if any.
    #[must_use]
    pub fn holder(&self, resource: &Resource) -> Option<LockInfo> {
        resource
            .annotation(&self.annotation)
            .map(|raw| LockInfo::parse(raw, resource))
    }

    /// Returns the owner id.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns the lease timeout.
    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Attempts to acquire the lock on a resource.
    ///
    /// Returns `Ok(false)` when a live owner holds the lock, including this
    /// owner, or when another broker wins the conditional patch.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist, or a storage error.
    pub async fn acquire(&self, reference: &ResourceRef) -> Result<bool> {
        self.acquire_with_operation(reference, None).await
    }

    /// Attempts to acquire the lock, recording the operation being processed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist, or a storage error.
    pub async fn acquire_with_operation(
        &self,
        reference: &ResourceRef,
        operation: Option<String>,
    ) -> Result<bool> {
        Ok(self.claim(reference, operation).await?.is_some())
    }

    /// Attempts to acquire the lock and returns the written holder value.
    ///
    /// Returns `Ok(None)` under the same conditions as [`Self::acquire`].
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist, or a storage error.
    pub async fn claim(
        &self,
        reference: &ResourceRef,
        operation: Option<String>,
    ) -> Result<Option<LockInfo>> {
        let resource = self.store.get(reference).await?;
        let current_raw = resource.annotation(&self.annotation).map(str::to_string);

        let next_sequence = match current_raw.as_deref() {
            Some(raw) => {
                let current = LockInfo::parse(raw, &resource);
                if !current.is_stale(self.lease_timeout, Utc::now()) {
                    tracing::debug!(
                        resource = %reference,
                        holder = %current.holder_id,
                        annotation = %self.annotation,
                        "resource locked by live owner"
                    );
                    return Ok(None);
                }
                tracing::info!(
                    resource = %reference,
                    stale_holder = %current.holder_id,
                    acquired_at = %current.acquired_at,
                    annotation = %self.annotation,
                    "taking over stale lock"
                );
                current.sequence_number + 1
            }
            None => 1,
        };

        let info = self.holder_info(next_sequence, operation);
        match self.write(reference, &info, current_raw).await {
            Ok(()) => {
                tracing::debug!(
                    resource = %reference,
                    owner = %self.owner_id,
                    sequence = info.sequence_number,
                    "lock acquired"
                );
                Ok(Some(info))
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(resource = %reference, "lost lock race");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Takes the lock whether or not someone else holds it.
    ///
    /// Used when this owner has just started the work the lock guards and any
    /// previous holder is working on something superseded. The previous
    /// holder notices on its next check through the bumped sequence number.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist, `Conflict` if the
    /// annotation kept changing under us, or a storage error.
    pub async fn take_over(
        &self,
        reference: &ResourceRef,
        operation: Option<String>,
    ) -> Result<LockInfo> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let resource = self.store.get(reference).await?;
            let current_raw = resource.annotation(&self.annotation).map(str::to_string);
            let previous = self.holder(&resource);
            let next_sequence = previous.as_ref().map_or(1, |p| p.sequence_number + 1);
            let info = self.holder_info(next_sequence, operation.clone());
            match self.write(reference, &info, current_raw).await {
                Ok(()) => {
                    if let Some(previous) = previous.filter(|p| p.holder_id != self.owner_id) {
                        tracing::info!(
                            resource = %reference,
                            previous_holder = %previous.holder_id,
                            annotation = %self.annotation,
                            "lock taken over"
                        );
                    }
                    return Ok(info);
                }
                Err(e) if e.is_conflict() && attempt < TAKE_OVER_ATTEMPTS => {
                    tracing::debug!(resource = %reference, attempt, "lock changed during takeover; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extends the lease of a held lock.
    ///
    /// Returns the refreshed holder value, or `Ok(None)` if the stored lock
    /// is no longer `held`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource is gone, or a storage error.
    pub async fn renew(
        &self,
        reference: &ResourceRef,
        held: &LockInfo,
    ) -> Result<Option<LockInfo>> {
        let renewed = LockInfo {
            acquired_at: Utc::now(),
            ..held.clone()
        };
        match self
            .write(reference, &renewed, Some(serde_json::to_string(held)?))
            .await
        {
            Ok(()) => Ok(Some(renewed)),
            Err(e) if e.is_conflict() => {
                tracing::info!(resource = %reference, annotation = %self.annotation, "lock lost before renewal");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Removes a held lock if the stored value is still exactly `held`.
    ///
    /// Returns `Ok(false)` if the lock was taken over or already removed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource is gone, or a storage error.
    pub async fn release_held(&self, reference: &ResourceRef, held: &LockInfo) -> Result<bool> {
        let precondition = PatchPrecondition::AnnotationEquals {
            key: self.annotation.clone(),
            expected: Some(serde_json::to_string(held)?),
        };
        let patch = ResourcePatch::new().remove_annotation(self.annotation.clone());
        match self.store.patch(reference, patch, precondition).await {
            Ok(_) => {
                tracing::debug!(resource = %reference, owner = %self.owner_id, "lock released");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn holder_info(&self, sequence_number: u64, operation: Option<String>) -> LockInfo {
        LockInfo {
            holder_id: self.owner_id.clone(),
            acquired_at: Utc::now(),
            sequence_number,
            operation,
        }
    }

    async fn write(
        &self,
        reference: &ResourceRef,
        info: &LockInfo,
        expected: Option<String>,
    ) -> Result<()> {
        let patch = ResourcePatch::new()
            .set_annotation(self.annotation.clone(), serde_json::to_string(info)?);
        let precondition = PatchPrecondition::AnnotationEquals {
            key: self.annotation.clone(),
            expected,
        };
        self.store.patch(reference, patch, precondition).await?;
        Ok(())
    }

    /// Releases the lock if this owner still holds it.
    ///
    /// Returns `Ok(false)` if the lock is absent or held by someone else.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource is gone, `Conflict` if the lock
    /// changed between read and release, or a storage error.
    pub async fn try_release(&self, reference: &ResourceRef) -> Result<bool> {
        let resource = self.store.get(reference).await?;
        let Some(raw) = resource.annotation(&self.annotation) else {
            return Ok(false);
        };
        let info = LockInfo::parse(raw, &resource);
        if info.holder_id != self.owner_id {
            tracing::warn!(
                resource = %reference,
                holder = %info.holder_id,
                owner = %self.owner_id,
                "lock no longer held by this owner; not releasing"
            );
            return Ok(false);
        }

        let precondition = PatchPrecondition::AnnotationEquals {
            key: self.annotation.clone(),
            expected: Some(raw.to_string()),
        };
        self.store
            .patch(
                reference,
                ResourcePatch::new().remove_annotation(self.annotation.clone()),
                precondition,
            )
            .await?;
        tracing::debug!(resource = %reference, owner = %self.owner_id, "lock released");
        Ok(true)
    }

    /// Releases the lock, logging and swallowing any failure.
    pub async fn release(&self, reference: &ResourceRef) {
        match self.try_release(reference).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(resource = %reference, "resource gone before lock release");
            }
            Err(e) => {
                tracing::warn!(resource = %reference, error = %e, "failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DEFAULT_NAMESPACE, ResourceType};
    use crate::store::MemoryResourceStore;
    use proptest::prelude::*;
    use serde_json::json;

    async fn store_with(name: &str) -> (Arc<MemoryResourceStore>, ResourceRef) {
        let store = Arc::new(MemoryResourceStore::new());
        let reference = ResourceRef::new(ResourceType::default_backup(), DEFAULT_NAMESPACE, name);
        let resource = Resource::new(&reference, &json!({"guid": name})).expect("resource");
        store.create(resource).await.expect("create");
        (store, reference)
    }

    #[tokio::test]
    async fn second_owner_cannot_acquire_live_lock() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let a = ResourceLock::new(Arc::clone(&store), "a", DEFAULT_LEASE_TIMEOUT);
        let b = ResourceLock::new(Arc::clone(&store), "b", DEFAULT_LEASE_TIMEOUT);

        assert!(a.acquire(&reference).await?);
        assert!(!b.acquire(&reference).await?);
        // A live lock is not re-entrant, even for its holder.
        assert!(!a.acquire(&reference).await?);

        let raw = store.get(&reference).await?;
        let info = LockInfo::parse(raw.annotation(LOCK_ANNOTATION).expect("lock"), &raw);
        assert_eq!(info.holder_id, "a");
        assert_eq!(info.sequence_number, 1);
        Ok(())
    }

    #[tokio::test]
    async fn release_clears_annotation_and_allows_next_owner() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let a = ResourceLock::new(Arc::clone(&store), "a", DEFAULT_LEASE_TIMEOUT);
        let b = ResourceLock::new(Arc::clone(&store), "b", DEFAULT_LEASE_TIMEOUT);

        assert!(a.acquire(&reference).await?);
        assert!(!b.try_release(&reference).await?);
        assert!(a.try_release(&reference).await?);
        assert!(store.get(&reference).await?.annotation(LOCK_ANNOTATION).is_none());
        assert!(b.acquire(&reference).await?);
        Ok(())
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let lease = Duration::from_millis(50);
        let a = ResourceLock::new(Arc::clone(&store), "a", lease);
        let b = ResourceLock::new(Arc::clone(&store), "b", lease);

        assert!(a.acquire(&reference).await?);
        assert!(!b.acquire(&reference).await?);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.acquire(&reference).await?);

        let raw = store.get(&reference).await?;
        let info = LockInfo::parse(raw.annotation(LOCK_ANNOTATION).expect("lock"), &raw);
        assert_eq!(info.holder_id, "b");
        assert_eq!(info.sequence_number, 2);

        // The crashed holder must not clear the new owner's lock.
        assert!(!a.try_release(&reference).await?);
        Ok(())
    }

    #[tokio::test]
    async fn claims_under_other_keys_are_independent() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let lock = ResourceLock::new(Arc::clone(&store), "a", DEFAULT_LEASE_TIMEOUT);
        let poll = ResourceLock::new(Arc::clone(&store), "b", DEFAULT_LEASE_TIMEOUT)
            .with_annotation(POLL_ANNOTATION);

        assert!(lock.acquire(&reference).await?);
        let claim = poll.claim(&reference, Some("create".into())).await?.expect("claim");
        assert_eq!(claim.holder_id, "b");
        assert_eq!(claim.operation.as_deref(), Some("create"));

        let stored = store.get(&reference).await?;
        assert_eq!(poll.holder(&stored), Some(claim.clone()));
        assert_eq!(lock.holder(&stored).map(|h| h.holder_id), Some("a".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn take_over_fences_out_the_previous_holder() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let a = ResourceLock::new(Arc::clone(&store), "a", DEFAULT_LEASE_TIMEOUT)
            .with_annotation(POLL_ANNOTATION);
        let b = ResourceLock::new(Arc::clone(&store), "b", DEFAULT_LEASE_TIMEOUT)
            .with_annotation(POLL_ANNOTATION);

        let held_a = a.claim(&reference, None).await?.expect("claim");
        let held_b = b.take_over(&reference, None).await?;
        assert_eq!(held_b.sequence_number, held_a.sequence_number + 1);
        assert!(!held_a.same_claim(&held_b));

        assert!(a.renew(&reference, &held_a).await?.is_none());
        assert!(!a.release_held(&reference, &held_a).await?);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let renewed = b.renew(&reference, &held_b).await?.expect("renewed");
        assert!(renewed.same_claim(&held_b));
        assert!(renewed.acquired_at >= held_b.acquired_at);
        // Only the latest written value releases.
        assert!(!b.release_held(&reference, &held_b).await?);
        assert!(b.release_held(&reference, &renewed).await?);
        assert!(store.get(&reference).await?.annotation(POLL_ANNOTATION).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn same_owner_take_over_replaces_its_own_claim() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let a = ResourceLock::new(Arc::clone(&store), "a", DEFAULT_LEASE_TIMEOUT)
            .with_annotation(POLL_ANNOTATION);

        let first = a.claim(&reference, Some("create".into())).await?.expect("claim");
        let second = a.take_over(&reference, Some("update".into())).await?;
        assert!(!first.same_claim(&second));
        assert!(!a.release_held(&reference, &first).await?);
        assert_eq!(
            a.holder(&store.get(&reference).await?).and_then(|h| h.operation),
            Some("update".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn legacy_plain_annotation_is_honoured() -> Result<()> {
        let store = Arc::new(MemoryResourceStore::new());
        let reference = ResourceRef::new(ResourceType::default_backup(), DEFAULT_NAMESPACE, "g-1");
        let resource = Resource::new(&reference, &json!({}))?
            .with_annotation(LOCK_ANNOTATION, "10.0.0.7");
        store.create(resource).await?;

        let b = ResourceLock::new(Arc::clone(&store), "b", DEFAULT_LEASE_TIMEOUT);
        assert!(!b.acquire(&reference).await?);
        Ok(())
    }

    #[tokio::test]
    async fn release_of_deleted_resource_is_swallowed() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let a = ResourceLock::new(Arc::clone(&store), "a", DEFAULT_LEASE_TIMEOUT);
        assert!(a.acquire(&reference).await?);
        store.delete(&reference).await?;

        assert!(a.try_release(&reference).await.unwrap_err().is_not_found());
        a.release(&reference).await;
        Ok(())
    }

    #[tokio::test]
    async fn acquire_on_missing_resource_is_not_found() {
        let store = Arc::new(MemoryResourceStore::new());
        let reference = ResourceRef::new(ResourceType::default_backup(), DEFAULT_NAMESPACE, "none");
        let a = ResourceLock::new(store, "a", DEFAULT_LEASE_TIMEOUT);
        assert!(a.acquire(&reference).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn concurrent_acquires_have_one_winner() -> Result<()> {
        let (store, reference) = store_with("g-1").await;
        let mut handles = Vec::new();
        for i in 0..16 {
            let lock = ResourceLock::new(Arc::clone(&store), format!("owner-{i}"), DEFAULT_LEASE_TIMEOUT);
            let reference = reference.clone();
            handles.push(tokio::spawn(async move { lock.acquire(&reference).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join")? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }

    proptest! {
        #[test]
        fn at_most_one_live_holder(ops in proptest::collection::vec((0usize..3, any::<bool>()), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                let (store, reference) = store_with("g-prop").await;
                let locks: Vec<_> = (0..3)
                    .map(|i| ResourceLock::new(Arc::clone(&store), format!("o{i}"), DEFAULT_LEASE_TIMEOUT))
                    .collect();
                let mut holder: Option<usize> = None;
                for (owner, acquire) in ops {
                    if acquire {
                        let won = locks[owner].acquire(&reference).await.expect("acquire");
                        prop_assert_eq!(won, holder.is_none());
                        if won {
                            holder = Some(owner);
                        }
                    } else {
                        let released = locks[owner].try_release(&reference).await.expect("release");
                        prop_assert_eq!(released, holder == Some(owner));
                        if released {
                            holder = None;
                        }
                    }
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
