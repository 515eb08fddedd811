use std::sync::{Arc, RwLock};

use rollcall_core::{EmbeddingError, Gallery, Identity};

use crate::store::{AttendanceStore, StoreError};

/// Enrollment mutation pushed by the enrollment collaborator.
#[derive(Debug, Clone)]
pub enum RosterEvent {
    /// New or re-enrolled identity. Inactive identities are removed from
    /// the gallery.
    Enrolled(Identity),
    Deactivated(String),
}

/// Copy-on-write snapshot of the active gallery.
///
/// Matchers take an `Arc<Gallery>` and keep it for the whole comparison.
/// Updates build a fresh gallery and swap the pointer, so a match started
/// before an enrollment change never sees a half-applied update.
pub struct Roster {
    current: RwLock<Arc<Gallery>>,
}

impl Roster {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    pub fn empty(dim: usize) -> Result<Self, EmbeddingError> {
        Ok(Self::new(Gallery::new(dim)?))
    }

    /// Build from the active identities currently in the store.
    pub async fn load(store: &AttendanceStore) -> Result<Self, StoreError> {
        let identities = store.active_identities().await?;
        let gallery = Gallery::from_identities(store.embedding_dim(), &identities)?;
        tracing::info!(identities = gallery.len(), "roster loaded");
        Ok(Self::new(gallery))
    }

    /// Current gallery. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.current.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// Replace the gallery with the store's current active identities.
    pub async fn reload(&self, store: &AttendanceStore) -> Result<usize, StoreError> {
        let identities = store.active_identities().await?;
        let gallery = Gallery::from_identities(store.embedding_dim(), &identities)?;
        let count = gallery.len();
        self.swap(gallery);
        tracing::debug!(identities = count, "roster reloaded");
        Ok(count)
    }

    /// Apply one enrollment mutation on top of the current snapshot.
    ///
    /// The write lock is held while the next gallery is built, so concurrent
    /// mutations never drop each other's updates.
    pub fn apply(&self, event: RosterEvent) -> Result<(), EmbeddingError> {
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        let mut next = Gallery::clone(&guard);
        match event {
            RosterEvent::Enrolled(identity) if identity.active => {
                next.insert(
                    &identity.identity_id,
                    &identity.display_name,
                    identity.embedding,
                )?;
                tracing::info!(identity_id = %identity.identity_id, "roster: identity enrolled");
            }
            RosterEvent::Enrolled(identity) => {
                next.remove(&identity.identity_id);
                tracing::info!(identity_id = %identity.identity_id, "roster: inactive identity enrolled");
            }
            RosterEvent::Deactivated(identity_id) => {
                if next.remove(&identity_id).is_none() {
                    tracing::debug!(identity_id = %identity_id, "roster: deactivate of unknown identity");
                    return Ok(());
                }
                tracing::info!(identity_id = %identity_id, "roster: identity deactivated");
            }
        }
        *guard = Arc::new(next);
        Ok(())
    }

    fn swap(&self, gallery: Gallery) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(gallery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_core::Embedding;
    use std::path::Path;

    fn identity(id: &str, values: Vec<f32>, active: bool) -> Identity {
        Identity {
            identity_id: id.to_string(),
            display_name: format!("Student {id}"),
            embedding: Embedding::new(values),
            enrolled_at: Utc::now(),
            active,
        }
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let roster = Roster::empty(2).unwrap();
        let before = roster.snapshot();

        roster
            .apply(RosterEvent::Enrolled(identity("S1", vec![1.0, 0.0], true)))
            .unwrap();

        assert!(before.is_empty());
        assert_eq!(roster.snapshot().len(), 1);
    }

    #[test]
    fn test_deactivate_removes_from_gallery() {
        let roster = Roster::empty(2).unwrap();
        roster
            .apply(RosterEvent::Enrolled(identity("S1", vec![1.0, 0.0], true)))
            .unwrap();
        roster
            .apply(RosterEvent::Deactivated("S1".to_string()))
            .unwrap();
        assert!(roster.snapshot().get("S1").is_none());

        // Unknown ids are a no-op.
        roster
            .apply(RosterEvent::Deactivated("S9".to_string()))
            .unwrap();
    }

    #[test]
    fn test_inactive_enrollment_not_matchable() {
        let roster = Roster::empty(2).unwrap();
        roster
            .apply(RosterEvent::Enrolled(identity("S1", vec![1.0, 0.0], false)))
            .unwrap();
        assert!(roster.snapshot().is_empty());
    }

    #[test]
    fn test_bad_enrollment_leaves_snapshot_untouched() {
        let roster = Roster::empty(2).unwrap();
        let err = roster
            .apply(RosterEvent::Enrolled(identity("S1", vec![1.0], true)))
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Dimension { .. }));
        assert!(roster.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let store = AttendanceStore::open(Path::new(":memory:"), 2)
            .await
            .unwrap();
        store
            .enroll(&identity("S1", vec![1.0, 0.0], true))
            .await
            .unwrap();
        store
            .enroll(&identity("S2", vec![0.0, 1.0], false))
            .await
            .unwrap();

        let roster = Roster::load(&store).await.unwrap();
        assert_eq!(roster.snapshot().len(), 1);

        store.set_active("S2", true).await.unwrap();
        assert_eq!(roster.reload(&store).await.unwrap(), 2);
    }
}
