//! Reconciler: binds on-chain project ids to off-chain records and drives
//! the off-chain status from on-chain confirmations.
//!
//! Every method is idempotent. Replaying an event that was already applied
//! returns [`ReconcileOutcome::AlreadyApplied`] and writes nothing.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::SyncError;
use crate::store::ProjectStore;
use crate::types::{normalize_address, Project, ProjectStatus};

/// Fragment prefix that carries the off-chain id through `submitProject`.
pub const BINDING_TAG_PREFIX: &str = "registrysync:";

const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Result of applying one reconciliation effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// State changed.
    Applied,
    /// Target state was already reached.
    AlreadyApplied,
    /// No matching off-chain project. Logged, not an error.
    NotFound,
}

/// Append `#registrysync:<id>` to a metadata URI, replacing an existing tag.
pub fn tagged_metadata_uri(uri: &str, project_id: Uuid) -> String {
    format!(
        "{}#{BINDING_TAG_PREFIX}{}",
        strip_binding_tag(uri),
        project_id.as_hyphenated()
    )
}

/// The off-chain id carried by a tagged metadata URI, if any.
pub fn parse_binding_tag(uri: &str) -> Option<Uuid> {
    let (_, fragment) = uri.rsplit_once('#')?;
    let raw = fragment.strip_prefix(BINDING_TAG_PREFIX)?;
    Uuid::parse_str(raw).ok()
}

/// The metadata URI without its binding tag.
pub fn strip_binding_tag(uri: &str) -> &str {
    match uri.rsplit_once('#') {
        Some((base, fragment)) if fragment.starts_with(BINDING_TAG_PREFIX) => base,
        _ => uri,
    }
}

/// What a binding tag resolved to.
enum TagMatch {
    /// No tag, or the tag names no known project.
    Untagged,
    Bindable(Project),
    /// The named project is bound, not bindable, or owned by someone else.
    Rejected(Project),
}

pub struct Reconciler<S> {
    store: Arc<S>,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ProjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Bind `on_chain_id` to an off-chain project.
    ///
    /// The binding tag in `metadata_uri` is tried first. A tag naming a known
    /// project decides the outcome on its own: if that project cannot take the
    /// id the event is dropped. Without a tag (or with a tag naming no known
    /// project) the most recently created unbound Submitted/Approved project
    /// of `owner` is chosen. No candidate is a logged
    /// [`ReconcileOutcome::NotFound`].
    pub async fn bind_project(
        &self,
        on_chain_id: u64,
        owner: &str,
        metadata_uri: &str,
    ) -> Result<ReconcileOutcome, SyncError> {
        if let Some(bound) = self.store.project_by_on_chain_id(on_chain_id).await? {
            tracing::debug!(
                on_chain_id,
                project = %bound.id,
                "On-chain id already bound"
            );
            return Ok(ReconcileOutcome::AlreadyApplied);
        }

        let owner = normalize_address(owner);
        let candidate = match self.tagged_candidate(&owner, metadata_uri).await? {
            TagMatch::Bindable(p) => Some(p),
            TagMatch::Untagged => self.store.bind_candidate(&owner).await?,
            TagMatch::Rejected(p) => {
                // A repeated submit of an already bound project lands here.
                tracing::warn!(
                    on_chain_id,
                    project = %p.id,
                    owner = %owner,
                    bound_to = ?p.on_chain_project_id,
                    status = %p.status,
                    "Binding tag names a project that cannot take this id; event dropped"
                );
                return Ok(ReconcileOutcome::NotFound);
            }
        };
        let Some(candidate) = candidate else {
            tracing::warn!(
                on_chain_id,
                owner = %owner,
                "No off-chain project to bind; event dropped"
            );
            return Ok(ReconcileOutcome::NotFound);
        };

        let uri = strip_binding_tag(metadata_uri);
        let uri = candidate.metadata_uri.is_none().then_some(uri);
        if self
            .store
            .bind_on_chain_id(candidate.id, on_chain_id, uri)
            .await?
        {
            tracing::info!(on_chain_id, project = %candidate.id, "Project bound");
            return Ok(ReconcileOutcome::Applied);
        }

        // Lost a race: either another writer bound this id, or the candidate
        // was bound to a different id in between.
        if self
            .store
            .project_by_on_chain_id(on_chain_id)
            .await?
            .is_some()
        {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }
        let actual = match self.store.project(candidate.id).await? {
            Some(p) => p
                .on_chain_project_id
                .map_or_else(|| "unbound".to_string(), |id| format!("bound to {id}")),
            None => "missing".to_string(),
        };
        Err(SyncError::Conflict {
            project_id: candidate.id,
            expected: "unbound".into(),
            actual,
        })
    }

    async fn tagged_candidate(
        &self,
        owner: &str,
        metadata_uri: &str,
    ) -> Result<TagMatch, SyncError> {
        let Some(id) = parse_binding_tag(metadata_uri) else {
            return Ok(TagMatch::Untagged);
        };
        let Some(project) = self.store.project(id).await? else {
            tracing::warn!(
                project = %id,
                owner = %owner,
                "Binding tag names an unknown project; falling back to owner match"
            );
            return Ok(TagMatch::Untagged);
        };
        if project.on_chain_project_id.is_none()
            && project.status.is_bindable()
            && project.is_owned_by(owner)
        {
            Ok(TagMatch::Bindable(project))
        } else {
            Ok(TagMatch::Rejected(project))
        }
    }

    /// Force the bound project to Approved.
    ///
    /// Uses conditional writes guarded by the observed status and retries a
    /// few times when a concurrent writer moves the status in between.
    pub async fn mark_approved_on_chain(
        &self,
        on_chain_id: u64,
    ) -> Result<ReconcileOutcome, SyncError> {
        let Some(mut project) = self.store.project_by_on_chain_id(on_chain_id).await? else {
            tracing::warn!(on_chain_id, "Approval for unbound on-chain id; nothing to update");
            return Ok(ReconcileOutcome::NotFound);
        };

        for _ in 0..STATUS_WRITE_ATTEMPTS {
            if project.status == ProjectStatus::Approved {
                return Ok(ReconcileOutcome::AlreadyApplied);
            }
            if self
                .store
                .update_status(project.id, project.status, ProjectStatus::Approved)
                .await?
            {
                tracing::info!(
                    on_chain_id,
                    project = %project.id,
                    from = %project.status,
                    "Project approved on-chain"
                );
                return Ok(ReconcileOutcome::Applied);
            }
            project = self
                .store
                .project(project.id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("project {}", project.id)))?;
        }

        Err(SyncError::Conflict {
            project_id: project.id,
            expected: project.status.to_string(),
            actual: "concurrently modified".into(),
        })
    }

    /// Record the minted certificate on the bound project.
    ///
    /// An unbound id is a logged gap; a repair read can fill it later.
    pub async fn record_certificate(
        &self,
        on_chain_id: u64,
        token_id: u64,
        contract: &str,
    ) -> Result<ReconcileOutcome, SyncError> {
        let Some(project) = self.store.project_by_on_chain_id(on_chain_id).await? else {
            tracing::warn!(
                on_chain_id,
                token_id,
                "Certificate for unbound on-chain id; left for repair"
            );
            return Ok(ReconcileOutcome::NotFound);
        };

        if project.certificate_token_id == Some(token_id) {
            return Ok(ReconcileOutcome::AlreadyApplied);
        }
        if self
            .store
            .set_certificate(project.id, token_id, contract)
            .await?
        {
            tracing::info!(
                on_chain_id,
                project = %project.id,
                token_id,
                "Certificate recorded"
            );
            Ok(ReconcileOutcome::Applied)
        } else {
            tracing::warn!(
                on_chain_id,
                project = %project.id,
                token_id,
                existing = ?project.certificate_token_id,
                "Project already holds a different certificate"
            );
            Ok(ReconcileOutcome::AlreadyApplied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    async fn setup(projects: &[&Project]) -> (Arc<MemoryStore>, Reconciler<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for p in projects {
            store.insert_project(p).await.unwrap();
        }
        (store.clone(), Reconciler::new(store))
    }

    #[test]
    fn binding_tag_roundtrip() {
        let id = Uuid::new_v4();
        let tagged = tagged_metadata_uri("ipfs://x", id);
        assert_eq!(parse_binding_tag(&tagged), Some(id));
        assert_eq!(strip_binding_tag(&tagged), "ipfs://x");
        // Re-tagging replaces rather than stacks.
        assert_eq!(tagged_metadata_uri(&tagged, id), tagged);
        assert_eq!(parse_binding_tag("ipfs://x#other"), None);
        assert_eq!(strip_binding_tag("ipfs://x#other"), "ipfs://x#other");
    }

    #[tokio::test]
    async fn binds_single_candidate() {
        let p = Project::new("0xABC", ProjectStatus::Submitted);
        let other = Project::new("0xdef", ProjectStatus::Submitted);
        let (store, rec) = setup(&[&p, &other]).await;

        let outcome = rec.bind_project(42, "0xabc", "ipfs://x").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let bound = store.project(p.id).await.unwrap().unwrap();
        assert_eq!(bound.on_chain_project_id, Some(42));
        assert_eq!(bound.metadata_uri.as_deref(), Some("ipfs://x"));
        let untouched = store.project(other.id).await.unwrap().unwrap();
        assert_eq!(untouched.on_chain_project_id, None);

        assert_eq!(
            rec.bind_project(42, "0xabc", "ipfs://x").await.unwrap(),
            ReconcileOutcome::AlreadyApplied
        );
    }

    #[tokio::test]
    async fn second_tagged_submit_does_not_bind_another_project() {
        let older = Project::new("0xabc", ProjectStatus::Submitted);
        let mut resubmitted = Project::new("0xabc", ProjectStatus::Submitted);
        resubmitted.created_at = older.created_at + chrono::Duration::seconds(10);
        let (store, rec) = setup(&[&older, &resubmitted]).await;

        let uri = tagged_metadata_uri("ipfs://a", resubmitted.id);
        assert_eq!(
            rec.bind_project(41, "0xabc", &uri).await.unwrap(),
            ReconcileOutcome::Applied
        );
        assert_eq!(
            rec.bind_project(42, "0xabc", &uri).await.unwrap(),
            ReconcileOutcome::NotFound
        );

        let bound = store.project(resubmitted.id).await.unwrap().unwrap();
        assert_eq!(bound.on_chain_project_id, Some(41));
        let untouched = store.project(older.id).await.unwrap().unwrap();
        assert_eq!(untouched.on_chain_project_id, None);
        assert!(store.project_by_on_chain_id(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tag_for_foreign_project_is_dropped() {
        let foreign = Project::new("0xdef", ProjectStatus::Submitted);
        let own = Project::new("0xabc", ProjectStatus::Submitted);
        let (store, rec) = setup(&[&foreign, &own]).await;

        let uri = tagged_metadata_uri("ipfs://a", foreign.id);
        assert_eq!(
            rec.bind_project(9, "0xabc", &uri).await.unwrap(),
            ReconcileOutcome::NotFound
        );
        assert_eq!(store.project(own.id).await.unwrap().unwrap().on_chain_project_id, None);
    }

    #[tokio::test]
    async fn unknown_tag_falls_back_to_owner() {
        let own = Project::new("0xabc", ProjectStatus::Submitted);
        let (store, rec) = setup(&[&own]).await;

        let uri = tagged_metadata_uri("ipfs://a", Uuid::new_v4());
        assert_eq!(
            rec.bind_project(5, "0xabc", &uri).await.unwrap(),
            ReconcileOutcome::Applied
        );
        assert_eq!(store.project(own.id).await.unwrap().unwrap().on_chain_project_id, Some(5));
    }

    #[tokio::test]
    async fn tag_wins_over_recency() {
        let tagged = Project::new("0xabc", ProjectStatus::Submitted);
        let mut newer = Project::new("0xabc", ProjectStatus::Submitted);
        newer.created_at = tagged.created_at + chrono::Duration::seconds(10);
        let (store, rec) = setup(&[&tagged, &newer]).await;

        let uri = tagged_metadata_uri("ipfs://a", tagged.id);
        rec.bind_project(7, "0xabc", &uri).await.unwrap();

        assert_eq!(
            store.project_by_on_chain_id(7).await.unwrap().unwrap().id,
            tagged.id
        );
    }

    #[tokio::test]
    async fn no_candidate_is_not_found() {
        let draft = Project::new("0xabc", ProjectStatus::Draft);
        let (_, rec) = setup(&[&draft]).await;
        assert_eq!(
            rec.bind_project(1, "0xabc", "ipfs://x").await.unwrap(),
            ReconcileOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn approval_is_idempotent_and_forward_only() {
        let p = Project::new("0xabc", ProjectStatus::Submitted);
        let (store, rec) = setup(&[&p]).await;
        rec.bind_project(42, "0xabc", "ipfs://x").await.unwrap();

        assert_eq!(
            rec.mark_approved_on_chain(42).await.unwrap(),
            ReconcileOutcome::Applied
        );
        assert_eq!(
            rec.mark_approved_on_chain(42).await.unwrap(),
            ReconcileOutcome::AlreadyApplied
        );
        assert_eq!(
            store.project(p.id).await.unwrap().unwrap().status,
            ProjectStatus::Approved
        );
        assert_eq!(
            rec.mark_approved_on_chain(99).await.unwrap(),
            ReconcileOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn certificate_recorded_once() {
        let p = Project::new("0xabc", ProjectStatus::Approved);
        let (store, rec) = setup(&[&p]).await;
        rec.bind_project(42, "0xabc", "ipfs://x").await.unwrap();

        assert_eq!(
            rec.record_certificate(42, 3, "0xCERT").await.unwrap(),
            ReconcileOutcome::Applied
        );
        assert_eq!(
            rec.record_certificate(42, 3, "0xcert").await.unwrap(),
            ReconcileOutcome::AlreadyApplied
        );
        assert_eq!(
            rec.record_certificate(42, 4, "0xcert").await.unwrap(),
            ReconcileOutcome::AlreadyApplied
        );
        let stored = store.project(p.id).await.unwrap().unwrap();
        assert_eq!(stored.certificate_token_id, Some(3));
        assert_eq!(
            rec.record_certificate(77, 1, "0xcert").await.unwrap(),
            ReconcileOutcome::NotFound
        );
    }
}
