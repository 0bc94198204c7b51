//! Registration orchestrator.
//!
//! Drives the multi-transaction sequence that takes an approved off-chain
//! project to a minted on-chain certificate:
//!
//! ```text
//! no on-chain id ──submit──▶ Pending ──approve (curator)──▶ Approved ──mint──▶ certificate
//! ```
//!
//! Chain state is re-read before every decision, so a sequence interrupted at
//! any point resumes with the same next action a fresh call would produce.
//! The orchestrator never signs or broadcasts; it returns [`TxDescriptor`]s.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AggregateEngine;
use crate::error::SyncError;
use crate::reconciler::{tagged_metadata_uri, ReconcileOutcome, Reconciler};
use crate::store::{FundingStore, ProjectStore, RatingStore};
use crate::types::{
    normalize_address, FundingAggregate, OnChainProject, OnChainStatus, Project, RatingAggregate,
    TxDescriptor,
};

/// Point-in-time reads of registry and token state.
#[async_trait]
pub trait ProjectStateReader: Send + Sync {
    /// `None` when the registry has no project with this id.
    async fn read_project_state(&self, on_chain_id: u64)
        -> Result<Option<OnChainProject>, SyncError>;

    /// ERC-20 allowance granted by `owner` to `spender`.
    async fn allowance(&self, owner: &str, spender: &str) -> Result<u128, SyncError>;
}

/// Builds unsigned transactions for the registry and the donation token.
pub trait TxEncoder: Send + Sync {
    fn submit_project(&self, metadata_uri: &str) -> Result<TxDescriptor, SyncError>;
    fn approve_project(&self, on_chain_id: u64) -> Result<TxDescriptor, SyncError>;
    fn mint_certificate(&self, on_chain_id: u64) -> Result<TxDescriptor, SyncError>;
    fn approve_token(&self, spender: &str, amount: u128) -> Result<TxDescriptor, SyncError>;
    fn donate(&self, on_chain_id: u64, amount: u128) -> Result<TxDescriptor, SyncError>;
    fn registry_address(&self) -> &str;
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub wallet: String,
    pub is_curator: bool,
}

impl Actor {
    pub fn owner(wallet: &str) -> Self {
        Self {
            wallet: normalize_address(wallet),
            is_curator: false,
        }
    }

    pub fn curator(wallet: &str) -> Self {
        Self {
            wallet: normalize_address(wallet),
            is_curator: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Submit,
    Approve,
    Mint,
}

/// The next action in a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrationStep {
    /// Sign and send `tx`.
    Transaction { kind: StepKind, tx: TxDescriptor },
    /// Pending on-chain; only a curator can move it forward.
    AwaitingCuratorApproval { on_chain_project_id: u64 },
}

/// Result of [`RegistrationOrchestrator::observe_mined`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: StepKind,
    /// Whether the step's effect is visible in chain/off-chain state.
    pub confirmed: bool,
    /// `None` once the project holds a certificate.
    pub next: Option<RegistrationStep>,
}

/// Result of [`RegistrationOrchestrator::repair`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub project_id: Uuid,
    pub on_chain_project_id: u64,
    pub on_chain_status: OnChainStatus,
    pub status_updated: bool,
    pub certificate_recorded: bool,
    pub ratings: RatingAggregate,
    pub funding: FundingAggregate,
}

/// Result of [`RegistrationOrchestrator::plan_donation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationPlan {
    /// Current allowance of the funder towards the registry.
    pub allowance: u128,
    /// ERC-20 `approve`, present only when the allowance is insufficient.
    pub approve: Option<TxDescriptor>,
    pub donate: TxDescriptor,
}

pub struct RegistrationOrchestrator<S, R, E> {
    store: Arc<S>,
    reader: Arc<R>,
    encoder: Arc<E>,
    reconciler: Reconciler<S>,
    engine: AggregateEngine<S>,
    certificate_contract: String,
}

impl<S, R, E> RegistrationOrchestrator<S, R, E>
where
    S: ProjectStore + RatingStore + FundingStore,
    R: ProjectStateReader,
    E: TxEncoder,
{
    pub fn new(
        store: Arc<S>,
        reader: Arc<R>,
        encoder: Arc<E>,
        certificate_contract: &str,
        token_decimals: u8,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&store)),
            engine: AggregateEngine::new(Arc::clone(&store), token_decimals),
            store,
            reader,
            encoder,
            certificate_contract: normalize_address(certificate_contract),
        }
    }

    /// Decide the next registration step for `project_id`.
    ///
    /// Errors: `NotFound`, `AlreadyRegistered`, `InvalidStatus`,
    /// `Unauthorized`, and `Conflict` when syncing the off-chain status loses
    /// a race.
    pub async fn next_step(
        &self,
        project_id: Uuid,
        actor: &Actor,
    ) -> Result<RegistrationStep, SyncError> {
        let project = self.load(project_id).await?;
        ensure_not_registered(&project)?;
        authorize(&project, actor)?;
        if !project.status.is_bindable() {
            return Err(SyncError::InvalidStatus {
                operation: "register",
                reason: format!("project is {}", project.status),
            });
        }

        let Some(on_chain_id) = project.on_chain_project_id else {
            return self.submit_step(&project, actor);
        };

        let state = self.read_state(on_chain_id).await?;
        match state.status {
            OnChainStatus::Pending if actor.is_curator => Ok(RegistrationStep::Transaction {
                kind: StepKind::Approve,
                tx: self.encoder.approve_project(on_chain_id)?,
            }),
            OnChainStatus::Pending => Ok(RegistrationStep::AwaitingCuratorApproval {
                on_chain_project_id: on_chain_id,
            }),
            OnChainStatus::Approved => {
                self.reconciler.mark_approved_on_chain(on_chain_id).await?;
                if let Some(token_id) = state.certificate_token_id {
                    // Minted but the event was missed; record it now.
                    self.reconciler
                        .record_certificate(on_chain_id, token_id, &self.certificate_contract)
                        .await?;
                    return Err(SyncError::AlreadyRegistered {
                        project_id,
                        token_id,
                    });
                }
                Ok(RegistrationStep::Transaction {
                    kind: StepKind::Mint,
                    tx: self.encoder.mint_certificate(on_chain_id)?,
                })
            }
            OnChainStatus::Rejected | OnChainStatus::None => Err(SyncError::InvalidStatus {
                operation: "register",
                reason: format!("on-chain project {on_chain_id} is {}", state.status),
            }),
        }
    }

    fn submit_step(&self, project: &Project, actor: &Actor) -> Result<RegistrationStep, SyncError> {
        if !project.is_owned_by(&actor.wallet) {
            return Err(SyncError::Unauthorized(
                "only the project owner can submit it on-chain".into(),
            ));
        }
        let uri = project
            .metadata_uri
            .as_deref()
            .ok_or_else(|| SyncError::InvalidStatus {
                operation: "submit",
                reason: "project has no metadata URI".into(),
            })?;
        Ok(RegistrationStep::Transaction {
            kind: StepKind::Submit,
            tx: self
                .encoder
                .submit_project(&tagged_metadata_uri(uri, project.id))?,
        })
    }

    /// Bind the on-chain id reported from a submit receipt.
    ///
    /// The registry must list the project's owner as the on-chain owner. Uses
    /// the same conditional write as the indexer, so either path may win.
    pub async fn confirm_submission(
        &self,
        project_id: Uuid,
        on_chain_id: u64,
        actor: &Actor,
    ) -> Result<ReconcileOutcome, SyncError> {
        let project = self.load(project_id).await?;
        authorize(&project, actor)?;
        match project.on_chain_project_id {
            Some(id) if id == on_chain_id => return Ok(ReconcileOutcome::AlreadyApplied),
            Some(id) => {
                return Err(SyncError::Conflict {
                    project_id,
                    expected: format!("bound to {on_chain_id}"),
                    actual: format!("bound to {id}"),
                })
            }
            None => {}
        }

        let state = self.read_state(on_chain_id).await?;
        if !project.is_owned_by(&state.owner) {
            return Err(SyncError::Unauthorized(format!(
                "on-chain project {on_chain_id} belongs to {}",
                state.owner
            )));
        }

        if self
            .store
            .bind_on_chain_id(project_id, on_chain_id, None)
            .await?
        {
            tracing::info!(on_chain_id, project = %project_id, "Submission confirmed");
            return Ok(ReconcileOutcome::Applied);
        }
        match self.store.project_by_on_chain_id(on_chain_id).await? {
            Some(p) if p.id == project_id => Ok(ReconcileOutcome::AlreadyApplied),
            Some(p) => Err(SyncError::Conflict {
                project_id,
                expected: "unbound".into(),
                actual: format!("on-chain id held by {}", p.id),
            }),
            None => Err(SyncError::Conflict {
                project_id,
                expected: "unbound".into(),
                actual: "bound concurrently".into(),
            }),
        }
    }

    /// Re-read state after the caller saw `step` mined and report whether its
    /// effect is visible, plus the next action.
    pub async fn observe_mined(
        &self,
        project_id: Uuid,
        step: StepKind,
        actor: &Actor,
    ) -> Result<StepReport, SyncError> {
        let project = self.load(project_id).await?;
        authorize(&project, actor)?;

        let confirmed = match (step, project.on_chain_project_id) {
            (StepKind::Submit, id) => id.is_some(),
            (_, None) => false,
            (StepKind::Approve, Some(id)) => {
                self.read_state(id).await?.status == OnChainStatus::Approved
            }
            (StepKind::Mint, Some(id)) => self.read_state(id).await?.certificate_token_id.is_some(),
        };
        if !confirmed {
            tracing::warn!(project = %project_id, ?step, "Mined step not visible yet");
        }

        let next = match self.next_step(project_id, actor).await {
            Ok(step) => Some(step),
            Err(SyncError::AlreadyRegistered { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(StepReport {
            step,
            confirmed,
            next,
        })
    }

    /// Manual repair read: pull on-chain status and certificate into the
    /// off-chain row and recompute both aggregates.
    pub async fn repair(&self, project_id: Uuid) -> Result<RepairReport, SyncError> {
        let project = self.load(project_id).await?;
        let on_chain_id = project
            .on_chain_project_id
            .ok_or_else(|| SyncError::InvalidStatus {
                operation: "repair",
                reason: "project is not bound to an on-chain id".into(),
            })?;
        let state = self.read_state(on_chain_id).await?;

        let status_updated = state.status == OnChainStatus::Approved
            && self.reconciler.mark_approved_on_chain(on_chain_id).await?
                == ReconcileOutcome::Applied;
        let certificate_recorded = match state.certificate_token_id {
            Some(token_id) => {
                self.reconciler
                    .record_certificate(on_chain_id, token_id, &self.certificate_contract)
                    .await?
                    == ReconcileOutcome::Applied
            }
            None => false,
        };

        let ratings = self.engine.recompute_ratings(on_chain_id).await?;
        let funding = self.engine.recompute_funding(on_chain_id).await?;
        if ratings.count != state.rating_count || funding.total_base_units != state.total_donated
        {
            tracing::warn!(
                project = %project_id,
                on_chain_id,
                local_ratings = ratings.count,
                chain_ratings = state.rating_count,
                local_funding = %funding.total_base_units,
                chain_funding = %state.total_donated,
                "Local aggregates differ from on-chain totals"
            );
        }

        Ok(RepairReport {
            project_id,
            on_chain_project_id: on_chain_id,
            on_chain_status: state.status,
            status_updated,
            certificate_recorded,
            ratings,
            funding,
        })
    }

    /// Donation pre-flight: check the funder's allowance and build the
    /// transactions needed to fund `amount` base units.
    pub async fn plan_donation(
        &self,
        project_id: Uuid,
        funder: &str,
        amount: u128,
    ) -> Result<DonationPlan, SyncError> {
        if amount == 0 {
            return Err(SyncError::InvalidStatus {
                operation: "donate",
                reason: "amount must be positive".into(),
            });
        }
        let project = self.load(project_id).await?;
        let on_chain_id = project
            .on_chain_project_id
            .ok_or_else(|| SyncError::InvalidStatus {
                operation: "donate",
                reason: "project is not registered on-chain".into(),
            })?;
        let state = self.read_state(on_chain_id).await?;
        if state.status != OnChainStatus::Approved {
            return Err(SyncError::InvalidStatus {
                operation: "donate",
                reason: format!("on-chain project {on_chain_id} is {}", state.status),
            });
        }

        let spender = self.encoder.registry_address();
        let allowance = self
            .reader
            .allowance(&normalize_address(funder), spender)
            .await?;
        let approve = if allowance < amount {
            Some(self.encoder.approve_token(spender, amount)?)
        } else {
            None
        };
        Ok(DonationPlan {
            allowance,
            approve,
            donate: self.encoder.donate(on_chain_id, amount)?,
        })
    }

    async fn load(&self, project_id: Uuid) -> Result<Project, SyncError> {
        self.store
            .project(project_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))
    }

    async fn read_state(&self, on_chain_id: u64) -> Result<OnChainProject, SyncError> {
        self.reader
            .read_project_state(on_chain_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("on-chain project {on_chain_id}")))
    }
}

fn ensure_not_registered(project: &Project) -> Result<(), SyncError> {
    match project.certificate_token_id {
        Some(token_id) => Err(SyncError::AlreadyRegistered {
            project_id: project.id,
            token_id,
        }),
        None => Ok(()),
    }
}

fn authorize(project: &Project, actor: &Actor) -> Result<(), SyncError> {
    if actor.is_curator || project.is_owned_by(&actor.wallet) {
        Ok(())
    } else {
        Err(SyncError::Unauthorized(format!(
            "{} is neither the owner nor a curator",
            actor.wallet
        )))
    }
}
