use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{ClientSession, Database};

use crate::account::{Amount, LedgerMove};
use crate::assignment::AssignmentStatus;
use crate::campaign::{CampaignId, CampaignTerms};
use crate::database::memory::{sorted, MemoryState};
use crate::database::{
    bson_now, is_duplicate_key, return_updated, MemoryDatabase,
    MongoDatabase,
};
use crate::error::Error;
use crate::evidence::Evidence;
use crate::user::UserId;

use super::{
    InstallmentProof, InstallmentProofId, ProofPeriod, ProofStatus, WeeklyProof, WeeklyProofId,
    WeeklyProofStatus,
};

pub const INSTALLMENT_PROOFS: &str = "installment_proofs";
pub const WEEKLY_PROOFS: &str = "weekly_proofs";

pub async fn initialize(db: &Database) -> Result<(), Error> {
    db.run_command(
        bson::doc! {
            "createIndexes": INSTALLMENT_PROOFS,
            "indexes": [
                {
                    "key": { "campaign_id": 1, "driver_id": 1 },
                    "name": "campaign_id_1_driver_id_1",
                    "unique": true,
                },
                { "key": { "status": 1 }, "name": "status_1" },
            ],
        },
        None,
    )
    .await?;

    db.run_command(
        bson::doc! {
            "createIndexes": WEEKLY_PROOFS,
            "indexes": [
                {
                    "key": {
                        "campaign_id": 1,
                        "driver_id": 1,
                        "period.year": 1,
                        "period.week": 1,
                    },
                    "name": "campaign_id_1_driver_id_1_period_1",
                    "unique": true,
                },
                { "key": { "status": 1 }, "name": "status_1" },
            ],
        },
        None,
    )
    .await?;

    Ok(())
}

/// The outcome of storing a submission over a possibly existing one.
#[derive(Clone, Debug)]
pub struct Resubmission<T> {
    pub proof: T,
    /// Evidence of the submission that was overwritten, if any.
    pub replaced: Option<Evidence>,
}

#[async_trait]
pub trait InstallmentProofStore: Send + Sync {
    /// Inserts the proof, or overwrites the pair's existing one with its
    /// evidence and resets it to pending. Fails with
    /// `InstallmentProofAlreadyApproved` if the existing one is approved.
    async fn upsert_installment_proof(
        &self,
        proof: &InstallmentProof,
    ) -> Result<Resubmission<InstallmentProof>, Error>;

    async fn fetch_installment_proof_by_id(
        &self,
        proof_id: InstallmentProofId,
    ) -> Result<Option<InstallmentProof>, Error>;

    async fn fetch_installment_proof_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Option<InstallmentProof>, Error>;

    async fn fetch_installment_proofs_by_status(
        &self,
        status: ProofStatus,
    ) -> Result<Vec<InstallmentProof>, Error>;

    /// pending_approval -> `to`. `None` if it is no longer pending.
    async fn review_installment_proof(
        &self,
        proof_id: InstallmentProofId,
        to: ProofStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<InstallmentProof>, Error>;
}

#[async_trait]
pub trait WeeklyProofStore: Send + Sync {
    /// Fails with `WeeklyProofAlreadySubmitted` if the pair already has a
    /// proof for the period.
    async fn insert_weekly_proof(&self, proof: &WeeklyProof) -> Result<(), Error>;

    async fn fetch_weekly_proof_by_id(
        &self,
        proof_id: WeeklyProofId,
    ) -> Result<Option<WeeklyProof>, Error>;

    async fn fetch_weekly_proof_by_period(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
        period: ProofPeriod,
    ) -> Result<Option<WeeklyProof>, Error>;

    async fn fetch_weekly_proofs_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Vec<WeeklyProof>, Error>;

    async fn fetch_weekly_proofs_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<WeeklyProof>, Error>;

    /// Swaps in new evidence and resets the proof to pending unless it was
    /// approved in the meantime. `None` if it was.
    async fn replace_weekly_evidence(
        &self,
        proof_id: WeeklyProofId,
        evidence: &Evidence,
        now: DateTime<Utc>,
    ) -> Result<Option<Resubmission<WeeklyProof>>, Error>;

    /// `from` -> rejected|flagged. `None` if the proof is no longer in `from`.
    async fn review_weekly_proof(
        &self,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        to: WeeklyProofStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error>;

    /// `from` -> approved, accruing the week's share of the driver earning
    /// into the assignment and the driver's pending balance as one unit. The
    /// installment gate and the assignment are re-checked inside the unit.
    async fn approve_weekly_proof(
        &self,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        terms: &CampaignTerms,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error>;
}

fn pair_filter(campaign_id: CampaignId, driver_id: UserId) -> Document {
    bson::doc! { "campaign_id": campaign_id, "driver_id": driver_id }
}

fn period_filter(campaign_id: CampaignId, driver_id: UserId, period: ProofPeriod) -> Document {
    bson::doc! {
        "campaign_id": campaign_id,
        "driver_id": driver_id,
        "period.year": period.year,
        "period.week": period.week,
    }
}

fn return_original() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::Before)
        .build()
}

fn upsert_original() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .upsert(true)
        .return_document(ReturnDocument::Before)
        .build()
}

fn oldest_first() -> FindOptions {
    FindOptions::builder()
        .sort(bson::doc! { "created_at": 1 })
        .build()
}

fn installment_not_approved(campaign_id: CampaignId, driver_id: UserId) -> Error {
    Error::InstallmentProofNotApproved {
        campaign_id,
        driver_id,
    }
}

#[async_trait]
impl InstallmentProofStore for MongoDatabase {
    #[tracing::instrument(skip(self))]
    async fn upsert_installment_proof(
        &self,
        proof: &InstallmentProof,
    ) -> Result<Resubmission<InstallmentProof>, Error> {
        let mut filter = pair_filter(proof.campaign_id, proof.driver_id);
        filter.insert("status", bson::doc! { "$ne": ProofStatus::Approved.name() });

        let result = self
            .installment_proofs
            .find_one_and_update(
                filter,
                bson::doc! {
                    "$set": {
                        "evidence": bson::to_bson(&proof.evidence)?,
                        "status": ProofStatus::PendingApproval.name(),
                        "reason": bson::Bson::Null,
                        "modified_at": bson_now(proof.modified_at),
                    },
                    "$setOnInsert": {
                        "_id": proof.id,
                        "created_at": bson_now(proof.created_at),
                    },
                },
                upsert_original(),
            )
            .await;

        let original = match result {
            Ok(original) => original,
            // the filter skipped an approved proof and the insert hit the pair index
            Err(err) if is_duplicate_key(&err) => {
                let existing = self
                    .fetch_installment_proof_by_campaign_and_driver(
                        proof.campaign_id,
                        proof.driver_id,
                    )
                    .await?;
                return Err(match existing {
                    Some(existing) if existing.status == ProofStatus::Approved => {
                        Error::InstallmentProofAlreadyApproved {
                            campaign_id: proof.campaign_id,
                            driver_id: proof.driver_id,
                        }
                    }
                    _ => Error::ConcurrentModificationDetected,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let resubmission = match original {
            Some(mut original) => {
                let replaced = std::mem::replace(&mut original.evidence, proof.evidence.clone());
                original.status = ProofStatus::PendingApproval;
                original.reason = None;
                original.modified_at = proof.modified_at;

                Resubmission {
                    proof: original,
                    replaced: Some(replaced),
                }
            }
            None => Resubmission {
                proof: proof.clone(),
                replaced: None,
            },
        };

        Ok(resubmission)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_installment_proof_by_id(
        &self,
        proof_id: InstallmentProofId,
    ) -> Result<Option<InstallmentProof>, Error> {
        let proof: Option<InstallmentProof> = self
            .installment_proofs
            .find_one(bson::doc! { "_id": proof_id }, None)
            .await?;

        Ok(proof)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_installment_proof_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Option<InstallmentProof>, Error> {
        let proof: Option<InstallmentProof> = self
            .installment_proofs
            .find_one(pair_filter(campaign_id, driver_id), None)
            .await?;

        Ok(proof)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_installment_proofs_by_status(
        &self,
        status: ProofStatus,
    ) -> Result<Vec<InstallmentProof>, Error> {
        let proofs: Vec<InstallmentProof> = self
            .installment_proofs
            .find(bson::doc! { "status": status.name() }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(proofs)
    }

    #[tracing::instrument(skip(self))]
    async fn review_installment_proof(
        &self,
        proof_id: InstallmentProofId,
        to: ProofStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<InstallmentProof>, Error> {
        let proof = self
            .installment_proofs
            .find_one_and_update(
                bson::doc! { "_id": proof_id, "status": ProofStatus::PendingApproval.name() },
                bson::doc! {
                    "$set": {
                        "status": to.name(),
                        "reason": reason,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
            )
            .await?;

        Ok(proof)
    }
}

#[async_trait]
impl WeeklyProofStore for MongoDatabase {
    #[tracing::instrument(skip(self))]
    async fn insert_weekly_proof(&self, proof: &WeeklyProof) -> Result<(), Error> {
        match self.weekly_proofs.insert_one(proof, None).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(Error::WeeklyProofAlreadySubmitted {
                campaign_id: proof.campaign_id,
                driver_id: proof.driver_id,
                period: proof.period,
            }),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_weekly_proof_by_id(
        &self,
        proof_id: WeeklyProofId,
    ) -> Result<Option<WeeklyProof>, Error> {
        let proof: Option<WeeklyProof> = self
            .weekly_proofs
            .find_one(bson::doc! { "_id": proof_id }, None)
            .await?;

        Ok(proof)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_weekly_proof_by_period(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
        period: ProofPeriod,
    ) -> Result<Option<WeeklyProof>, Error> {
        let proof: Option<WeeklyProof> = self
            .weekly_proofs
            .find_one(period_filter(campaign_id, driver_id, period), None)
            .await?;

        Ok(proof)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_weekly_proofs_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Vec<WeeklyProof>, Error> {
        let proofs: Vec<WeeklyProof> = self
            .weekly_proofs
            .find(pair_filter(campaign_id, driver_id), oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(proofs)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_weekly_proofs_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<WeeklyProof>, Error> {
        let proofs: Vec<WeeklyProof> = self
            .weekly_proofs
            .find(bson::doc! { "campaign_id": campaign_id }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(proofs)
    }

    #[tracing::instrument(skip(self))]
    async fn replace_weekly_evidence(
        &self,
        proof_id: WeeklyProofId,
        evidence: &Evidence,
        now: DateTime<Utc>,
    ) -> Result<Option<Resubmission<WeeklyProof>>, Error> {
        let original = self
            .weekly_proofs
            .find_one_and_update(
                bson::doc! {
                    "_id": proof_id,
                    "status": { "$ne": WeeklyProofStatus::Approved.name() },
                },
                bson::doc! {
                    "$set": {
                        "evidence": bson::to_bson(evidence)?,
                        "status": WeeklyProofStatus::PendingApproval.name(),
                        "reason": bson::Bson::Null,
                        "modified_at": bson_now(now),
                    }
                },
                return_original(),
            )
            .await?;

        Ok(original.map(|mut original| {
            let replaced = std::mem::replace(&mut original.evidence, evidence.clone());
            original.status = WeeklyProofStatus::PendingApproval;
            original.reason = None;
            original.modified_at = now;

            Resubmission {
                proof: original,
                replaced: Some(replaced),
            }
        }))
    }

    #[tracing::instrument(skip(self))]
    async fn review_weekly_proof(
        &self,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        to: WeeklyProofStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error> {
        let proof = self
            .weekly_proofs
            .find_one_and_update(
                bson::doc! { "_id": proof_id, "status": from.name() },
                bson::doc! {
                    "$set": {
                        "status": to.name(),
                        "reason": reason,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
            )
            .await?;

        Ok(proof)
    }

    #[tracing::instrument(skip(self, terms))]
    async fn approve_weekly_proof(
        &self,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        terms: &CampaignTerms,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error> {
        self.run_transaction(|mut session| {
            let reason = reason.clone();
            Box::pin(async move {
                let result = self
                    .approve_weekly_proof_with_session(&mut session, proof_id, from, terms, reason, now)
                    .await;
                (session, result)
            })
        })
        .await
    }
}

impl MongoDatabase {
    async fn approve_weekly_proof_with_session(
        &self,
        session: &mut ClientSession,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        terms: &CampaignTerms,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error> {
        let proof = self
            .weekly_proofs
            .find_one_with_session(bson::doc! { "_id": proof_id, "status": from.name() }, None, session)
            .await?;
        let proof = match proof {
            Some(proof) => proof,
            None => return Ok(None),
        };
        let (campaign_id, driver_id) = (proof.campaign_id, proof.driver_id);

        let mut gate = pair_filter(campaign_id, driver_id);
        gate.insert("status", ProofStatus::Approved.name());
        let installed = self
            .installment_proofs
            .count_documents_with_session(gate, None, session)
            .await?;
        if installed == 0 {
            return Err(installment_not_approved(campaign_id, driver_id));
        }

        let mut approved = pair_filter(campaign_id, driver_id);
        approved.insert("status", WeeklyProofStatus::Approved.name());
        let approved_before = self
            .weekly_proofs
            .count_documents_with_session(approved, None, session)
            .await?;
        let accrual = terms.weekly_accrual(approved_before as usize);

        let proof = self
            .weekly_proofs
            .find_one_and_update_with_session(
                bson::doc! { "_id": proof_id, "status": from.name() },
                bson::doc! {
                    "$set": {
                        "status": WeeklyProofStatus::Approved.name(),
                        "reason": reason,
                        "accrued": accrual,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
                session,
            )
            .await?;
        let proof = match proof {
            Some(proof) => proof,
            None => return Ok(None),
        };

        let running: Vec<&str> = vec![
            AssignmentStatus::Approved.name(),
            AssignmentStatus::DueSoon.name(),
        ];
        let mut assignment_filter = pair_filter(campaign_id, driver_id);
        assignment_filter.insert("status", bson::doc! { "$in": running });
        let assignment = self
            .assignments
            .find_one_and_update_with_session(
                assignment_filter,
                bson::doc! {
                    "$inc": { "accrued": accrual },
                    "$set": { "modified_at": bson_now(now) },
                },
                return_updated(),
                session,
            )
            .await?;
        if assignment.is_none() {
            let assignment = self
                .assignments
                .find_one_with_session(pair_filter(campaign_id, driver_id), None, session)
                .await?
                .ok_or(Error::AssignmentNotFoundForDriver {
                    campaign_id,
                    driver_id,
                })?;
            return Err(Error::AssignmentNotApproved {
                assignment_id: assignment.id,
                status: assignment.status,
            });
        }

        if accrual > 0 {
            self.apply_ledger_move_with_session(
                session,
                driver_id,
                LedgerMove::CreditPending(accrual),
                now,
            )
            .await?;
        }

        Ok(Some(proof))
    }
}

impl MemoryState {
    fn installment_approved(&self, campaign_id: CampaignId, driver_id: UserId) -> bool {
        self.installment_proofs.values().any(|proof| {
            proof.campaign_id == campaign_id
                && proof.driver_id == driver_id
                && proof.status == ProofStatus::Approved
        })
    }

    fn approved_weeks(&self, campaign_id: CampaignId, driver_id: UserId) -> usize {
        self.weekly_proofs
            .values()
            .filter(|proof| {
                proof.campaign_id == campaign_id
                    && proof.driver_id == driver_id
                    && proof.status == WeeklyProofStatus::Approved
            })
            .count()
    }
}

#[async_trait]
impl InstallmentProofStore for MemoryDatabase {
    async fn upsert_installment_proof(
        &self,
        proof: &InstallmentProof,
    ) -> Result<Resubmission<InstallmentProof>, Error> {
        let mut state = self.lock()?;
        let existing = state.installment_proofs.values_mut().find(|existing| {
            existing.campaign_id == proof.campaign_id && existing.driver_id == proof.driver_id
        });

        match existing {
            Some(existing) if existing.status == ProofStatus::Approved => {
                Err(Error::InstallmentProofAlreadyApproved {
                    campaign_id: proof.campaign_id,
                    driver_id: proof.driver_id,
                })
            }
            Some(existing) => {
                existing.status = ProofStatus::PendingApproval;
                existing.reason = None;
                existing.modified_at = proof.modified_at;
                let replaced = std::mem::replace(&mut existing.evidence, proof.evidence.clone());

                Ok(Resubmission {
                    proof: existing.clone(),
                    replaced: Some(replaced),
                })
            }
            None => {
                state.installment_proofs.insert(proof.id, proof.clone());

                Ok(Resubmission {
                    proof: proof.clone(),
                    replaced: None,
                })
            }
        }
    }

    async fn fetch_installment_proof_by_id(
        &self,
        proof_id: InstallmentProofId,
    ) -> Result<Option<InstallmentProof>, Error> {
        let state = self.lock()?;

        Ok(state.installment_proofs.get(&proof_id).cloned())
    }

    async fn fetch_installment_proof_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Option<InstallmentProof>, Error> {
        let state = self.lock()?;
        let proof = state
            .installment_proofs
            .values()
            .find(|proof| proof.campaign_id == campaign_id && proof.driver_id == driver_id)
            .cloned();

        Ok(proof)
    }

    async fn fetch_installment_proofs_by_status(
        &self,
        status: ProofStatus,
    ) -> Result<Vec<InstallmentProof>, Error> {
        let state = self.lock()?;
        let proofs = state
            .installment_proofs
            .values()
            .filter(|proof| proof.status == status)
            .cloned();

        Ok(sorted(proofs, |proof| proof.created_at))
    }

    async fn review_installment_proof(
        &self,
        proof_id: InstallmentProofId,
        to: ProofStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<InstallmentProof>, Error> {
        let mut state = self.lock()?;
        let proof = match state.installment_proofs.get_mut(&proof_id) {
            Some(proof) if proof.status == ProofStatus::PendingApproval => proof,
            _ => return Ok(None),
        };

        proof.status = to;
        proof.reason = reason;
        proof.modified_at = now;

        Ok(Some(proof.clone()))
    }
}

#[async_trait]
impl WeeklyProofStore for MemoryDatabase {
    async fn insert_weekly_proof(&self, proof: &WeeklyProof) -> Result<(), Error> {
        let mut state = self.lock()?;
        let exists = state.weekly_proofs.values().any(|existing| {
            existing.campaign_id == proof.campaign_id
                && existing.driver_id == proof.driver_id
                && existing.period == proof.period
        });
        if exists {
            return Err(Error::WeeklyProofAlreadySubmitted {
                campaign_id: proof.campaign_id,
                driver_id: proof.driver_id,
                period: proof.period,
            });
        }

        state.weekly_proofs.insert(proof.id, proof.clone());

        Ok(())
    }

    async fn fetch_weekly_proof_by_id(
        &self,
        proof_id: WeeklyProofId,
    ) -> Result<Option<WeeklyProof>, Error> {
        let state = self.lock()?;

        Ok(state.weekly_proofs.get(&proof_id).cloned())
    }

    async fn fetch_weekly_proof_by_period(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
        period: ProofPeriod,
    ) -> Result<Option<WeeklyProof>, Error> {
        let state = self.lock()?;
        let proof = state
            .weekly_proofs
            .values()
            .find(|proof| {
                proof.campaign_id == campaign_id
                    && proof.driver_id == driver_id
                    && proof.period == period
            })
            .cloned();

        Ok(proof)
    }

    async fn fetch_weekly_proofs_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Vec<WeeklyProof>, Error> {
        let state = self.lock()?;
        let proofs = state
            .weekly_proofs
            .values()
            .filter(|proof| proof.campaign_id == campaign_id && proof.driver_id == driver_id)
            .cloned();

        Ok(sorted(proofs, |proof| proof.created_at))
    }

    async fn fetch_weekly_proofs_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<WeeklyProof>, Error> {
        let state = self.lock()?;
        let proofs = state
            .weekly_proofs
            .values()
            .filter(|proof| proof.campaign_id == campaign_id)
            .cloned();

        Ok(sorted(proofs, |proof| proof.created_at))
    }

    async fn replace_weekly_evidence(
        &self,
        proof_id: WeeklyProofId,
        evidence: &Evidence,
        now: DateTime<Utc>,
    ) -> Result<Option<Resubmission<WeeklyProof>>, Error> {
        let mut state = self.lock()?;
        let proof = match state.weekly_proofs.get_mut(&proof_id) {
            Some(proof) if proof.status != WeeklyProofStatus::Approved => proof,
            _ => return Ok(None),
        };

        proof.status = WeeklyProofStatus::PendingApproval;
        proof.reason = None;
        proof.modified_at = now;
        let replaced = std::mem::replace(&mut proof.evidence, evidence.clone());

        Ok(Some(Resubmission {
            proof: proof.clone(),
            replaced: Some(replaced),
        }))
    }

    async fn review_weekly_proof(
        &self,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        to: WeeklyProofStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error> {
        let mut state = self.lock()?;
        let proof = match state.weekly_proofs.get_mut(&proof_id) {
            Some(proof) if proof.status == from => proof,
            _ => return Ok(None),
        };

        proof.status = to;
        proof.reason = reason;
        proof.modified_at = now;

        Ok(Some(proof.clone()))
    }

    async fn approve_weekly_proof(
        &self,
        proof_id: WeeklyProofId,
        from: WeeklyProofStatus,
        terms: &CampaignTerms,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeeklyProof>, Error> {
        let mut state = self.lock()?;
        let (campaign_id, driver_id) = match state.weekly_proofs.get(&proof_id) {
            Some(proof) if proof.status == from => (proof.campaign_id, proof.driver_id),
            _ => return Ok(None),
        };

        if !state.installment_approved(campaign_id, driver_id) {
            return Err(installment_not_approved(campaign_id, driver_id));
        }

        let assignment_id = {
            let assignment = state
                .assignments
                .values()
                .find(|assignment| {
                    assignment.campaign_id == campaign_id && assignment.driver_id == driver_id
                })
                .ok_or(Error::AssignmentNotFoundForDriver {
                    campaign_id,
                    driver_id,
                })?;
            if !assignment.is_running() {
                return Err(Error::AssignmentNotApproved {
                    assignment_id: assignment.id,
                    status: assignment.status,
                });
            }
            assignment.id
        };

        let accrual: Amount = terms.weekly_accrual(state.approved_weeks(campaign_id, driver_id));
        if accrual > 0 {
            state.apply_ledger_move(driver_id, LedgerMove::CreditPending(accrual), now)?;
        }

        if let Some(assignment) = state.assignments.get_mut(&assignment_id) {
            assignment.accrued += accrual;
            assignment.modified_at = now;
        }

        let proof = state.weekly_proofs.get_mut(&proof_id).ok_or_else(|| {
            Error::ExistentialState(format!("weekly proof {} vanished", proof_id))
        })?;
        proof.status = WeeklyProofStatus::Approved;
        proof.reason = reason;
        proof.accrued = accrual;
        proof.modified_at = now;

        Ok(Some(proof.clone()))
    }
}
