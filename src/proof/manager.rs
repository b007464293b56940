use chrono::Utc;
use tracing::{debug, info};

use crate::assignment::Assignment;
use crate::campaign::{Campaign, CampaignId};
use crate::config::RetryConfig;
use crate::database::Database;
use crate::error::Error;
use crate::evidence::{self, Evidence, EvidenceStore};
use crate::notification::{NotificationEvent, Notifications};
use crate::retry::with_retry;
use crate::user::{Identity, Role, UserId};

use super::{
    InstallmentProof, InstallmentProofId, ProofDecision, ProofPeriod, ProofStatus, WeeklyProof,
    WeeklyProofId, WeeklyProofStatus,
};

/// The gate for every weekly proof path: the pair's installment proof must be
/// approved.
#[tracing::instrument(skip(db))]
pub async fn ensure_installment_approved(
    db: &dyn Database,
    campaign_id: CampaignId,
    driver_id: UserId,
) -> Result<InstallmentProof, Error> {
    let proof = db
        .installment_proofs()
        .fetch_installment_proof_by_campaign_and_driver(campaign_id, driver_id)
        .await?;

    match proof {
        Some(proof) if proof.status == ProofStatus::Approved => Ok(proof),
        _ => Err(Error::InstallmentProofNotApproved {
            campaign_id,
            driver_id,
        }),
    }
}

/// The driver's assignment on the campaign, which must be on the road.
async fn fetch_running_assignment(
    db: &dyn Database,
    campaign_id: CampaignId,
    driver_id: UserId,
) -> Result<Assignment, Error> {
    let assignment = db
        .assignments()
        .fetch_assignment_by_campaign_and_driver(campaign_id, driver_id)
        .await?
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

    Ok(assignment)
}

async fn fetch_campaign(db: &dyn Database, campaign_id: CampaignId) -> Result<Campaign, Error> {
    db.campaigns()
        .fetch_campaign_by_id(campaign_id)
        .await?
        .ok_or(Error::CampaignNotFound { campaign_id })
}

async fn store_evidence(
    store: &dyn EvidenceStore,
    retry: &RetryConfig,
    bytes: Vec<u8>,
    content_type: Option<String>,
) -> Result<Evidence, Error> {
    if bytes.is_empty() {
        return Err(Error::EmptyEvidence);
    }

    with_retry(retry, "store_evidence", || {
        store.store(bytes.clone(), content_type.clone())
    })
    .await
}

/// Stores the evidence and submits it as the pair's installment proof,
/// overwriting a previous submission that was not approved.
#[tracing::instrument(skip(db, evidence_store, retry, bytes), fields(size = bytes.len()))]
pub async fn submit_installment_proof(
    db: &dyn Database,
    evidence_store: &dyn EvidenceStore,
    retry: &RetryConfig,
    campaign_id: CampaignId,
    driver_id: UserId,
    bytes: Vec<u8>,
    content_type: Option<String>,
) -> Result<InstallmentProof, Error> {
    fetch_running_assignment(db, campaign_id, driver_id).await?;

    let existing = db
        .installment_proofs()
        .fetch_installment_proof_by_campaign_and_driver(campaign_id, driver_id)
        .await?;
    if matches!(&existing, Some(proof) if proof.status == ProofStatus::Approved) {
        return Err(Error::InstallmentProofAlreadyApproved {
            campaign_id,
            driver_id,
        });
    }

    let evidence = store_evidence(evidence_store, retry, bytes, content_type).await?;

    let now = Utc::now();
    let proof = InstallmentProof {
        id: InstallmentProofId::new(),
        campaign_id,
        driver_id,
        evidence: evidence.clone(),
        status: ProofStatus::PendingApproval,
        reason: None,
        created_at: now,
        modified_at: now,
    };

    let resubmission = match db.installment_proofs().upsert_installment_proof(&proof).await {
        Ok(resubmission) => resubmission,
        Err(err) => {
            evidence::discard(evidence_store, &evidence).await;
            return Err(err);
        }
    };

    if let Some(replaced) = &resubmission.replaced {
        evidence::discard(evidence_store, replaced).await;
    }

    info!(
        installment_proof_id = %resubmission.proof.id,
        resubmitted = resubmission.replaced.is_some(),
        "installment proof submitted"
    );

    Ok(resubmission.proof)
}

#[tracing::instrument(skip(db, notifications))]
pub async fn review_installment_proof(
    db: &dyn Database,
    notifications: &Notifications,
    proof_id: InstallmentProofId,
    decision: ProofDecision,
    reason: Option<String>,
) -> Result<InstallmentProof, Error> {
    let reason = decision.check_reason(reason)?;
    let to = decision.installment_status()?;

    let already_reviewed = |proof: InstallmentProof| Error::InstallmentProofAlreadyReviewed {
        installment_proof_id: proof.id,
        status: proof.status,
    };

    let proof = db
        .installment_proofs()
        .fetch_installment_proof_by_id(proof_id)
        .await?
        .ok_or(Error::InstallmentProofNotFound {
            installment_proof_id: proof_id,
        })?;
    if proof.status != ProofStatus::PendingApproval {
        return Err(already_reviewed(proof));
    }

    let proof = match db
        .installment_proofs()
        .review_installment_proof(proof_id, to, reason, Utc::now())
        .await?
    {
        Some(proof) => proof,
        None => {
            let proof = db
                .installment_proofs()
                .fetch_installment_proof_by_id(proof_id)
                .await?
                .ok_or(Error::InstallmentProofNotFound {
                    installment_proof_id: proof_id,
                })?;
            return Err(already_reviewed(proof));
        }
    };

    info!(installment_proof_id = %proof_id, status = ?proof.status, "installment proof reviewed");
    notifications.send(
        proof.driver_id,
        NotificationEvent::InstallmentProofReviewed {
            installment_proof_id: proof_id,
            campaign_id: proof.campaign_id,
            status: proof.status,
            reason: proof.reason.clone(),
        },
    );

    Ok(proof)
}

/// Submits the driver's proof for one week of the campaign. A proof already
/// submitted for the week gets its evidence replaced and goes back to review,
/// unless it was approved.
#[tracing::instrument(skip(db, evidence_store, retry, bytes), fields(size = bytes.len()))]
#[allow(clippy::too_many_arguments)]
pub async fn submit_weekly_proof(
    db: &dyn Database,
    evidence_store: &dyn EvidenceStore,
    retry: &RetryConfig,
    campaign_id: CampaignId,
    driver_id: UserId,
    period: ProofPeriod,
    bytes: Vec<u8>,
    content_type: Option<String>,
) -> Result<WeeklyProof, Error> {
    ensure_installment_approved(db, campaign_id, driver_id).await?;
    fetch_running_assignment(db, campaign_id, driver_id).await?;

    let campaign = fetch_campaign(db, campaign_id).await?;
    let now = Utc::now();
    let invalid_period = Error::InvalidProofPeriod {
        campaign_id,
        period,
    };
    if !campaign.terms()?.accepts_proof_for(period, now) {
        return Err(invalid_period);
    }
    let month = period.month().ok_or(invalid_period)?;

    let existing = db
        .weekly_proofs()
        .fetch_weekly_proof_by_period(campaign_id, driver_id, period)
        .await?;
    if let Some(existing) = &existing {
        if existing.status == WeeklyProofStatus::Approved {
            return Err(Error::WeeklyProofAlreadyApproved {
                weekly_proof_id: existing.id,
            });
        }
    }

    let evidence = store_evidence(evidence_store, retry, bytes, content_type).await?;

    let result = match existing {
        Some(existing) => db
            .weekly_proofs()
            .replace_weekly_evidence(existing.id, &evidence, now)
            .await
            .and_then(|resubmission| {
                resubmission.ok_or(Error::WeeklyProofAlreadyApproved {
                    weekly_proof_id: existing.id,
                })
            })
            .map(|resubmission| (resubmission.proof, resubmission.replaced)),
        None => {
            let proof = WeeklyProof {
                id: WeeklyProofId::new(),
                campaign_id,
                driver_id,
                period,
                month,
                evidence: evidence.clone(),
                status: WeeklyProofStatus::PendingApproval,
                reason: None,
                accrued: 0,
                created_at: now,
                modified_at: now,
            };
            db.weekly_proofs()
                .insert_weekly_proof(&proof)
                .await
                .map(|()| (proof, None))
        }
    };

    let (proof, replaced) = match result {
        Ok(stored) => stored,
        Err(err) => {
            evidence::discard(evidence_store, &evidence).await;
            return Err(err);
        }
    };

    if let Some(replaced) = &replaced {
        evidence::discard(evidence_store, replaced).await;
    }

    debug!(weekly_proof_id = %proof.id, ?period, "weekly proof submitted");

    Ok(proof)
}

/// Approving re-checks the installment gate and accrues the week's share of
/// the driver earning in the same unit.
#[tracing::instrument(skip(db, notifications))]
pub async fn review_weekly_proof(
    db: &dyn Database,
    notifications: &Notifications,
    proof_id: WeeklyProofId,
    decision: ProofDecision,
    reason: Option<String>,
) -> Result<WeeklyProof, Error> {
    let reason = decision.check_reason(reason)?;
    let to = decision.weekly_status();

    let fetch = || async {
        db.weekly_proofs()
            .fetch_weekly_proof_by_id(proof_id)
            .await?
            .ok_or(Error::WeeklyProofNotFound {
                weekly_proof_id: proof_id,
            })
    };
    let refusal = |proof: &WeeklyProof| {
        if proof.status.is_reviewable() {
            Error::InvalidTransition {
                entity: "weekly_proof",
                from: proof.status.name().to_string(),
                to: to.name().to_string(),
            }
        } else {
            Error::WeeklyProofAlreadyReviewed {
                weekly_proof_id: proof.id,
                status: proof.status,
            }
        }
    };

    let proof = fetch().await?;
    if !proof.status.can_transition_to(to) {
        return Err(refusal(&proof));
    }

    let now = Utc::now();
    let reviewed = if to == WeeklyProofStatus::Approved {
        let campaign = fetch_campaign(db, proof.campaign_id).await?;
        db.weekly_proofs()
            .approve_weekly_proof(proof_id, proof.status, campaign.terms()?, reason, now)
            .await?
    } else {
        db.weekly_proofs()
            .review_weekly_proof(proof_id, proof.status, to, reason, now)
            .await?
    };

    let proof = match reviewed {
        Some(proof) => proof,
        None => {
            let current = fetch().await?;
            if current.status.can_transition_to(to) {
                return Err(Error::ConcurrentModificationDetected);
            }
            return Err(refusal(&current));
        }
    };

    info!(
        weekly_proof_id = %proof_id,
        status = ?proof.status,
        accrued = proof.accrued,
        "weekly proof reviewed"
    );
    notifications.send(
        proof.driver_id,
        NotificationEvent::WeeklyProofReviewed {
            weekly_proof_id: proof_id,
            campaign_id: proof.campaign_id,
            period: proof.period,
            status: proof.status,
            reason: proof.reason.clone(),
        },
    );

    Ok(proof)
}

/// The campaign's owner and admins can look at any driver's proofs; drivers
/// only at their own.
async fn resolve_driver(
    db: &dyn Database,
    identity: Identity,
    campaign_id: CampaignId,
    driver_id: Option<UserId>,
) -> Result<Option<UserId>, Error> {
    match identity.role {
        Role::Driver => Ok(Some(identity.user_id)),
        Role::Admin => Ok(driver_id),
        Role::BusinessOwner => {
            if fetch_campaign(db, campaign_id).await?.owner_id != identity.user_id {
                return Err(Error::CampaignNotFound { campaign_id });
            }
            Ok(driver_id)
        }
    }
}

#[tracing::instrument(skip(db))]
pub async fn get_installment_proofs(
    db: &dyn Database,
    identity: Identity,
    campaign_id: CampaignId,
    driver_id: Option<UserId>,
) -> Result<Vec<InstallmentProof>, Error> {
    let driver_id = match resolve_driver(db, identity, campaign_id, driver_id).await? {
        Some(driver_id) => driver_id,
        None => return Err(Error::MissingField { field: "driver_id" }),
    };

    let proof = db
        .installment_proofs()
        .fetch_installment_proof_by_campaign_and_driver(campaign_id, driver_id)
        .await?;

    Ok(proof.into_iter().collect())
}

/// Installment proofs waiting for a reviewer, oldest first.
#[tracing::instrument(skip(db))]
pub async fn get_pending_installment_proofs(
    db: &dyn Database,
) -> Result<Vec<InstallmentProof>, Error> {
    let proofs = db
        .installment_proofs()
        .fetch_installment_proofs_by_status(ProofStatus::PendingApproval)
        .await?;

    Ok(proofs)
}

#[tracing::instrument(skip(db))]
pub async fn get_weekly_proofs(
    db: &dyn Database,
    identity: Identity,
    campaign_id: CampaignId,
    driver_id: Option<UserId>,
) -> Result<Vec<WeeklyProof>, Error> {
    let proofs = match resolve_driver(db, identity, campaign_id, driver_id).await? {
        Some(driver_id) => {
            db.weekly_proofs()
                .fetch_weekly_proofs_by_campaign_and_driver(campaign_id, driver_id)
                .await?
        }
        None => {
            db.weekly_proofs()
                .fetch_weekly_proofs_by_campaign(campaign_id)
                .await?
        }
    };

    Ok(proofs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::manager::get_account;
    use crate::assignment::manager as assignments;
    use crate::assignment::AssignmentStatus;
    use crate::database::MemoryDatabase;
    use crate::evidence::MemoryEvidenceStore;
    use crate::testing;

    fn this_week() -> ProofPeriod {
        ProofPeriod::of(Utc::now())
    }

    #[tokio::test]
    async fn installment_requires_an_approved_assignment() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        let assignment = assignments::apply(&db, &testing::notifications(), driver_id, campaign.id)
            .await
            .unwrap();

        let err = submit_installment_proof(
            &db,
            &store,
            &testing::fast_retry(),
            campaign.id,
            driver_id,
            b"photo".to_vec(),
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            Error::AssignmentNotApproved {
                assignment_id: assignment.id,
                status: AssignmentStatus::PendingApproval,
            }
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn installment_resubmission_overwrites_until_approved() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let retry = testing::fast_retry();
        let notifications = testing::notifications();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::approved_assignment(&db, &campaign, driver_id).await;

        let first = submit_installment_proof(
            &db,
            &store,
            &retry,
            campaign.id,
            driver_id,
            b"blurry".to_vec(),
            None,
        )
        .await
        .unwrap();
        review_installment_proof(
            &db,
            &notifications,
            first.id,
            ProofDecision::Reject,
            Some("too blurry".into()),
        )
        .await
        .unwrap();

        let second = submit_installment_proof(
            &db,
            &store,
            &retry,
            campaign.id,
            driver_id,
            b"sharp".to_vec(),
            Some("image/png".into()),
        )
        .await
        .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.status, ProofStatus::PendingApproval);
        assert_eq!(second.reason, None);
        assert_eq!(store.len(), 1);
        assert!(!store.contains(&first.evidence.storage_id));
        assert!(store.contains(&second.evidence.storage_id));

        review_installment_proof(&db, &notifications, second.id, ProofDecision::Approve, None)
            .await
            .unwrap();

        let err = submit_installment_proof(
            &db,
            &store,
            &retry,
            campaign.id,
            driver_id,
            b"again".to_vec(),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            Error::InstallmentProofAlreadyApproved {
                campaign_id: campaign.id,
                driver_id,
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn installment_review_rules() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let notifications = testing::notifications();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::approved_assignment(&db, &campaign, driver_id).await;
        let proof = submit_installment_proof(
            &db,
            &store,
            &testing::fast_retry(),
            campaign.id,
            driver_id,
            b"photo".to_vec(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            review_installment_proof(
                &db,
                &notifications,
                proof.id,
                ProofDecision::Reject,
                Some("   ".into())
            )
            .await
            .unwrap_err(),
            Error::RejectionReasonRequired
        );
        assert!(matches!(
            review_installment_proof(&db, &notifications, proof.id, ProofDecision::Flag, Some("odd".into())).await,
            Err(Error::InvalidTransition { .. })
        ));

        review_installment_proof(&db, &notifications, proof.id, ProofDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(
            review_installment_proof(&db, &notifications, proof.id, ProofDecision::Approve, None)
                .await
                .unwrap_err(),
            Error::InstallmentProofAlreadyReviewed {
                installment_proof_id: proof.id,
                status: ProofStatus::Approved,
            }
        );
    }

    #[tokio::test]
    async fn weekly_proofs_wait_for_the_installment() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let retry = testing::fast_retry();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::approved_assignment(&db, &campaign, driver_id).await;

        let err = submit_weekly_proof(
            &db,
            &store,
            &retry,
            campaign.id,
            driver_id,
            this_week(),
            b"week".to_vec(),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            Error::InstallmentProofNotApproved {
                campaign_id: campaign.id,
                driver_id,
            }
        );

        // a pending installment proof does not open the gate either
        submit_installment_proof(
            &db,
            &store,
            &retry,
            campaign.id,
            driver_id,
            b"photo".to_vec(),
            None,
        )
        .await
        .unwrap();
        assert!(matches!(
            submit_weekly_proof(
                &db,
                &store,
                &retry,
                campaign.id,
                driver_id,
                this_week(),
                b"week".to_vec(),
                None,
            )
            .await,
            Err(Error::InstallmentProofNotApproved { .. })
        ));
        assert!(db
            .weekly_proofs()
            .fetch_weekly_proofs_by_campaign(campaign.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn weekly_period_must_fall_in_the_campaign() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::installed_driver(&db, &store, &campaign, driver_id).await;

        let period = ProofPeriod::of(Utc::now() + chrono::Duration::days(70));
        let err = submit_weekly_proof(
            &db,
            &store,
            &testing::fast_retry(),
            campaign.id,
            driver_id,
            period,
            b"week".to_vec(),
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            Error::InvalidProofPeriod {
                campaign_id: campaign.id,
                period,
            }
        );
    }

    #[tokio::test]
    async fn weeks_that_have_not_started_are_refused() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::installed_driver(&db, &store, &campaign, driver_id).await;

        let next_week = ProofPeriod::of(Utc::now() + chrono::Duration::days(7));
        assert!(campaign.terms().unwrap().covers_period(next_week));

        let err = submit_weekly_proof(
            &db,
            &store,
            &testing::fast_retry(),
            campaign.id,
            driver_id,
            next_week,
            b"week".to_vec(),
            None,
        )
        .await
        .unwrap_err();

        assert_eq!(
            err,
            Error::InvalidProofPeriod {
                campaign_id: campaign.id,
                period: next_week,
            }
        );
        // only the installment evidence was kept
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn weekly_resubmission_replaces_evidence_until_approved() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let retry = testing::fast_retry();
        let notifications = testing::notifications();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::installed_driver(&db, &store, &campaign, driver_id).await;

        let submit = |bytes: &'static [u8]| {
            submit_weekly_proof(
                &db,
                &store,
                &retry,
                campaign.id,
                driver_id,
                this_week(),
                bytes.to_vec(),
                None,
            )
        };

        let first = submit(b"first").await.unwrap();
        review_weekly_proof(
            &db,
            &notifications,
            first.id,
            ProofDecision::Flag,
            Some("ad not visible".into()),
        )
        .await
        .unwrap();

        let second = submit(b"second").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, WeeklyProofStatus::PendingApproval);
        assert!(!store.contains(&first.evidence.storage_id));

        review_weekly_proof(&db, &notifications, second.id, ProofDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(
            submit(b"third").await.unwrap_err(),
            Error::WeeklyProofAlreadyApproved {
                weekly_proof_id: first.id
            }
        );
        // installment evidence plus the approved weekly evidence
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn weekly_review_transitions() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let notifications = testing::notifications();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::installed_driver(&db, &store, &campaign, driver_id).await;
        let proof = submit_weekly_proof(
            &db,
            &store,
            &testing::fast_retry(),
            campaign.id,
            driver_id,
            this_week(),
            b"week".to_vec(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            review_weekly_proof(&db, &notifications, proof.id, ProofDecision::Flag, None)
                .await
                .unwrap_err(),
            Error::RejectionReasonRequired
        );

        let flagged = review_weekly_proof(
            &db,
            &notifications,
            proof.id,
            ProofDecision::Flag,
            Some("check plate".into()),
        )
        .await
        .unwrap();
        assert_eq!(flagged.status, WeeklyProofStatus::Flagged);
        assert!(matches!(
            review_weekly_proof(&db, &notifications, proof.id, ProofDecision::Flag, Some("again".into())).await,
            Err(Error::InvalidTransition { .. })
        ));

        let approved =
            review_weekly_proof(&db, &notifications, proof.id, ProofDecision::Approve, None)
                .await
                .unwrap();
        assert_eq!(approved.status, WeeklyProofStatus::Approved);
        assert!(approved.accrued > 0);
        assert_eq!(
            review_weekly_proof(
                &db,
                &notifications,
                proof.id,
                ProofDecision::Reject,
                Some("late".into())
            )
            .await
            .unwrap_err(),
            Error::WeeklyProofAlreadyReviewed {
                weekly_proof_id: proof.id,
                status: WeeklyProofStatus::Approved,
            }
        );
    }

    #[tokio::test]
    async fn approved_weeks_accrue_exactly_the_driver_earning() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let retry = testing::fast_retry();
        let notifications = testing::notifications();
        let campaign =
            testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        testing::installed_driver(&db, &store, &campaign, driver_id).await;
        // every week of the window has started
        let campaign = testing::backdate(&db, campaign.id, testing::DURATION_DAYS);

        for period in campaign.terms().unwrap().required_periods() {
            let proof = submit_weekly_proof(
                &db,
                &store,
                &retry,
                campaign.id,
                driver_id,
                period,
                b"week".to_vec(),
                None,
            )
            .await
            .unwrap();
            review_weekly_proof(&db, &notifications, proof.id, ProofDecision::Approve, None)
                .await
                .unwrap();
        }

        let account = get_account(&db, driver_id).await.unwrap();
        assert_eq!(account.pending, testing::EARNING_PER_DRIVER);
        assert_eq!(account.balance, 0);

        let assignment = db
            .assignments()
            .fetch_assignment_by_campaign_and_driver(campaign.id, driver_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.accrued, testing::EARNING_PER_DRIVER);

        let completed = assignments::mark_completed(&db, &notifications, assignment.id)
            .await
            .unwrap();
        assert_eq!(completed.status, AssignmentStatus::Completed);
        assert!(completed.paid);
        assert!(!completed.active);

        let account = get_account(&db, driver_id).await.unwrap();
        assert_eq!(account.pending, 0);
        assert_eq!(account.balance, testing::EARNING_PER_DRIVER);
    }

    #[tokio::test]
    async fn proofs_are_scoped_to_the_caller() {
        let db = MemoryDatabase::new();
        let store = MemoryEvidenceStore::new();
        let owner_id = UserId::new();
        let campaign = testing::funded_campaign(&db, owner_id, testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        let proof = testing::installed_driver(&db, &store, &campaign, driver_id).await;

        let own = get_installment_proofs(
            &db,
            Identity::new(driver_id, Role::Driver),
            campaign.id,
            None,
        )
        .await
        .unwrap();
        assert_eq!(own[0].id, proof.id);

        let other = get_installment_proofs(
            &db,
            Identity::new(UserId::new(), Role::Driver),
            campaign.id,
            Some(driver_id),
        )
        .await
        .unwrap();
        assert!(other.is_empty());

        assert_eq!(
            get_weekly_proofs(
                &db,
                Identity::new(UserId::new(), Role::BusinessOwner),
                campaign.id,
                None
            )
            .await
            .unwrap_err(),
            Error::CampaignNotFound {
                campaign_id: campaign.id
            }
        );
        assert!(get_pending_installment_proofs(&db).await.unwrap().is_empty());
    }
}
