use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::account::manager::open_account;
use crate::campaign::manager::{transition_to_active, transition_to_completed};
use crate::campaign::{Campaign, CampaignId};
use crate::database::Database;
use crate::error::Error;
use crate::notification::{NotificationEvent, Notifications};
use crate::proof::{ProofPeriod, WeeklyProofStatus};
use crate::user::{Identity, Role, UserId};

use super::{Assignment, AssignmentDecision, AssignmentId, AssignmentStatus};

pub(crate) async fn fetch_assignment(
    db: &dyn Database,
    assignment_id: AssignmentId,
) -> Result<Assignment, Error> {
    db.assignments()
        .fetch_assignment_by_id(assignment_id)
        .await?
        .ok_or(Error::AssignmentNotFound { assignment_id })
}

async fn fetch_campaign(db: &dyn Database, campaign_id: CampaignId) -> Result<Campaign, Error> {
    db.campaigns()
        .fetch_campaign_by_id(campaign_id)
        .await?
        .ok_or(Error::CampaignNotFound { campaign_id })
}

/// The error for a transition that lost a race: reports what the assignment
/// turned into in the meantime.
async fn lost_transition(
    db: &dyn Database,
    assignment_id: AssignmentId,
    to: AssignmentStatus,
) -> Error {
    match fetch_assignment(db, assignment_id).await {
        Ok(assignment) => match assignment.status.ensure_transition(to) {
            Err(err) => err,
            Ok(()) => Error::ConcurrentModificationDetected,
        },
        Err(err) => err,
    }
}

/// Applies the driver to the campaign, taking one of its slots.
#[tracing::instrument(skip(db, notifications))]
pub async fn apply(
    db: &dyn Database,
    notifications: &Notifications,
    driver_id: UserId,
    campaign_id: CampaignId,
) -> Result<Assignment, Error> {
    open_account(db, driver_id, Role::Driver).await?;

    let now = Utc::now();
    let assignment = Assignment::new(campaign_id, driver_id, now);
    let campaign = db.assignments().insert_assignment(&assignment).await?;

    info!(assignment_id = %assignment.id, campaign_id = %campaign_id, "driver applied");

    if !campaign.has_open_slots() {
        transition_to_active(db, notifications, campaign_id, now).await?;
    }

    Ok(assignment)
}

#[tracing::instrument(skip(db, notifications))]
pub async fn decide(
    db: &dyn Database,
    notifications: &Notifications,
    assignment_id: AssignmentId,
    decision: AssignmentDecision,
) -> Result<Assignment, Error> {
    let assignment = fetch_assignment(db, assignment_id).await?;
    let to = decision.status();
    assignment.status.ensure_transition(to)?;

    let now = Utc::now();
    let updated = match decision {
        AssignmentDecision::Approve => {
            let campaign = fetch_campaign(db, assignment.campaign_id).await?;
            let start_date = std::cmp::max(now, campaign.terms()?.start_date);
            db.assignments()
                .approve_assignment(assignment_id, start_date, now)
                .await?
        }
        AssignmentDecision::Reject => db.assignments().reject_assignment(assignment_id, now).await?,
    };

    let assignment = match updated {
        Some(assignment) => assignment,
        None => return Err(lost_transition(db, assignment_id, to).await),
    };

    info!(assignment_id = %assignment_id, status = ?assignment.status, "assignment decided");
    notifications.send(
        assignment.driver_id,
        NotificationEvent::AssignmentDecided {
            assignment_id,
            campaign_id: assignment.campaign_id,
            status: assignment.status,
        },
    );

    Ok(assignment)
}

/// approved -> due_soon, warning the driver that the campaign is ending.
#[tracing::instrument(skip(db, notifications))]
pub async fn mark_due_soon(
    db: &dyn Database,
    notifications: &Notifications,
    assignment_id: AssignmentId,
    now: DateTime<Utc>,
) -> Result<Assignment, Error> {
    let assignment = fetch_assignment(db, assignment_id).await?;
    assignment
        .status
        .ensure_transition(AssignmentStatus::DueSoon)?;

    let assignment = match db
        .assignments()
        .update_assignment_status(
            assignment_id,
            AssignmentStatus::Approved,
            AssignmentStatus::DueSoon,
            now,
        )
        .await?
    {
        Some(assignment) => assignment,
        None => return Err(lost_transition(db, assignment_id, AssignmentStatus::DueSoon).await),
    };

    debug!(assignment_id = %assignment_id, "assignment due soon");
    notifications.send(
        assignment.driver_id,
        NotificationEvent::AssignmentDueSoon {
            assignment_id,
            campaign_id: assignment.campaign_id,
        },
    );

    Ok(assignment)
}

/// The periods of the campaign window the driver has no approved weekly
/// proof for.
async fn missing_periods(
    db: &dyn Database,
    campaign: &Campaign,
    driver_id: UserId,
) -> Result<Vec<ProofPeriod>, Error> {
    let approved: Vec<ProofPeriod> = db
        .weekly_proofs()
        .fetch_weekly_proofs_by_campaign_and_driver(campaign.id, driver_id)
        .await?
        .into_iter()
        .filter(|proof| proof.status == WeeklyProofStatus::Approved)
        .map(|proof| proof.period)
        .collect();

    let missing = campaign
        .terms()?
        .required_periods()
        .into_iter()
        .filter(|period| !approved.contains(period))
        .collect();

    Ok(missing)
}

/// Completes the assignment once every week of the campaign has an approved
/// proof, releasing the driver's accrued earnings into their balance.
#[tracing::instrument(skip(db, notifications))]
pub async fn mark_completed(
    db: &dyn Database,
    notifications: &Notifications,
    assignment_id: AssignmentId,
) -> Result<Assignment, Error> {
    let assignment = fetch_assignment(db, assignment_id).await?;
    assignment
        .status
        .ensure_transition(AssignmentStatus::Completed)?;

    let campaign = fetch_campaign(db, assignment.campaign_id).await?;
    let missing_periods = missing_periods(db, &campaign, assignment.driver_id).await?;
    if !missing_periods.is_empty() {
        return Err(Error::WeeklyProofsOutstanding {
            assignment_id,
            missing_periods,
        });
    }

    let now = Utc::now();
    let assignment = match db
        .assignments()
        .complete_assignment(assignment_id, now)
        .await?
    {
        Some(assignment) => assignment,
        None => return Err(lost_transition(db, assignment_id, AssignmentStatus::Completed).await),
    };

    info!(
        assignment_id = %assignment_id,
        released = assignment.accrued,
        "assignment completed"
    );
    notifications.send(
        assignment.driver_id,
        NotificationEvent::AssignmentCompleted {
            assignment_id,
            campaign_id: assignment.campaign_id,
            released: assignment.accrued,
        },
    );

    transition_to_completed(db, notifications, assignment.campaign_id, now).await?;

    Ok(assignment)
}

/// Drivers see their own assignments, owners the ones on their campaigns, and
/// admins all of them.
#[tracing::instrument(skip(db))]
pub async fn get_assignment(
    db: &dyn Database,
    identity: Identity,
    assignment_id: AssignmentId,
) -> Result<Assignment, Error> {
    let assignment = fetch_assignment(db, assignment_id).await?;

    let visible = match identity.role {
        Role::Admin => true,
        Role::Driver => assignment.driver_id == identity.user_id,
        Role::BusinessOwner => {
            fetch_campaign(db, assignment.campaign_id).await?.owner_id == identity.user_id
        }
    };

    if !visible {
        return Err(Error::AssignmentNotFound { assignment_id });
    }

    Ok(assignment)
}

#[tracing::instrument(skip(db))]
pub async fn get_assignments_for_driver(
    db: &dyn Database,
    driver_id: UserId,
) -> Result<Vec<Assignment>, Error> {
    let assignments = db.assignments().fetch_assignments_by_driver(driver_id).await?;

    Ok(assignments)
}

#[tracing::instrument(skip(db))]
pub async fn get_assignments_for_campaign(
    db: &dyn Database,
    identity: Identity,
    campaign_id: CampaignId,
) -> Result<Vec<Assignment>, Error> {
    identity.require_any(&[Role::Admin, Role::BusinessOwner])?;
    if identity.role == Role::BusinessOwner
        && fetch_campaign(db, campaign_id).await?.owner_id != identity.user_id
    {
        return Err(Error::CampaignNotFound { campaign_id });
    }

    let assignments = db
        .assignments()
        .fetch_assignments_by_campaign(campaign_id)
        .await?;

    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;

    use super::*;
    use crate::campaign::{CampaignStatus, PaymentStatus};
    use crate::database::MemoryDatabase;
    use crate::testing;

    #[tokio::test]
    async fn apply_takes_a_slot() {
        let db = MemoryDatabase::new();
        let campaign = testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();

        let assignment = apply(&db, &testing::notifications(), driver_id, campaign.id)
            .await
            .unwrap();

        assert_eq!(assignment.status, AssignmentStatus::PendingApproval);
        assert!(!assignment.active);
        let campaign = fetch_campaign(&db, campaign.id).await.unwrap();
        assert_eq!(campaign.driver_slots_taken, 1);
        assert!(db.accounts().fetch_account(driver_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn apply_refuses_duplicates() {
        let db = MemoryDatabase::new();
        let campaign = testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        let notifications = testing::notifications();

        apply(&db, &notifications, driver_id, campaign.id).await.unwrap();

        assert_eq!(
            apply(&db, &notifications, driver_id, campaign.id)
                .await
                .unwrap_err(),
            Error::AssignmentAlreadyExists {
                campaign_id: campaign.id,
                driver_id,
            }
        );
        let campaign = fetch_campaign(&db, campaign.id).await.unwrap();
        assert_eq!(campaign.driver_slots_taken, 1);
    }

    #[tokio::test]
    async fn apply_requires_a_paid_campaign() {
        let db = MemoryDatabase::new();
        let campaign =
            testing::approved_campaign(&db, UserId::new(), testing::details(Utc::now())).await;

        assert_eq!(
            apply(&db, &testing::notifications(), UserId::new(), campaign.id)
                .await
                .unwrap_err(),
            Error::CampaignNotAcceptingDrivers {
                campaign_id: campaign.id,
                status: CampaignStatus::Approved,
                payment_status: PaymentStatus::Pending,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_applications_never_exceed_capacity() {
        let db = Arc::new(MemoryDatabase::new());
        let campaign =
            testing::funded_campaign(db.as_ref(), UserId::new(), testing::details(Utc::now()))
                .await;
        let notifications = testing::notifications();
        let start = Arc::new(Barrier::new(10));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let db = Arc::clone(&db);
                let notifications = notifications.clone();
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    apply(db.as_ref(), &notifications, UserId::new(), campaign.id).await
                })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(err) => assert!(matches!(
                    err,
                    Error::CampaignFull { .. } | Error::CampaignNotAcceptingDrivers { .. }
                )),
            }
        }

        assert_eq!(succeeded, testing::DRIVERS);
        let campaign = fetch_campaign(db.as_ref(), campaign.id).await.unwrap();
        assert_eq!(campaign.driver_slots_taken, testing::DRIVERS);
        assert_eq!(campaign.status, CampaignStatus::Active);
    }

    #[tokio::test]
    async fn rejecting_frees_the_slot() {
        let db = MemoryDatabase::new();
        let campaign = testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let notifications = testing::notifications();

        let assignment = apply(&db, &notifications, UserId::new(), campaign.id)
            .await
            .unwrap();
        let assignment = decide(&db, &notifications, assignment.id, AssignmentDecision::Reject)
            .await
            .unwrap();

        assert_eq!(assignment.status, AssignmentStatus::Rejected);
        let campaign = fetch_campaign(&db, campaign.id).await.unwrap();
        assert_eq!(campaign.driver_slots_taken, 0);

        assert!(matches!(
            decide(&db, &notifications, assignment.id, AssignmentDecision::Approve).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn approving_marks_active_from_the_campaign_start() {
        let db = MemoryDatabase::new();
        let start_date = Utc::now() + chrono::Duration::days(3);
        let campaign = testing::funded_campaign(&db, UserId::new(), testing::details(start_date)).await;

        let assignment = testing::approved_assignment(&db, &campaign, UserId::new()).await;

        assert_eq!(assignment.status, AssignmentStatus::Approved);
        assert!(assignment.active);
        assert_eq!(
            assignment.start_date,
            Some(campaign.terms().unwrap().start_date)
        );
    }

    #[tokio::test]
    async fn due_soon_only_from_approved() {
        let db = MemoryDatabase::new();
        let campaign = testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let notifications = testing::notifications();

        let pending = apply(&db, &notifications, UserId::new(), campaign.id)
            .await
            .unwrap();
        assert!(matches!(
            mark_due_soon(&db, &notifications, pending.id, Utc::now()).await,
            Err(Error::InvalidTransition { .. })
        ));

        let approved = testing::approved_assignment(&db, &campaign, UserId::new()).await;
        let due_soon = mark_due_soon(&db, &notifications, approved.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(due_soon.status, AssignmentStatus::DueSoon);
        assert!(due_soon.active);
    }

    #[tokio::test]
    async fn completion_lists_outstanding_weeks() {
        let db = MemoryDatabase::new();
        let campaign = testing::funded_campaign(&db, UserId::new(), testing::details(Utc::now())).await;
        let assignment = testing::approved_assignment(&db, &campaign, UserId::new()).await;

        let err = mark_completed(&db, &testing::notifications(), assignment.id)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::WeeklyProofsOutstanding {
                assignment_id: assignment.id,
                missing_periods: campaign.terms().unwrap().required_periods(),
            }
        );
        let assignment = fetch_assignment(&db, assignment.id).await.unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Approved);
    }

    #[tokio::test]
    async fn assignments_are_scoped_to_the_caller() {
        let db = MemoryDatabase::new();
        let owner_id = UserId::new();
        let campaign = testing::funded_campaign(&db, owner_id, testing::details(Utc::now())).await;
        let driver_id = UserId::new();
        let assignment = apply(&db, &testing::notifications(), driver_id, campaign.id)
            .await
            .unwrap();

        let owner = Identity::new(owner_id, Role::BusinessOwner);
        let stranger = Identity::new(UserId::new(), Role::BusinessOwner);
        let other_driver = Identity::new(UserId::new(), Role::Driver);

        assert!(get_assignment(&db, owner, assignment.id).await.is_ok());
        assert!(get_assignment(&db, Identity::new(driver_id, Role::Driver), assignment.id)
            .await
            .is_ok());
        assert_eq!(
            get_assignment(&db, other_driver, assignment.id)
                .await
                .unwrap_err(),
            Error::AssignmentNotFound {
                assignment_id: assignment.id
            }
        );
        assert_eq!(
            get_assignments_for_campaign(&db, owner, campaign.id)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            get_assignments_for_campaign(&db, stranger, campaign.id)
                .await
                .unwrap_err(),
            Error::CampaignNotFound {
                campaign_id: campaign.id
            }
        );
        assert_eq!(
            get_assignments_for_campaign(&db, other_driver, campaign.id)
                .await
                .unwrap_err(),
            Error::PermissionDenied {
                user_id: other_driver.user_id,
                role: Role::Driver,
                allowed_roles: vec![Role::Admin, Role::BusinessOwner],
            }
        );
        assert_eq!(
            get_assignments_for_driver(&db, driver_id).await.unwrap()[0].id,
            assignment.id
        );
    }
}
