use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson;
use mongodb::options::FindOptions;
use mongodb::{ClientSession, Database};

use crate::account::LedgerMove;
use crate::campaign::{Campaign, CampaignId, CampaignStatus};
use crate::database::memory::{sorted, MemoryState};
use crate::database::{
    bson_now, is_duplicate_key, return_updated, MemoryDatabase,
    MongoDatabase,
};
use crate::error::Error;
use crate::user::UserId;

use super::{Assignment, AssignmentId, AssignmentStatus};

pub const ASSIGNMENTS: &str = "assignments";

pub async fn initialize(db: &Database) -> Result<(), Error> {
    db.run_command(
        bson::doc! {
            "createIndexes": ASSIGNMENTS,
            "indexes": [
                {
                    "key": { "campaign_id": 1, "driver_id": 1 },
                    "name": "campaign_id_1_driver_id_1",
                    "unique": true,
                },
                { "key": { "driver_id": 1 }, "name": "driver_id_1" },
                { "key": { "status": 1 }, "name": "status_1" },
            ],
        },
        None,
    )
    .await?;

    Ok(())
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Takes one driver slot of the campaign and inserts the assignment as a
    /// single unit. Returns the campaign with the slot taken.
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<Campaign, Error>;

    async fn fetch_assignment_by_id(
        &self,
        assignment_id: AssignmentId,
    ) -> Result<Option<Assignment>, Error>;

    async fn fetch_assignment_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Option<Assignment>, Error>;

    async fn fetch_assignments_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<Assignment>, Error>;

    async fn fetch_assignments_by_driver(&self, driver_id: UserId)
        -> Result<Vec<Assignment>, Error>;

    async fn fetch_assignments_by_status(
        &self,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<Assignment>, Error>;

    /// pending_approval -> approved. `None` if it is no longer pending.
    async fn approve_assignment(
        &self,
        assignment_id: AssignmentId,
        start_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error>;

    /// pending_approval -> rejected, giving the slot back to the campaign in
    /// the same unit.
    async fn reject_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error>;

    async fn update_assignment_status(
        &self,
        assignment_id: AssignmentId,
        from: AssignmentStatus,
        to: AssignmentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error>;

    /// approved|due_soon -> completed, releasing the accrued earnings from the
    /// driver's pending balance into the available balance in the same unit.
    async fn complete_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error>;
}

fn not_accepting(campaign: &Campaign) -> Error {
    Error::CampaignNotAcceptingDrivers {
        campaign_id: campaign.id,
        status: campaign.status,
        payment_status: campaign.payment_status,
    }
}

/// Why a slot could not be taken on the campaign as it is now.
fn slot_refusal(campaign: &Campaign) -> Error {
    if !campaign.is_accepting_drivers() {
        return not_accepting(campaign);
    }

    Error::CampaignFull {
        campaign_id: campaign.id,
        drivers_requested: campaign
            .terms
            .as_ref()
            .map_or(0, |terms| terms.drivers_requested),
    }
}

fn running_statuses() -> Vec<&'static str> {
    vec![
        AssignmentStatus::Approved.name(),
        AssignmentStatus::DueSoon.name(),
    ]
}

fn oldest_first() -> FindOptions {
    FindOptions::builder()
        .sort(bson::doc! { "created_at": 1 })
        .build()
}

#[async_trait]
impl AssignmentStore for MongoDatabase {
    #[tracing::instrument(skip(self))]
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<Campaign, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self.insert_assignment_with_session(&mut session, assignment).await;
                (session, result)
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_assignment_by_id(
        &self,
        assignment_id: AssignmentId,
    ) -> Result<Option<Assignment>, Error> {
        let assignment: Option<Assignment> = self
            .assignments
            .find_one(bson::doc! { "_id": assignment_id }, None)
            .await?;

        Ok(assignment)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_assignment_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Option<Assignment>, Error> {
        let assignment: Option<Assignment> = self
            .assignments
            .find_one(
                bson::doc! { "campaign_id": campaign_id, "driver_id": driver_id },
                None,
            )
            .await?;

        Ok(assignment)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_assignments_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<Assignment>, Error> {
        let assignments: Vec<Assignment> = self
            .assignments
            .find(bson::doc! { "campaign_id": campaign_id }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(assignments)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_assignments_by_driver(
        &self,
        driver_id: UserId,
    ) -> Result<Vec<Assignment>, Error> {
        let assignments: Vec<Assignment> = self
            .assignments
            .find(bson::doc! { "driver_id": driver_id }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(assignments)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_assignments_by_status(
        &self,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<Assignment>, Error> {
        let statuses: Vec<&str> = statuses.iter().map(|status| status.name()).collect();
        let assignments: Vec<Assignment> = self
            .assignments
            .find(bson::doc! { "status": { "$in": statuses } }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(assignments)
    }

    #[tracing::instrument(skip(self))]
    async fn approve_assignment(
        &self,
        assignment_id: AssignmentId,
        start_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let assignment = self
            .assignments
            .find_one_and_update(
                bson::doc! {
                    "_id": assignment_id,
                    "status": AssignmentStatus::PendingApproval.name(),
                },
                bson::doc! {
                    "$set": {
                        "status": AssignmentStatus::Approved.name(),
                        "active": true,
                        "start_date": bson::to_bson(&start_date)?,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
            )
            .await?;

        Ok(assignment)
    }

    #[tracing::instrument(skip(self))]
    async fn reject_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self
                    .reject_assignment_with_session(&mut session, assignment_id, now)
                    .await;
                (session, result)
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn update_assignment_status(
        &self,
        assignment_id: AssignmentId,
        from: AssignmentStatus,
        to: AssignmentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let assignment = self
            .assignments
            .find_one_and_update(
                bson::doc! { "_id": assignment_id, "status": from.name() },
                bson::doc! { "$set": { "status": to.name(), "modified_at": bson_now(now) } },
                return_updated(),
            )
            .await?;

        Ok(assignment)
    }

    #[tracing::instrument(skip(self))]
    async fn complete_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self
                    .complete_assignment_with_session(&mut session, assignment_id, now)
                    .await;
                (session, result)
            })
        })
        .await
    }
}

impl MongoDatabase {
    async fn insert_assignment_with_session(
        &self,
        session: &mut ClientSession,
        assignment: &Assignment,
    ) -> Result<Campaign, Error> {
        let pair = bson::doc! {
            "campaign_id": assignment.campaign_id,
            "driver_id": assignment.driver_id,
        };
        let existing = self
            .assignments
            .find_one_with_session(pair, None, session)
            .await?;
        if existing.is_some() {
            return Err(Error::AssignmentAlreadyExists {
                campaign_id: assignment.campaign_id,
                driver_id: assignment.driver_id,
            });
        }

        let campaign = self
            .campaigns
            .find_one_and_update_with_session(
                bson::doc! {
                    "_id": assignment.campaign_id,
                    "status": CampaignStatus::Approved.name(),
                    "payment_status": "spent",
                    "$expr": { "$lt": ["$driver_slots_taken", "$terms.drivers_requested"] },
                },
                bson::doc! {
                    "$inc": { "driver_slots_taken": 1 },
                    "$set": { "modified_at": bson_now(assignment.created_at) },
                },
                return_updated(),
                session,
            )
            .await?;

        let campaign = match campaign {
            Some(campaign) => campaign,
            None => {
                let campaign_id = assignment.campaign_id;
                let current = self
                    .campaigns
                    .find_one_with_session(bson::doc! { "_id": campaign_id }, None, session)
                    .await?
                    .ok_or(Error::CampaignNotFound { campaign_id })?;
                return Err(slot_refusal(&current));
            }
        };

        match self
            .assignments
            .insert_one_with_session(assignment, None, session)
            .await
        {
            Ok(_) => Ok(campaign),
            Err(err) if is_duplicate_key(&err) => Err(Error::AssignmentAlreadyExists {
                campaign_id: assignment.campaign_id,
                driver_id: assignment.driver_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn reject_assignment_with_session(
        &self,
        session: &mut ClientSession,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let assignment = self
            .assignments
            .find_one_and_update_with_session(
                bson::doc! {
                    "_id": assignment_id,
                    "status": AssignmentStatus::PendingApproval.name(),
                },
                bson::doc! {
                    "$set": {
                        "status": AssignmentStatus::Rejected.name(),
                        "active": false,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
                session,
            )
            .await?;

        let assignment = match assignment {
            Some(assignment) => assignment,
            None => return Ok(None),
        };

        self.campaigns
            .update_one_with_session(
                bson::doc! { "_id": assignment.campaign_id, "driver_slots_taken": { "$gt": 0 } },
                bson::doc! {
                    "$inc": { "driver_slots_taken": -1 },
                    "$set": { "modified_at": bson_now(now) },
                },
                None,
                session,
            )
            .await?;

        Ok(Some(assignment))
    }

    async fn complete_assignment_with_session(
        &self,
        session: &mut ClientSession,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let assignment = self
            .assignments
            .find_one_and_update_with_session(
                bson::doc! { "_id": assignment_id, "status": { "$in": running_statuses() } },
                bson::doc! {
                    "$set": {
                        "status": AssignmentStatus::Completed.name(),
                        "active": false,
                        "paid": true,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
                session,
            )
            .await?;

        let assignment = match assignment {
            Some(assignment) => assignment,
            None => return Ok(None),
        };

        if assignment.accrued > 0 {
            self.apply_ledger_move_with_session(
                session,
                assignment.driver_id,
                LedgerMove::PendingToBalance(assignment.accrued),
                now,
            )
            .await?;
        }

        Ok(Some(assignment))
    }
}

impl MemoryState {
    fn assignment_mut(&mut self, assignment_id: AssignmentId) -> Option<&mut Assignment> {
        self.assignments.get_mut(&assignment_id)
    }
}

#[async_trait]
impl AssignmentStore for MemoryDatabase {
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<Campaign, Error> {
        let mut state = self.lock()?;

        let exists = state.assignments.values().any(|existing| {
            existing.campaign_id == assignment.campaign_id
                && existing.driver_id == assignment.driver_id
        });
        if exists {
            return Err(Error::AssignmentAlreadyExists {
                campaign_id: assignment.campaign_id,
                driver_id: assignment.driver_id,
            });
        }

        let campaign_id = assignment.campaign_id;
        let campaign = state
            .campaigns
            .get_mut(&campaign_id)
            .ok_or(Error::CampaignNotFound { campaign_id })?;
        if !campaign.is_accepting_drivers() || !campaign.has_open_slots() {
            return Err(slot_refusal(campaign));
        }

        campaign.driver_slots_taken += 1;
        campaign.modified_at = assignment.created_at;
        let campaign = campaign.clone();

        state.assignments.insert(assignment.id, assignment.clone());

        Ok(campaign)
    }

    async fn fetch_assignment_by_id(
        &self,
        assignment_id: AssignmentId,
    ) -> Result<Option<Assignment>, Error> {
        let state = self.lock()?;

        Ok(state.assignments.get(&assignment_id).cloned())
    }

    async fn fetch_assignment_by_campaign_and_driver(
        &self,
        campaign_id: CampaignId,
        driver_id: UserId,
    ) -> Result<Option<Assignment>, Error> {
        let state = self.lock()?;
        let assignment = state
            .assignments
            .values()
            .find(|assignment| {
                assignment.campaign_id == campaign_id && assignment.driver_id == driver_id
            })
            .cloned();

        Ok(assignment)
    }

    async fn fetch_assignments_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<Assignment>, Error> {
        let state = self.lock()?;
        let assignments = state
            .assignments
            .values()
            .filter(|assignment| assignment.campaign_id == campaign_id)
            .cloned();

        Ok(sorted(assignments, |assignment| assignment.created_at))
    }

    async fn fetch_assignments_by_driver(
        &self,
        driver_id: UserId,
    ) -> Result<Vec<Assignment>, Error> {
        let state = self.lock()?;
        let assignments = state
            .assignments
            .values()
            .filter(|assignment| assignment.driver_id == driver_id)
            .cloned();

        Ok(sorted(assignments, |assignment| assignment.created_at))
    }

    async fn fetch_assignments_by_status(
        &self,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<Assignment>, Error> {
        let state = self.lock()?;
        let assignments = state
            .assignments
            .values()
            .filter(|assignment| statuses.contains(&assignment.status))
            .cloned();

        Ok(sorted(assignments, |assignment| assignment.created_at))
    }

    async fn approve_assignment(
        &self,
        assignment_id: AssignmentId,
        start_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let mut state = self.lock()?;
        let assignment = match state.assignment_mut(assignment_id) {
            Some(assignment) if assignment.status == AssignmentStatus::PendingApproval => {
                assignment
            }
            _ => return Ok(None),
        };

        assignment.status = AssignmentStatus::Approved;
        assignment.active = true;
        assignment.start_date = Some(start_date);
        assignment.modified_at = now;

        Ok(Some(assignment.clone()))
    }

    async fn reject_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let mut state = self.lock()?;
        let assignment = match state.assignment_mut(assignment_id) {
            Some(assignment) if assignment.status == AssignmentStatus::PendingApproval => {
                assignment
            }
            _ => return Ok(None),
        };

        assignment.status = AssignmentStatus::Rejected;
        assignment.active = false;
        assignment.modified_at = now;
        let assignment = assignment.clone();

        if let Some(campaign) = state.campaigns.get_mut(&assignment.campaign_id) {
            if campaign.driver_slots_taken > 0 {
                campaign.driver_slots_taken -= 1;
                campaign.modified_at = now;
            }
        }

        Ok(Some(assignment))
    }

    async fn update_assignment_status(
        &self,
        assignment_id: AssignmentId,
        from: AssignmentStatus,
        to: AssignmentStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let mut state = self.lock()?;
        let assignment = match state.assignment_mut(assignment_id) {
            Some(assignment) if assignment.status == from => assignment,
            _ => return Ok(None),
        };

        assignment.status = to;
        assignment.modified_at = now;

        Ok(Some(assignment.clone()))
    }

    async fn complete_assignment(
        &self,
        assignment_id: AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, Error> {
        let mut state = self.lock()?;
        let (driver_id, accrued) = match state.assignments.get(&assignment_id) {
            Some(assignment) if assignment.is_running() => {
                (assignment.driver_id, assignment.accrued)
            }
            _ => return Ok(None),
        };

        if accrued > 0 {
            state.apply_ledger_move(driver_id, LedgerMove::PendingToBalance(accrued), now)?;
        }

        let assignment = state.assignment_mut(assignment_id).ok_or_else(|| {
            Error::ExistentialState(format!("assignment {} vanished", assignment_id))
        })?;
        assignment.status = AssignmentStatus::Completed;
        assignment.active = false;
        assignment.paid = true;
        assignment.modified_at = now;

        Ok(Some(assignment.clone()))
    }
}
