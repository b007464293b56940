use actix_web::web::{Data, Json, Path, ServiceConfig};
use actix_web::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Amount;
use crate::campaign::CampaignId;
use crate::database::Database;
use crate::error::Error;
use crate::notification::Notifications;
use crate::user::{Identity, Role, UserId};

use super::{manager, Assignment, AssignmentDecision, AssignmentId, AssignmentStatus};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DecideAssignmentBody {
    pub decision: AssignmentDecision,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssignmentBody {
    pub id: AssignmentId,
    pub campaign_id: CampaignId,
    pub driver_id: UserId,
    pub status: AssignmentStatus,
    pub active: bool,
    pub paid: bool,
    pub accrued: Amount,
    pub start_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl AssignmentBody {
    pub fn render(assignment: Assignment) -> AssignmentBody {
        AssignmentBody {
            id: assignment.id,
            campaign_id: assignment.campaign_id,
            driver_id: assignment.driver_id,
            status: assignment.status,
            active: assignment.active,
            paid: assignment.paid,
            accrued: assignment.accrued,
            start_date: assignment.start_date,
            created_at: assignment.created_at,
            modified_at: assignment.modified_at,
        }
    }
}

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(apply_to_campaign)
        .service(get_assignments_in_campaign)
        .service(get_own_assignments)
        .service(get_assignment_by_id)
        .service(decide_assignment)
        .service(mark_assignment_due_soon)
        .service(complete_assignment);
}

#[post("/campaigns/{campaign_id}/assignments")]
#[tracing::instrument(skip(db, notifications))]
async fn apply_to_campaign(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<CampaignId>,
) -> Result<Json<AssignmentBody>, Error> {
    let driver_id = identity.require(Role::Driver)?;
    let campaign_id = params.into_inner();

    let assignment =
        manager::apply(db.get_ref(), notifications.get_ref(), driver_id, campaign_id).await?;

    Ok(Json(AssignmentBody::render(assignment)))
}

#[get("/campaigns/{campaign_id}/assignments")]
#[tracing::instrument(skip(db))]
async fn get_assignments_in_campaign(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<CampaignId>,
) -> Result<Json<Vec<AssignmentBody>>, Error> {
    let campaign_id = params.into_inner();

    let assignments =
        manager::get_assignments_for_campaign(db.get_ref(), identity, campaign_id).await?;

    let body = assignments.into_iter().map(AssignmentBody::render).collect();

    Ok(Json(body))
}

#[get("/assignments")]
#[tracing::instrument(skip(db))]
async fn get_own_assignments(
    db: Data<dyn Database>,
    identity: Identity,
) -> Result<Json<Vec<AssignmentBody>>, Error> {
    let driver_id = identity.require(Role::Driver)?;

    let assignments = manager::get_assignments_for_driver(db.get_ref(), driver_id).await?;

    let body = assignments.into_iter().map(AssignmentBody::render).collect();

    Ok(Json(body))
}

#[get("/assignments/{assignment_id}")]
#[tracing::instrument(skip(db))]
async fn get_assignment_by_id(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<AssignmentId>,
) -> Result<Json<AssignmentBody>, Error> {
    let assignment_id = params.into_inner();

    let assignment = manager::get_assignment(db.get_ref(), identity, assignment_id).await?;

    Ok(Json(AssignmentBody::render(assignment)))
}

#[post("/assignments/{assignment_id}/decision")]
#[tracing::instrument(skip(db, notifications))]
async fn decide_assignment(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<AssignmentId>,
    body: Json<DecideAssignmentBody>,
) -> Result<Json<AssignmentBody>, Error> {
    identity.require(Role::Admin)?;
    let assignment_id = params.into_inner();

    let assignment = manager::decide(
        db.get_ref(),
        notifications.get_ref(),
        assignment_id,
        body.decision,
    )
    .await?;

    Ok(Json(AssignmentBody::render(assignment)))
}

#[post("/assignments/{assignment_id}/due-soon")]
#[tracing::instrument(skip(db, notifications))]
async fn mark_assignment_due_soon(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<AssignmentId>,
) -> Result<Json<AssignmentBody>, Error> {
    identity.require(Role::Admin)?;
    let assignment_id = params.into_inner();

    let assignment =
        manager::mark_due_soon(db.get_ref(), notifications.get_ref(), assignment_id, Utc::now())
            .await?;

    Ok(Json(AssignmentBody::render(assignment)))
}

#[post("/assignments/{assignment_id}/complete")]
#[tracing::instrument(skip(db, notifications))]
async fn complete_assignment(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<AssignmentId>,
) -> Result<Json<AssignmentBody>, Error> {
    identity.require(Role::Admin)?;
    let assignment_id = params.into_inner();

    let assignment =
        manager::mark_completed(db.get_ref(), notifications.get_ref(), assignment_id).await?;

    Ok(Json(AssignmentBody::render(assignment)))
}
