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

use super::manager::{self, Dashboard};
use super::{ApprovalStatus, Earning, EarningId, PaymentState, PayoutMethod, PayoutRequest};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RequestPayoutBody {
    pub amount: Amount,
    pub method: PayoutMethod,
    pub recipient_reference: String,
    #[serde(default)]
    pub campaign_id: Option<CampaignId>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApprovePayoutBody {
    pub recipient_reference: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RejectPayoutBody {
    pub recipient_reference: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EarningBody {
    pub id: EarningId,
    pub driver_id: UserId,
    pub campaign_id: Option<CampaignId>,
    pub amount: Amount,
    pub method: PayoutMethod,
    pub recipient_reference: String,
    pub approval: ApprovalStatus,
    pub payment: PaymentState,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl EarningBody {
    pub fn render(earning: Earning) -> EarningBody {
        EarningBody {
            id: earning.id,
            driver_id: earning.driver_id,
            campaign_id: earning.campaign_id,
            amount: earning.amount,
            method: earning.method,
            recipient_reference: earning.recipient_reference,
            approval: earning.approval,
            payment: earning.payment,
            reason: earning.reason,
            created_at: earning.created_at,
            modified_at: earning.modified_at,
        }
    }
}

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(request_payout)
        .service(get_earnings)
        .service(get_dashboard)
        .service(approve_payout)
        .service(reject_payout);
}

#[post("/earnings")]
#[tracing::instrument(skip(db))]
async fn request_payout(
    db: Data<dyn Database>,
    identity: Identity,
    body: Json<RequestPayoutBody>,
) -> Result<Json<EarningBody>, Error> {
    let driver_id = identity.require(Role::Driver)?;
    let body = body.into_inner();

    let request = PayoutRequest {
        driver_id,
        campaign_id: body.campaign_id,
        amount: body.amount,
        method: body.method,
        recipient_reference: body.recipient_reference,
    };
    let earning = manager::request_payout(db.get_ref(), request).await?;

    Ok(Json(EarningBody::render(earning)))
}

/// Drivers see their own history; admins see the requests awaiting a decision.
#[get("/earnings")]
#[tracing::instrument(skip(db))]
async fn get_earnings(
    db: Data<dyn Database>,
    identity: Identity,
) -> Result<Json<Vec<EarningBody>>, Error> {
    let earnings = match identity.role {
        Role::Admin => manager::get_unapproved_earnings(db.get_ref()).await?,
        _ => {
            let driver_id = identity.require(Role::Driver)?;
            manager::get_earnings(db.get_ref(), driver_id).await?
        }
    };

    let body = earnings.into_iter().map(EarningBody::render).collect();

    Ok(Json(body))
}

#[get("/earnings/dashboard")]
#[tracing::instrument(skip(db))]
async fn get_dashboard(db: Data<dyn Database>, identity: Identity) -> Result<Json<Dashboard>, Error> {
    let driver_id = identity.require(Role::Driver)?;

    let dashboard = manager::dashboard(db.get_ref(), driver_id).await?;

    Ok(Json(dashboard))
}

#[post("/drivers/{driver_id}/earnings/approve")]
#[tracing::instrument(skip(db, notifications))]
async fn approve_payout(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<UserId>,
    body: Json<ApprovePayoutBody>,
) -> Result<Json<EarningBody>, Error> {
    identity.require(Role::Admin)?;
    let driver_id = params.into_inner();

    let earning = manager::approve_payout(
        db.get_ref(),
        notifications.get_ref(),
        driver_id,
        body.into_inner().recipient_reference,
    )
    .await?;

    Ok(Json(EarningBody::render(earning)))
}

#[post("/drivers/{driver_id}/earnings/reject")]
#[tracing::instrument(skip(db, notifications))]
async fn reject_payout(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<UserId>,
    body: Json<RejectPayoutBody>,
) -> Result<Json<EarningBody>, Error> {
    identity.require(Role::Admin)?;
    let driver_id = params.into_inner();
    let body = body.into_inner();

    let earning = manager::reject_payout(
        db.get_ref(),
        notifications.get_ref(),
        driver_id,
        body.recipient_reference,
        body.reason,
    )
    .await?;

    Ok(Json(EarningBody::render(earning)))
}
