use actix_web::web::{Bytes, Data, Json, Path, Query, ServiceConfig};
use actix_web::{delete, get, post, put, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Amount;
use crate::config::RetryConfig;
use crate::database::Database;
use crate::error::Error;
use crate::gateway::{PaymentGateway, SIGNATURE_HEADER};
use crate::notification::Notifications;
use crate::user::{Identity, Role, UserId};

use super::{
    manager, Campaign, CampaignDecision, CampaignDetails, CampaignId, CampaignStatus,
    CampaignTerms, GatewayPayment, PackageType, PaymentSettlement, PaymentStatus,
};

#[derive(Clone, Debug, Deserialize)]
pub struct CampaignQuery {
    pub status: Option<CampaignStatus>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReviewCampaignBody {
    pub decision: CampaignDecision,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InitializePaymentBody {
    pub email: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PaymentInitBody {
    pub campaign: CampaignBody,
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CampaignTermsBody {
    pub name: String,
    pub package_type: PackageType,
    pub price: Amount,
    pub drivers_requested: i32,
    pub earning_per_driver: Amount,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub duration_days: i32,
}

impl CampaignTermsBody {
    pub fn render(terms: CampaignTerms) -> CampaignTermsBody {
        CampaignTermsBody {
            name: terms.name,
            package_type: terms.package_type,
            price: terms.price,
            drivers_requested: terms.drivers_requested,
            earning_per_driver: terms.earning_per_driver,
            start_date: terms.start_date,
            end_date: terms.end_date,
            duration_days: terms.duration_days,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CampaignBody {
    pub id: CampaignId,
    pub owner_id: UserId,
    pub status: CampaignStatus,
    pub details: CampaignDetails,
    pub terms: Option<CampaignTermsBody>,
    pub payment_status: PaymentStatus,
    pub payments: Vec<GatewayPaymentBody>,
    pub driver_slots_taken: i32,
    pub review_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GatewayPaymentBody {
    pub reference: String,
    pub settlement: Option<PaymentSettlement>,
    pub amount: Option<Amount>,
    pub created_at: DateTime<Utc>,
}

impl GatewayPaymentBody {
    pub fn render(payment: GatewayPayment) -> GatewayPaymentBody {
        GatewayPaymentBody {
            reference: payment.reference,
            settlement: payment.settlement,
            amount: payment.amount,
            created_at: payment.created_at,
        }
    }
}

impl CampaignBody {
    pub fn render(campaign: Campaign) -> CampaignBody {
        CampaignBody {
            id: campaign.id,
            owner_id: campaign.owner_id,
            status: campaign.status,
            details: campaign.details,
            terms: campaign.terms.map(CampaignTermsBody::render),
            payment_status: campaign.payment_status,
            payments: campaign
                .payments
                .into_iter()
                .map(GatewayPaymentBody::render)
                .collect(),
            driver_slots_taken: campaign.driver_slots_taken,
            review_comment: campaign.review_comment,
            created_at: campaign.created_at,
            modified_at: campaign.modified_at,
        }
    }
}

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(create_draft)
        .service(publish_campaign)
        .service(get_campaigns)
        .service(get_campaign_by_id)
        .service(update_draft)
        .service(delete_draft)
        .service(publish_draft)
        .service(review_campaign)
        .service(initialize_payment)
        .service(pay_from_balance)
        .service(verify_payment)
        .service(payment_webhook);
}

#[post("/campaigns/drafts")]
#[tracing::instrument(skip(db))]
async fn create_draft(
    db: Data<dyn Database>,
    identity: Identity,
    body: Json<CampaignDetails>,
) -> Result<Json<CampaignBody>, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;

    let campaign = manager::create_draft(db.get_ref(), owner_id, body.into_inner()).await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[post("/campaigns")]
#[tracing::instrument(skip(db, notifications))]
async fn publish_campaign(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    body: Json<CampaignDetails>,
) -> Result<Json<CampaignBody>, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;

    let campaign = manager::publish(
        db.get_ref(),
        notifications.get_ref(),
        owner_id,
        body.into_inner(),
    )
    .await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[get("/campaigns")]
#[tracing::instrument(skip(db))]
async fn get_campaigns(
    db: Data<dyn Database>,
    identity: Identity,
    query: Query<CampaignQuery>,
) -> Result<Json<Vec<CampaignBody>>, Error> {
    let campaigns = manager::get_campaigns(db.get_ref(), identity, query.status).await?;

    let body = campaigns.into_iter().map(CampaignBody::render).collect();

    Ok(Json(body))
}

#[get("/campaigns/{campaign_id}")]
#[tracing::instrument(skip(db))]
async fn get_campaign_by_id(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<CampaignId>,
) -> Result<Json<CampaignBody>, Error> {
    let campaign_id = params.into_inner();

    let campaign = manager::get_campaign(db.get_ref(), identity, campaign_id).await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[put("/campaigns/{campaign_id}")]
#[tracing::instrument(skip(db))]
async fn update_draft(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<CampaignId>,
    body: Json<CampaignDetails>,
) -> Result<Json<CampaignBody>, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;
    let campaign_id = params.into_inner();

    let campaign =
        manager::update_draft(db.get_ref(), owner_id, campaign_id, body.into_inner()).await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[delete("/campaigns/{campaign_id}")]
#[tracing::instrument(skip(db))]
async fn delete_draft(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<CampaignId>,
) -> Result<HttpResponse, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;
    let campaign_id = params.into_inner();

    manager::delete_draft(db.get_ref(), owner_id, campaign_id).await?;

    Ok(HttpResponse::NoContent().finish())
}

/// Submits a draft for review; fields in the body override the draft's.
#[post("/campaigns/{campaign_id}/publish")]
#[tracing::instrument(skip(db, notifications))]
async fn publish_draft(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<CampaignId>,
    body: Option<Json<CampaignDetails>>,
) -> Result<Json<CampaignBody>, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;
    let campaign_id = params.into_inner();
    let changes = body.map(Json::into_inner).unwrap_or_default();

    let campaign = manager::publish_draft(
        db.get_ref(),
        notifications.get_ref(),
        owner_id,
        campaign_id,
        changes,
    )
    .await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[post("/campaigns/{campaign_id}/review")]
#[tracing::instrument(skip(db, notifications))]
async fn review_campaign(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<CampaignId>,
    body: Json<ReviewCampaignBody>,
) -> Result<Json<CampaignBody>, Error> {
    identity.require(Role::Admin)?;
    let campaign_id = params.into_inner();
    let body = body.into_inner();

    let campaign = manager::review_decision(
        db.get_ref(),
        notifications.get_ref(),
        campaign_id,
        body.decision,
        body.comment,
    )
    .await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[post("/campaigns/{campaign_id}/payment")]
#[tracing::instrument(skip(db, gateway, retry, body))]
async fn initialize_payment(
    db: Data<dyn Database>,
    gateway: Data<dyn PaymentGateway>,
    retry: Data<RetryConfig>,
    identity: Identity,
    params: Path<CampaignId>,
    body: Json<InitializePaymentBody>,
) -> Result<Json<PaymentInitBody>, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;
    let campaign_id = params.into_inner();

    let init = manager::initialize_payment(
        db.get_ref(),
        gateway.get_ref(),
        retry.get_ref(),
        owner_id,
        campaign_id,
        body.into_inner().email,
    )
    .await?;

    Ok(Json(PaymentInitBody {
        campaign: CampaignBody::render(init.campaign),
        authorization_url: init.authorization_url,
        access_code: init.access_code,
        reference: init.reference,
    }))
}

#[post("/campaigns/{campaign_id}/payment/balance")]
#[tracing::instrument(skip(db, notifications))]
async fn pay_from_balance(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<CampaignId>,
) -> Result<Json<CampaignBody>, Error> {
    let owner_id = identity.require(Role::BusinessOwner)?;
    let campaign_id = params.into_inner();

    let campaign =
        manager::pay_from_balance(db.get_ref(), notifications.get_ref(), owner_id, campaign_id)
            .await?;

    Ok(Json(CampaignBody::render(campaign)))
}

/// The redirect target after checkout. Any caller may ask for the reference
/// to be checked; the gateway is the source of truth.
#[post("/payments/{reference}/verify")]
#[tracing::instrument(skip(db, gateway, retry, notifications))]
async fn verify_payment(
    db: Data<dyn Database>,
    gateway: Data<dyn PaymentGateway>,
    retry: Data<RetryConfig>,
    notifications: Data<Notifications>,
    params: Path<String>,
) -> Result<Json<CampaignBody>, Error> {
    let reference = params.into_inner();

    let campaign = manager::confirm_payment(
        db.get_ref(),
        gateway.get_ref(),
        retry.get_ref(),
        notifications.get_ref(),
        reference,
    )
    .await?;

    Ok(Json(CampaignBody::render(campaign)))
}

#[post("/payments/webhook")]
#[tracing::instrument(skip(db, gateway, retry, notifications, request, payload))]
async fn payment_webhook(
    db: Data<dyn Database>,
    gateway: Data<dyn PaymentGateway>,
    retry: Data<RetryConfig>,
    notifications: Data<Notifications>,
    request: HttpRequest,
    payload: Bytes,
) -> Result<HttpResponse, Error> {
    let signature = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    manager::handle_webhook(
        db.get_ref(),
        gateway.get_ref(),
        retry.get_ref(),
        notifications.get_ref(),
        &payload,
        signature,
    )
    .await?;

    Ok(HttpResponse::Ok().finish())
}
