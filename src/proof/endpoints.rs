use actix_web::http::header::CONTENT_TYPE;
use actix_web::web::{Bytes, Data, Json, Path, Query, ServiceConfig};
use actix_web::{get, post, put, HttpRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Amount;
use crate::campaign::CampaignId;
use crate::config::RetryConfig;
use crate::database::Database;
use crate::error::Error;
use crate::evidence::{Evidence, EvidenceStore};
use crate::notification::Notifications;
use crate::user::{Identity, Role, UserId};

use super::{
    manager, InstallmentProof, InstallmentProofId, ProofDecision, ProofPeriod, ProofStatus,
    WeeklyProof, WeeklyProofId, WeeklyProofStatus,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReviewProofBody {
    pub decision: ProofDecision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProofQuery {
    pub driver_id: Option<UserId>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstallmentProofBody {
    pub id: InstallmentProofId,
    pub campaign_id: CampaignId,
    pub driver_id: UserId,
    pub evidence: Evidence,
    pub status: ProofStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl InstallmentProofBody {
    pub fn render(proof: InstallmentProof) -> InstallmentProofBody {
        InstallmentProofBody {
            id: proof.id,
            campaign_id: proof.campaign_id,
            driver_id: proof.driver_id,
            evidence: proof.evidence,
            status: proof.status,
            reason: proof.reason,
            created_at: proof.created_at,
            modified_at: proof.modified_at,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WeeklyProofBody {
    pub id: WeeklyProofId,
    pub campaign_id: CampaignId,
    pub driver_id: UserId,
    pub year: i32,
    pub month: u32,
    pub week: u32,
    pub evidence: Evidence,
    pub status: WeeklyProofStatus,
    pub reason: Option<String>,
    pub accrued: Amount,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl WeeklyProofBody {
    pub fn render(proof: WeeklyProof) -> WeeklyProofBody {
        WeeklyProofBody {
            id: proof.id,
            campaign_id: proof.campaign_id,
            driver_id: proof.driver_id,
            year: proof.period.year,
            month: proof.month,
            week: proof.period.week,
            evidence: proof.evidence,
            status: proof.status,
            reason: proof.reason,
            accrued: proof.accrued,
            created_at: proof.created_at,
            modified_at: proof.modified_at,
        }
    }
}

fn content_type(request: &HttpRequest) -> Option<String> {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(submit_installment_proof)
        .service(get_installment_proofs_in_campaign)
        .service(get_pending_installment_proofs)
        .service(review_installment_proof)
        .service(submit_weekly_proof)
        .service(get_weekly_proofs_in_campaign)
        .service(review_weekly_proof);
}

#[put("/campaigns/{campaign_id}/installment-proof")]
#[tracing::instrument(skip(db, evidence_store, retry, request, payload))]
async fn submit_installment_proof(
    db: Data<dyn Database>,
    evidence_store: Data<dyn EvidenceStore>,
    retry: Data<RetryConfig>,
    identity: Identity,
    params: Path<CampaignId>,
    request: HttpRequest,
    payload: Bytes,
) -> Result<Json<InstallmentProofBody>, Error> {
    let driver_id = identity.require(Role::Driver)?;
    let campaign_id = params.into_inner();

    let proof = manager::submit_installment_proof(
        db.get_ref(),
        evidence_store.get_ref(),
        retry.get_ref(),
        campaign_id,
        driver_id,
        payload.to_vec(),
        content_type(&request),
    )
    .await?;

    Ok(Json(InstallmentProofBody::render(proof)))
}

#[get("/campaigns/{campaign_id}/installment-proof")]
#[tracing::instrument(skip(db))]
async fn get_installment_proofs_in_campaign(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<CampaignId>,
    query: Query<ProofQuery>,
) -> Result<Json<Vec<InstallmentProofBody>>, Error> {
    let campaign_id = params.into_inner();

    let proofs =
        manager::get_installment_proofs(db.get_ref(), identity, campaign_id, query.driver_id)
            .await?;

    let body = proofs.into_iter().map(InstallmentProofBody::render).collect();

    Ok(Json(body))
}

#[get("/installment-proofs")]
#[tracing::instrument(skip(db))]
async fn get_pending_installment_proofs(
    db: Data<dyn Database>,
    identity: Identity,
) -> Result<Json<Vec<InstallmentProofBody>>, Error> {
    identity.require(Role::Admin)?;

    let proofs = manager::get_pending_installment_proofs(db.get_ref()).await?;

    let body = proofs.into_iter().map(InstallmentProofBody::render).collect();

    Ok(Json(body))
}

#[post("/installment-proofs/{proof_id}/review")]
#[tracing::instrument(skip(db, notifications))]
async fn review_installment_proof(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<InstallmentProofId>,
    body: Json<ReviewProofBody>,
) -> Result<Json<InstallmentProofBody>, Error> {
    identity.require(Role::Admin)?;
    let proof_id = params.into_inner();
    let body = body.into_inner();

    let proof = manager::review_installment_proof(
        db.get_ref(),
        notifications.get_ref(),
        proof_id,
        body.decision,
        body.reason,
    )
    .await?;

    Ok(Json(InstallmentProofBody::render(proof)))
}

#[put("/campaigns/{campaign_id}/weekly-proofs/{year}/{week}")]
#[tracing::instrument(skip(db, evidence_store, retry, request, payload))]
#[allow(clippy::too_many_arguments)]
async fn submit_weekly_proof(
    db: Data<dyn Database>,
    evidence_store: Data<dyn EvidenceStore>,
    retry: Data<RetryConfig>,
    identity: Identity,
    params: Path<(CampaignId, i32, u32)>,
    request: HttpRequest,
    payload: Bytes,
) -> Result<Json<WeeklyProofBody>, Error> {
    let driver_id = identity.require(Role::Driver)?;
    let (campaign_id, year, week) = params.into_inner();

    let proof = manager::submit_weekly_proof(
        db.get_ref(),
        evidence_store.get_ref(),
        retry.get_ref(),
        campaign_id,
        driver_id,
        ProofPeriod { year, week },
        payload.to_vec(),
        content_type(&request),
    )
    .await?;

    Ok(Json(WeeklyProofBody::render(proof)))
}

#[get("/campaigns/{campaign_id}/weekly-proofs")]
#[tracing::instrument(skip(db))]
async fn get_weekly_proofs_in_campaign(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<CampaignId>,
    query: Query<ProofQuery>,
) -> Result<Json<Vec<WeeklyProofBody>>, Error> {
    let campaign_id = params.into_inner();

    let proofs =
        manager::get_weekly_proofs(db.get_ref(), identity, campaign_id, query.driver_id).await?;

    let body = proofs.into_iter().map(WeeklyProofBody::render).collect();

    Ok(Json(body))
}

#[post("/weekly-proofs/{proof_id}/review")]
#[tracing::instrument(skip(db, notifications))]
async fn review_weekly_proof(
    db: Data<dyn Database>,
    notifications: Data<Notifications>,
    identity: Identity,
    params: Path<WeeklyProofId>,
    body: Json<ReviewProofBody>,
) -> Result<Json<WeeklyProofBody>, Error> {
    identity.require(Role::Admin)?;
    let proof_id = params.into_inner();
    let body = body.into_inner();

    let proof = manager::review_weekly_proof(
        db.get_ref(),
        notifications.get_ref(),
        proof_id,
        body.decision,
        body.reason,
    )
    .await?;

    Ok(Json(WeeklyProofBody::render(proof)))
}
