use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::account::manager::open_account;
use crate::config::RetryConfig;
use crate::database::Database;
use crate::error::Error;
use crate::gateway::{self, PaymentGateway, TransactionStatus, WebhookEvent, CHARGE_SUCCESS};
use crate::notification::{NotificationEvent, Notifications};
use crate::retry::with_retry;
use crate::user::{Identity, Role, UserId};

use super::{
    Campaign, CampaignDecision, CampaignDetails, CampaignId, CampaignStatus, GatewayPayment,
    PaymentSettlement, PaymentStatus,
};

/// The outcome of starting a gateway payment for a campaign.
#[derive(Clone, Debug)]
pub struct PaymentInit {
    pub campaign: Campaign,
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

fn not_payable(campaign: &Campaign) -> Error {
    Error::CampaignNotPayable {
        campaign_id: campaign.id,
        status: campaign.status,
        payment_status: campaign.payment_status,
    }
}

async fn fetch_campaign(db: &dyn Database, campaign_id: CampaignId) -> Result<Campaign, Error> {
    db.campaigns()
        .fetch_campaign_by_id(campaign_id)
        .await?
        .ok_or(Error::CampaignNotFound { campaign_id })
}

/// The campaign, if `owner_id` owns it. Other owners get the same error as
/// for a missing campaign.
async fn fetch_owned_campaign(
    db: &dyn Database,
    owner_id: UserId,
    campaign_id: CampaignId,
) -> Result<Campaign, Error> {
    let campaign = fetch_campaign(db, campaign_id).await?;
    if campaign.owner_id != owner_id {
        return Err(Error::CampaignNotFound { campaign_id });
    }

    Ok(campaign)
}

async fn fetch_owned_draft(
    db: &dyn Database,
    owner_id: UserId,
    campaign_id: CampaignId,
) -> Result<Campaign, Error> {
    let campaign = fetch_owned_campaign(db, owner_id, campaign_id).await?;
    if campaign.status != CampaignStatus::Draft {
        return Err(Error::CampaignNotFound { campaign_id });
    }

    Ok(campaign)
}

#[tracing::instrument(skip(db))]
pub async fn create_draft(
    db: &dyn Database,
    owner_id: UserId,
    details: CampaignDetails,
) -> Result<Campaign, Error> {
    open_account(db, owner_id, Role::BusinessOwner).await?;

    let campaign = Campaign::new_draft(owner_id, details, Utc::now());
    db.campaigns().insert_campaign(&campaign).await?;

    Ok(campaign)
}

#[tracing::instrument(skip(db, notifications))]
pub async fn publish(
    db: &dyn Database,
    notifications: &Notifications,
    owner_id: UserId,
    details: CampaignDetails,
) -> Result<Campaign, Error> {
    let now = Utc::now();
    let terms = details.validate(now)?;

    open_account(db, owner_id, Role::BusinessOwner).await?;

    let mut campaign = Campaign::new_draft(owner_id, details, now);
    campaign.status = CampaignStatus::Pending;
    campaign.terms = Some(terms);
    db.campaigns().insert_campaign(&campaign).await?;

    info!(campaign_id = %campaign.id, "campaign submitted for review");
    notifications.send(
        owner_id,
        NotificationEvent::CampaignSubmitted {
            campaign_id: campaign.id,
        },
    );

    Ok(campaign)
}

/// Applies the changes to a draft and submits it for review.
#[tracing::instrument(skip(db, notifications))]
pub async fn publish_draft(
    db: &dyn Database,
    notifications: &Notifications,
    owner_id: UserId,
    campaign_id: CampaignId,
    changes: CampaignDetails,
) -> Result<Campaign, Error> {
    let campaign = fetch_owned_draft(db, owner_id, campaign_id).await?;

    let now = Utc::now();
    let details = campaign.details.merge(changes);
    let terms = details.validate(now)?;

    let campaign = db
        .campaigns()
        .publish_draft_campaign(campaign_id, owner_id, details, terms, now)
        .await?
        .ok_or(Error::CampaignNotFound { campaign_id })?;

    info!(campaign_id = %campaign.id, "campaign submitted for review");
    notifications.send(owner_id, NotificationEvent::CampaignSubmitted { campaign_id });

    Ok(campaign)
}

#[tracing::instrument(skip(db))]
pub async fn update_draft(
    db: &dyn Database,
    owner_id: UserId,
    campaign_id: CampaignId,
    changes: CampaignDetails,
) -> Result<Campaign, Error> {
    let campaign = fetch_owned_draft(db, owner_id, campaign_id).await?;

    let details = campaign.details.clone().merge(changes);
    let campaign = db
        .campaigns()
        .update_campaign_details(campaign, details, Utc::now())
        .await?;

    Ok(campaign)
}

#[tracing::instrument(skip(db))]
pub async fn delete_draft(
    db: &dyn Database,
    owner_id: UserId,
    campaign_id: CampaignId,
) -> Result<(), Error> {
    let deleted = db
        .campaigns()
        .delete_draft_campaign(campaign_id, owner_id)
        .await?;

    if !deleted {
        return Err(Error::CampaignNotFound { campaign_id });
    }

    Ok(())
}

/// Owners see their own campaigns, admins see everything, and drivers see
/// campaigns that made it past review.
#[tracing::instrument(skip(db))]
pub async fn get_campaign(
    db: &dyn Database,
    identity: Identity,
    campaign_id: CampaignId,
) -> Result<Campaign, Error> {
    let campaign = fetch_campaign(db, campaign_id).await?;

    let visible = match identity.role {
        Role::Admin => true,
        Role::BusinessOwner => campaign.owner_id == identity.user_id,
        Role::Driver => matches!(
            campaign.status,
            CampaignStatus::Approved | CampaignStatus::Active | CampaignStatus::Completed
        ),
    };

    if !visible {
        return Err(Error::CampaignNotFound { campaign_id });
    }

    Ok(campaign)
}

/// Owners list their own campaigns, drivers the open marketplace, and admins
/// every campaign in the given status (all of them if none is given).
#[tracing::instrument(skip(db))]
pub async fn get_campaigns(
    db: &dyn Database,
    identity: Identity,
    status: Option<CampaignStatus>,
) -> Result<Vec<Campaign>, Error> {
    let matches_status = |campaign: &Campaign| status.map_or(true, |s| campaign.status == s);

    let campaigns: Vec<Campaign> = match identity.role {
        Role::BusinessOwner => db
            .campaigns()
            .fetch_campaigns_by_owner(identity.user_id)
            .await?
            .into_iter()
            .filter(|campaign| matches_status(campaign))
            .collect(),
        Role::Driver => db
            .campaigns()
            .fetch_campaigns_by_status(&[CampaignStatus::Approved])
            .await?
            .into_iter()
            .filter(|campaign| campaign.is_accepting_drivers() && campaign.has_open_slots())
            .collect(),
        Role::Admin => {
            let statuses = match status {
                Some(status) => vec![status],
                None => vec![
                    CampaignStatus::Draft,
                    CampaignStatus::Pending,
                    CampaignStatus::Approved,
                    CampaignStatus::Active,
                    CampaignStatus::Completed,
                    CampaignStatus::Rejected,
                ],
            };
            db.campaigns().fetch_campaigns_by_status(&statuses).await?
        }
    };

    Ok(campaigns)
}

/// Approves or rejects a pending campaign. Only the first decision wins;
/// later ones see `CampaignAlreadyDecided`.
#[tracing::instrument(skip(db, notifications))]
pub async fn review_decision(
    db: &dyn Database,
    notifications: &Notifications,
    campaign_id: CampaignId,
    decision: CampaignDecision,
    comment: Option<String>,
) -> Result<Campaign, Error> {
    let to = decision.status();
    CampaignStatus::Pending.ensure_transition(to)?;

    let updated = db
        .campaigns()
        .update_campaign_status(campaign_id, CampaignStatus::Pending, to, comment, Utc::now())
        .await?;

    let campaign = match updated {
        Some(campaign) => campaign,
        None => {
            let campaign = fetch_campaign(db, campaign_id).await?;
            return Err(Error::CampaignAlreadyDecided {
                campaign_id,
                status: campaign.status,
            });
        }
    };

    info!(campaign_id = %campaign_id, status = ?campaign.status, "campaign reviewed");
    notifications.send(
        campaign.owner_id,
        NotificationEvent::CampaignReviewed {
            campaign_id,
            status: campaign.status,
            comment: campaign.review_comment.clone(),
        },
    );

    Ok(campaign)
}

/// Starts a gateway payment of the campaign price. The reference is recorded
/// before the gateway is called, next to any earlier ones, so that a payment
/// made through any checkout the owner opened can be matched back to the
/// campaign.
#[tracing::instrument(skip(db, gateway, retry, email))]
pub async fn initialize_payment(
    db: &dyn Database,
    gateway: &dyn PaymentGateway,
    retry: &RetryConfig,
    owner_id: UserId,
    campaign_id: CampaignId,
    email: String,
) -> Result<PaymentInit, Error> {
    let campaign = fetch_owned_campaign(db, owner_id, campaign_id).await?;
    if campaign.status != CampaignStatus::Approved
        || campaign.payment_status != PaymentStatus::Pending
    {
        return Err(not_payable(&campaign));
    }

    let price = campaign.terms()?.price;
    let reference = gateway::generate_reference();
    let payment = GatewayPayment::new(reference.clone(), Utc::now());

    let campaign = match db
        .campaigns()
        .add_gateway_payment(campaign_id, &payment, Utc::now())
        .await?
    {
        Some(campaign) => campaign,
        None => return Err(not_payable(&fetch_campaign(db, campaign_id).await?)),
    };

    let init = with_retry(retry, "initialize_transaction", || {
        gateway.initialize_transaction(price, &reference, &email)
    })
    .await?;

    debug!(campaign_id = %campaign_id, reference = %reference, "payment initialized");

    Ok(PaymentInit {
        campaign,
        authorization_url: init.authorization_url,
        access_code: init.access_code,
        reference,
    })
}

/// The outcome of a payment that has been booked. Money the campaign could not
/// take was credited to the owner's balance, which the caller has to hear
/// about.
fn settled(campaign: Campaign, reference: &str) -> Result<Campaign, Error> {
    let payment = campaign
        .payment(reference)
        .ok_or_else(|| Error::PaymentReferenceNotFound {
            reference: reference.to_string(),
        })?;

    match (payment.settlement, payment.amount) {
        (Some(PaymentSettlement::Funded), _) => Ok(campaign),
        (Some(PaymentSettlement::CreditedToBalance), Some(amount)) => {
            Err(Error::PaymentCreditedToBalance {
                campaign_id: campaign.id,
                reference: reference.to_string(),
                amount,
            })
        }
        _ => Err(Error::ConcurrentModificationDetected),
    }
}

/// Confirms a gateway payment and books it exactly once. A successful payment
/// funds the campaign if it is still approved and unpaid and the amount
/// covers the price; any excess, or the whole amount otherwise, is credited to
/// the owner's available balance. Confirming a booked reference again repeats
/// its outcome without touching the ledger.
#[tracing::instrument(skip(db, gateway, retry, notifications))]
pub async fn confirm_payment(
    db: &dyn Database,
    gateway: &dyn PaymentGateway,
    retry: &RetryConfig,
    notifications: &Notifications,
    reference: String,
) -> Result<Campaign, Error> {
    let campaign = db
        .campaigns()
        .fetch_campaign_by_payment_reference(&reference)
        .await?
        .ok_or_else(|| Error::PaymentReferenceNotFound {
            reference: reference.clone(),
        })?;

    if matches!(campaign.payment(&reference), Some(payment) if payment.settlement.is_some()) {
        return settled(campaign, &reference);
    }

    let verification = with_retry(retry, "verify_transaction", || {
        gateway.verify_transaction(&reference)
    })
    .await?;

    if verification.status != TransactionStatus::Success {
        return Err(Error::PaymentNotSuccessful {
            reference,
            status: verification.status,
        });
    }

    let booked = db
        .campaigns()
        .settle_gateway_payment(campaign.id, &reference, verification.amount, Utc::now())
        .await?;

    let campaign = match booked {
        Some(campaign) => campaign,
        // a concurrent confirmation booked it first
        None => return settled(fetch_campaign(db, campaign.id).await?, &reference),
    };

    match campaign.payment(&reference).and_then(|payment| payment.settlement) {
        Some(PaymentSettlement::Funded) => {
            info!(campaign_id = %campaign.id, reference = %reference, "campaign paid");
            notifications.send(
                campaign.owner_id,
                NotificationEvent::CampaignPaid {
                    campaign_id: campaign.id,
                },
            );
        }
        _ => {
            warn!(
                campaign_id = %campaign.id,
                reference = %reference,
                amount = verification.amount,
                "payment credited to owner balance"
            );
            notifications.send(
                campaign.owner_id,
                NotificationEvent::PaymentCreditedToBalance {
                    campaign_id: campaign.id,
                    amount: verification.amount,
                },
            );
        }
    }

    settled(campaign, &reference)
}

/// Handles a signed gateway webhook delivery. Returns the paid campaign for
/// successful charges and `None` for events that need no action.
#[tracing::instrument(skip(db, gateway, retry, notifications, payload))]
pub async fn handle_webhook(
    db: &dyn Database,
    gateway: &dyn PaymentGateway,
    retry: &RetryConfig,
    notifications: &Notifications,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<Option<Campaign>, Error> {
    let signature = signature.ok_or(Error::InvalidWebhookSignature)?;
    if !gateway.verify_signature(payload, signature) {
        return Err(Error::InvalidWebhookSignature);
    }

    let event: WebhookEvent =
        serde_json::from_slice(payload).map_err(Error::InvalidWebhookPayload)?;

    if event.event != CHARGE_SUCCESS {
        debug!(event = %event.event, "ignoring webhook event");
        return Ok(None);
    }

    match confirm_payment(db, gateway, retry, notifications, event.data.reference).await {
        Ok(campaign) => Ok(Some(campaign)),
        // booked to the balance; the gateway has nothing to redeliver
        Err(Error::PaymentCreditedToBalance { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Pays the campaign price out of the owner's available balance.
#[tracing::instrument(skip(db, notifications))]
pub async fn pay_from_balance(
    db: &dyn Database,
    notifications: &Notifications,
    owner_id: UserId,
    campaign_id: CampaignId,
) -> Result<Campaign, Error> {
    let campaign = fetch_owned_campaign(db, owner_id, campaign_id).await?;
    if campaign.status != CampaignStatus::Approved
        || campaign.payment_status != PaymentStatus::Pending
    {
        return Err(not_payable(&campaign));
    }

    let campaign = match db
        .campaigns()
        .fund_campaign_from_balance(campaign_id, Utc::now())
        .await?
    {
        Some(campaign) => campaign,
        None => return Err(not_payable(&fetch_campaign(db, campaign_id).await?)),
    };

    info!(campaign_id = %campaign_id, "campaign paid from balance");
    notifications.send(owner_id, NotificationEvent::CampaignPaid { campaign_id });

    Ok(campaign)
}

/// approved -> active once the campaign is paid and either every driver slot
/// is taken or the start date has come. `None` if it is not eligible.
#[tracing::instrument(skip(db, notifications))]
pub async fn transition_to_active(
    db: &dyn Database,
    notifications: &Notifications,
    campaign_id: CampaignId,
    now: DateTime<Utc>,
) -> Result<Option<Campaign>, Error> {
    let campaign = fetch_campaign(db, campaign_id).await?;
    if !campaign.is_accepting_drivers() {
        return Ok(None);
    }

    let terms = campaign.terms()?;
    let full = campaign.driver_slots_taken >= terms.drivers_requested;
    let started = terms.start_date <= now;
    if !full && !started {
        return Ok(None);
    }

    let campaign = db
        .campaigns()
        .update_campaign_status(
            campaign_id,
            CampaignStatus::Approved,
            CampaignStatus::Active,
            None,
            now,
        )
        .await?;

    if let Some(campaign) = &campaign {
        info!(campaign_id = %campaign_id, full, started, "campaign activated");
        notifications.send(
            campaign.owner_id,
            NotificationEvent::CampaignActivated { campaign_id },
        );
    }

    Ok(campaign)
}

/// active -> completed once the end date has passed and every assignment is
/// settled; the price leaves the owner's pending balance in the same unit.
/// `None` if it is not eligible.
#[tracing::instrument(skip(db, notifications))]
pub async fn transition_to_completed(
    db: &dyn Database,
    notifications: &Notifications,
    campaign_id: CampaignId,
    now: DateTime<Utc>,
) -> Result<Option<Campaign>, Error> {
    let campaign = fetch_campaign(db, campaign_id).await?;
    if campaign.status != CampaignStatus::Active || campaign.terms()?.end_date > now {
        return Ok(None);
    }

    let assignments = db
        .assignments()
        .fetch_assignments_by_campaign(campaign_id)
        .await?;
    if assignments
        .iter()
        .any(|assignment| !assignment.status.is_settled())
    {
        return Ok(None);
    }

    let campaign = db.campaigns().complete_campaign(campaign_id, now).await?;

    if let Some(campaign) = &campaign {
        info!(campaign_id = %campaign_id, "campaign completed");
        notifications.send(
            campaign.owner_id,
            NotificationEvent::CampaignCompleted { campaign_id },
        );
    }

    Ok(campaign)
}
