use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson;
use mongodb::options::FindOptions;
use mongodb::{ClientSession, Database};

use crate::account::{Amount, LedgerMove};
use crate::assignment::AssignmentStatus;
use crate::database::memory::{sorted, MemoryState};
use crate::database::{
    bson_now, return_updated, MemoryDatabase, MongoDatabase,
};
use crate::error::Error;
use crate::user::UserId;

use super::{
    Campaign, CampaignDetails, CampaignId, CampaignStatus, CampaignTerms, GatewayPayment,
    PaymentSettlement, PaymentStatus,
};

pub const CAMPAIGNS: &str = "campaigns";

pub async fn initialize(db: &Database) -> Result<(), Error> {
    db.run_command(
        bson::doc! {
            "createIndexes": CAMPAIGNS,
            "indexes": [
                { "key": { "owner_id": 1 }, "name": "owner_id_1" },
                { "key": { "status": 1 }, "name": "status_1" },
                {
                    "key": { "payments.reference": 1 },
                    "name": "payments_reference_1",
                    "unique": true,
                    "partialFilterExpression": { "payments.reference": { "$type": "string" } },
                },
            ],
        },
        None,
    )
    .await?;

    Ok(())
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), Error>;

    async fn fetch_campaign_by_id(&self, campaign_id: CampaignId)
        -> Result<Option<Campaign>, Error>;

    async fn fetch_campaigns_by_owner(&self, owner_id: UserId) -> Result<Vec<Campaign>, Error>;

    async fn fetch_campaigns_by_status(
        &self,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<Campaign>, Error>;

    async fn fetch_campaign_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Campaign>, Error>;

    /// Replaces the details of a draft that has not changed since it was read.
    async fn update_campaign_details(
        &self,
        campaign: Campaign,
        details: CampaignDetails,
        now: DateTime<Utc>,
    ) -> Result<Campaign, Error>;

    /// Deletes the campaign only while it is the owner's draft.
    async fn delete_draft_campaign(
        &self,
        campaign_id: CampaignId,
        owner_id: UserId,
    ) -> Result<bool, Error>;

    /// draft -> pending, freezing the given terms. `None` if the campaign is
    /// no longer the owner's draft.
    async fn publish_draft_campaign(
        &self,
        campaign_id: CampaignId,
        owner_id: UserId,
        details: CampaignDetails,
        terms: CampaignTerms,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error>;

    /// Moves the campaign from `from` to `to`. `None` if it is not in `from`.
    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        review_comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error>;

    /// Appends a newly initialized gateway payment to an approved, unpaid
    /// campaign. Earlier payments stay on record.
    async fn add_gateway_payment(
        &self,
        campaign_id: CampaignId,
        payment: &GatewayPayment,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error>;

    /// Books a confirmed gateway payment as one unit: records its settlement
    /// and amount and applies the owner's ledger moves, marking the campaign
    /// spent when it is funded. `None` if the payment is unknown or already
    /// settled.
    async fn settle_gateway_payment(
        &self,
        campaign_id: CampaignId,
        reference: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error>;

    /// Atomically marks the campaign spent and moves its price from the
    /// owner's balance to pending. `None` if the campaign is not approved and
    /// unpaid.
    async fn fund_campaign_from_balance(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error>;

    /// Atomically completes an active campaign whose assignments are all
    /// settled and debits its price from the owner's pending balance.
    async fn complete_campaign(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error>;
}

fn open_payment(campaign_id: CampaignId, reference: &str) -> bson::Document {
    bson::doc! {
        "_id": campaign_id,
        "payments": { "$elemMatch": { "reference": reference, "settlement": bson::Bson::Null } },
    }
}

/// Campaigns with assignments still running cannot complete.
fn unsettled_assignments() -> Error {
    Error::InvalidTransition {
        entity: "campaign",
        from: CampaignStatus::Active.name().to_string(),
        to: CampaignStatus::Completed.name().to_string(),
    }
}

fn oldest_first() -> FindOptions {
    FindOptions::builder()
        .sort(bson::doc! { "created_at": 1 })
        .build()
}

#[async_trait]
impl CampaignStore for MongoDatabase {
    #[tracing::instrument(skip(self))]
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), Error> {
        self.campaigns.insert_one(campaign, None).await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_campaign_by_id(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<Campaign>, Error> {
        let campaign: Option<Campaign> = self
            .campaigns
            .find_one(bson::doc! { "_id": campaign_id }, None)
            .await?;

        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_campaigns_by_owner(&self, owner_id: UserId) -> Result<Vec<Campaign>, Error> {
        let campaigns: Vec<Campaign> = self
            .campaigns
            .find(bson::doc! { "owner_id": owner_id }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(campaigns)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_campaigns_by_status(
        &self,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<Campaign>, Error> {
        let statuses: Vec<&str> = statuses.iter().map(|status| status.name()).collect();
        let campaigns: Vec<Campaign> = self
            .campaigns
            .find(bson::doc! { "status": { "$in": statuses } }, oldest_first())
            .await?
            .try_collect()
            .await?;

        Ok(campaigns)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_campaign_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Campaign>, Error> {
        let campaign: Option<Campaign> = self
            .campaigns
            .find_one(bson::doc! { "payments.reference": reference }, None)
            .await?;

        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    async fn update_campaign_details(
        &self,
        mut campaign: Campaign,
        details: CampaignDetails,
        now: DateTime<Utc>,
    ) -> Result<Campaign, Error> {
        let old_modified_at = bson_now(campaign.modified_at);
        let new_details = bson::to_bson(&details)?;

        let result = self
            .campaigns
            .update_one(
                bson::doc! {
                    "_id": campaign.id,
                    "status": CampaignStatus::Draft.name(),
                    "modified_at": old_modified_at,
                },
                bson::doc! { "$set": { "details": new_details, "modified_at": bson_now(now) } },
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(Error::ConcurrentModificationDetected);
        }

        campaign.details = details;
        campaign.modified_at = now;

        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_draft_campaign(
        &self,
        campaign_id: CampaignId,
        owner_id: UserId,
    ) -> Result<bool, Error> {
        let result = self
            .campaigns
            .delete_one(
                bson::doc! {
                    "_id": campaign_id,
                    "owner_id": owner_id,
                    "status": CampaignStatus::Draft.name(),
                },
                None,
            )
            .await?;

        Ok(result.deleted_count == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn publish_draft_campaign(
        &self,
        campaign_id: CampaignId,
        owner_id: UserId,
        details: CampaignDetails,
        terms: CampaignTerms,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let campaign = self
            .campaigns
            .find_one_and_update(
                bson::doc! {
                    "_id": campaign_id,
                    "owner_id": owner_id,
                    "status": CampaignStatus::Draft.name(),
                },
                bson::doc! {
                    "$set": {
                        "status": CampaignStatus::Pending.name(),
                        "details": bson::to_bson(&details)?,
                        "terms": bson::to_bson(&terms)?,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
            )
            .await?;

        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        review_comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut set = bson::doc! { "status": to.name(), "modified_at": bson_now(now) };
        if let Some(comment) = review_comment {
            set.insert("review_comment", comment);
        }

        let campaign = self
            .campaigns
            .find_one_and_update(
                bson::doc! { "_id": campaign_id, "status": from.name() },
                bson::doc! { "$set": set },
                return_updated(),
            )
            .await?;

        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    async fn add_gateway_payment(
        &self,
        campaign_id: CampaignId,
        payment: &GatewayPayment,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let campaign = self
            .campaigns
            .find_one_and_update(
                bson::doc! {
                    "_id": campaign_id,
                    "status": CampaignStatus::Approved.name(),
                    "payment_status": "pending",
                },
                bson::doc! {
                    "$push": { "payments": bson::to_bson(payment)? },
                    "$set": { "modified_at": bson_now(now) },
                },
                return_updated(),
            )
            .await?;

        Ok(campaign)
    }

    #[tracing::instrument(skip(self))]
    async fn settle_gateway_payment(
        &self,
        campaign_id: CampaignId,
        reference: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self
                    .settle_gateway_payment_with_session(&mut session, campaign_id, reference, amount, now)
                    .await;
                (session, result)
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn fund_campaign_from_balance(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self
                    .fund_campaign_from_balance_with_session(&mut session, campaign_id, now)
                    .await;
                (session, result)
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn complete_campaign(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self
                    .complete_campaign_with_session(&mut session, campaign_id, now)
                    .await;
                (session, result)
            })
        })
        .await
    }
}

impl MongoDatabase {
    async fn settle_gateway_payment_with_session(
        &self,
        session: &mut ClientSession,
        campaign_id: CampaignId,
        reference: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let current = self
            .campaigns
            .find_one_with_session(open_payment(campaign_id, reference), None, session)
            .await?;
        let current = match current {
            Some(current) => current,
            None => return Ok(None),
        };

        let settlement = current.settlement_for(amount)?;
        let mut filter = open_payment(campaign_id, reference);
        let mut set = bson::doc! {
            "payments.$.settlement": settlement.name(),
            "payments.$.amount": amount,
            "modified_at": bson_now(now),
        };
        if settlement == PaymentSettlement::Funded {
            filter.insert("status", CampaignStatus::Approved.name());
            filter.insert("payment_status", "pending");
            set.insert("payment_status", "spent");
        }

        let campaign = self
            .campaigns
            .find_one_and_update_with_session(
                filter,
                bson::doc! { "$set": set },
                return_updated(),
                session,
            )
            .await?;
        let campaign = match campaign {
            Some(campaign) => campaign,
            None => return Ok(None),
        };

        for ledger_move in settlement.ledger_moves(campaign.terms()?.price, amount) {
            self.apply_ledger_move_with_session(session, campaign.owner_id, ledger_move, now)
                .await?;
        }

        Ok(Some(campaign))
    }

    async fn fund_campaign_from_balance_with_session(
        &self,
        session: &mut ClientSession,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let campaign = self
            .campaigns
            .find_one_and_update_with_session(
                bson::doc! {
                    "_id": campaign_id,
                    "status": CampaignStatus::Approved.name(),
                    "payment_status": "pending",
                },
                bson::doc! { "$set": { "payment_status": "spent", "modified_at": bson_now(now) } },
                return_updated(),
                session,
            )
            .await?;

        let campaign = match campaign {
            Some(campaign) => campaign,
            None => return Ok(None),
        };

        let price = campaign.terms()?.price;
        self.apply_ledger_move_with_session(
            session,
            campaign.owner_id,
            LedgerMove::BalanceToPending(price),
            now,
        )
        .await?;

        Ok(Some(campaign))
    }

    async fn complete_campaign_with_session(
        &self,
        session: &mut ClientSession,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let settled: Vec<&str> = vec![
            AssignmentStatus::Completed.name(),
            AssignmentStatus::Rejected.name(),
        ];
        let unsettled = self
            .assignments
            .count_documents_with_session(
                bson::doc! { "campaign_id": campaign_id, "status": { "$nin": settled } },
                None,
                session,
            )
            .await?;

        if unsettled > 0 {
            return Err(unsettled_assignments());
        }

        let campaign = self
            .campaigns
            .find_one_and_update_with_session(
                bson::doc! { "_id": campaign_id, "status": CampaignStatus::Active.name() },
                bson::doc! {
                    "$set": {
                        "status": CampaignStatus::Completed.name(),
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
                session,
            )
            .await?;

        let campaign = match campaign {
            Some(campaign) => campaign,
            None => return Ok(None),
        };

        let price = campaign.terms()?.price;
        self.apply_ledger_move_with_session(
            session,
            campaign.owner_id,
            LedgerMove::DebitPending(price),
            now,
        )
        .await?;

        Ok(Some(campaign))
    }
}

impl MemoryState {
    fn campaign_mut(&mut self, campaign_id: CampaignId) -> Option<&mut Campaign> {
        self.campaigns.get_mut(&campaign_id)
    }
}

#[async_trait]
impl CampaignStore for MemoryDatabase {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), Error> {
        let mut state = self.lock()?;
        state.campaigns.insert(campaign.id, campaign.clone());

        Ok(())
    }

    async fn fetch_campaign_by_id(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Option<Campaign>, Error> {
        let state = self.lock()?;

        Ok(state.campaigns.get(&campaign_id).cloned())
    }

    async fn fetch_campaigns_by_owner(&self, owner_id: UserId) -> Result<Vec<Campaign>, Error> {
        let state = self.lock()?;
        let campaigns = state
            .campaigns
            .values()
            .filter(|campaign| campaign.owner_id == owner_id)
            .cloned();

        Ok(sorted(campaigns, |campaign| campaign.created_at))
    }

    async fn fetch_campaigns_by_status(
        &self,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<Campaign>, Error> {
        let state = self.lock()?;
        let campaigns = state
            .campaigns
            .values()
            .filter(|campaign| statuses.contains(&campaign.status))
            .cloned();

        Ok(sorted(campaigns, |campaign| campaign.created_at))
    }

    async fn fetch_campaign_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Campaign>, Error> {
        let state = self.lock()?;
        let campaign = state
            .campaigns
            .values()
            .find(|campaign| campaign.payment(reference).is_some())
            .cloned();

        Ok(campaign)
    }

    async fn update_campaign_details(
        &self,
        campaign: Campaign,
        details: CampaignDetails,
        now: DateTime<Utc>,
    ) -> Result<Campaign, Error> {
        let mut state = self.lock()?;
        let stored = state
            .campaign_mut(campaign.id)
            .filter(|stored| {
                stored.status == CampaignStatus::Draft && stored.modified_at == campaign.modified_at
            })
            .ok_or(Error::ConcurrentModificationDetected)?;

        stored.details = details;
        stored.modified_at = now;

        Ok(stored.clone())
    }

    async fn delete_draft_campaign(
        &self,
        campaign_id: CampaignId,
        owner_id: UserId,
    ) -> Result<bool, Error> {
        let mut state = self.lock()?;
        let deletable = state.campaigns.get(&campaign_id).map_or(false, |campaign| {
            campaign.owner_id == owner_id && campaign.status == CampaignStatus::Draft
        });

        if deletable {
            state.campaigns.remove(&campaign_id);
        }

        Ok(deletable)
    }

    async fn publish_draft_campaign(
        &self,
        campaign_id: CampaignId,
        owner_id: UserId,
        details: CampaignDetails,
        terms: CampaignTerms,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut state = self.lock()?;
        let campaign = match state.campaign_mut(campaign_id) {
            Some(campaign)
                if campaign.owner_id == owner_id && campaign.status == CampaignStatus::Draft =>
            {
                campaign
            }
            _ => return Ok(None),
        };

        campaign.status = CampaignStatus::Pending;
        campaign.details = details;
        campaign.terms = Some(terms);
        campaign.modified_at = now;

        Ok(Some(campaign.clone()))
    }

    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        review_comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut state = self.lock()?;
        let campaign = match state.campaign_mut(campaign_id) {
            Some(campaign) if campaign.status == from => campaign,
            _ => return Ok(None),
        };

        campaign.status = to;
        if review_comment.is_some() {
            campaign.review_comment = review_comment;
        }
        campaign.modified_at = now;

        Ok(Some(campaign.clone()))
    }

    async fn add_gateway_payment(
        &self,
        campaign_id: CampaignId,
        payment: &GatewayPayment,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut state = self.lock()?;
        let campaign = match state.campaign_mut(campaign_id) {
            Some(campaign)
                if campaign.status == CampaignStatus::Approved
                    && campaign.payment_status == PaymentStatus::Pending =>
            {
                campaign
            }
            _ => return Ok(None),
        };

        campaign.payments.push(payment.clone());
        campaign.modified_at = now;

        Ok(Some(campaign.clone()))
    }

    async fn settle_gateway_payment(
        &self,
        campaign_id: CampaignId,
        reference: &str,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut state = self.lock()?;
        let campaign = match state.campaigns.get(&campaign_id) {
            Some(campaign) => campaign,
            None => return Ok(None),
        };
        match campaign.payment(reference) {
            Some(payment) if payment.settlement.is_none() => {}
            _ => return Ok(None),
        }

        let owner_id = campaign.owner_id;
        let settlement = campaign.settlement_for(amount)?;
        let moves = settlement.ledger_moves(campaign.terms()?.price, amount);
        for ledger_move in &moves {
            state.check_ledger_move(owner_id, *ledger_move)?;
        }
        for ledger_move in moves {
            state.apply_ledger_move(owner_id, ledger_move, now)?;
        }

        let campaign = state
            .campaign_mut(campaign_id)
            .ok_or_else(|| Error::ExistentialState(format!("campaign {} vanished", campaign_id)))?;
        if settlement == PaymentSettlement::Funded {
            campaign.payment_status = PaymentStatus::Spent;
        }
        if let Some(payment) = campaign
            .payments
            .iter_mut()
            .find(|payment| payment.reference == reference)
        {
            payment.settlement = Some(settlement);
            payment.amount = Some(amount);
        }
        campaign.modified_at = now;

        Ok(Some(campaign.clone()))
    }

    async fn fund_campaign_from_balance(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut state = self.lock()?;
        let campaign = match state.campaigns.get(&campaign_id) {
            Some(campaign) => campaign,
            None => return Ok(None),
        };
        if campaign.status != CampaignStatus::Approved
            || campaign.payment_status != PaymentStatus::Pending
        {
            return Ok(None);
        }

        let owner_id = campaign.owner_id;
        let price = campaign.terms()?.price;
        state.apply_ledger_move(owner_id, LedgerMove::BalanceToPending(price), now)?;

        let campaign = state
            .campaign_mut(campaign_id)
            .ok_or_else(|| Error::ExistentialState(format!("campaign {} vanished", campaign_id)))?;
        campaign.payment_status = PaymentStatus::Spent;
        campaign.modified_at = now;

        Ok(Some(campaign.clone()))
    }

    async fn complete_campaign(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<Campaign>, Error> {
        let mut state = self.lock()?;
        let campaign = match state.campaigns.get(&campaign_id) {
            Some(campaign) if campaign.status == CampaignStatus::Active => campaign,
            _ => return Ok(None),
        };

        let unsettled = state.assignments.values().any(|assignment| {
            assignment.campaign_id == campaign_id && !assignment.status.is_settled()
        });
        if unsettled {
            return Err(unsettled_assignments());
        }

        let owner_id = campaign.owner_id;
        let price = campaign.terms()?.price;
        state.apply_ledger_move(owner_id, LedgerMove::DebitPending(price), now)?;

        let campaign = state
            .campaign_mut(campaign_id)
            .ok_or_else(|| Error::ExistentialState(format!("campaign {} vanished", campaign_id)))?;
        campaign.status = CampaignStatus::Completed;
        campaign.modified_at = now;

        Ok(Some(campaign.clone()))
    }
}
