use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson;
use mongodb::options::FindOptions;
use mongodb::{ClientSession, Database};

use crate::account::LedgerMove;
use crate::database::memory::{sorted, MemoryState};
use crate::database::{
    bson_now, is_duplicate_key, return_updated, MemoryDatabase,
    MongoDatabase,
};
use crate::error::Error;
use crate::user::UserId;

use super::{ApprovalStatus, Earning, EarningId, PaymentState};

pub const EARNINGS: &str = "earnings";

pub async fn initialize(db: &Database) -> Result<(), Error> {
    db.run_command(
        bson::doc! {
            "createIndexes": EARNINGS,
            "indexes": [
                {
                    "key": { "driver_id": 1 },
                    "name": "driver_id_1_unapproved",
                    "unique": true,
                    "partialFilterExpression": {
                        "approval": ApprovalStatus::Unapproved.name(),
                    },
                },
                { "key": { "driver_id": 1, "created_at": 1 }, "name": "driver_id_1_created_at_1" },
                { "key": { "approval": 1 }, "name": "approval_1" },
            ],
        },
        None,
    )
    .await?;

    Ok(())
}

#[async_trait]
pub trait EarningStore: Send + Sync {
    /// Inserts the payout request if the driver has no other unapproved one
    /// and their available balance covers it.
    async fn open_payout(&self, earning: &Earning) -> Result<(), Error>;

    async fn fetch_unapproved_earning(
        &self,
        driver_id: UserId,
        recipient_reference: &str,
    ) -> Result<Option<Earning>, Error>;

    async fn fetch_earnings_by_driver(&self, driver_id: UserId) -> Result<Vec<Earning>, Error>;

    async fn fetch_earnings_by_approval(
        &self,
        approval: ApprovalStatus,
    ) -> Result<Vec<Earning>, Error>;

    /// UNAPPROVED -> APPROVED+PAID, debiting the amount from the driver's
    /// available balance in the same unit. `None` if it is no longer
    /// unapproved.
    async fn settle_payout(
        &self,
        earning_id: EarningId,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error>;

    /// UNAPPROVED -> REJECTED. `None` if it is no longer unapproved.
    async fn reject_payout(
        &self,
        earning_id: EarningId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error>;
}

fn newest_first() -> FindOptions {
    FindOptions::builder()
        .sort(bson::doc! { "created_at": -1 })
        .build()
}

#[async_trait]
impl EarningStore for MongoDatabase {
    #[tracing::instrument(skip(self))]
    async fn open_payout(&self, earning: &Earning) -> Result<(), Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self.open_payout_with_session(&mut session, earning).await;
                (session, result)
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_unapproved_earning(
        &self,
        driver_id: UserId,
        recipient_reference: &str,
    ) -> Result<Option<Earning>, Error> {
        let earning: Option<Earning> = self
            .earnings
            .find_one(
                bson::doc! {
                    "driver_id": driver_id,
                    "recipient_reference": recipient_reference,
                    "approval": ApprovalStatus::Unapproved.name(),
                },
                None,
            )
            .await?;

        Ok(earning)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_earnings_by_driver(&self, driver_id: UserId) -> Result<Vec<Earning>, Error> {
        let earnings: Vec<Earning> = self
            .earnings
            .find(bson::doc! { "driver_id": driver_id }, newest_first())
            .await?
            .try_collect()
            .await?;

        Ok(earnings)
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_earnings_by_approval(
        &self,
        approval: ApprovalStatus,
    ) -> Result<Vec<Earning>, Error> {
        let earnings: Vec<Earning> = self
            .earnings
            .find(bson::doc! { "approval": approval.name() }, newest_first())
            .await?
            .try_collect()
            .await?;

        Ok(earnings)
    }

    #[tracing::instrument(skip(self))]
    async fn settle_payout(
        &self,
        earning_id: EarningId,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error> {
        self.run_transaction(|mut session| {
            Box::pin(async move {
                let result = self.settle_payout_with_session(&mut session, earning_id, now).await;
                (session, result)
            })
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn reject_payout(
        &self,
        earning_id: EarningId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error> {
        let earning = self
            .earnings
            .find_one_and_update(
                bson::doc! { "_id": earning_id, "approval": ApprovalStatus::Unapproved.name() },
                bson::doc! {
                    "$set": {
                        "approval": ApprovalStatus::Rejected.name(),
                        "reason": reason,
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
            )
            .await?;

        Ok(earning)
    }
}

impl MongoDatabase {
    async fn open_payout_with_session(
        &self,
        session: &mut ClientSession,
        earning: &Earning,
    ) -> Result<(), Error> {
        let driver_id = earning.driver_id;
        let outstanding = self
            .earnings
            .count_documents_with_session(
                bson::doc! {
                    "driver_id": driver_id,
                    "approval": ApprovalStatus::Unapproved.name(),
                },
                None,
                session,
            )
            .await?;
        if outstanding > 0 {
            return Err(Error::UnapprovedEarningExists { driver_id });
        }

        let account = self
            .accounts
            .find_one_with_session(bson::doc! { "_id": driver_id }, None, session)
            .await?
            .ok_or(Error::AccountNotFound { user_id: driver_id })?;
        if account.balance < earning.amount {
            return Err(Error::InsufficientFunds {
                user_id: driver_id,
                requested: earning.amount,
                available: account.balance,
            });
        }

        match self
            .earnings
            .insert_one_with_session(earning, None, session)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(Error::UnapprovedEarningExists { driver_id }),
            Err(err) => Err(err.into()),
        }
    }

    async fn settle_payout_with_session(
        &self,
        session: &mut ClientSession,
        earning_id: EarningId,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error> {
        let earning = self
            .earnings
            .find_one_and_update_with_session(
                bson::doc! { "_id": earning_id, "approval": ApprovalStatus::Unapproved.name() },
                bson::doc! {
                    "$set": {
                        "approval": ApprovalStatus::Approved.name(),
                        "payment": PaymentState::Paid.name(),
                        "modified_at": bson_now(now),
                    }
                },
                return_updated(),
                session,
            )
            .await?;

        let earning = match earning {
            Some(earning) => earning,
            None => return Ok(None),
        };

        self.apply_ledger_move_with_session(
            session,
            earning.driver_id,
            LedgerMove::DebitBalance(earning.amount),
            now,
        )
        .await?;

        Ok(Some(earning))
    }
}

impl MemoryState {
    fn unapproved_earning_mut(&mut self, earning_id: EarningId) -> Option<&mut Earning> {
        self.earnings
            .get_mut(&earning_id)
            .filter(|earning| earning.approval == ApprovalStatus::Unapproved)
    }
}

#[async_trait]
impl EarningStore for MemoryDatabase {
    async fn open_payout(&self, earning: &Earning) -> Result<(), Error> {
        let mut state = self.lock()?;
        let driver_id = earning.driver_id;

        let outstanding = state.earnings.values().any(|existing| {
            existing.driver_id == driver_id && existing.approval == ApprovalStatus::Unapproved
        });
        if outstanding {
            return Err(Error::UnapprovedEarningExists { driver_id });
        }

        state.check_ledger_move(driver_id, LedgerMove::DebitBalance(earning.amount))?;
        state.earnings.insert(earning.id, earning.clone());

        Ok(())
    }

    async fn fetch_unapproved_earning(
        &self,
        driver_id: UserId,
        recipient_reference: &str,
    ) -> Result<Option<Earning>, Error> {
        let state = self.lock()?;
        let earning = state
            .earnings
            .values()
            .find(|earning| {
                earning.driver_id == driver_id
                    && earning.recipient_reference == recipient_reference
                    && earning.approval == ApprovalStatus::Unapproved
            })
            .cloned();

        Ok(earning)
    }

    async fn fetch_earnings_by_driver(&self, driver_id: UserId) -> Result<Vec<Earning>, Error> {
        let state = self.lock()?;
        let earnings = state
            .earnings
            .values()
            .filter(|earning| earning.driver_id == driver_id)
            .cloned();

        Ok(sorted(earnings, |earning| std::cmp::Reverse(earning.created_at)))
    }

    async fn fetch_earnings_by_approval(
        &self,
        approval: ApprovalStatus,
    ) -> Result<Vec<Earning>, Error> {
        let state = self.lock()?;
        let earnings = state
            .earnings
            .values()
            .filter(|earning| earning.approval == approval)
            .cloned();

        Ok(sorted(earnings, |earning| std::cmp::Reverse(earning.created_at)))
    }

    async fn settle_payout(
        &self,
        earning_id: EarningId,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error> {
        let mut state = self.lock()?;
        let (driver_id, amount) = match state.unapproved_earning_mut(earning_id) {
            Some(earning) => (earning.driver_id, earning.amount),
            None => return Ok(None),
        };

        state.apply_ledger_move(driver_id, LedgerMove::DebitBalance(amount), now)?;

        let earning = state.unapproved_earning_mut(earning_id).ok_or_else(|| {
            Error::ExistentialState(format!("earning {} vanished", earning_id))
        })?;
        earning.approval = ApprovalStatus::Approved;
        earning.payment = PaymentState::Paid;
        earning.modified_at = now;

        Ok(Some(earning.clone()))
    }

    async fn reject_payout(
        &self,
        earning_id: EarningId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Option<Earning>, Error> {
        let mut state = self.lock()?;
        let earning = match state.unapproved_earning_mut(earning_id) {
            Some(earning) => earning,
            None => return Ok(None),
        };

        earning.approval = ApprovalStatus::Rejected;
        earning.reason = Some(reason);
        earning.modified_at = now;

        Ok(Some(earning.clone()))
    }
}
