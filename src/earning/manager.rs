use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::info;

use crate::account::manager::open_account;
use crate::account::{Account, Amount};
use crate::database::Database;
use crate::error::Error;
use crate::notification::{NotificationEvent, Notifications};
use crate::user::{Role, UserId};

use super::{ApprovalStatus, Earning, PayoutRequest};

/// What a driver has earned and been paid.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Dashboard {
    pub available_balance: Amount,
    pub pending_balance: Amount,
    pub total_paid_out: Amount,
    /// Everything ever earned: paid out, available and pending.
    pub total_earnings: Amount,
    pub monthly_payouts: Vec<MonthlyPayout>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonthlyPayout {
    pub year: i32,
    pub month: u32,
    pub amount: Amount,
}

/// Files a payout request against the driver's available balance. The
/// balance is only debited once an admin approves it.
#[tracing::instrument(skip(db))]
pub async fn request_payout(db: &dyn Database, request: PayoutRequest) -> Result<Earning, Error> {
    if request.amount <= 0 {
        return Err(Error::InvalidAmount {
            amount: request.amount,
        });
    }
    if request.recipient_reference.trim().is_empty() {
        return Err(Error::MissingField {
            field: "recipient_reference",
        });
    }

    open_account(db, request.driver_id, Role::Driver).await?;

    let earning = request.into_earning(Utc::now());
    db.earnings().open_payout(&earning).await?;

    info!(earning_id = %earning.id, amount = earning.amount, "payout requested");

    Ok(earning)
}

async fn fetch_unapproved(
    db: &dyn Database,
    driver_id: UserId,
    recipient_reference: &str,
) -> Result<Earning, Error> {
    db.earnings()
        .fetch_unapproved_earning(driver_id, recipient_reference)
        .await?
        .ok_or(Error::EarningNotFound { driver_id })
}

/// Approves the driver's outstanding payout to the recipient and debits
/// their balance. A balance that no longer covers the amount fails the whole
/// approval.
#[tracing::instrument(skip(db, notifications))]
pub async fn approve_payout(
    db: &dyn Database,
    notifications: &Notifications,
    driver_id: UserId,
    recipient_reference: String,
) -> Result<Earning, Error> {
    let earning = fetch_unapproved(db, driver_id, &recipient_reference).await?;

    let earning = db
        .earnings()
        .settle_payout(earning.id, Utc::now())
        .await?
        .ok_or(Error::EarningNotFound { driver_id })?;

    info!(earning_id = %earning.id, amount = earning.amount, "payout approved");
    notifications.send(
        driver_id,
        NotificationEvent::PayoutApproved {
            earning_id: earning.id,
            amount: earning.amount,
        },
    );

    Ok(earning)
}

#[tracing::instrument(skip(db, notifications))]
pub async fn reject_payout(
    db: &dyn Database,
    notifications: &Notifications,
    driver_id: UserId,
    recipient_reference: String,
    reason: Option<String>,
) -> Result<Earning, Error> {
    let reason = reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
        .ok_or(Error::RejectionReasonRequired)?;

    let earning = fetch_unapproved(db, driver_id, &recipient_reference).await?;

    let earning = db
        .earnings()
        .reject_payout(earning.id, reason, Utc::now())
        .await?
        .ok_or(Error::EarningNotFound { driver_id })?;

    info!(earning_id = %earning.id, "payout rejected");
    notifications.send(
        driver_id,
        NotificationEvent::PayoutRejected {
            earning_id: earning.id,
            reason: earning.reason.clone(),
        },
    );

    Ok(earning)
}

#[tracing::instrument(skip(db))]
pub async fn dashboard(db: &dyn Database, driver_id: UserId) -> Result<Dashboard, Error> {
    // drivers who never earned anything have no account yet
    let account = db.accounts().fetch_account(driver_id).await?;
    let available_balance = account.as_ref().map_or(0, |account| account.balance);
    let pending_balance = account.as_ref().map_or(0, |account| account.pending);
    let held = account.as_ref().map_or(0, Account::total);

    let mut months: BTreeMap<(i32, u32), Amount> = BTreeMap::new();
    let mut total_paid_out = 0;
    for earning in db.earnings().fetch_earnings_by_driver(driver_id).await? {
        if !earning.is_paid_out() {
            continue;
        }

        total_paid_out += earning.amount;
        let paid_at = earning.modified_at;
        *months.entry((paid_at.year(), paid_at.month())).or_default() += earning.amount;
    }

    let monthly_payouts = months
        .into_iter()
        .map(|((year, month), amount)| MonthlyPayout {
            year,
            month,
            amount,
        })
        .collect();

    Ok(Dashboard {
        available_balance,
        pending_balance,
        total_paid_out,
        total_earnings: total_paid_out + held,
        monthly_payouts,
    })
}

#[tracing::instrument(skip(db))]
pub async fn get_earnings(db: &dyn Database, driver_id: UserId) -> Result<Vec<Earning>, Error> {
    let earnings = db.earnings().fetch_earnings_by_driver(driver_id).await?;

    Ok(earnings)
}

/// Payout requests waiting for an admin decision.
#[tracing::instrument(skip(db))]
pub async fn get_unapproved_earnings(db: &dyn Database) -> Result<Vec<Earning>, Error> {
    let earnings = db
        .earnings()
        .fetch_earnings_by_approval(ApprovalStatus::Unapproved)
        .await?;

    Ok(earnings)
}
