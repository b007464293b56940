use chrono::Utc;

use crate::database::Database;
use crate::error::Error;
use crate::user::{Role, UserId};

use super::{Account, Amount, LedgerMove};

/// Creates the user's account with empty balances unless it already exists.
#[tracing::instrument(skip(db))]
pub async fn open_account(db: &dyn Database, user_id: UserId, role: Role) -> Result<Account, Error> {
    let account = Account::new(user_id, role, Utc::now());
    let account = db.accounts().insert_account_if_missing(&account).await?;

    Ok(account)
}

#[tracing::instrument(skip(db))]
pub async fn get_account(db: &dyn Database, user_id: UserId) -> Result<Account, Error> {
    let account = db
        .accounts()
        .fetch_account(user_id)
        .await?
        .ok_or(Error::AccountNotFound { user_id })?;

    Ok(account)
}

/// Manual adjustment into the available balance, e.g. a refund or top-up.
#[tracing::instrument(skip(db))]
pub async fn credit_account(
    db: &dyn Database,
    user_id: UserId,
    amount: Amount,
) -> Result<Account, Error> {
    if amount <= 0 {
        return Err(Error::InvalidAmount { amount });
    }

    let account = db
        .accounts()
        .apply_ledger_move(user_id, LedgerMove::CreditBalance(amount), Utc::now())
        .await?;

    Ok(account)
}
