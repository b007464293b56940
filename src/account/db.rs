use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, Document};
use mongodb::options::UpdateOptions;
use mongodb::{ClientSession, Database};

use crate::database::memory::MemoryState;
use crate::database::{bson_now, is_duplicate_key, return_updated, MemoryDatabase, MongoDatabase};
use crate::error::Error;
use crate::user::UserId;

use super::{Account, LedgerField, LedgerMove};

pub const ACCOUNTS: &str = "accounts";

pub async fn initialize(_db: &Database) -> Result<(), Error> {
    // accounts are keyed by user id, which `_id` already indexes
    Ok(())
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Inserts the account unless one exists for the user; returns the stored
    /// account either way.
    async fn insert_account_if_missing(&self, account: &Account) -> Result<Account, Error>;

    async fn fetch_account(&self, user_id: UserId) -> Result<Option<Account>, Error>;

    /// Applies the move as a single conditional update. Fails with
    /// `InsufficientFunds` if the source field does not cover the amount.
    async fn apply_ledger_move(
        &self,
        user_id: UserId,
        ledger_move: LedgerMove,
        now: DateTime<Utc>,
    ) -> Result<Account, Error>;
}

fn check_amount(ledger_move: LedgerMove) -> Result<(), Error> {
    if ledger_move.amount() <= 0 {
        return Err(Error::InvalidAmount {
            amount: ledger_move.amount(),
        });
    }

    Ok(())
}

/// The error for a move whose guard did not match.
fn refusal(account: Option<&Account>, user_id: UserId, ledger_move: LedgerMove) -> Error {
    match account {
        None => Error::AccountNotFound { user_id },
        Some(account) => Error::InsufficientFunds {
            user_id,
            requested: ledger_move.amount(),
            available: match ledger_move.source() {
                Some(LedgerField::Pending) => account.pending,
                _ => account.balance,
            },
        },
    }
}

fn ledger_filter(user_id: UserId, ledger_move: LedgerMove) -> Document {
    let mut filter = bson::doc! { "_id": user_id };
    if let Some(field) = ledger_move.source() {
        filter.insert(field.name(), bson::doc! { "$gte": ledger_move.amount() });
    }

    filter
}

fn ledger_update(ledger_move: LedgerMove, now: DateTime<Utc>) -> Document {
    let (balance, pending) = ledger_move.deltas();

    bson::doc! {
        "$inc": { "balance": balance, "pending": pending },
        "$set": { "modified_at": bson_now(now) },
    }
}

#[async_trait]
impl AccountStore for MongoDatabase {
    #[tracing::instrument(skip(self))]
    async fn insert_account_if_missing(&self, account: &Account) -> Result<Account, Error> {
        let mut on_insert = bson::to_document(account)?;
        on_insert.remove("_id");

        let result = self
            .accounts
            .update_one(
                bson::doc! { "_id": account.id },
                bson::doc! { "$setOnInsert": on_insert },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await;

        match result {
            Ok(_) => {}
            // a concurrent upsert won the race, which is just as good
            Err(err) if is_duplicate_key(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.fetch_account(account.id)
            .await?
            .ok_or_else(|| Error::ExistentialState(format!("account {} vanished", account.id)))
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_account(&self, user_id: UserId) -> Result<Option<Account>, Error> {
        let account: Option<Account> = self
            .accounts
            .find_one(bson::doc! { "_id": user_id }, None)
            .await?;

        Ok(account)
    }

    #[tracing::instrument(skip(self))]
    async fn apply_ledger_move(
        &self,
        user_id: UserId,
        ledger_move: LedgerMove,
        now: DateTime<Utc>,
    ) -> Result<Account, Error> {
        check_amount(ledger_move)?;

        let account = self
            .accounts
            .find_one_and_update(
                ledger_filter(user_id, ledger_move),
                ledger_update(ledger_move, now),
                return_updated(),
            )
            .await?;

        match account {
            Some(account) => Ok(account),
            None => {
                let current = self.fetch_account(user_id).await?;
                Err(refusal(current.as_ref(), user_id, ledger_move))
            }
        }
    }
}

impl MongoDatabase {
    /// The ledger move as a step of a larger transaction.
    #[tracing::instrument(skip(self, session))]
    pub(crate) async fn apply_ledger_move_with_session(
        &self,
        session: &mut ClientSession,
        user_id: UserId,
        ledger_move: LedgerMove,
        now: DateTime<Utc>,
    ) -> Result<Account, Error> {
        check_amount(ledger_move)?;

        let account = self
            .accounts
            .find_one_and_update_with_session(
                ledger_filter(user_id, ledger_move),
                ledger_update(ledger_move, now),
                return_updated(),
                session,
            )
            .await?;

        match account {
            Some(account) => Ok(account),
            None => {
                let current = self
                    .accounts
                    .find_one_with_session(bson::doc! { "_id": user_id }, None, session)
                    .await?;
                Err(refusal(current.as_ref(), user_id, ledger_move))
            }
        }
    }
}

impl MemoryState {
    /// Applies the move or leaves the account untouched.
    pub(crate) fn apply_ledger_move(
        &mut self,
        user_id: UserId,
        ledger_move: LedgerMove,
        now: DateTime<Utc>,
    ) -> Result<Account, Error> {
        check_amount(ledger_move)?;

        let account = self
            .accounts
            .get_mut(&user_id)
            .ok_or(Error::AccountNotFound { user_id })?;

        if !account.apply(ledger_move, now) {
            return Err(refusal(Some(&*account), user_id, ledger_move));
        }

        Ok(account.clone())
    }

    /// Checks that the move would succeed without applying it.
    pub(crate) fn check_ledger_move(
        &self,
        user_id: UserId,
        ledger_move: LedgerMove,
    ) -> Result<(), Error> {
        check_amount(ledger_move)?;

        let account = self.accounts.get(&user_id);
        match account.and_then(|account| ledger_move.apply(account.balance, account.pending)) {
            Some(_) => Ok(()),
            None => Err(refusal(account, user_id, ledger_move)),
        }
    }
}

#[async_trait]
impl AccountStore for MemoryDatabase {
    async fn insert_account_if_missing(&self, account: &Account) -> Result<Account, Error> {
        let mut state = self.lock()?;
        let stored = state
            .accounts
            .entry(account.id)
            .or_insert_with(|| account.clone());

        Ok(stored.clone())
    }

    async fn fetch_account(&self, user_id: UserId) -> Result<Option<Account>, Error> {
        let state = self.lock()?;

        Ok(state.accounts.get(&user_id).cloned())
    }

    async fn apply_ledger_move(
        &self,
        user_id: UserId,
        ledger_move: LedgerMove,
        now: DateTime<Utc>,
    ) -> Result<Account, Error> {
        let mut state = self.lock()?;

        state.apply_ledger_move(user_id, ledger_move, now)
    }
}
