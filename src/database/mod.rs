use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use mongodb::bson;
use mongodb::error::{
    Error as DatabaseError, ErrorKind, WriteFailure, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, ClientSession, Collection};
use tracing::{debug, info, warn};

use crate::account::db::AccountStore;
use crate::account::Account;
use crate::assignment::db::AssignmentStore;
use crate::assignment::Assignment;
use crate::campaign::db::CampaignStore;
use crate::campaign::Campaign;
use crate::earning::db::EarningStore;
use crate::earning::Earning;
use crate::error::Error;
use crate::proof::db::{InstallmentProofStore, WeeklyProofStore};
use crate::proof::{InstallmentProof, WeeklyProof};

pub mod memory;
pub use memory::MemoryDatabase;

const DUPLICATE_KEY: i32 = 11000;
const TRANSACTION_RETRIES: usize = 4;
const COMMIT_ATTEMPTS: usize = 3;

/// Every store the service persists through.
///
/// Operations that span several records are exposed as single store calls so
/// that each backend can run them as one atomic unit.
pub trait Database: Send + Sync {
    fn accounts(&self) -> &dyn AccountStore;
    fn campaigns(&self) -> &dyn CampaignStore;
    fn assignments(&self) -> &dyn AssignmentStore;
    fn installment_proofs(&self) -> &dyn InstallmentProofStore;
    fn weekly_proofs(&self) -> &dyn WeeklyProofStore;
    fn earnings(&self) -> &dyn EarningStore;
}

#[derive(Debug, Clone)]
pub struct MongoDatabase {
    pub(crate) client: Client,
    pub(crate) accounts: Collection<Account>,
    pub(crate) campaigns: Collection<Campaign>,
    pub(crate) assignments: Collection<Assignment>,
    pub(crate) installment_proofs: Collection<InstallmentProof>,
    pub(crate) weekly_proofs: Collection<WeeklyProof>,
    pub(crate) earnings: Collection<Earning>,
    db: mongodb::Database,
}

impl MongoDatabase {
    pub fn new(client: Client, name: &str) -> MongoDatabase {
        let db = client.database(name);
        MongoDatabase {
            client,
            accounts: db.collection(crate::account::db::ACCOUNTS),
            campaigns: db.collection(crate::campaign::db::CAMPAIGNS),
            assignments: db.collection(crate::assignment::db::ASSIGNMENTS),
            installment_proofs: db.collection(crate::proof::db::INSTALLMENT_PROOFS),
            weekly_proofs: db.collection(crate::proof::db::WEEKLY_PROOFS),
            earnings: db.collection(crate::earning::db::EARNINGS),
            db,
        }
    }

    /// Pings the server and creates the indexes backing the uniqueness rules.
    pub async fn initialize(client: Client, name: &str) -> Result<MongoDatabase, Error> {
        let database = MongoDatabase::new(client, name);

        // ping the database to ensure connection is established
        database
            .db
            .run_command(bson::doc! { "ping": 1 }, None)
            .await?;

        crate::account::db::initialize(&database.db).await?;
        crate::campaign::db::initialize(&database.db).await?;
        crate::assignment::db::initialize(&database.db).await?;
        crate::proof::db::initialize(&database.db).await?;
        crate::earning::db::initialize(&database.db).await?;

        info!(database = name, "database initialized");

        Ok(database)
    }

    /// Multi-document units need a replica set or sharded cluster.
    pub(crate) async fn start_transaction(&self) -> Result<ClientSession, Error> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        Ok(session)
    }

    /// Runs `unit` as one transaction. When the server aborts it with a
    /// transient error (a write conflict with another transaction) the whole
    /// unit runs again on a fresh transaction.
    pub(crate) async fn run_transaction<'a, T, F>(&'a self, unit: F) -> Result<T, Error>
    where
        F: Fn(ClientSession) -> BoxFuture<'a, (ClientSession, Result<T, Error>)>,
    {
        retry_transaction_conflicts(|| async {
            let session = self.start_transaction().await?;
            let (session, result) = unit(session).await;
            finish_transaction(session, result).await
        })
        .await
    }

    pub async fn drop(&self) -> Result<(), Error> {
        self.db.drop(None).await?;
        Ok(())
    }
}

impl Database for MongoDatabase {
    fn accounts(&self) -> &dyn AccountStore {
        self
    }

    fn campaigns(&self) -> &dyn CampaignStore {
        self
    }

    fn assignments(&self) -> &dyn AssignmentStore {
        self
    }

    fn installment_proofs(&self) -> &dyn InstallmentProofStore {
        self
    }

    fn weekly_proofs(&self) -> &dyn WeeklyProofStore {
        self
    }

    fn earnings(&self) -> &dyn EarningStore {
        self
    }
}

/// Commits the transaction if the unit succeeded, otherwise aborts it so that
/// none of its writes become visible.
pub(crate) async fn finish_transaction<T>(
    mut session: ClientSession,
    result: Result<T, Error>,
) -> Result<T, Error> {
    match result {
        Ok(value) => {
            let mut attempt = 1;
            loop {
                match session.commit_transaction().await {
                    Ok(()) => return Ok(value),
                    Err(err)
                        if err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                            && attempt < COMMIT_ATTEMPTS =>
                    {
                        debug!(attempt, error = %err, "commit result unknown, committing again");
                        attempt += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Err(err) => {
            if let Err(abort_err) = session.abort_transaction().await {
                warn!(error = %abort_err, "failed to abort transaction");
            }
            Err(err)
        }
    }
}

fn transaction_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(TRANSACTION_RETRIES)
        .with_jitter()
}

/// Re-runs a transactional unit while it fails with
/// [`Error::TransactionConflict`]. Once the retries run out the conflict is
/// reported as [`Error::ConcurrentModificationDetected`].
pub(crate) async fn retry_transaction_conflicts<T, F, Fut>(f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let result = f
        .retry(transaction_backoff())
        .when(|err: &Error| matches!(err, Error::TransactionConflict))
        .notify(|_: &Error, delay: Duration| {
            debug!(backoff_ms = %delay.as_millis(), "transaction conflicted, running it again");
        })
        .await;

    match result {
        Err(Error::TransactionConflict) => {
            warn!(retries = TRANSACTION_RETRIES, "transaction kept conflicting");
            Err(Error::ConcurrentModificationDetected)
        }
        result => result,
    }
}

pub(crate) fn is_duplicate_key(error: &DatabaseError) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == DUPLICATE_KEY,
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY,
        _ => false,
    }
}

pub(crate) fn return_updated() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

pub(crate) fn bson_now(now: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(now)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn conflicting_transaction_runs_again() {
        let runs = AtomicUsize::new(0);

        let result = retry_transaction_conflicts(|| async {
            if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::TransactionConflict)
            } else {
                Ok("committed")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "committed");
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_conflict_is_reported_as_concurrent_modification() {
        let runs = AtomicUsize::new(0);

        let result: Result<(), Error> = retry_transaction_conflicts(|| async {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(Error::TransactionConflict)
        })
        .await;

        assert_eq!(result.unwrap_err(), Error::ConcurrentModificationDetected);
        assert_eq!(runs.load(Ordering::SeqCst), TRANSACTION_RETRIES + 1);
    }

    #[tokio::test]
    async fn business_failures_are_not_rerun() {
        let runs = AtomicUsize::new(0);

        let result: Result<(), Error> = retry_transaction_conflicts(|| async {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(Error::ConcurrentModificationDetected)
        })
        .await;

        assert_eq!(result.unwrap_err(), Error::ConcurrentModificationDetected);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
