use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::account::db::AccountStore;
use crate::account::Account;
use crate::assignment::db::AssignmentStore;
use crate::assignment::{Assignment, AssignmentId};
use crate::campaign::db::CampaignStore;
use crate::campaign::{Campaign, CampaignId};
use crate::earning::db::EarningStore;
use crate::earning::{Earning, EarningId};
use crate::error::Error;
use crate::proof::db::{InstallmentProofStore, WeeklyProofStore};
use crate::proof::{InstallmentProof, InstallmentProofId, WeeklyProof, WeeklyProofId};
use crate::user::UserId;

use super::Database;

/// A process-local backend. Every store call runs under one lock, which makes
/// each call an atomic unit just like a transaction on the Mongo backend.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryState {
    pub(crate) accounts: HashMap<UserId, Account>,
    pub(crate) campaigns: HashMap<CampaignId, Campaign>,
    pub(crate) assignments: HashMap<AssignmentId, Assignment>,
    pub(crate) installment_proofs: HashMap<InstallmentProofId, InstallmentProof>,
    pub(crate) weekly_proofs: HashMap<WeeklyProofId, WeeklyProof>,
    pub(crate) earnings: HashMap<EarningId, Earning>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::ExistentialState("memory database lock poisoned".into()))
    }
}

impl Database for MemoryDatabase {
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

/// Sorts records oldest first so listings are stable.
pub(crate) fn sorted<T, K: Ord>(
    records: impl Iterator<Item = T>,
    key: impl Fn(&T) -> K,
) -> Vec<T> {
    let mut records: Vec<T> = records.collect();
    records.sort_by_key(|record| key(record));
    records
}
