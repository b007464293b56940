//! Fixtures and fake collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::account::manager::credit_account;
use crate::account::Amount;
use crate::assignment::{manager as assignments, Assignment, AssignmentDecision};
use crate::campaign::{
    manager as campaigns, Campaign, CampaignDecision, CampaignDetails, CampaignId, PackageType,
};
use crate::config::RetryConfig;
use crate::database::{Database, MemoryDatabase};
use crate::error::Error;
use crate::evidence::MemoryEvidenceStore;
use crate::gateway::{
    self, PaymentGateway, TransactionInit, TransactionStatus, TransactionVerification,
};
use crate::notification::{LogNotifier, Notifications};
use crate::proof::{manager as proofs, InstallmentProof, ProofDecision};
use crate::user::UserId;

pub const PRICE: Amount = 10_000;
pub const DRIVERS: i32 = 2;
pub const EARNING_PER_DRIVER: Amount = 4_000;
pub const DURATION_DAYS: i32 = 28;
pub const GATEWAY_SECRET: &[u8] = b"sk_test_secret";

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        min_delay_ms: 1,
        max_delay_ms: 2,
        max_attempts: 3,
    }
}

pub fn notifications() -> Notifications {
    Notifications::new(Arc::new(LogNotifier), fast_retry())
}

pub fn details(start_date: DateTime<Utc>) -> CampaignDetails {
    CampaignDetails {
        name: Some("Spring launch".into()),
        package_type: Some(PackageType::Basic),
        price: Some(PRICE),
        drivers_requested: Some(DRIVERS),
        earning_per_driver: Some(EARNING_PER_DRIVER),
        start_date: Some(start_date),
        duration_days: Some(DURATION_DAYS),
    }
}

pub async fn approved_campaign(
    db: &dyn Database,
    owner_id: UserId,
    details: CampaignDetails,
) -> Campaign {
    let notifications = notifications();
    let campaign = campaigns::publish(db, &notifications, owner_id, details)
        .await
        .unwrap();

    campaigns::review_decision(db, &notifications, campaign.id, CampaignDecision::Approve, None)
        .await
        .unwrap()
}

/// An approved campaign paid from the owner's balance.
pub async fn funded_campaign(
    db: &dyn Database,
    owner_id: UserId,
    details: CampaignDetails,
) -> Campaign {
    let campaign = approved_campaign(db, owner_id, details).await;
    let price = campaign.terms().unwrap().price;
    credit_account(db, owner_id, price).await.unwrap();

    campaigns::pay_from_balance(db, &notifications(), owner_id, campaign.id)
        .await
        .unwrap()
}

/// Moves a published campaign's window back by `days`, as if it had started
/// that long ago.
pub fn backdate(db: &MemoryDatabase, campaign_id: CampaignId, days: i32) -> Campaign {
    let mut state = db.lock().unwrap();
    let campaign = state.campaigns.get_mut(&campaign_id).unwrap();
    let shift = Duration::days(i64::from(days));
    let terms = campaign.terms.as_mut().unwrap();
    terms.start_date = terms.start_date - shift;
    terms.end_date = terms.end_date - shift;
    campaign.details.start_date = Some(terms.start_date);

    campaign.clone()
}

/// A driver approved on the campaign.
pub async fn approved_assignment(
    db: &dyn Database,
    campaign: &Campaign,
    driver_id: UserId,
) -> Assignment {
    let notifications = notifications();
    let assignment = assignments::apply(db, &notifications, driver_id, campaign.id)
        .await
        .unwrap();

    assignments::decide(db, &notifications, assignment.id, AssignmentDecision::Approve)
        .await
        .unwrap()
}

/// An approved driver whose installment proof is approved too.
pub async fn installed_driver(
    db: &dyn Database,
    evidence: &MemoryEvidenceStore,
    campaign: &Campaign,
    driver_id: UserId,
) -> InstallmentProof {
    approved_assignment(db, campaign, driver_id).await;

    let proof = proofs::submit_installment_proof(
        db,
        evidence,
        &fast_retry(),
        campaign.id,
        driver_id,
        b"installed".to_vec(),
        None,
    )
    .await
    .unwrap();

    proofs::review_installment_proof(
        db,
        &notifications(),
        proof.id,
        ProofDecision::Approve,
        None,
    )
    .await
    .unwrap()
}

/// A gateway that accepts every payment it initialized, unless told
/// otherwise.
#[derive(Debug)]
pub struct FakeGateway {
    initialized: Mutex<HashMap<String, Amount>>,
    status: Mutex<TransactionStatus>,
    amount: Mutex<Option<Amount>>,
    failures: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> FakeGateway {
        FakeGateway {
            initialized: Mutex::new(HashMap::new()),
            status: Mutex::new(TransactionStatus::Success),
            amount: Mutex::new(None),
            failures: AtomicUsize::new(0),
        }
    }

    /// The next `count` calls fail as if the gateway were unreachable.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_amount(&self, amount: Amount) {
        *self.amount.lock().unwrap() = Some(amount);
    }

    fn check_reachable(&self) -> Result<(), Error> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::PaymentGatewayFailed("connection reset".into()));
        }

        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn initialize_transaction(
        &self,
        amount: Amount,
        reference: &str,
        _email: &str,
    ) -> Result<TransactionInit, Error> {
        self.check_reachable()?;
        self.initialized
            .lock()
            .unwrap()
            .insert(reference.to_string(), amount);

        Ok(TransactionInit {
            authorization_url: format!("https://checkout.test/{}", reference),
            access_code: "access".into(),
            reference: reference.to_string(),
        })
    }

    async fn verify_transaction(&self, reference: &str) -> Result<TransactionVerification, Error> {
        self.check_reachable()?;
        let initialized = self.initialized.lock().unwrap().get(reference).copied();
        let amount = (*self.amount.lock().unwrap())
            .or(initialized)
            .ok_or_else(|| Error::PaymentReferenceNotFound {
                reference: reference.to_string(),
            })?;

        Ok(TransactionVerification {
            reference: reference.to_string(),
            status: *self.status.lock().unwrap(),
            amount,
        })
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        gateway::verify_signature(GATEWAY_SECRET, payload, signature)
    }
}
