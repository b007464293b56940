use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Amount;
use crate::campaign::CampaignId;
use crate::typedid::{TypedId, TypedIdMarker};
use crate::user::UserId;

pub mod db;
pub mod endpoints;
pub mod manager;
pub use endpoints::*;

pub type EarningId = TypedId<Earning>;

impl TypedIdMarker for Earning {
    fn tag() -> &'static str {
        "ERN"
    }
}

/// A driver's request to be paid out of their available balance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Earning {
    #[serde(rename = "_id")]
    pub id: EarningId,
    pub driver_id: UserId,
    pub campaign_id: Option<CampaignId>,
    pub amount: Amount,
    pub method: PayoutMethod,
    pub recipient_reference: String,
    pub approval: ApprovalStatus,
    pub payment: PaymentState,
    pub reason: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,
}

impl Earning {
    pub fn is_paid_out(&self) -> bool {
        self.approval == ApprovalStatus::Approved && self.payment == PaymentState::Paid
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Unapproved,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn name(self) -> &'static str {
        match self {
            ApprovalStatus::Unapproved => "UNAPPROVED",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    Paid,
    Unpaid,
}

impl PaymentState {
    pub fn name(self) -> &'static str {
        match self {
            PaymentState::Paid => "PAID",
            PaymentState::Unpaid => "UNPAID",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    BankTransfer,
    MobileMoney,
}

/// A new payout request, before it is checked against the ledger.
#[derive(Clone, Debug)]
pub struct PayoutRequest {
    pub driver_id: UserId,
    pub campaign_id: Option<CampaignId>,
    pub amount: Amount,
    pub method: PayoutMethod,
    pub recipient_reference: String,
}

impl PayoutRequest {
    pub fn into_earning(self, now: DateTime<Utc>) -> Earning {
        Earning {
            id: EarningId::new(),
            driver_id: self.driver_id,
            campaign_id: self.campaign_id,
            amount: self.amount,
            method: self.method,
            recipient_reference: self.recipient_reference,
            approval: ApprovalStatus::Unapproved,
            payment: PaymentState::Unpaid,
            reason: None,
            created_at: now,
            modified_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_their_serialized_form() {
        for status in [
            ApprovalStatus::Unapproved,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
        ] {
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.name().to_string())
            );
        }
        assert_eq!(
            serde_json::to_value(PaymentState::Unpaid).unwrap(),
            serde_json::Value::String(PaymentState::Unpaid.name().to_string())
        );
    }

    #[test]
    fn new_requests_start_unapproved_and_unpaid() {
        let earning = PayoutRequest {
            driver_id: UserId::new(),
            campaign_id: None,
            amount: 3_000,
            method: PayoutMethod::BankTransfer,
            recipient_reference: "RCP_123".into(),
        }
        .into_earning(Utc::now());

        assert_eq!(earning.approval, ApprovalStatus::Unapproved);
        assert_eq!(earning.payment, PaymentState::Unpaid);
        assert!(!earning.is_paid_out());
    }
}
