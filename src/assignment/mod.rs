use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Amount;
use crate::campaign::CampaignId;
use crate::error::Error;
use crate::typedid::{TypedId, TypedIdMarker};
use crate::user::UserId;

pub mod db;
pub mod endpoints;
pub mod manager;
pub use endpoints::*;

pub type AssignmentId = TypedId<Assignment>;

impl TypedIdMarker for Assignment {
    fn tag() -> &'static str {
        "ASG"
    }
}

/// A driver's application to, and standing within, one campaign.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Assignment {
    #[serde(rename = "_id")]
    pub id: AssignmentId,
    pub campaign_id: CampaignId,
    pub driver_id: UserId,
    pub status: AssignmentStatus,
    pub active: bool,
    pub paid: bool,
    /// Earnings credited to the driver's pending balance for this campaign.
    pub accrued: Amount,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(campaign_id: CampaignId, driver_id: UserId, now: DateTime<Utc>) -> Assignment {
        Assignment {
            id: AssignmentId::new(),
            campaign_id,
            driver_id,
            status: AssignmentStatus::PendingApproval,
            active: false,
            paid: false,
            accrued: 0,
            start_date: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Whether the driver is on the road for the campaign and may submit
    /// weekly proofs.
    pub fn is_running(&self) -> bool {
        matches!(
            self.status,
            AssignmentStatus::Approved | AssignmentStatus::DueSoon
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    PendingApproval,
    Approved,
    Rejected,
    DueSoon,
    Completed,
}

impl AssignmentStatus {
    pub fn name(self) -> &'static str {
        match self {
            AssignmentStatus::PendingApproval => "pending_approval",
            AssignmentStatus::Approved => "approved",
            AssignmentStatus::Rejected => "rejected",
            AssignmentStatus::DueSoon => "due_soon",
            AssignmentStatus::Completed => "completed",
        }
    }

    /// `completed` and `rejected` are final.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            AssignmentStatus::Completed | AssignmentStatus::Rejected
        )
    }

    pub fn can_transition_to(self, to: AssignmentStatus) -> bool {
        use AssignmentStatus::*;

        matches!(
            (self, to),
            (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, DueSoon)
                | (Approved, Completed)
                | (DueSoon, Completed)
        )
    }

    pub fn ensure_transition(self, to: AssignmentStatus) -> Result<(), Error> {
        if !self.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                entity: "assignment",
                from: self.name().to_string(),
                to: to.name().to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentDecision {
    Approve,
    Reject,
}

impl AssignmentDecision {
    pub fn status(self) -> AssignmentStatus {
        match self {
            AssignmentDecision::Approve => AssignmentStatus::Approved,
            AssignmentDecision::Reject => AssignmentStatus::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use AssignmentStatus::*;

        assert!(PendingApproval.can_transition_to(Approved));
        assert!(Approved.can_transition_to(DueSoon));
        assert!(Approved.can_transition_to(Completed));
        assert!(DueSoon.can_transition_to(Completed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Completed.can_transition_to(DueSoon));
        assert!(!PendingApproval.can_transition_to(Completed));
    }

    #[test]
    fn settled_statuses_are_final() {
        use AssignmentStatus::*;

        for from in [Completed, Rejected] {
            assert!(from.is_settled());
            for to in [PendingApproval, Approved, Rejected, DueSoon, Completed] {
                assert!(from.ensure_transition(to).is_err());
            }
        }
    }
}
