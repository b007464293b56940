use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::account::Amount;
use crate::campaign::CampaignId;
use crate::error::Error;
use crate::evidence::Evidence;
use crate::typedid::{TypedId, TypedIdMarker};
use crate::user::UserId;

pub mod db;
pub mod endpoints;
pub mod manager;
pub use endpoints::*;

pub type InstallmentProofId = TypedId<InstallmentProof>;
pub type WeeklyProofId = TypedId<WeeklyProof>;

impl TypedIdMarker for InstallmentProof {
    fn tag() -> &'static str {
        "IPF"
    }
}

impl TypedIdMarker for WeeklyProof {
    fn tag() -> &'static str {
        "WPF"
    }
}

/// Evidence that the ad material is installed on the driver's vehicle. One
/// per (campaign, driver) pair; it gates every weekly proof of that pair.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstallmentProof {
    #[serde(rename = "_id")]
    pub id: InstallmentProofId,
    pub campaign_id: CampaignId,
    pub driver_id: UserId,
    pub evidence: Evidence,
    pub status: ProofStatus,
    pub reason: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WeeklyProof {
    #[serde(rename = "_id")]
    pub id: WeeklyProofId,
    pub campaign_id: CampaignId,
    pub driver_id: UserId,
    pub period: ProofPeriod,
    pub month: u32,
    pub evidence: Evidence,
    pub status: WeeklyProofStatus,
    pub reason: Option<String>,
    /// The earning credited when this proof was approved.
    pub accrued: Amount,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,
}

/// An ISO week.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ProofPeriod {
    pub year: i32,
    pub week: u32,
}

impl ProofPeriod {
    pub fn of(date: DateTime<Utc>) -> ProofPeriod {
        let iso = date.iso_week();
        ProofPeriod {
            year: iso.year(),
            week: iso.week(),
        }
    }

    /// The calendar month of the week's Monday.
    pub fn month(&self) -> Option<u32> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon).map(|date| date.month())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    PendingApproval,
    Approved,
    Rejected,
}

impl ProofStatus {
    pub fn name(self) -> &'static str {
        match self {
            ProofStatus::PendingApproval => "pending_approval",
            ProofStatus::Approved => "approved",
            ProofStatus::Rejected => "rejected",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeeklyProofStatus {
    PendingApproval,
    Approved,
    Rejected,
    Flagged,
}

impl WeeklyProofStatus {
    pub fn name(self) -> &'static str {
        match self {
            WeeklyProofStatus::PendingApproval => "pending_approval",
            WeeklyProofStatus::Approved => "approved",
            WeeklyProofStatus::Rejected => "rejected",
            WeeklyProofStatus::Flagged => "flagged",
        }
    }

    /// Whether a reviewer may still decide on a proof in this status.
    pub fn is_reviewable(self) -> bool {
        matches!(
            self,
            WeeklyProofStatus::PendingApproval | WeeklyProofStatus::Flagged
        )
    }

    pub fn can_transition_to(self, to: WeeklyProofStatus) -> bool {
        use WeeklyProofStatus::*;

        matches!(
            (self, to),
            (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (PendingApproval, Flagged)
                | (Flagged, Approved)
                | (Flagged, Rejected)
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofDecision {
    Approve,
    Reject,
    Flag,
}

impl ProofDecision {
    /// Reject and flag decisions must carry a non-empty reason.
    pub fn check_reason(self, reason: Option<String>) -> Result<Option<String>, Error> {
        let reason = reason
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty());

        match self {
            ProofDecision::Approve => Ok(reason),
            ProofDecision::Reject | ProofDecision::Flag => match reason {
                Some(reason) => Ok(Some(reason)),
                None => Err(Error::RejectionReasonRequired),
            },
        }
    }

    pub fn installment_status(self) -> Result<ProofStatus, Error> {
        match self {
            ProofDecision::Approve => Ok(ProofStatus::Approved),
            ProofDecision::Reject => Ok(ProofStatus::Rejected),
            ProofDecision::Flag => Err(Error::InvalidTransition {
                entity: "installment_proof",
                from: ProofStatus::PendingApproval.name().to_string(),
                to: "flagged".to_string(),
            }),
        }
    }

    pub fn weekly_status(self) -> WeeklyProofStatus {
        match self {
            ProofDecision::Approve => WeeklyProofStatus::Approved,
            ProofDecision::Reject => WeeklyProofStatus::Rejected,
            ProofDecision::Flag => WeeklyProofStatus::Flagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn period_follows_iso_weeks_across_years() {
        let date = Utc.with_ymd_and_hms(2021, 1, 2, 12, 0, 0).unwrap();
        let period = ProofPeriod::of(date);

        assert_eq!(period, ProofPeriod { year: 2020, week: 53 });
        assert_eq!(period.month(), Some(12));
    }

    #[test]
    fn invalid_week_has_no_month() {
        assert_eq!(ProofPeriod { year: 2024, week: 60 }.month(), None);
    }

    #[test]
    fn reject_and_flag_need_reason() {
        assert_eq!(
            ProofDecision::Reject.check_reason(Some("   ".into())),
            Err(Error::RejectionReasonRequired)
        );
        assert_eq!(
            ProofDecision::Flag.check_reason(None),
            Err(Error::RejectionReasonRequired)
        );
        assert_eq!(
            ProofDecision::Reject.check_reason(Some(" blurry ".into())),
            Ok(Some("blurry".into()))
        );
        assert_eq!(ProofDecision::Approve.check_reason(None), Ok(None));
    }

    #[test]
    fn flagged_proofs_can_still_be_decided() {
        use WeeklyProofStatus::*;

        assert!(Flagged.is_reviewable());
        assert!(Flagged.can_transition_to(Approved));
        assert!(!Flagged.can_transition_to(Flagged));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.is_reviewable());
    }

    #[test]
    fn installment_proofs_cannot_be_flagged() {
        assert!(ProofDecision::Flag.installment_status().is_err());
        assert_eq!(
            ProofDecision::Approve.installment_status(),
            Ok(ProofStatus::Approved)
        );
    }
}
