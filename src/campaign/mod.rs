use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{Amount, LedgerMove};
use crate::error::Error;
use crate::proof::ProofPeriod;
use crate::typedid::{TypedId, TypedIdMarker};
use crate::user::UserId;

pub mod db;
pub mod endpoints;
pub mod manager;
pub use endpoints::*;

pub type CampaignId = TypedId<Campaign>;

impl TypedIdMarker for Campaign {
    fn tag() -> &'static str {
        "CPN"
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Campaign {
    #[serde(rename = "_id")]
    pub id: CampaignId,
    pub owner_id: UserId,
    pub status: CampaignStatus,
    pub details: CampaignDetails,
    pub terms: Option<CampaignTerms>,
    pub payment_status: PaymentStatus,
    /// Every gateway payment started for the campaign, oldest first.
    #[serde(default)]
    pub payments: Vec<GatewayPayment>,
    pub driver_slots_taken: i32,
    pub review_comment: Option<String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub modified_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new_draft(owner_id: UserId, details: CampaignDetails, now: DateTime<Utc>) -> Campaign {
        Campaign {
            id: CampaignId::new(),
            owner_id,
            status: CampaignStatus::Draft,
            details,
            terms: None,
            payment_status: PaymentStatus::Pending,
            payments: Vec::new(),
            driver_slots_taken: 0,
            review_comment: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// The validated terms; every campaign past `draft` carries them.
    pub fn terms(&self) -> Result<&CampaignTerms, Error> {
        self.terms.as_ref().ok_or_else(|| {
            Error::ExistentialState(format!("campaign {} has no terms", self.id))
        })
    }

    pub fn payment(&self, reference: &str) -> Option<&GatewayPayment> {
        self.payments
            .iter()
            .find(|payment| payment.reference == reference)
    }

    /// How a successful gateway payment of `amount` is booked against the
    /// campaign as it is now. Only an unpaid, approved campaign can be funded
    /// and only by at least its price; anything else goes to the owner's
    /// available balance.
    pub fn settlement_for(&self, amount: Amount) -> Result<PaymentSettlement, Error> {
        let price = self.terms()?.price;
        let fundable = self.status == CampaignStatus::Approved
            && self.payment_status == PaymentStatus::Pending
            && amount >= price;

        if fundable {
            Ok(PaymentSettlement::Funded)
        } else {
            Ok(PaymentSettlement::CreditedToBalance)
        }
    }

    pub fn is_accepting_drivers(&self) -> bool {
        self.status == CampaignStatus::Approved && self.payment_status == PaymentStatus::Spent
    }

    pub fn has_open_slots(&self) -> bool {
        match &self.terms {
            Some(terms) => self.driver_slots_taken < terms.drivers_requested,
            None => false,
        }
    }

    /// Whether ads of this campaign should currently be on the road.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        let live_status = matches!(
            self.status,
            CampaignStatus::Approved | CampaignStatus::Active
        );

        match &self.terms {
            Some(terms) => live_status && terms.start_date <= now && now <= terms.end_date,
            None => false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Starter,
    Basic,
    Premium,
    Custom,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Pending,
    Approved,
    Active,
    Completed,
    Rejected,
}

impl CampaignStatus {
    pub fn name(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Pending => "pending",
            CampaignStatus::Approved => "approved",
            CampaignStatus::Active => "active",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Rejected => "rejected",
        }
    }

    pub fn can_transition_to(self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;

        matches!(
            (self, to),
            (Draft, Pending)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Active)
                | (Active, Completed)
        )
    }

    pub fn ensure_transition(self, to: CampaignStatus) -> Result<(), Error> {
        if !self.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                entity: "campaign",
                from: self.name().to_string(),
                to: to.name().to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Spent,
}

/// Campaign fields as entered by the owner; anything may still be missing.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CampaignDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub package_type: Option<PackageType>,
    #[serde(default)]
    pub price: Option<Amount>,
    #[serde(default)]
    pub drivers_requested: Option<i32>,
    #[serde(default)]
    pub earning_per_driver: Option<Amount>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_days: Option<i32>,
}

impl CampaignDetails {
    /// Fields present in `changes` replace the current ones.
    pub fn merge(self, changes: CampaignDetails) -> CampaignDetails {
        CampaignDetails {
            name: changes.name.or(self.name),
            package_type: changes.package_type.or(self.package_type),
            price: changes.price.or(self.price),
            drivers_requested: changes.drivers_requested.or(self.drivers_requested),
            earning_per_driver: changes.earning_per_driver.or(self.earning_per_driver),
            start_date: changes.start_date.or(self.start_date),
            duration_days: changes.duration_days.or(self.duration_days),
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<CampaignTerms, Error> {
        let name = self
            .name
            .as_ref()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .ok_or(Error::MissingField { field: "name" })?;
        let package_type = self
            .package_type
            .ok_or(Error::MissingField { field: "package_type" })?;
        let price = self.price.ok_or(Error::MissingField { field: "price" })?;
        let drivers_requested = self.drivers_requested.ok_or(Error::MissingField {
            field: "drivers_requested",
        })?;
        let earning_per_driver = self.earning_per_driver.ok_or(Error::MissingField {
            field: "earning_per_driver",
        })?;
        let start_date = self
            .start_date
            .ok_or(Error::MissingField { field: "start_date" })?;
        let duration_days = self.duration_days.ok_or(Error::MissingField {
            field: "duration_days",
        })?;

        // compared by calendar day so that "today" is always accepted
        if start_date.date_naive() < now.date_naive() {
            return Err(Error::StartDateInPast { start_date });
        }
        if price <= 0 {
            return Err(Error::InvalidAmount { amount: price });
        }
        if earning_per_driver <= 0 {
            return Err(Error::InvalidAmount {
                amount: earning_per_driver,
            });
        }
        if drivers_requested <= 0 {
            return Err(Error::InvalidDriverCount { drivers_requested });
        }
        if duration_days <= 0 {
            return Err(Error::InvalidDuration { duration_days });
        }

        let total_earnings = earning_per_driver.saturating_mul(Amount::from(drivers_requested));
        if total_earnings > price {
            return Err(Error::EarningsExceedPrice {
                price,
                total_earnings,
            });
        }

        Ok(CampaignTerms {
            name: name.to_string(),
            package_type,
            price,
            drivers_requested,
            earning_per_driver,
            start_date,
            end_date: start_date + Duration::days(i64::from(duration_days)),
            duration_days,
        })
    }
}

/// The validated, frozen copy of a published campaign's details.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CampaignTerms {
    pub name: String,
    pub package_type: PackageType,
    pub price: Amount,
    pub drivers_requested: i32,
    pub earning_per_driver: Amount,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub start_date: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub end_date: DateTime<Utc>,
    pub duration_days: i32,
}

impl CampaignTerms {
    /// Every ISO week touched by the campaign window, in order.
    pub fn required_periods(&self) -> Vec<ProofPeriod> {
        let mut periods: Vec<ProofPeriod> = Vec::new();
        for day in 0..i64::from(self.duration_days) {
            let period = ProofPeriod::of(self.start_date + Duration::days(day));
            if periods.last() != Some(&period) {
                periods.push(period);
            }
        }

        periods
    }

    pub fn covers_period(&self, period: ProofPeriod) -> bool {
        self.required_periods().contains(&period)
    }

    /// A week can be proven once it has started and only if the campaign runs
    /// through it.
    pub fn accepts_proof_for(&self, period: ProofPeriod, now: DateTime<Utc>) -> bool {
        period <= ProofPeriod::of(now) && self.covers_period(period)
    }

    /// The driver earning released by the next approved weekly proof, given
    /// how many were approved before it. The last required week receives the
    /// remainder so the sum is exactly `earning_per_driver`.
    pub fn weekly_accrual(&self, approved_before: usize) -> Amount {
        let weeks = self.required_periods().len();
        if weeks == 0 || approved_before >= weeks {
            return 0;
        }

        let share = self.earning_per_driver / weeks as Amount;
        if approved_before + 1 == weeks {
            self.earning_per_driver - share * (weeks as Amount - 1)
        } else {
            share
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignDecision {
    Approve,
    Reject,
}

impl CampaignDecision {
    pub fn status(self) -> CampaignStatus {
        match self {
            CampaignDecision::Approve => CampaignStatus::Approved,
            CampaignDecision::Reject => CampaignStatus::Rejected,
        }
    }
}

/// A checkout started with the payment gateway.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GatewayPayment {
    pub reference: String,
    /// `None` until the gateway confirmed the payment and it was booked.
    pub settlement: Option<PaymentSettlement>,
    /// The amount the gateway reported, once settled.
    pub amount: Option<Amount>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl GatewayPayment {
    pub fn new(reference: String, now: DateTime<Utc>) -> GatewayPayment {
        GatewayPayment {
            reference,
            settlement: None,
            amount: None,
            created_at: now,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSettlement {
    /// Paid for the campaign; any excess over the price went to the balance.
    Funded,
    /// The campaign could not take it, so all of it went to the balance.
    CreditedToBalance,
}

impl PaymentSettlement {
    pub fn name(self) -> &'static str {
        match self {
            PaymentSettlement::Funded => "funded",
            PaymentSettlement::CreditedToBalance => "credited_to_balance",
        }
    }

    /// The owner's ledger moves for a payment of `amount` on a campaign
    /// priced at `price`.
    pub fn ledger_moves(self, price: Amount, amount: Amount) -> Vec<LedgerMove> {
        let (to_pending, to_balance) = match self {
            PaymentSettlement::Funded => (price, amount - price),
            PaymentSettlement::CreditedToBalance => (0, amount),
        };

        let mut moves = Vec::new();
        if to_pending > 0 {
            moves.push(LedgerMove::CreditPending(to_pending));
        }
        if to_balance > 0 {
            moves.push(LedgerMove::CreditBalance(to_balance));
        }
        moves
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn details(start_date: DateTime<Utc>) -> CampaignDetails {
        CampaignDetails {
            name: Some("Launch".into()),
            package_type: Some(PackageType::Basic),
            price: Some(10_000),
            drivers_requested: Some(2),
            earning_per_driver: Some(4_000),
            start_date: Some(start_date),
            duration_days: Some(28),
        }
    }

    #[test]
    fn validate_accepts_today_at_an_earlier_hour() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();

        let terms = details(start).validate(now).unwrap();

        assert_eq!(terms.end_date, start + Duration::days(28));
    }

    #[test]
    fn validate_rejects_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 0, 30, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 3, 23, 59, 0).unwrap();

        assert_eq!(
            details(start).validate(now).unwrap_err(),
            Error::StartDateInPast { start_date: start }
        );
    }

    #[test]
    fn validate_reports_first_missing_field() {
        let now = Utc::now();
        let mut details = details(now);
        details.price = None;

        assert_eq!(
            details.validate(now).unwrap_err(),
            Error::MissingField { field: "price" }
        );
    }

    #[test]
    fn validate_rejects_earnings_above_price() {
        let now = Utc::now();
        let mut details = details(now);
        details.earning_per_driver = Some(6_000);

        assert_eq!(
            details.validate(now).unwrap_err(),
            Error::EarningsExceedPrice {
                price: 10_000,
                total_earnings: 12_000
            }
        );
    }

    #[test]
    fn merge_keeps_fields_not_given() {
        let now = Utc::now();
        let merged = details(now).merge(CampaignDetails {
            price: Some(20_000),
            ..CampaignDetails::default()
        });

        assert_eq!(merged.price, Some(20_000));
        assert_eq!(merged.name.as_deref(), Some("Launch"));
    }

    #[test]
    fn transition_table() {
        use CampaignStatus::*;

        assert!(Draft.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Active.can_transition_to(Completed));
        assert!(!Draft.can_transition_to(Approved));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Completed.can_transition_to(Active));
        assert!(matches!(
            Approved.ensure_transition(Completed),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn weekly_accruals_sum_to_earning_per_driver() {
        // a Monday, so 28 days are exactly four ISO weeks
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let mut terms = details(start).validate(start).unwrap();
        terms.earning_per_driver = 4_001;

        assert_eq!(terms.required_periods().len(), 4);
        let accruals: Vec<Amount> = (0..4).map(|n| terms.weekly_accrual(n)).collect();
        assert_eq!(accruals, vec![1_000, 1_000, 1_000, 1_001]);
        assert_eq!(terms.weekly_accrual(4), 0);
    }

    #[test]
    fn required_periods_cover_partial_weeks() {
        // a Thursday: twelve days run into the Monday of the third ISO week
        let start = Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap();
        let mut terms = details(start).validate(start).unwrap();
        terms.duration_days = 12;

        assert_eq!(
            terms.required_periods(),
            vec![
                ProofPeriod { year: 2024, week: 10 },
                ProofPeriod { year: 2024, week: 11 },
                ProofPeriod { year: 2024, week: 12 },
            ]
        );
    }

    #[test]
    fn is_live_requires_window_and_status() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let mut campaign = Campaign::new_draft(UserId::new(), details(start), start);
        campaign.terms = Some(details(start).validate(start).unwrap());

        assert!(!campaign.is_live(start));
        campaign.status = CampaignStatus::Approved;
        assert!(campaign.is_live(start + Duration::days(1)));
        assert!(!campaign.is_live(start + Duration::days(29)));
    }

    #[test]
    fn gateway_payments_fund_only_an_unpaid_approved_campaign() {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let mut campaign = Campaign::new_draft(UserId::new(), details(start), start);
        campaign.terms = Some(details(start).validate(start).unwrap());
        campaign.status = CampaignStatus::Approved;

        assert_eq!(
            campaign.settlement_for(12_000).unwrap(),
            PaymentSettlement::Funded
        );
        assert_eq!(
            campaign.settlement_for(9_999).unwrap(),
            PaymentSettlement::CreditedToBalance
        );

        campaign.payment_status = PaymentStatus::Spent;
        assert_eq!(
            campaign.settlement_for(10_000).unwrap(),
            PaymentSettlement::CreditedToBalance
        );
    }

    #[test]
    fn overpayment_excess_goes_to_the_balance() {
        assert_eq!(
            PaymentSettlement::Funded.ledger_moves(10_000, 12_500),
            vec![
                LedgerMove::CreditPending(10_000),
                LedgerMove::CreditBalance(2_500)
            ]
        );
        assert_eq!(
            PaymentSettlement::Funded.ledger_moves(10_000, 10_000),
            vec![LedgerMove::CreditPending(10_000)]
        );
        assert_eq!(
            PaymentSettlement::CreditedToBalance.ledger_moves(10_000, 10_000),
            vec![LedgerMove::CreditBalance(10_000)]
        );
    }
}
