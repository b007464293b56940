use std::fmt::{Debug, Display};
use std::io::Error as IoError;

use actix_web::error::{JsonPayloadError, PathError, QueryPayloadError, UrlencodedError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use config::ConfigError;
use derivative::Derivative;
use mongodb::bson::ser::Error as BsonError;
use mongodb::error::{Error as DatabaseError, TRANSIENT_TRANSACTION_ERROR};
use serde::{Serialize, Serializer};

use crate::account::Amount;
use crate::assignment::{AssignmentId, AssignmentStatus};
use crate::campaign::{CampaignId, CampaignStatus, PaymentStatus};
use crate::gateway::TransactionStatus;
use crate::proof::{
    InstallmentProofId, ProofPeriod, ProofStatus, WeeklyProofId, WeeklyProofStatus,
};
use crate::user::{Role, UserId};

#[derive(Debug, Serialize, Derivative)]
#[derivative(PartialEq)]
#[serde(untagged)]
pub enum Error {
    // 400
    #[serde(serialize_with = "display")]
    InvalidJson(#[derivative(PartialEq = "ignore")] JsonPayloadError),
    #[serde(serialize_with = "display")]
    InvalidPath(#[derivative(PartialEq = "ignore")] PathError),
    #[serde(serialize_with = "display")]
    InvalidForm(#[derivative(PartialEq = "ignore")] UrlencodedError),
    #[serde(serialize_with = "display")]
    InvalidQuery(#[derivative(PartialEq = "ignore")] QueryPayloadError),
    MissingField {
        field: &'static str,
    },
    StartDateInPast {
        start_date: DateTime<Utc>,
    },
    InvalidAmount {
        amount: Amount,
    },
    InvalidDriverCount {
        drivers_requested: i32,
    },
    InvalidDuration {
        duration_days: i32,
    },
    EarningsExceedPrice {
        price: Amount,
        total_earnings: Amount,
    },
    RejectionReasonRequired,
    InvalidProofPeriod {
        campaign_id: CampaignId,
        period: ProofPeriod,
    },
    EmptyEvidence,
    InvalidWebhookSignature,
    #[serde(serialize_with = "display")]
    InvalidWebhookPayload(#[derivative(PartialEq = "ignore")] serde_json::Error),

    // 401
    MissingIdentity,

    // 403
    PermissionDenied {
        user_id: UserId,
        role: Role,
        allowed_roles: Vec<Role>,
    },

    // 404
    PathNotFound,
    CampaignNotFound {
        campaign_id: CampaignId,
    },
    PaymentReferenceNotFound {
        reference: String,
    },
    AssignmentNotFound {
        assignment_id: AssignmentId,
    },
    AssignmentNotFoundForDriver {
        campaign_id: CampaignId,
        driver_id: UserId,
    },
    InstallmentProofNotFound {
        installment_proof_id: InstallmentProofId,
    },
    WeeklyProofNotFound {
        weekly_proof_id: WeeklyProofId,
    },
    EarningNotFound {
        driver_id: UserId,
    },
    AccountNotFound {
        user_id: UserId,
    },

    // 409
    ConcurrentModificationDetected,
    /// The server aborted a transaction that raced another one. Retried inside
    /// the store and never expected to reach a caller.
    TransactionConflict,
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    CampaignAlreadyDecided {
        campaign_id: CampaignId,
        status: CampaignStatus,
    },
    AssignmentAlreadyExists {
        campaign_id: CampaignId,
        driver_id: UserId,
    },
    InstallmentProofAlreadyReviewed {
        installment_proof_id: InstallmentProofId,
        status: ProofStatus,
    },
    WeeklyProofAlreadyReviewed {
        weekly_proof_id: WeeklyProofId,
        status: WeeklyProofStatus,
    },
    WeeklyProofAlreadySubmitted {
        campaign_id: CampaignId,
        driver_id: UserId,
        period: ProofPeriod,
    },
    UnapprovedEarningExists {
        driver_id: UserId,
    },

    // 422
    CampaignNotPayable {
        campaign_id: CampaignId,
        status: CampaignStatus,
        payment_status: PaymentStatus,
    },
    CampaignNotAcceptingDrivers {
        campaign_id: CampaignId,
        status: CampaignStatus,
        payment_status: PaymentStatus,
    },
    CampaignFull {
        campaign_id: CampaignId,
        drivers_requested: i32,
    },
    AssignmentNotApproved {
        assignment_id: AssignmentId,
        status: AssignmentStatus,
    },
    InstallmentProofAlreadyApproved {
        campaign_id: CampaignId,
        driver_id: UserId,
    },
    InstallmentProofNotApproved {
        campaign_id: CampaignId,
        driver_id: UserId,
    },
    WeeklyProofAlreadyApproved {
        weekly_proof_id: WeeklyProofId,
    },
    WeeklyProofsOutstanding {
        assignment_id: AssignmentId,
        missing_periods: Vec<ProofPeriod>,
    },
    PaymentNotSuccessful {
        reference: String,
        status: TransactionStatus,
    },
    PaymentCreditedToBalance {
        campaign_id: CampaignId,
        reference: String,
        amount: Amount,
    },
    InsufficientFunds {
        user_id: UserId,
        requested: Amount,
        available: Amount,
    },

    // 502
    PaymentGatewayFailed(String),
    EvidenceStorageFailed(String),
    NotificationFailed(String),

    // 500
    ExistentialState(String),
    #[serde(serialize_with = "display")]
    FailedDatabaseCall(#[derivative(PartialEq = "ignore")] DatabaseError),
    #[serde(serialize_with = "display")]
    FailedToSerializeToBson(#[derivative(PartialEq = "ignore")] BsonError),
    #[serde(serialize_with = "display")]
    IoError(#[derivative(PartialEq = "ignore")] IoError),
    #[serde(serialize_with = "display")]
    InvalidConfiguration(#[derivative(PartialEq = "ignore")] ConfigError),
}

/// Coarse classes callers use to decide how to react to a failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    Validation,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    Conflict,
    BusinessRule,
    InsufficientFunds,
    Dependency,
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidJson(_)
            | Error::InvalidPath(_)
            | Error::InvalidForm(_)
            | Error::InvalidQuery(_)
            | Error::MissingField { .. }
            | Error::StartDateInPast { .. }
            | Error::InvalidAmount { .. }
            | Error::InvalidDriverCount { .. }
            | Error::InvalidDuration { .. }
            | Error::EarningsExceedPrice { .. }
            | Error::RejectionReasonRequired
            | Error::InvalidProofPeriod { .. }
            | Error::EmptyEvidence
            | Error::InvalidWebhookSignature
            | Error::InvalidWebhookPayload(_) => ErrorCategory::Validation,
            Error::MissingIdentity => ErrorCategory::Unauthenticated,
            Error::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Error::PathNotFound
            | Error::CampaignNotFound { .. }
            | Error::PaymentReferenceNotFound { .. }
            | Error::AssignmentNotFound { .. }
            | Error::AssignmentNotFoundForDriver { .. }
            | Error::InstallmentProofNotFound { .. }
            | Error::WeeklyProofNotFound { .. }
            | Error::EarningNotFound { .. }
            | Error::AccountNotFound { .. } => ErrorCategory::NotFound,
            Error::ConcurrentModificationDetected
            | Error::TransactionConflict
            | Error::InvalidTransition { .. }
            | Error::CampaignAlreadyDecided { .. }
            | Error::AssignmentAlreadyExists { .. }
            | Error::InstallmentProofAlreadyReviewed { .. }
            | Error::WeeklyProofAlreadyReviewed { .. }
            | Error::WeeklyProofAlreadySubmitted { .. }
            | Error::UnapprovedEarningExists { .. }
            | Error::PaymentCreditedToBalance { .. } => ErrorCategory::Conflict,
            Error::CampaignNotPayable { .. }
            | Error::CampaignNotAcceptingDrivers { .. }
            | Error::CampaignFull { .. }
            | Error::AssignmentNotApproved { .. }
            | Error::InstallmentProofAlreadyApproved { .. }
            | Error::InstallmentProofNotApproved { .. }
            | Error::WeeklyProofAlreadyApproved { .. }
            | Error::WeeklyProofsOutstanding { .. }
            | Error::PaymentNotSuccessful { .. } => ErrorCategory::BusinessRule,
            Error::InsufficientFunds { .. } => ErrorCategory::InsufficientFunds,
            Error::PaymentGatewayFailed(_)
            | Error::EvidenceStorageFailed(_)
            | Error::NotificationFailed(_) => ErrorCategory::Dependency,
            Error::ExistentialState(_)
            | Error::FailedDatabaseCall(_)
            | Error::FailedToSerializeToBson(_)
            | Error::IoError(_)
            | Error::InvalidConfiguration(_) => ErrorCategory::Internal,
        }
    }

    /// Only failures of external collaborators are worth retrying at the
    /// boundary; everything else would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Dependency
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidJson(_) => "E4001000",
            Error::InvalidPath(_) => "E4001001",
            Error::InvalidForm(_) => "E4001002",
            Error::InvalidQuery(_) => "E4001003",
            Error::MissingField { .. } => "E4001004",
            Error::StartDateInPast { .. } => "E4001005",
            Error::InvalidAmount { .. } => "E4001006",
            Error::InvalidDriverCount { .. } => "E4001007",
            Error::InvalidDuration { .. } => "E4001008",
            Error::EarningsExceedPrice { .. } => "E4001009",
            Error::RejectionReasonRequired => "E4001010",
            Error::InvalidProofPeriod { .. } => "E4001011",
            Error::EmptyEvidence => "E4001012",
            Error::InvalidWebhookSignature => "E4001013",
            Error::InvalidWebhookPayload(_) => "E4001014",
            Error::MissingIdentity => "E4011000",
            Error::PermissionDenied { .. } => "E4031000",
            Error::PathNotFound => "E4041000",
            Error::CampaignNotFound { .. } => "E4041001",
            Error::PaymentReferenceNotFound { .. } => "E4041002",
            Error::AssignmentNotFound { .. } => "E4041003",
            Error::AssignmentNotFoundForDriver { .. } => "E4041004",
            Error::InstallmentProofNotFound { .. } => "E4041005",
            Error::WeeklyProofNotFound { .. } => "E4041006",
            Error::EarningNotFound { .. } => "E4041007",
            Error::AccountNotFound { .. } => "E4041008",
            Error::ConcurrentModificationDetected | Error::TransactionConflict => "E4091000",
            Error::InvalidTransition { .. } => "E4091001",
            Error::CampaignAlreadyDecided { .. } => "E4091002",
            Error::AssignmentAlreadyExists { .. } => "E4091003",
            Error::InstallmentProofAlreadyReviewed { .. } => "E4091004",
            Error::WeeklyProofAlreadyReviewed { .. } => "E4091005",
            Error::WeeklyProofAlreadySubmitted { .. } => "E4091006",
            Error::UnapprovedEarningExists { .. } => "E4091007",
            Error::PaymentCreditedToBalance { .. } => "E4091008",
            Error::CampaignNotPayable { .. } => "E4221000",
            Error::CampaignNotAcceptingDrivers { .. } => "E4221001",
            Error::CampaignFull { .. } => "E4221002",
            Error::AssignmentNotApproved { .. } => "E4221003",
            Error::InstallmentProofAlreadyApproved { .. } => "E4221004",
            Error::InstallmentProofNotApproved { .. } => "E4221005",
            Error::WeeklyProofAlreadyApproved { .. } => "E4221006",
            Error::WeeklyProofsOutstanding { .. } => "E4221007",
            Error::PaymentNotSuccessful { .. } => "E4221008",
            Error::InsufficientFunds { .. } => "E4221010",
            Error::PaymentGatewayFailed(_) => "E5021000",
            Error::EvidenceStorageFailed(_) => "E5021001",
            Error::NotificationFailed(_) => "E5021002",
            Error::ExistentialState(_) => "E5001000",
            Error::FailedDatabaseCall(_) => "E5001001",
            Error::FailedToSerializeToBson(_) => "E5001002",
            Error::IoError(_) => "E5001003",
            Error::InvalidConfiguration(_) => "E5001004",
        }
    }

    pub fn error_message(&self) -> &'static str {
        match self {
            Error::InvalidJson(_) => "The given json could not be parsed",
            Error::InvalidPath(_) => "The given path could not be parsed",
            Error::InvalidForm(_) => "The given form could not be parsed",
            Error::InvalidQuery(_) => "The given query could not be parsed",
            Error::MissingField { .. } => "A required field is missing",
            Error::StartDateInPast { .. } => "The start date must not be in the past",
            Error::InvalidAmount { .. } => "The amount must be greater than zero",
            Error::InvalidDriverCount { .. } => "The number of drivers must be greater than zero",
            Error::InvalidDuration { .. } => "The duration must be greater than zero",
            Error::EarningsExceedPrice { .. } => {
                "The total driver earnings exceed the campaign price"
            }
            Error::RejectionReasonRequired => "A reason is required for this decision",
            Error::InvalidProofPeriod { .. } => {
                "The given period is outside of the campaign window"
            }
            Error::EmptyEvidence => "The uploaded evidence is empty",
            Error::InvalidWebhookSignature => "The webhook signature is invalid",
            Error::InvalidWebhookPayload(_) => "The webhook payload could not be parsed",
            Error::MissingIdentity => "The caller identity is missing or malformed",
            Error::PermissionDenied { .. } => "The caller is not allowed to perform this action",
            Error::PathNotFound => "The requested path was not found",
            Error::CampaignNotFound { .. } => "The requested campaign was not found",
            Error::PaymentReferenceNotFound { .. } => {
                "No campaign is associated with the payment reference"
            }
            Error::AssignmentNotFound { .. } => "The requested assignment was not found",
            Error::AssignmentNotFoundForDriver { .. } => {
                "The driver is not assigned to the requested campaign"
            }
            Error::InstallmentProofNotFound { .. } => {
                "The requested installment proof was not found"
            }
            Error::WeeklyProofNotFound { .. } => "The requested weekly proof was not found",
            Error::EarningNotFound { .. } => "No matching unapproved earning was found",
            Error::AccountNotFound { .. } => "The requested account was not found",
            Error::ConcurrentModificationDetected | Error::TransactionConflict => {
                "The server detected a concurrent modification"
            }
            Error::InvalidTransition { .. } => "The requested status transition is not allowed",
            Error::CampaignAlreadyDecided { .. } => {
                "A decision has already been made for the campaign"
            }
            Error::AssignmentAlreadyExists { .. } => {
                "The driver has already applied to the campaign"
            }
            Error::InstallmentProofAlreadyReviewed { .. } => {
                "The installment proof has already been reviewed"
            }
            Error::WeeklyProofAlreadyReviewed { .. } => {
                "The weekly proof has already been reviewed"
            }
            Error::WeeklyProofAlreadySubmitted { .. } => {
                "A weekly proof for the period was submitted concurrently"
            }
            Error::UnapprovedEarningExists { .. } => {
                "The driver already has an unapproved payout request"
            }
            Error::CampaignNotPayable { .. } => "The campaign cannot be paid for in its state",
            Error::CampaignNotAcceptingDrivers { .. } => {
                "The campaign is not accepting driver applications"
            }
            Error::CampaignFull { .. } => "The campaign has no open driver slots",
            Error::AssignmentNotApproved { .. } => "The driver's assignment is not approved",
            Error::InstallmentProofAlreadyApproved { .. } => {
                "The installment proof is already approved and cannot be resubmitted"
            }
            Error::InstallmentProofNotApproved { .. } => {
                "The installment proof must be approved first"
            }
            Error::WeeklyProofAlreadyApproved { .. } => {
                "The weekly proof is already approved and cannot be replaced"
            }
            Error::WeeklyProofsOutstanding { .. } => {
                "Some weekly proofs of the campaign are not approved yet"
            }
            Error::PaymentNotSuccessful { .. } => "The payment was not successful",
            Error::PaymentCreditedToBalance { .. } => {
                "The payment could not fund the campaign and was credited to the account balance"
            }
            Error::InsufficientFunds { .. } => "The account balance is insufficient",
            Error::PaymentGatewayFailed(_) => "The payment gateway could not be reached",
            Error::EvidenceStorageFailed(_) => "The evidence storage could not be reached",
            Error::NotificationFailed(_) => "The notification could not be delivered",
            Error::ExistentialState(_) => "The server detected an invalid state",
            Error::FailedDatabaseCall(_) => {
                "An error occurred when communicating with the database"
            }
            Error::FailedToSerializeToBson(_) => {
                "An error occurred when serializing an object to bson"
            }
            Error::IoError(_) => "An error occurred during an I/O operation",
            Error::InvalidConfiguration(_) => "The server configuration is invalid",
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCategory::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::BusinessRule => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::Dependency => StatusCode::BAD_GATEWAY,
            ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        #[derive(Serialize)]
        struct Dummy<'a> {
            error_code: &'static str,
            error_message: &'static str,
            error_meta: &'a Error,
        }

        HttpResponse::build(self.status_code()).json(&Dummy {
            error_code: self.error_code(),
            error_message: self.error_message(),
            error_meta: self,
        })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        Debug::fmt(self, f)
    }
}

impl From<DatabaseError> for Error {
    fn from(error: DatabaseError) -> Error {
        // write conflicts between concurrent transactions
        if error.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return Error::TransactionConflict;
        }

        Error::FailedDatabaseCall(error)
    }
}

impl From<BsonError> for Error {
    fn from(error: BsonError) -> Error {
        Error::FailedToSerializeToBson(error)
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Error {
        Error::InvalidConfiguration(error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidJson(err) => Some(err),
            Error::InvalidPath(err) => Some(err),
            Error::InvalidForm(err) => Some(err),
            Error::InvalidQuery(err) => Some(err),
            Error::InvalidWebhookPayload(err) => Some(err),
            Error::FailedDatabaseCall(err) => Some(err),
            Error::FailedToSerializeToBson(err) => Some(err),
            Error::IoError(err) => Some(err),
            Error::InvalidConfiguration(err) => Some(err),
            _ => None,
        }
    }
}

fn display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}
