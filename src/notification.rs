//! Outbound notifications to users.
//!
//! Notifications are sent after the state change they describe has been
//! committed, on their own task. A failed delivery never fails the request.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::account::Amount;
use crate::assignment::{AssignmentId, AssignmentStatus};
use crate::campaign::{CampaignId, CampaignStatus};
use crate::config::{GatewayConfig, NotificationConfig, RetryConfig};
use crate::earning::EarningId;
use crate::error::Error;
use crate::proof::{InstallmentProofId, ProofPeriod, ProofStatus, WeeklyProofId, WeeklyProofStatus};
use crate::retry::with_retry;
use crate::user::UserId;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    CampaignSubmitted {
        campaign_id: CampaignId,
    },
    CampaignReviewed {
        campaign_id: CampaignId,
        status: CampaignStatus,
        comment: Option<String>,
    },
    CampaignPaid {
        campaign_id: CampaignId,
    },
    PaymentCreditedToBalance {
        campaign_id: CampaignId,
        amount: Amount,
    },
    CampaignActivated {
        campaign_id: CampaignId,
    },
    CampaignCompleted {
        campaign_id: CampaignId,
    },
    AssignmentDecided {
        assignment_id: AssignmentId,
        campaign_id: CampaignId,
        status: AssignmentStatus,
    },
    AssignmentDueSoon {
        assignment_id: AssignmentId,
        campaign_id: CampaignId,
    },
    AssignmentCompleted {
        assignment_id: AssignmentId,
        campaign_id: CampaignId,
        released: Amount,
    },
    InstallmentProofReviewed {
        installment_proof_id: InstallmentProofId,
        campaign_id: CampaignId,
        status: ProofStatus,
        reason: Option<String>,
    },
    WeeklyProofReviewed {
        weekly_proof_id: WeeklyProofId,
        campaign_id: CampaignId,
        period: ProofPeriod,
        status: WeeklyProofStatus,
        reason: Option<String>,
    },
    PayoutApproved {
        earning_id: EarningId,
        amount: Amount,
    },
    PayoutRejected {
        earning_id: EarningId,
        reason: Option<String>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, event: &NotificationEvent) -> Result<(), Error>;
}

/// Writes notifications to the log only.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: UserId, event: &NotificationEvent) -> Result<(), Error> {
        info!(user_id = %user_id, event = ?event, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    user_id: UserId,
    #[serde(flatten)]
    event: &'a NotificationEvent,
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, gateway: &GatewayConfig) -> Result<WebhookNotifier, Error> {
        let client = Client::builder()
            .timeout(gateway.timeout())
            .build()
            .map_err(|err| Error::NotificationFailed(err.to_string()))?;

        Ok(WebhookNotifier { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[tracing::instrument(skip(self, event))]
    async fn notify(&self, user_id: UserId, event: &NotificationEvent) -> Result<(), Error> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload { user_id, event })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| Error::NotificationFailed(err.to_string()))?;

        Ok(())
    }
}

/// Fire-and-forget dispatch of notifications.
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    retry: RetryConfig,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>, retry: RetryConfig) -> Notifications {
        Notifications { notifier, retry }
    }

    pub fn from_config(
        config: &NotificationConfig,
        gateway: &GatewayConfig,
        retry: RetryConfig,
    ) -> Result<Notifications, Error> {
        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), gateway)?),
            None => Arc::new(LogNotifier),
        };

        Ok(Notifications::new(notifier, retry))
    }

    pub fn send(&self, user_id: UserId, event: NotificationEvent) {
        let notifier = Arc::clone(&self.notifier);
        let retry = self.retry.clone();

        tokio::spawn(async move {
            let result = with_retry(&retry, "notify", || notifier.notify(user_id, &event)).await;
            if let Err(err) = result {
                warn!(user_id = %user_id, error = %err, "failed to deliver notification");
            }
        });
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications").finish_non_exhaustive()
    }
}
