//! Time-driven campaign and assignment transitions.
//!
//! The sweeper runs on a fixed interval next to the HTTP server. Each pass
//! activates paid campaigns whose start date has come, warns drivers whose
//! campaign is about to end, and completes campaigns that are over. A failure
//! on one record is logged and the pass carries on with the next one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::assignment::manager as assignments;
use crate::assignment::AssignmentStatus;
use crate::campaign::manager as campaigns;
use crate::campaign::{Campaign, CampaignId, CampaignStatus};
use crate::config::LifecycleConfig;
use crate::database::Database;
use crate::error::Error;
use crate::notification::Notifications;

/// What a single pass changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    pub activated: usize,
    pub due_soon: usize,
    pub completed: usize,
}

pub struct LifecycleSweeper {
    db: Arc<dyn Database>,
    notifications: Arc<Notifications>,
    interval: Duration,
    due_soon_window: chrono::Duration,
}

impl LifecycleSweeper {
    pub fn new(
        db: Arc<dyn Database>,
        notifications: Arc<Notifications>,
        config: &LifecycleConfig,
    ) -> LifecycleSweeper {
        LifecycleSweeper {
            db,
            notifications,
            interval: config.sweep_interval(),
            due_soon_window: config.due_soon_window(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                match self.sweep(Utc::now()).await {
                    Ok(report) if report != SweepReport::default() => {
                        info!(
                            activated = report.activated,
                            due_soon = report.due_soon,
                            completed = report.completed,
                            "lifecycle sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "lifecycle sweep failed"),
                }
            }
        })
    }

    /// Runs one pass as of `now`. Only failing to list the candidates fails
    /// the pass.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, Error> {
        let db = self.db.as_ref();
        let notifications = self.notifications.as_ref();
        let mut report = SweepReport::default();

        let approved = db
            .campaigns()
            .fetch_campaigns_by_status(&[CampaignStatus::Approved])
            .await?;
        for campaign in approved.iter().filter(|c| c.is_accepting_drivers()) {
            match campaigns::transition_to_active(db, notifications, campaign.id, now).await {
                Ok(Some(_)) => report.activated += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(campaign_id = %campaign.id, error = %err, "failed to activate campaign")
                }
            }
        }

        report.due_soon = self.mark_due_soon(now).await?;

        let active = db
            .campaigns()
            .fetch_campaigns_by_status(&[CampaignStatus::Active])
            .await?;
        for campaign in &active {
            match campaigns::transition_to_completed(db, notifications, campaign.id, now).await {
                Ok(Some(_)) => report.completed += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(campaign_id = %campaign.id, error = %err, "failed to complete campaign")
                }
            }
        }

        Ok(report)
    }

    async fn mark_due_soon(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let db = self.db.as_ref();
        let approved = db
            .assignments()
            .fetch_assignments_by_status(&[AssignmentStatus::Approved])
            .await?;

        let mut campaigns: HashMap<CampaignId, Option<Campaign>> = HashMap::new();
        let mut marked = 0;
        for assignment in approved {
            let campaign = match campaigns.get(&assignment.campaign_id) {
                Some(campaign) => campaign.clone(),
                None => {
                    let campaign = db
                        .campaigns()
                        .fetch_campaign_by_id(assignment.campaign_id)
                        .await?;
                    campaigns.insert(assignment.campaign_id, campaign.clone());
                    campaign
                }
            };

            let end_date = match campaign.as_ref().and_then(|c| c.terms.as_ref()) {
                Some(terms) => terms.end_date,
                None => {
                    debug!(assignment_id = %assignment.id, "assignment without campaign terms");
                    continue;
                }
            };
            if end_date - self.due_soon_window > now {
                continue;
            }

            match assignments::mark_due_soon(db, self.notifications.as_ref(), assignment.id, now)
                .await
            {
                Ok(_) => marked += 1,
                Err(err) => {
                    warn!(assignment_id = %assignment.id, error = %err, "failed to mark assignment due soon")
                }
            }
        }

        Ok(marked)
    }
}

impl std::fmt::Debug for LifecycleSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleSweeper")
            .field("interval", &self.interval)
            .field("due_soon_window", &self.due_soon_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::account::manager::get_account;
    use crate::database::MemoryDatabase;
    use crate::testing::{self, DURATION_DAYS};
    use crate::user::UserId;

    fn sweeper(db: Arc<MemoryDatabase>) -> LifecycleSweeper {
        LifecycleSweeper::new(
            db,
            Arc::new(testing::notifications()),
            &LifecycleConfig::default(),
        )
    }

    #[tokio::test]
    async fn activates_and_completes_a_campaign_without_drivers() {
        let db = Arc::new(MemoryDatabase::new());
        let owner_id = UserId::new();
        let start = Utc::now() + ChronoDuration::days(1);
        let campaign =
            testing::funded_campaign(db.as_ref(), owner_id, testing::details(start)).await;
        let sweeper = sweeper(Arc::clone(&db));

        // nothing to do before the start date
        assert_eq!(sweeper.sweep(Utc::now()).await.unwrap(), SweepReport::default());

        let report = sweeper
            .sweep(start + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.activated, 1);
        assert_eq!(report.completed, 0);

        let end = start + ChronoDuration::days(i64::from(DURATION_DAYS));
        let report = sweeper.sweep(end + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(report.completed, 1);

        let campaign = db
            .campaigns()
            .fetch_campaign_by_id(campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        let account = get_account(db.as_ref(), owner_id).await.unwrap();
        assert_eq!(account.pending, 0);
        assert_eq!(account.balance, 0);
    }

    #[tokio::test]
    async fn marks_drivers_due_soon_near_the_end() {
        let db = Arc::new(MemoryDatabase::new());
        let start = Utc::now() + ChronoDuration::days(1);
        let campaign =
            testing::funded_campaign(db.as_ref(), UserId::new(), testing::details(start)).await;
        let assignment = testing::approved_assignment(db.as_ref(), &campaign, UserId::new()).await;
        let sweeper = sweeper(Arc::clone(&db));

        let report = sweeper
            .sweep(start + ChronoDuration::days(2))
            .await
            .unwrap();
        assert_eq!(
            report,
            SweepReport {
                activated: 1,
                due_soon: 0,
                completed: 0,
            }
        );

        let report = sweeper
            .sweep(start + ChronoDuration::days(22))
            .await
            .unwrap();
        assert_eq!(report.due_soon, 1);

        let assignment = db
            .assignments()
            .fetch_assignment_by_id(assignment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.status, AssignmentStatus::DueSoon);

        // the driver has not completed, so the campaign stays active
        let report = sweeper
            .sweep(start + ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
