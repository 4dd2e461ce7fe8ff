use crate::config::{SweeperConfig, TradeConfig};
use crate::database::Database;
use crate::model::Proposal;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::store::ProposalStore;
use crate::{Result, TradeError};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub failed: usize,
    pub reminded: usize,
}

/// Background task enforcing the time-based transition from persisted
/// deadlines, so expiry survives restarts without per-proposal timers.
pub struct ExpirationSweeper {
    store: Arc<ProposalStore>,
    db: Database,
    notifier: Notifier,
    trade: TradeConfig,
    sweeper: SweeperConfig,
}

impl ExpirationSweeper {
    pub fn new(
        store: Arc<ProposalStore>,
        db: Database,
        notifier: Notifier,
        trade: TradeConfig,
        sweeper: SweeperConfig,
    ) -> Self {
        Self {
            store,
            db,
            notifier,
            trade,
            sweeper,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.sweeper.interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) => {
                        if report.expired > 0 || report.failed > 0 || report.reminded > 0 {
                            tracing::info!(
                                "Sweep finished: {} scanned, {} expired, {} failed, {} reminded",
                                report.scanned,
                                report.expired,
                                report.failed,
                                report.reminded
                            );
                        }
                    }
                    Err(e) => tracing::error!("Sweep run failed: {}", e),
                }
            }
        })
    }

    /// One sweep pass. Each proposal's transition is its own transaction; a
    /// failure is logged and skipped so it never blocks the rest of the batch.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let cutoff = now - Duration::days(self.trade.expiry_days);
        let stale = self.db.stale_pending(cutoff).await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for proposal in stale {
            match self.store.expire(proposal.id).await {
                Ok(_) => report.expired += 1,
                // Lost a race with a manual transition; nothing to do.
                Err(TradeError::InvalidStateTransition { .. }) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Failed to expire proposal {}: {}", proposal.id, e);
                }
            }
        }

        for proposal in self.expiring_soon().await? {
            if proposal.reminded_at.is_some() {
                continue;
            }
            // Mark first so a sink hiccup cannot produce repeat reminders.
            if let Err(e) = self.db.mark_reminded(proposal.id, now).await {
                report.failed += 1;
                tracing::error!("Failed to mark proposal {} reminded: {}", proposal.id, e);
                continue;
            }
            for party in [proposal.proposer_id, proposal.receiver_id] {
                self.notifier.dispatch(
                    party,
                    Notification::new(
                        NotificationKind::ExpiryReminder,
                        proposal.id,
                        "Proposal about to expire",
                        "A pending trade proposal expires soon. Answer it before it closes.",
                    ),
                );
            }
            report.reminded += 1;
        }

        Ok(report)
    }

    /// Pending proposals inside the warning window: past deadline minus the
    /// warning lead, but not yet past the deadline itself.
    pub async fn expiring_soon(&self) -> Result<Vec<Proposal>> {
        let now = Utc::now();
        let deadline = Duration::days(self.trade.expiry_days);
        let older_than = now - (deadline - Duration::hours(self.trade.warning_hours));
        let newer_than = now - deadline;
        self.db.pending_created_between(older_than, newer_than).await
    }
}
