//! All-tenant batch runner.
//!
//! Runs once a day after the click model's own batch, so click touchpoints for
//! the day are complete before platform exclusion reads them. Every tenant is
//! independent: a failure is captured in that tenant's [`TenantOutcome`] and the
//! run moves on.

use crate::service::{TenantRunStats, ViewThroughService};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use viewthrough_core::config::SchedulerConfig;
use viewthrough_core::types::{DateRange, TenantId};
use viewthrough_core::AttributionResult;

/// Result of one tenant's run.
#[derive(Debug, Clone, Serialize)]
pub struct TenantOutcome {
    pub tenant_id: TenantId,
    pub ok: bool,
    pub error: Option<String>,
    pub stats: TenantRunStats,
}

/// Aggregate of an all-tenant run. Counters include the partial progress of
/// failed tenants, since their committed chunks stay in the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerSummary {
    pub tenants_processed: usize,
    pub tenants_failed: usize,
    pub orders_seen: usize,
    pub orders_processed: usize,
    pub results_written: usize,
    pub summary_rows_updated: usize,
    pub outcomes: Vec<TenantOutcome>,
}

impl SchedulerSummary {
    fn from_outcomes(mut outcomes: Vec<TenantOutcome>) -> Self {
        outcomes.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        let mut totals = TenantRunStats::default();
        for outcome in &outcomes {
            totals += outcome.stats;
        }
        Self {
            tenants_processed: outcomes.len(),
            tenants_failed: outcomes.iter().filter(|o| !o.ok).count(),
            orders_seen: totals.orders_seen,
            orders_processed: totals.orders_processed,
            results_written: totals.results_written,
            summary_rows_updated: totals.summary_rows_updated,
            outcomes,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.tenants_failed > 0
    }
}

pub struct AttributionScheduler {
    service: Arc<ViewThroughService>,
    config: SchedulerConfig,
}

impl AttributionScheduler {
    pub fn new(service: Arc<ViewThroughService>, config: SchedulerConfig) -> Self {
        Self { service, config }
    }

    /// The default trailing window ending at `now`.
    pub fn default_window(&self, now: DateTime<Utc>) -> DateRange {
        DateRange::trailing(now, self.config.window_days)
    }

    /// Worker for a single tenant. Never fails; errors land in the outcome
    /// together with whatever the run committed before failing.
    pub async fn run_tenant(
        service: &ViewThroughService,
        tenant_id: TenantId,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> TenantOutcome {
        let mut stats = TenantRunStats::default();
        match service
            .compute_tracked(&tenant_id, range, now, &mut stats)
            .await
        {
            Ok(()) => TenantOutcome {
                tenant_id,
                ok: true,
                error: None,
                stats,
            },
            Err(e) => {
                error!(
                    tenant_id = %tenant_id,
                    error = %e,
                    results_written = stats.results_written,
                    "View-through computation failed for tenant"
                );
                metrics::counter!("viewthrough.tenant_failures").increment(1);
                TenantOutcome {
                    tenant_id,
                    ok: false,
                    error: Some(e.to_string()),
                    stats,
                }
            }
        }
    }

    /// Run every tenant over `window` (default: trailing window ending at `now`).
    ///
    /// Only a failure to enumerate tenants fails the run as a whole.
    pub async fn run_all(
        &self,
        window: Option<DateRange>,
        now: DateTime<Utc>,
    ) -> AttributionResult<SchedulerSummary> {
        let range = window.unwrap_or_else(|| self.default_window(now));
        let tenants = self.service.stores().events.list_tenants().await?;
        info!(
            tenants = tenants.len(),
            start = %range.start,
            end = %range.end,
            workers = self.config.max_concurrent_tenants,
            "Starting view-through run"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tenants.max(1)));
        let mut tasks = Vec::with_capacity(tenants.len());
        for tenant_id in tenants {
            let service = self.service.clone();
            let permits = permits.clone();
            let worker_id = tenant_id.clone();
            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                Self::run_tenant(&service, worker_id, range, now).await
            });
            tasks.push((tenant_id, handle));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (tenant_id, handle) in tasks {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let reason = abort_reason(e);
                    error!(
                        tenant_id = %tenant_id,
                        error = %reason,
                        "Tenant task aborted"
                    );
                    metrics::counter!("viewthrough.tenant_failures").increment(1);
                    outcomes.push(TenantOutcome {
                        tenant_id,
                        ok: false,
                        error: Some(reason),
                        stats: TenantRunStats::default(),
                    });
                }
            }
        }

        let summary = SchedulerSummary::from_outcomes(outcomes);
        if summary.has_failures() {
            warn!(
                tenants = summary.tenants_processed,
                failed = summary.tenants_failed,
                results_written = summary.results_written,
                "View-through run completed with partial failures"
            );
        } else {
            info!(
                tenants = summary.tenants_processed,
                orders_seen = summary.orders_seen,
                results_written = summary.results_written,
                "View-through run completed"
            );
        }
        Ok(summary)
    }

    /// Run forever, once a day at the configured UTC hour.
    pub async fn run_daily(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.config.run_at_hour_utc);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "View-through scheduler sleeping");
            tokio::time::sleep(wait).await;

            if let Err(e) = self.run_all(None, Utc::now()).await {
                error!(error = %e, "View-through run failed to start");
            }
        }
    }
}

/// Describe why a tenant task ended without an outcome.
fn abort_reason(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("task aborted: {e}");
    }
    match e.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|m| m.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            format!("task panicked: {message}")
        }
        Err(e) => format!("task aborted: {e}"),
    }
}

/// Next instant strictly after `now` at `hour`:00 UTC.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}
