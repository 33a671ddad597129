//! Folds view-through totals into the daily summary maintained by the click
//! pipeline.

use std::sync::Arc;
use tracing::debug;
use viewthrough_core::types::DateRange;
use viewthrough_core::AttributionResult;
use viewthrough_store::{ResultStore, SummaryStore};

pub struct SummaryMerger {
    results: Arc<dyn ResultStore>,
    summaries: Arc<dyn SummaryStore>,
}

impl SummaryMerger {
    pub fn new(results: Arc<dyn ResultStore>, summaries: Arc<dyn SummaryStore>) -> Self {
        Self { results, summaries }
    }

    /// Recompute per (date, platform) view totals for `range` from the result
    /// store and write them onto existing summary rows. Rows in `range` with
    /// no remaining view credit are reset to zero; missing summary rows are
    /// left missing. Returns the number of rows updated.
    pub async fn merge(&self, tenant_id: &str, range: DateRange) -> AttributionResult<usize> {
        let totals = self.results.view_totals(tenant_id, range).await?;
        let updated = self
            .summaries
            .update_view_metrics(tenant_id, range, &totals)
            .await?;
        debug!(
            tenant_id,
            groups = totals.len(),
            updated,
            "Merged view-through totals into daily summary"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use viewthrough_core::types::{DailySummaryRow, ViewThroughResult};
    use viewthrough_store::InMemoryStore;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn result(
        order: &str,
        platform: &str,
        day: u32,
        probability: f64,
        revenue: f64,
    ) -> ViewThroughResult {
        ViewThroughResult {
            tenant_id: "t1".to_string(),
            visitor_id: "v1".to_string(),
            order_id: order.to_string(),
            platform: platform.to_string(),
            campaign_id: "c1".to_string(),
            conversion_date: date(day),
            order_revenue: 100.0,
            view_probability: probability,
            attributed_revenue: revenue,
            model_version: "vt-1".to_string(),
            computed_at: Utc.with_ymd_and_hms(2024, 7, 20, 4, 0, 0).unwrap(),
        }
    }

    fn summary(platform: &str, day: u32) -> DailySummaryRow {
        DailySummaryRow {
            tenant_id: "t1".to_string(),
            date: date(day),
            platform: platform.to_string(),
            clicks: 40,
            click_conversions: 3.0,
            click_revenue: 150.0,
            view_conversions: 0.0,
            view_revenue: 0.0,
        }
    }

    #[tokio::test]
    async fn test_merge_updates_existing_rows_only() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary_row(summary("meta", 3));
        store
            .upsert_results(&[
                result("o1", "meta", 3, 0.2, 20.0),
                result("o2", "meta", 3, 0.1, 4.5),
                result("o3", "google", 3, 0.05, 2.0),
                result("o4", "meta", 4, 0.1, 1.0),
            ])
            .await
            .unwrap();

        let merger = SummaryMerger::new(store.clone(), store.clone());
        let updated = merger
            .merge("t1", DateRange::new(date(1), date(10)).unwrap())
            .await
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(store.summary_row_count(), 1);
        let row = store.summary_row("t1", date(3), "meta").unwrap();
        assert!((row.view_conversions - 0.3).abs() < 1e-12);
        assert_eq!(row.view_revenue, 24.5);
        assert_eq!(row.click_revenue, 150.0);
    }

    #[tokio::test]
    async fn test_merge_respects_range() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_summary_row(summary("meta", 4));
        store
            .upsert_results(&[result("o4", "meta", 4, 0.1, 1.0)])
            .await
            .unwrap();

        let merger = SummaryMerger::new(store.clone(), store.clone());
        let updated = merger
            .merge("t1", DateRange::new(date(1), date(3)).unwrap())
            .await
            .unwrap();

        assert_eq!(updated, 0);
        assert_eq!(store.summary_row("t1", date(4), "meta").unwrap().view_revenue, 0.0);
    }

    #[tokio::test]
    async fn test_merge_clears_credit_that_no_longer_exists() {
        let store = Arc::new(InMemoryStore::new());
        let mut stale = summary("tiktok", 5);
        stale.view_conversions = 0.2;
        stale.view_revenue = 12.0;
        store.insert_summary_row(stale.clone());
        let mut outside = stale.clone();
        outside.date = date(20);
        store.insert_summary_row(outside);

        let merger = SummaryMerger::new(store.clone(), store.clone());
        let updated = merger
            .merge("t1", DateRange::new(date(1), date(10)).unwrap())
            .await
            .unwrap();

        assert_eq!(updated, 1);
        let cleared = store.summary_row("t1", date(5), "tiktok").unwrap();
        assert_eq!(cleared.view_conversions, 0.0);
        assert_eq!(cleared.view_revenue, 0.0);
        assert_eq!(cleared.click_revenue, 150.0);
        assert_eq!(store.summary_row("t1", date(20), "tiktok").unwrap().view_revenue, 12.0);
    }
}
