//! Read-side reports: view-through only, combined click + view, and the raw
//! impression rollup.

use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;
use viewthrough_core::types::{round_to, DateRange, ImpressionRecord, ImpressionRollup};
use viewthrough_core::{AttributionResult, ClickModel};
use viewthrough_store::Stores;

/// Decimals kept for fractional conversion counts.
const CONVERSION_DECIMALS: i32 = 4;
/// Decimals kept for currency.
const CURRENCY_DECIMALS: i32 = 2;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ViewThroughPlatformRow {
    pub platform: String,
    pub impressions: u64,
    pub view_conversions: f64,
    pub view_revenue: f64,
    pub avg_probability: f64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ViewThroughReport {
    pub range: DateRange,
    pub platforms: Vec<ViewThroughPlatformRow>,
    pub view_revenue: f64,
    pub click_revenue: f64,
    pub combined_revenue: f64,
    /// View revenue as a share of combined revenue, e.g. `"23.4%"`.
    pub view_share: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CombinedPlatformRow {
    pub platform: String,
    pub click_conversions: f64,
    pub click_revenue: f64,
    pub view_conversions: f64,
    pub view_revenue: f64,
    pub total_conversions: f64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct CombinedTotals {
    pub click_conversions: f64,
    pub click_revenue: f64,
    pub view_conversions: f64,
    pub view_revenue: f64,
    pub total_conversions: f64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CombinedReport {
    pub range: DateRange,
    pub model: ClickModel,
    pub platforms: Vec<CombinedPlatformRow>,
    pub totals: CombinedTotals,
}

/// Format `part / whole` as a one-decimal percentage, `"0%"` for an empty whole.
pub fn format_share(part: f64, whole: f64) -> String {
    if whole <= 0.0 {
        return "0%".to_string();
    }
    format!("{:.1}%", part / whole * 100.0)
}

#[derive(Default)]
struct ViewAccumulator {
    impressions: u64,
    view_conversions: f64,
    view_revenue: f64,
    results: u64,
}

#[derive(Default)]
struct CombinedAccumulator {
    click_conversions: f64,
    click_revenue: f64,
    view_conversions: f64,
    view_revenue: f64,
}

pub struct ReportService {
    stores: Stores,
}

impl ReportService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Per-platform view-through numbers plus the view share of total revenue.
    /// Click revenue comes from the default click model.
    pub async fn view_through_report(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<ViewThroughReport> {
        let impressions = self.stores.events.impressions(tenant_id, range).await?;
        let results = self.stores.results.results(tenant_id, range).await?;
        let clicks = self
            .stores
            .clicks
            .click_totals(tenant_id, range, ClickModel::default())
            .await?;

        let mut by_platform: BTreeMap<String, ViewAccumulator> = BTreeMap::new();
        for record in &impressions {
            by_platform
                .entry(record.platform.clone())
                .or_default()
                .impressions += record.impressions;
        }
        for result in &results {
            let acc = by_platform.entry(result.platform.clone()).or_default();
            acc.view_conversions += result.view_probability;
            acc.view_revenue += result.attributed_revenue;
            acc.results += 1;
        }

        let view_revenue_raw: f64 = by_platform.values().map(|a| a.view_revenue).sum();
        let platforms = by_platform
            .into_iter()
            .map(|(platform, acc)| ViewThroughPlatformRow {
                platform,
                impressions: acc.impressions,
                view_conversions: round_to(acc.view_conversions, CONVERSION_DECIMALS),
                view_revenue: round_to(acc.view_revenue, CURRENCY_DECIMALS),
                avg_probability: if acc.results > 0 {
                    round_to(acc.view_conversions / acc.results as f64, CONVERSION_DECIMALS)
                } else {
                    0.0
                },
            })
            .collect();

        let view_revenue = round_to(view_revenue_raw, CURRENCY_DECIMALS);
        let click_revenue = round_to(clicks.iter().map(|c| c.revenue).sum(), CURRENCY_DECIMALS);
        let combined_revenue = round_to(view_revenue + click_revenue, CURRENCY_DECIMALS);

        Ok(ViewThroughReport {
            range,
            platforms,
            view_revenue,
            click_revenue,
            combined_revenue,
            view_share: format_share(view_revenue, combined_revenue),
        })
    }

    /// Click model numbers for `model` merged with view-through numbers per
    /// platform, sorted by total revenue descending.
    pub async fn combined_report(
        &self,
        tenant_id: &str,
        range: DateRange,
        model: ClickModel,
    ) -> AttributionResult<CombinedReport> {
        let clicks = self.stores.clicks.click_totals(tenant_id, range, model).await?;
        let views = self.stores.results.view_totals(tenant_id, range).await?;

        let mut by_platform: BTreeMap<String, CombinedAccumulator> = BTreeMap::new();
        for click in clicks {
            let acc = by_platform.entry(click.platform).or_default();
            acc.click_conversions += click.conversions;
            acc.click_revenue += click.revenue;
        }
        for view in views {
            let acc = by_platform.entry(view.platform).or_default();
            acc.view_conversions += view.view_conversions;
            acc.view_revenue += view.view_revenue;
        }

        let mut platforms: Vec<CombinedPlatformRow> = by_platform
            .into_iter()
            .map(|(platform, acc)| {
                let click_conversions = round_to(acc.click_conversions, CONVERSION_DECIMALS);
                let click_revenue = round_to(acc.click_revenue, CURRENCY_DECIMALS);
                let view_conversions = round_to(acc.view_conversions, CONVERSION_DECIMALS);
                let view_revenue = round_to(acc.view_revenue, CURRENCY_DECIMALS);
                CombinedPlatformRow {
                    platform,
                    click_conversions,
                    click_revenue,
                    view_conversions,
                    view_revenue,
                    total_conversions: round_to(
                        click_conversions + view_conversions,
                        CONVERSION_DECIMALS,
                    ),
                    total_revenue: round_to(click_revenue + view_revenue, CURRENCY_DECIMALS),
                }
            })
            .collect();
        platforms.sort_by(|a, b| {
            b.total_revenue
                .total_cmp(&a.total_revenue)
                .then_with(|| a.platform.cmp(&b.platform))
        });

        let mut totals = CombinedTotals::default();
        for row in &platforms {
            totals.click_conversions += row.click_conversions;
            totals.click_revenue += row.click_revenue;
            totals.view_conversions += row.view_conversions;
            totals.view_revenue += row.view_revenue;
            totals.total_conversions += row.total_conversions;
            totals.total_revenue += row.total_revenue;
        }
        totals.click_conversions = round_to(totals.click_conversions, CONVERSION_DECIMALS);
        totals.view_conversions = round_to(totals.view_conversions, CONVERSION_DECIMALS);
        totals.total_conversions = round_to(totals.total_conversions, CONVERSION_DECIMALS);
        totals.click_revenue = round_to(totals.click_revenue, CURRENCY_DECIMALS);
        totals.view_revenue = round_to(totals.view_revenue, CURRENCY_DECIMALS);
        totals.total_revenue = round_to(totals.total_revenue, CURRENCY_DECIMALS);

        Ok(CombinedReport {
            range,
            model,
            platforms,
            totals,
        })
    }

    /// Impressions summed per (date, platform, campaign), optionally for one
    /// platform (case-insensitive).
    pub async fn impression_rollup(
        &self,
        tenant_id: &str,
        range: DateRange,
        platform: Option<&str>,
    ) -> AttributionResult<Vec<ImpressionRollup>> {
        let records = self.stores.events.impressions(tenant_id, range).await?;

        let mut grouped: BTreeMap<(chrono::NaiveDate, String, String), ImpressionRecord> =
            BTreeMap::new();
        for record in records
            .into_iter()
            .filter(|r| platform.map_or(true, |p| r.platform.eq_ignore_ascii_case(p)))
        {
            let key = (record.date, record.platform.clone(), record.campaign_id.clone());
            grouped
                .entry(key)
                .and_modify(|sum| {
                    sum.impressions += record.impressions;
                    sum.reach += record.reach;
                })
                .or_insert(record);
        }

        Ok(grouped
            .into_values()
            .map(|sum| ImpressionRollup {
                frequency: round_to(sum.frequency(), CONVERSION_DECIMALS),
                date: sum.date,
                platform: sum.platform,
                campaign_id: sum.campaign_id,
                impressions: sum.impressions,
                reach: sum.reach,
            })
            .collect())
    }
}
