//! Domain types shared by the store, the attribution engine and the API.

use crate::error::{AttributionError, AttributionResult};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Opaque tenant (account owner) identifier. Every read and write is scoped to one.
pub type TenantId = String;

/// Years a caller-supplied range may span. Matches the ClickHouse `Date` type.
pub const MIN_RANGE_YEAR: i32 = 1970;
pub const MAX_RANGE_YEAR: i32 = 2149;

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> AttributionResult<Self> {
        for date in [start, end] {
            if !(MIN_RANGE_YEAR..=MAX_RANGE_YEAR).contains(&date.year()) {
                return Err(AttributionError::Validation(format!(
                    "date {date} is outside {MIN_RANGE_YEAR}..={MAX_RANGE_YEAR}"
                )));
            }
        }
        if start > end {
            return Err(AttributionError::Validation(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days`-long window ending on `now`'s date. The start saturates at
    /// the earliest representable date.
    pub fn trailing(now: DateTime<Utc>, days: i64) -> Self {
        let end = now.date_naive();
        let start = end
            .checked_sub_signed(Duration::days(days))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// A completed purchase inside the computation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedOrder {
    pub order_id: String,
    pub visitor_id: String,
    pub revenue: f64,
    pub converted_at: DateTime<Utc>,
}

/// Impressions for one (platform, campaign, date), as reported by the ad platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpressionRecord {
    pub platform: String,
    pub campaign_id: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub reach: u64,
}

impl ImpressionRecord {
    /// Impressions per person reached.
    pub fn frequency(&self) -> f64 {
        self.impressions as f64 / self.reach.max(1) as f64
    }
}

/// A recorded click on an ad, used only to exclude platforms from view credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickTouchpoint {
    pub visitor_id: String,
    pub platform: String,
    pub clicked_at: DateTime<Utc>,
}

/// Modeled view-through credit for one (visitor, order, platform, campaign).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ViewThroughResult {
    pub tenant_id: TenantId,
    pub visitor_id: String,
    pub order_id: String,
    pub platform: String,
    pub campaign_id: String,
    pub conversion_date: NaiveDate,
    pub order_revenue: f64,
    pub view_probability: f64,
    pub attributed_revenue: f64,
    pub model_version: String,
    pub computed_at: DateTime<Utc>,
}

impl ViewThroughResult {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            tenant_id: self.tenant_id.clone(),
            visitor_id: self.visitor_id.clone(),
            order_id: self.order_id.clone(),
            platform: self.platform.clone(),
            campaign_id: self.campaign_id.clone(),
        }
    }
}

/// Natural key of a [`ViewThroughResult`]; writes with an existing key overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultKey {
    pub tenant_id: TenantId,
    pub visitor_id: String,
    pub order_id: String,
    pub platform: String,
    pub campaign_id: String,
}

/// Per (date, platform) view-through totals folded into the daily summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatePlatformTotals {
    pub date: NaiveDate,
    pub platform: String,
    pub view_conversions: f64,
    pub view_revenue: f64,
}

/// Daily per-platform aggregate owned by the click pipeline. Only the view
/// columns are written here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummaryRow {
    pub tenant_id: TenantId,
    pub date: NaiveDate,
    pub platform: String,
    pub clicks: u64,
    pub click_conversions: f64,
    pub click_revenue: f64,
    pub view_conversions: f64,
    pub view_revenue: f64,
}

/// One touchpoint's credit as stored by the click attribution model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickAttributionRow {
    pub model: crate::model::ClickModel,
    pub platform: String,
    pub order_id: String,
    pub conversion_date: NaiveDate,
    pub credit: f64,
    pub attributed_revenue: f64,
}

/// Click model totals for one platform over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformClickTotals {
    pub platform: String,
    pub conversions: f64,
    pub revenue: f64,
}

/// Impression rollup row returned by the pass-through impressions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ImpressionRollup {
    pub date: NaiveDate,
    pub platform: String,
    pub campaign_id: String,
    pub impressions: u64,
    pub reach: u64,
    pub frequency: f64,
}

/// Round to `decimals` places, half away from zero.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
