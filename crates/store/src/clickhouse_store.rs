//! ClickHouse-backed store.
//!
//! Event, click model and daily summary tables are owned by ingestion and the
//! click pipeline; only `view_through_results` is created here. It is a
//! `ReplacingMergeTree` ordered by the natural key, so re-inserting a key
//! replaces the older version (by `computed_at`) and all reads use `FINAL`.

use crate::traits::{ClickResultStore, ClickedPlatforms, EventStore, ResultStore, SummaryStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use viewthrough_core::config::ClickHouseConfig;
use viewthrough_core::types::{
    ConvertedOrder, DatePlatformTotals, DateRange, ImpressionRecord, PlatformClickTotals,
    TenantId, ViewThroughResult,
};
use viewthrough_core::{AttributionError, AttributionResult, ClickModel};

/// Maximum visitor ids per click lookup query.
const VISITOR_LOOKUP_CHUNK: usize = 1_000;

/// Separator for flattened (visitor, platform, campaign) keys.
const KEY_SEP: &str = "\u{1f}";

pub struct ClickHouseStore {
    client: clickhouse::Client,
}

impl ClickHouseStore {
    pub async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let mut client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }

        info!(url = %config.url, database = %config.database, "Connecting to ClickHouse");
        Self::ensure_schema(&client).await?;

        Ok(Self { client })
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS view_through_results (
                    tenant_id String,
                    visitor_id String,
                    order_id String,
                    platform LowCardinality(String),
                    campaign_id String,
                    conversion_date Date,
                    order_revenue Float64,
                    view_probability Float64,
                    attributed_revenue Float64,
                    model_version LowCardinality(String),
                    computed_at DateTime64(3)
                ) ENGINE = ReplacingMergeTree(computed_at)
                ORDER BY (tenant_id, visitor_id, order_id, platform, campaign_id)
                PARTITION BY toYYYYMM(conversion_date)",
            )
            .execute()
            .await?;

        info!("ClickHouse schema verified");
        Ok(())
    }
}

fn store_err(e: clickhouse::error::Error) -> AttributionError {
    metrics::counter!("store.clickhouse.errors").increment(1);
    AttributionError::Store(e.to_string())
}

// ClickHouse `Date` travels as UInt16 days since the epoch and
// `DateTime64(3)` as Int64 milliseconds in RowBinary.

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn to_day_number(date: NaiveDate) -> u16 {
    (date - epoch()).num_days().clamp(0, u16::MAX as i64) as u16
}

fn from_day_number(days: u16) -> NaiveDate {
    epoch() + Duration::days(days as i64)
}

fn from_millis(ms: i64) -> AttributionResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AttributionError::Store(format!("timestamp out of range: {ms}")))
}

#[derive(Debug, Row, Deserialize)]
struct TenantRow {
    tenant_id: String,
}

#[derive(Debug, Row, Deserialize)]
struct OrderRow {
    order_id: String,
    visitor_id: String,
    revenue: f64,
    converted_at_ms: i64,
}

#[derive(Debug, Row, Deserialize)]
struct ImpressionRow {
    platform: String,
    campaign_id: String,
    day: u16,
    impressions: u64,
    reach: u64,
}

#[derive(Debug, Row, Deserialize)]
struct ClickedRow {
    visitor_id: String,
    platform: String,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct ResultRow {
    tenant_id: String,
    visitor_id: String,
    order_id: String,
    platform: String,
    campaign_id: String,
    conversion_date: u16,
    order_revenue: f64,
    view_probability: f64,
    attributed_revenue: f64,
    model_version: String,
    computed_at: i64,
}

impl From<&ViewThroughResult> for ResultRow {
    fn from(r: &ViewThroughResult) -> Self {
        Self {
            tenant_id: r.tenant_id.clone(),
            visitor_id: r.visitor_id.clone(),
            order_id: r.order_id.clone(),
            platform: r.platform.clone(),
            campaign_id: r.campaign_id.clone(),
            conversion_date: to_day_number(r.conversion_date),
            order_revenue: r.order_revenue,
            view_probability: r.view_probability,
            attributed_revenue: r.attributed_revenue,
            model_version: r.model_version.clone(),
            computed_at: r.computed_at.timestamp_millis(),
        }
    }
}

impl TryFrom<ResultRow> for ViewThroughResult {
    type Error = AttributionError;

    fn try_from(r: ResultRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tenant_id: r.tenant_id,
            visitor_id: r.visitor_id,
            order_id: r.order_id,
            platform: r.platform,
            campaign_id: r.campaign_id,
            conversion_date: from_day_number(r.conversion_date),
            order_revenue: r.order_revenue,
            view_probability: r.view_probability,
            attributed_revenue: r.attributed_revenue,
            model_version: r.model_version,
            computed_at: from_millis(r.computed_at)?,
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct TotalsRow {
    day: u16,
    platform: String,
    view_conversions: f64,
    view_revenue: f64,
}

#[derive(Debug, Row, Deserialize)]
struct SummaryKeyRow {
    day: u16,
    platform: String,
}

#[derive(Debug, Row, Deserialize)]
struct ClickTotalsRow {
    platform: String,
    conversions: f64,
    revenue: f64,
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn list_tenants(&self) -> AttributionResult<Vec<TenantId>> {
        let rows = self
            .client
            .query("SELECT DISTINCT tenant_id FROM converted_orders ORDER BY tenant_id")
            .fetch_all::<TenantRow>()
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(|r| r.tenant_id).collect())
    }

    async fn converted_orders(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ConvertedOrder>> {
        let rows = self
            .client
            .query(
                "SELECT order_id, visitor_id, revenue,
                        toUnixTimestamp64Milli(converted_at) AS converted_at_ms
                 FROM converted_orders
                 WHERE tenant_id = ?
                   AND toDate(converted_at) BETWEEN toDate(?) AND toDate(?)
                 ORDER BY converted_at, order_id",
            )
            .bind(tenant_id)
            .bind(range.start.to_string())
            .bind(range.end.to_string())
            .fetch_all::<OrderRow>()
            .await
            .map_err(store_err)?;

        rows.into_iter()
            .map(|r| {
                Ok(ConvertedOrder {
                    order_id: r.order_id,
                    visitor_id: r.visitor_id,
                    revenue: r.revenue,
                    converted_at: from_millis(r.converted_at_ms)?,
                })
            })
            .collect()
    }

    async fn impressions(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ImpressionRecord>> {
        let rows = self
            .client
            .query(
                "SELECT platform, campaign_id, toUInt16(event_date) AS day,
                        sum(impressions) AS impressions, sum(reach) AS reach
                 FROM ad_impressions
                 WHERE tenant_id = ?
                   AND event_date BETWEEN toDate(?) AND toDate(?)
                 GROUP BY platform, campaign_id, event_date
                 ORDER BY platform, campaign_id, event_date",
            )
            .bind(tenant_id)
            .bind(range.start.to_string())
            .bind(range.end.to_string())
            .fetch_all::<ImpressionRow>()
            .await
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|r| ImpressionRecord {
                platform: r.platform,
                campaign_id: r.campaign_id,
                date: from_day_number(r.day),
                impressions: r.impressions,
                reach: r.reach,
            })
            .collect())
    }

    async fn clicked_platforms(
        &self,
        tenant_id: &str,
        visitor_ids: &[String],
    ) -> AttributionResult<ClickedPlatforms> {
        let mut clicked = ClickedPlatforms::new();
        for chunk in visitor_ids.chunks(VISITOR_LOOKUP_CHUNK) {
            let rows = self
                .client
                .query(
                    "SELECT DISTINCT visitor_id, platform
                     FROM click_touchpoints
                     WHERE tenant_id = ? AND has(?, visitor_id)",
                )
                .bind(tenant_id)
                .bind(chunk)
                .fetch_all::<ClickedRow>()
                .await
                .map_err(store_err)?;
            for row in rows {
                clicked.entry(row.visitor_id).or_default().insert(row.platform);
            }
        }
        Ok(clicked)
    }
}

#[async_trait]
impl ResultStore for ClickHouseStore {
    async fn upsert_results(&self, rows: &[ViewThroughResult]) -> AttributionResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        // A single insert below max_insert_block_size is applied atomically.
        let mut insert = self
            .client
            .insert::<ResultRow>("view_through_results")
            .map_err(store_err)?;
        for row in rows {
            insert.write(&ResultRow::from(row)).await.map_err(store_err)?;
        }
        insert.end().await.map_err(store_err)?;

        metrics::counter!("store.clickhouse.rows_written").increment(rows.len() as u64);
        debug!(count = rows.len(), "Upserted view-through results");
        Ok(rows.len())
    }

    async fn replace_order_results(
        &self,
        tenant_id: &str,
        order_ids: &[String],
        rows: &[ViewThroughResult],
    ) -> AttributionResult<usize> {
        if order_ids.is_empty() {
            return Ok(0);
        }
        let written = self.upsert_results(rows).await?;

        // Keys just written are kept; every other key of these orders is stale.
        let client = self.client.clone().with_option("mutations_sync", "1");
        if rows.is_empty() {
            client
                .query(
                    "ALTER TABLE view_through_results
                     DELETE WHERE tenant_id = ? AND has(?, order_id)",
                )
                .bind(tenant_id)
                .bind(order_ids)
                .execute()
                .await
                .map_err(store_err)?;
        } else {
            let keep: Vec<String> = rows
                .iter()
                .map(|r| {
                    format!(
                        "{}{KEY_SEP}{}{KEY_SEP}{}",
                        r.visitor_id, r.platform, r.campaign_id
                    )
                })
                .collect();
            client
                .query(
                    "ALTER TABLE view_through_results
                     DELETE WHERE tenant_id = ? AND has(?, order_id)
                       AND NOT has(?, concat(visitor_id, ?, platform, ?, campaign_id))",
                )
                .bind(tenant_id)
                .bind(order_ids)
                .bind(keep)
                .bind(KEY_SEP)
                .bind(KEY_SEP)
                .execute()
                .await
                .map_err(store_err)?;
        }

        debug!(
            tenant_id,
            orders = order_ids.len(),
            written,
            "Replaced view-through results"
        );
        Ok(written)
    }

    async fn results(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<ViewThroughResult>> {
        let rows = self
            .client
            .query(
                "SELECT ?fields FROM view_through_results FINAL
                 WHERE tenant_id = ?
                   AND conversion_date BETWEEN toDate(?) AND toDate(?)
                 ORDER BY tenant_id, visitor_id, order_id, platform, campaign_id",
            )
            .bind(tenant_id)
            .bind(range.start.to_string())
            .bind(range.end.to_string())
            .fetch_all::<ResultRow>()
            .await
            .map_err(store_err)?;

        rows.into_iter().map(ViewThroughResult::try_from).collect()
    }

    async fn view_totals(
        &self,
        tenant_id: &str,
        range: DateRange,
    ) -> AttributionResult<Vec<DatePlatformTotals>> {
        let rows = self
            .client
            .query(
                "SELECT toUInt16(conversion_date) AS day, platform,
                        sum(view_probability) AS view_conversions,
                        sum(attributed_revenue) AS view_revenue
                 FROM view_through_results FINAL
                 WHERE tenant_id = ?
                   AND conversion_date BETWEEN toDate(?) AND toDate(?)
                 GROUP BY conversion_date, platform
                 ORDER BY conversion_date, platform",
            )
            .bind(tenant_id)
            .bind(range.start.to_string())
            .bind(range.end.to_string())
            .fetch_all::<TotalsRow>()
            .await
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|r| DatePlatformTotals {
                date: from_day_number(r.day),
                platform: r.platform,
                view_conversions: r.view_conversions,
                view_revenue: r.view_revenue,
            })
            .collect())
    }
}

#[async_trait]
impl SummaryStore for ClickHouseStore {
    async fn update_view_metrics(
        &self,
        tenant_id: &str,
        range: DateRange,
        totals: &[DatePlatformTotals],
    ) -> AttributionResult<usize> {
        let by_key: HashMap<(u16, &str), &DatePlatformTotals> = totals
            .iter()
            .map(|t| ((to_day_number(t.date), t.platform.as_str()), t))
            .collect();

        // ALTER ... UPDATE does not report affected rows, so resolve which
        // (date, platform) rows exist first and only touch those.
        let existing: Vec<SummaryKeyRow> = self
            .client
            .query(
                "SELECT DISTINCT toUInt16(summary_date) AS day, platform
                 FROM daily_summary
                 WHERE tenant_id = ?
                   AND summary_date BETWEEN toDate(?) AND toDate(?)",
            )
            .bind(tenant_id)
            .bind(range.start.to_string())
            .bind(range.end.to_string())
            .fetch_all::<SummaryKeyRow>()
            .await
            .map_err(store_err)?;

        let client = self.client.clone().with_option("mutations_sync", "1");
        let mut updated = 0;
        for key in &existing {
            let (view_conversions, view_revenue) = by_key
                .get(&(key.day, key.platform.as_str()))
                .map_or((0.0, 0.0), |t| (t.view_conversions, t.view_revenue));
            client
                .query(
                    "ALTER TABLE daily_summary
                     UPDATE view_conversions = ?, view_revenue = ?
                     WHERE tenant_id = ? AND summary_date = toDate(?) AND platform = ?",
                )
                .bind(view_conversions)
                .bind(view_revenue)
                .bind(tenant_id)
                .bind(from_day_number(key.day).to_string())
                .bind(key.platform.as_str())
                .execute()
                .await
                .map_err(store_err)?;
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl ClickResultStore for ClickHouseStore {
    async fn click_totals(
        &self,
        tenant_id: &str,
        range: DateRange,
        model: ClickModel,
    ) -> AttributionResult<Vec<PlatformClickTotals>> {
        let rows = self
            .client
            .query(
                "SELECT platform, sum(credit) AS conversions,
                        sum(attributed_revenue) AS revenue
                 FROM click_attribution
                 WHERE tenant_id = ? AND model = ?
                   AND conversion_date BETWEEN toDate(?) AND toDate(?)
                 GROUP BY platform
                 ORDER BY platform",
            )
            .bind(tenant_id)
            .bind(model.as_str())
            .bind(range.start.to_string())
            .bind(range.end.to_string())
            .fetch_all::<ClickTotalsRow>()
            .await
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|r| PlatformClickTotals {
                platform: r.platform,
                conversions: r.conversions,
                revenue: r.revenue,
            })
            .collect())
    }
}
