//! View probability estimation.
//!
//! Impressions are only known in aggregate per (platform, campaign, day), so
//! whether a buyer actually saw an ad is inferred from how saturated the
//! campaign was (frequency), how large it was relative to everything else
//! running (reach), how recently it ran (exponential decay) and a per-platform
//! prior (base rate).

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use viewthrough_core::config::ModelConfig;
use viewthrough_core::types::{ConvertedOrder, ImpressionRecord};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// A tenant's impression history grouped by platform then campaign, each
/// campaign's records sorted by date. Ordered maps keep platform and campaign
/// iteration lexicographic, which fixes allocation order across runs.
#[derive(Debug, Default)]
pub struct ImpressionIndex {
    by_platform: BTreeMap<String, BTreeMap<String, Vec<ImpressionRecord>>>,
}

impl ImpressionIndex {
    pub fn new(records: impl IntoIterator<Item = ImpressionRecord>) -> Self {
        let mut by_platform: BTreeMap<String, BTreeMap<String, Vec<ImpressionRecord>>> =
            BTreeMap::new();
        for record in records {
            by_platform
                .entry(record.platform.clone())
                .or_default()
                .entry(record.campaign_id.clone())
                .or_default()
                .push(record);
        }
        for campaigns in by_platform.values_mut() {
            for records in campaigns.values_mut() {
                records.sort_by_key(|r| r.date);
            }
        }
        Self { by_platform }
    }

    pub fn is_empty(&self) -> bool {
        self.by_platform.is_empty()
    }

    /// Largest single-record reach across all platforms inside the window.
    fn max_reach(&self, start: NaiveDate, end: NaiveDate) -> u64 {
        self.by_platform
            .values()
            .flat_map(|campaigns| campaigns.values())
            .flat_map(|records| in_window(records, start, end))
            .map(|r| r.reach)
            .max()
            .unwrap_or(0)
    }
}

fn in_window(
    records: &[ImpressionRecord],
    start: NaiveDate,
    end: NaiveDate,
) -> &[ImpressionRecord] {
    let lo = records.partition_point(|r| r.date < start);
    let hi = records.partition_point(|r| r.date <= end);
    &records[lo..hi.max(lo)]
}

/// Days between the start of `date` and `at`, never negative.
fn days_since(date: NaiveDate, at: DateTime<Utc>) -> f64 {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    ((at - start).num_seconds() as f64 / SECONDS_PER_DAY).max(0.0)
}

/// Best-scoring campaign for one platform and one order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformEstimate {
    pub platform: String,
    pub campaign_id: String,
    pub probability: f64,
}

pub struct ViewProbabilityEstimator {
    model: ModelConfig,
}

impl ViewProbabilityEstimator {
    pub fn new(model: ModelConfig) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Estimate view probabilities for `order`.
    ///
    /// Returns at most one entry per platform, sorted by platform name.
    /// Platforms in `clicked`, platforms without in-window impressions and
    /// platforms whose best probability falls below the configured minimum
    /// are omitted. Orders without positive revenue yield nothing.
    pub fn estimate(
        &self,
        index: &ImpressionIndex,
        order: &ConvertedOrder,
        clicked: Option<&BTreeSet<String>>,
    ) -> Vec<PlatformEstimate> {
        if order.revenue <= 0.0 {
            return Vec::new();
        }

        let end = order.converted_at.date_naive();
        let start = order
            .converted_at
            .checked_sub_signed(Duration::days(self.model.lookback_days))
            .map_or(NaiveDate::MIN, |t| t.date_naive());
        let global_max_reach = index.max_reach(start, end).max(1) as f64;

        let mut estimates = Vec::new();
        for (platform, campaigns) in &index.by_platform {
            if clicked.is_some_and(|set| set.contains(platform)) {
                continue;
            }
            let base_rate = self.model.base_rate(platform);

            let mut best: Option<(&str, f64)> = None;
            for (campaign_id, records) in campaigns {
                let Some(probability) = self.campaign_probability(
                    in_window(records, start, end),
                    order.converted_at,
                    global_max_reach,
                    base_rate,
                ) else {
                    continue;
                };
                // Strict comparison: on a tie the lexicographically first campaign stays.
                if best.map_or(true, |(_, current)| probability > current) {
                    best = Some((campaign_id, probability));
                }
            }

            if let Some((campaign_id, probability)) = best {
                if probability >= self.model.min_view_probability {
                    estimates.push(PlatformEstimate {
                        platform: platform.clone(),
                        campaign_id: campaign_id.to_string(),
                        probability,
                    });
                }
            }
        }
        estimates
    }

    fn campaign_probability(
        &self,
        records: &[ImpressionRecord],
        converted_at: DateTime<Utc>,
        global_max_reach: f64,
        base_rate: f64,
    ) -> Option<f64> {
        let mut weighted_impressions = 0.0;
        let mut weighted_decay_sum = 0.0;
        let mut reach_total: u64 = 0;
        let mut max_reach: u64 = 0;

        for record in records {
            let impressions = record.impressions as f64;
            let decay = (-days_since(record.date, converted_at) / self.model.decay_days).exp();
            weighted_impressions += impressions;
            weighted_decay_sum += impressions * decay;
            reach_total += record.reach;
            max_reach = max_reach.max(record.reach);
        }

        if weighted_impressions <= 0.0 {
            return None;
        }

        let avg_frequency = weighted_impressions / reach_total.max(1) as f64;
        let frequency_factor = (avg_frequency / self.model.frequency_saturation).min(1.0);
        let reach_factor = max_reach as f64 / global_max_reach;
        let avg_time_decay = weighted_decay_sum / weighted_impressions;

        let probability = frequency_factor * reach_factor * avg_time_decay * base_rate;
        Some(probability.clamp(0.0, self.model.max_view_probability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn record(
        platform: &str,
        campaign: &str,
        date: NaiveDate,
        impressions: u64,
        reach: u64,
    ) -> ImpressionRecord {
        ImpressionRecord {
            platform: platform.to_string(),
            campaign_id: campaign.to_string(),
            date,
            impressions,
            reach,
        }
    }

    fn order_at(revenue: f64, at: DateTime<Utc>) -> ConvertedOrder {
        ConvertedOrder {
            order_id: "o1".to_string(),
            visitor_id: "v1".to_string(),
            revenue,
            converted_at: at,
        }
    }

    fn midnight(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_saturated_same_day_campaign_gets_base_rate() {
        let index = ImpressionIndex::new(vec![record("meta", "c1", day(20), 100, 10)]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);

        assert_eq!(estimates.len(), 1);
        assert_eq!(estimates[0].campaign_id, "c1");
        assert!((estimates[0].probability - 0.15).abs() < 1e-12);
    }

    #[test]
    fn test_decay_frequency_and_reach_factors() {
        // Campaign "small" has half the reach of the largest record in the window
        // and runs at frequency 5, seven days before conversion.
        let index = ImpressionIndex::new(vec![
            record("google", "small", day(13), 250, 50),
            record("tiktok", "big", day(20), 1_000, 100),
        ]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        let google = estimates.iter().find(|e| e.platform == "google").unwrap();

        let expected = 0.5 * 0.5 * (-7.0f64 / 14.0).exp() * 0.08;
        assert!((google.probability - expected).abs() < 1e-12);
    }

    #[test]
    fn test_clicked_platform_is_excluded() {
        let index = ImpressionIndex::new(vec![
            record("meta", "c1", day(18), 100, 10),
            record("tiktok", "c2", day(18), 100, 10),
        ]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());
        let clicked = BTreeSet::from(["meta".to_string()]);

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), Some(&clicked));

        assert_eq!(estimates.len(), 1);
        assert_eq!(estimates[0].platform, "tiktok");
    }

    #[test]
    fn test_probability_is_capped() {
        let model = ModelConfig {
            base_rates: HashMap::from([("meta".to_string(), 5.0)]),
            ..ModelConfig::default()
        };
        let index = ImpressionIndex::new(vec![record("meta", "c1", day(20), 100, 10)]);
        let estimator = ViewProbabilityEstimator::new(model);

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        assert_eq!(estimates[0].probability, 0.30);
    }

    #[test]
    fn test_only_best_campaign_per_platform() {
        let index = ImpressionIndex::new(vec![
            record("meta", "weak", day(19), 20, 10),
            record("meta", "strong", day(19), 100, 10),
        ]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        assert_eq!(estimates.len(), 1);
        assert_eq!(estimates[0].campaign_id, "strong");
    }

    #[test]
    fn test_equal_campaigns_resolve_to_first_by_name() {
        let index = ImpressionIndex::new(vec![
            record("meta", "c-b", day(19), 100, 10),
            record("meta", "c-a", day(19), 100, 10),
        ]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        assert_eq!(estimates[0].campaign_id, "c-a");
    }

    #[test]
    fn test_impressions_outside_lookback_are_ignored() {
        let index = ImpressionIndex::new(vec![
            // 40 days before conversion
            record("meta", "old", NaiveDate::from_ymd_opt(2024, 2, 9).unwrap(), 100, 10),
            // after conversion
            record("google", "future", day(25), 100, 10),
        ]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        assert!(estimates.is_empty());
    }

    #[test]
    fn test_negligible_probability_is_dropped() {
        // Frequency 0.01 -> factor 0.001, times base rate 0.05.
        let index = ImpressionIndex::new(vec![record("unknown", "c1", day(20), 1, 100)]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        assert!(estimates.is_empty());
    }

    #[test]
    fn test_zero_revenue_order_is_skipped() {
        let index = ImpressionIndex::new(vec![record("meta", "c1", day(20), 100, 10)]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        assert!(estimator.estimate(&index, &order_at(0.0, midnight(20)), None).is_empty());
    }

    #[test]
    fn test_lookback_saturates_at_calendar_start() {
        let index = ImpressionIndex::new(vec![record("meta", "c1", NaiveDate::MIN, 100, 10)]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, DateTime::<Utc>::MIN_UTC), None);

        assert_eq!(estimates.len(), 1);
        assert_eq!(estimates[0].platform, "meta");
    }

    #[test]
    fn test_zero_reach_everywhere_does_not_divide_by_zero() {
        let index = ImpressionIndex::new(vec![record("meta", "c1", day(20), 100, 0)]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let estimates = estimator.estimate(&index, &order_at(50.0, midnight(20)), None);
        // reach factor is 0 / max(0, 1) = 0, so nothing survives the threshold
        assert!(estimates.is_empty());
    }

    #[test]
    fn test_platforms_emitted_in_name_order() {
        let index = ImpressionIndex::new(vec![
            record("tiktok", "c1", day(19), 100, 10),
            record("google", "c2", day(19), 100, 10),
            record("meta", "c3", day(19), 100, 10),
        ]);
        let estimator = ViewProbabilityEstimator::new(ModelConfig::default());

        let platforms: Vec<String> = estimator
            .estimate(&index, &order_at(50.0, midnight(20)), None)
            .into_iter()
            .map(|e| e.platform)
            .collect();
        assert_eq!(platforms, vec!["google", "meta", "tiktok"]);
    }
}
