//! Chunked, idempotent persistence of view-through results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};
use viewthrough_core::types::ViewThroughResult;
use viewthrough_core::{AttributionError, AttributionResult};
use viewthrough_store::ResultStore;

/// Whole orders grouped for one store call.
#[derive(Debug, Default)]
struct OrderChunk {
    order_ids: Vec<String>,
    rows: Vec<ViewThroughResult>,
}

/// Writes results in chunks of whole orders. Each chunk is one store call that
/// replaces the complete result set of its orders, so a failure leaves earlier
/// chunks committed and stops the batch.
pub struct ResultUpserter {
    store: Arc<dyn ResultStore>,
    batch_size: usize,
}

impl ResultUpserter {
    pub fn new(store: Arc<dyn ResultStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Replace the stored results of `order_ids` with `rows`, returning how
    /// many rows were written. Listed orders without rows are cleared.
    pub async fn persist(
        &self,
        tenant_id: &str,
        order_ids: &[String],
        rows: &[ViewThroughResult],
    ) -> AttributionResult<usize> {
        let mut written = 0;
        self.persist_counted(tenant_id, order_ids, rows, &mut written)
            .await?;
        Ok(written)
    }

    /// Like [`persist`](Self::persist), but `written` keeps the rows of every
    /// committed chunk even when a later chunk fails.
    pub async fn persist_counted(
        &self,
        tenant_id: &str,
        order_ids: &[String],
        rows: &[ViewThroughResult],
        written: &mut usize,
    ) -> AttributionResult<()> {
        let chunks = self.chunk_orders(order_ids, rows);
        let total_chunks = chunks.len();
        let committed_before = *written;

        for (i, chunk) in chunks.into_iter().enumerate() {
            match self
                .store
                .replace_order_results(tenant_id, &chunk.order_ids, &chunk.rows)
                .await
            {
                Ok(n) => {
                    *written += n;
                    metrics::counter!("viewthrough.results_written").increment(n as u64);
                    debug!(
                        tenant_id,
                        chunk = i + 1,
                        total_chunks,
                        orders = chunk.order_ids.len(),
                        rows = n,
                        "Result chunk committed"
                    );
                }
                Err(e) => {
                    let committed = *written - committed_before;
                    error!(
                        tenant_id,
                        chunk = i + 1,
                        total_chunks,
                        committed,
                        error = %e,
                        "Result chunk failed"
                    );
                    return Err(AttributionError::Store(format!(
                        "chunk {}/{} failed after {} rows committed: {}",
                        i + 1,
                        total_chunks,
                        committed,
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Group rows by order and pack whole orders into chunks of at most
    /// `batch_size` orders and, unless a single order exceeds it,
    /// `batch_size` rows.
    fn chunk_orders(&self, order_ids: &[String], rows: &[ViewThroughResult]) -> Vec<OrderChunk> {
        let mut by_order: HashMap<&str, Vec<&ViewThroughResult>> = HashMap::new();
        for row in rows {
            by_order.entry(row.order_id.as_str()).or_default().push(row);
        }

        let listed = order_ids.iter().map(String::as_str);
        let unlisted = rows.iter().map(|r| r.order_id.as_str());

        let mut chunks = Vec::new();
        let mut current = OrderChunk::default();
        let mut seen = HashSet::new();
        for order_id in listed.chain(unlisted) {
            if !seen.insert(order_id) {
                continue;
            }
            let order_rows = by_order.remove(order_id).unwrap_or_default();
            let full = current.order_ids.len() >= self.batch_size
                || current.rows.len() + order_rows.len() > self.batch_size;
            if full && !current.order_ids.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.order_ids.push(order_id.to_string());
            current.rows.extend(order_rows.into_iter().cloned());
        }
        if !current.order_ids.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use viewthrough_core::types::DateRange;
    use viewthrough_store::InMemoryStore;

    /// Delegates to an in-memory store but fails the Nth write call.
    struct FlakyStore {
        inner: InMemoryStore,
        fail_on_call: usize,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn failing_on(fail_on_call: usize) -> Self {
            Self {
                inner: InMemoryStore::new(),
                fail_on_call,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn upsert_results(&self, rows: &[ViewThroughResult]) -> AttributionResult<usize> {
            self.inner.upsert_results(rows).await
        }

        async fn replace_order_results(
            &self,
            tenant_id: &str,
            order_ids: &[String],
            rows: &[ViewThroughResult],
        ) -> AttributionResult<usize> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on_call {
                return Err(AttributionError::Store("connection reset".to_string()));
            }
            self.inner
                .replace_order_results(tenant_id, order_ids, rows)
                .await
        }

        async fn results(
            &self,
            tenant_id: &str,
            range: DateRange,
        ) -> AttributionResult<Vec<ViewThroughResult>> {
            self.inner.results(tenant_id, range).await
        }
    }

    fn row(order_id: &str, platform: &str) -> ViewThroughResult {
        ViewThroughResult {
            tenant_id: "t1".to_string(),
            visitor_id: format!("v-{order_id}"),
            order_id: order_id.to_string(),
            platform: platform.to_string(),
            campaign_id: "c1".to_string(),
            conversion_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            order_revenue: 10.0,
            view_probability: 0.1,
            attributed_revenue: 1.0,
            model_version: "vt-1".to_string(),
            computed_at: Utc.with_ymd_and_hms(2024, 1, 16, 4, 0, 0).unwrap(),
        }
    }

    fn rows(count: usize) -> (Vec<String>, Vec<ViewThroughResult>) {
        let rows: Vec<ViewThroughResult> = (0..count)
            .map(|i| row(&format!("o{i:03}"), "meta"))
            .collect();
        let ids = rows.iter().map(|r| r.order_id.clone()).collect();
        (ids, rows)
    }

    #[tokio::test]
    async fn test_persist_in_chunks() {
        let store = Arc::new(FlakyStore::failing_on(usize::MAX));
        let upserter = ResultUpserter::new(store.clone(), 4);
        let (ids, rows) = rows(10);

        let written = upserter.persist("t1", &ids, &rows).await.unwrap();

        assert_eq!(written, 10);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.all_results("t1").len(), 10);
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_earlier_chunks() {
        let store = Arc::new(FlakyStore::failing_on(2));
        let upserter = ResultUpserter::new(store.clone(), 4);
        let (ids, rows) = rows(10);

        let mut written = 0;
        let err = upserter
            .persist_counted("t1", &ids, &rows, &mut written)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("chunk 2/3"));
        assert_eq!(written, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.all_results("t1").len(), 4);
    }

    #[tokio::test]
    async fn test_orders_never_split_across_chunks() {
        let store = Arc::new(FlakyStore::failing_on(usize::MAX));
        let upserter = ResultUpserter::new(store.clone(), 2);
        let ids = vec!["o1".to_string(), "o2".to_string()];
        let rows = vec![
            row("o1", "meta"),
            row("o1", "tiktok"),
            row("o1", "google"),
            row("o2", "meta"),
        ];

        let written = upserter.persist("t1", &ids, &rows).await.unwrap();

        assert_eq!(written, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listed_order_without_rows_is_cleared() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_results(&[row("o1", "meta"), row("o1", "tiktok"), row("o2", "meta")])
            .await
            .unwrap();
        let upserter = ResultUpserter::new(store.clone(), 10);

        let ids = vec!["o1".to_string(), "o2".to_string()];
        let written = upserter
            .persist("t1", &ids, &[row("o1", "tiktok")])
            .await
            .unwrap();

        assert_eq!(written, 1);
        let kept: Vec<(String, String)> = store
            .all_results("t1")
            .into_iter()
            .map(|r| (r.order_id, r.platform))
            .collect();
        assert_eq!(kept, vec![("o1".to_string(), "tiktok".to_string())]);
    }

    #[tokio::test]
    async fn test_empty_batch_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let upserter = ResultUpserter::new(store, 0);
        assert_eq!(upserter.batch_size(), 1);
        assert_eq!(upserter.persist("t1", &[], &[]).await.unwrap(), 0);
    }
}
