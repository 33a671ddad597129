//! View-through attribution: estimates which ad platforms a buyer plausibly
//! saw before purchasing, allocates capped revenue credit to them, and merges
//! the result with click-based attribution for reporting.

pub mod allocator;
pub mod estimator;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod summary;
pub mod upsert;

pub use allocator::RevenueAllocator;
pub use estimator::{ImpressionIndex, ViewProbabilityEstimator};
pub use report::ReportService;
pub use scheduler::{AttributionScheduler, SchedulerSummary, TenantOutcome};
pub use service::{TenantRunStats, ViewThroughService};
pub use summary::SummaryMerger;
pub use upsert::ResultUpserter;
