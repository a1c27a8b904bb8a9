//! Shared fixtures for the integration tests.

use chrono::{DateTime, Duration, Utc};
use qindex_coverage::JobRecord;

/// A job ledger row with the given shape.
#[allow(clippy::too_many_arguments)]
pub fn job_record(
    partition: Option<(i32, i32)>,
    status: &str,
    finished: bool,
    heartbeat_age_secs: i64,
    processed: i64,
    total: i64,
    now: DateTime<Utc>,
) -> JobRecord {
    JobRecord {
        entity_type: "example:todo".to_string(),
        organization_id: Some("o1".to_string()),
        tenant_id: Some("t1".to_string()),
        partition_index: partition.map(|(i, _)| i),
        partition_count: partition.map(|(_, c)| c),
        status: status.to_string(),
        started_at: now - Duration::seconds(3600),
        heartbeat_at: now - Duration::seconds(heartbeat_age_secs),
        finished_at: finished.then(|| now - Duration::seconds(1)),
        processed_count: processed,
        total_count: total,
    }
}
