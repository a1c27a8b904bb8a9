//! Status roll-up scenarios across partitions.

use crate::helpers::job_record;
use chrono::Utc;
use pretty_assertions::assert_eq;
use qindex_coverage::{roll_up_jobs, AggregateStatus};
use std::time::Duration;

const STALE: Duration = Duration::from_secs(60);

#[test]
fn idle_when_every_partition_finished() {
    let now = Utc::now();
    let jobs = vec![
        job_record(Some((0, 5)), "reindexing", true, 0, 200, 200, now),
        job_record(Some((1, 5)), "reindexing", true, 0, 200, 200, now),
        job_record(Some((2, 5)), "reindexing", true, 0, 200, 200, now),
        job_record(Some((3, 5)), "reindexing", true, 0, 200, 200, now),
        job_record(Some((4, 5)), "reindexing", true, 0, 200, 200, now),
    ];
    let summary = roll_up_jobs(&jobs, STALE, now);
    assert_eq!(summary.status, AggregateStatus::Idle);
    assert_eq!(summary.processed_count, 1000);
    assert_eq!(summary.total_count, 1000);
    assert_eq!(summary.partitions, 5);
}

#[test]
fn one_live_purge_dominates() {
    let now = Utc::now();
    let jobs = vec![
        job_record(Some((0, 2)), "reindexing", false, 10, 40, 100, now),
        job_record(Some((1, 2)), "purging", false, 10, 40, 100, now),
    ];
    assert_eq!(roll_up_jobs(&jobs, STALE, now).status, AggregateStatus::Purging);
}

#[test]
fn stalled_only_when_nothing_runs() {
    let now = Utc::now();
    let stalled_and_running = vec![
        job_record(Some((0, 2)), "reindexing", false, 600, 10, 100, now),
        job_record(Some((1, 2)), "reindexing", false, 5, 10, 100, now),
    ];
    assert_eq!(
        roll_up_jobs(&stalled_and_running, STALE, now).status,
        AggregateStatus::Reindexing
    );

    let all_stalled = vec![job_record(None, "reindexing", false, 600, 10, 100, now)];
    let summary = roll_up_jobs(&all_stalled, STALE, now);
    assert_eq!(summary.status, AggregateStatus::Stalled);
    assert_eq!(summary.stalled_partitions, 1);
}

#[test]
fn progress_sums_and_clamps() {
    let now = Utc::now();
    // A partition that re-ran oversums; the clamp keeps the aggregate
    // below the declared total.
    let jobs = vec![
        job_record(Some((0, 2)), "reindexing", true, 0, 900, 500, now),
        job_record(Some((1, 2)), "reindexing", false, 5, 100, 500, now),
    ];
    let summary = roll_up_jobs(&jobs, STALE, now);
    assert_eq!(summary.total_count, 1000);
    assert_eq!(summary.processed_count, 1000);
}

#[test]
fn empty_history_is_idle() {
    let summary = roll_up_jobs(&[], STALE, Utc::now());
    assert_eq!(summary.status, AggregateStatus::Idle);
    assert_eq!(summary.partitions, 0);
}
