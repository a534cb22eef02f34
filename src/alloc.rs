use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

/// Length of one assessment period: two weeks, inclusive of the start day.
pub const SESSION_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize)]
pub struct AllocError {
    pub code: String,
    pub message: String,
}

impl AllocError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Counter snapshot for one cluster, loaded inside the caller's transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterLoad {
    pub cluster_id: String,
    pub student_count: i64,
    pub set_a: i64,
    pub set_b: i64,
    pub created_seq: i64,
}

pub fn cluster_id_for(branch: &str, batch: &str, index: i64) -> String {
    format!("{}-{}-{}", branch, batch, index)
}

/// Cluster type letter by creation index: 1 -> A, 2 -> B, everything after -> C.
pub fn cluster_type_for(index: i64) -> &'static str {
    match index {
        1 => "A",
        2 => "B",
        _ => "C",
    }
}

/// Least-populated cluster wins; ties go to the earliest created so assignment
/// stays deterministic under equal load.
pub fn pick_cluster(clusters: &[ClusterLoad]) -> Option<&ClusterLoad> {
    clusters
        .iter()
        .min_by_key(|c| (c.student_count, c.created_seq))
}

/// Balanced bipartition step: A whenever it is not ahead of B.
pub fn pick_set(set_a: i64, set_b: i64) -> &'static str {
    if set_a <= set_b {
        "A"
    } else {
        "B"
    }
}

pub fn parse_start_date(raw: &str) -> Result<NaiveDate, AllocError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        AllocError::new(
            "bad_params",
            format!("startDate must be YYYY-MM-DD, got {:?}", raw),
        )
    })
}

/// Which half of each cluster is assessed in the session starting on `start`:
/// even ISO week number -> A, odd -> B. Year edges follow the ISO week-based
/// year, so an early-January date in week 52/53 of the previous ISO year uses
/// that week's parity.
pub fn live_set_for(start: NaiveDate) -> &'static str {
    if start.iso_week().week() % 2 == 0 {
        "A"
    } else {
        "B"
    }
}

pub fn session_end(start: NaiveDate) -> NaiveDate {
    start + Duration::days(SESSION_DAYS - 1)
}

pub fn period_label(start: NaiveDate) -> String {
    format!(
        "{} - {}",
        start.format("%d %b %Y"),
        session_end(start).format("%d %b %Y")
    )
}

/// Rotation-based teacher placement: the teacher at `position` (roster order)
/// gets the cluster at `position % cluster_count` (creation order). Unlike
/// student intake this is not load-based, so every teacher cycles through
/// every cluster across successive sessions.
pub fn rotation_cluster(position: usize, cluster_count: usize) -> usize {
    position % cluster_count
}
