use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub name: String,
    pub start_offset_seconds: f64,
    pub duration_seconds: f64,
}

impl StepTiming {
    pub fn new(name: impl Into<String>, start_offset_seconds: f64, duration_seconds: f64) -> Self {
        Self {
            name: name.into(),
            start_offset_seconds,
            duration_seconds,
        }
    }

    pub fn end_offset_seconds(&self) -> f64 {
        self.start_offset_seconds + self.duration_seconds
    }
}

/// One completed build. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub project_id: String,
    pub build_number: u64,
    pub timestamp: DateTime<Utc>,
    pub total_duration_seconds: f64,
    pub steps: Vec<StepTiming>,
}

impl BuildRecord {
    pub fn summary(&self) -> HistoryEntry {
        HistoryEntry {
            build_number: self.build_number,
            timestamp: self.timestamp,
            total_duration_seconds: self.total_duration_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub build_number: u64,
    pub timestamp: DateTime<Utc>,
    pub total_duration_seconds: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectHistory {
    pub project_id: String,
    pub builds: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlameEntry {
    pub step: String,
    pub target_seconds: f64,
    pub baseline_seconds: f64,
    pub delta_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlameReport {
    pub project_id: String,
    pub build_number: u64,
    pub baseline: String,
    pub baseline_builds: Vec<u64>,
    pub entries: Vec<BlameEntry>,
    pub total_delta_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
}

impl BlameReport {
    pub fn unavailable(
        project_id: &str,
        build_number: u64,
        baseline: String,
        reason: String,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            build_number,
            baseline,
            baseline_builds: vec![],
            entries: vec![],
            total_delta_seconds: 0.0,
            unavailable_reason: Some(reason),
        }
    }

    /// Ranked `(step, delta)` pairs as consumed by the blame panel.
    pub fn ranked_deltas(&self) -> Vec<(&str, f64)> {
        self.entries
            .iter()
            .map(|e| (e.step.as_str(), e.delta_seconds))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrend {
    pub step: String,
    /// `(build_number, duration_seconds)`, oldest build first.
    pub durations: Vec<(u64, f64)>,
    pub avg_duration_seconds: f64,
    pub max_duration_seconds: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrendReport {
    pub project_id: String,
    pub builds_analyzed: usize,
    pub steps: Vec<StepTrend>,
}
