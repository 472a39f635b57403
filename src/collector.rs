use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;

use crate::error::{BlameError, Result};
use crate::history::HistoryStore;
use crate::models::{BuildRecord, StepTiming};

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Stored(Arc<BuildRecord>),
    /// The build was delivered before; history was left untouched.
    AlreadyRecorded { project_id: String, build_number: u64 },
}

impl RecordOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored(_))
    }
}

pub struct TimingCollector {
    store: Arc<HistoryStore>,
}

impl TimingCollector {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }

    /// Records a build whose steps ran back to back, in the given order.
    pub fn record<N: Into<String>>(
        &self,
        project_id: &str,
        build_number: u64,
        steps: impl IntoIterator<Item = (N, f64)>,
    ) -> Result<RecordOutcome> {
        let mut offset = 0.0;
        let steps = steps
            .into_iter()
            .map(|(name, duration)| {
                let step = StepTiming::new(name, offset, duration);
                offset += duration.max(0.0);
                step
            })
            .collect();

        self.record_timings(project_id, build_number, Utc::now(), steps)
    }

    /// Records a build from step timings measured elsewhere (offsets included).
    pub fn record_timings(
        &self,
        project_id: &str,
        build_number: u64,
        timestamp: DateTime<Utc>,
        steps: Vec<StepTiming>,
    ) -> Result<RecordOutcome> {
        let record = build_record(project_id, build_number, timestamp, steps)?;

        match self.store.append(record) {
            Ok(stored) => {
                info!(
                    "Recorded build #{build_number} of '{project_id}': {} steps, {:.1}s",
                    stored.steps.len(),
                    stored.total_duration_seconds
                );
                Ok(RecordOutcome::Stored(stored))
            }
            Err(BlameError::DuplicateBuild {
                project_id,
                build_number,
            }) => {
                warn!("Build #{build_number} of '{project_id}' was already recorded, ignoring");
                Ok(RecordOutcome::AlreadyRecorded {
                    project_id,
                    build_number,
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn build_record(
    project_id: &str,
    build_number: u64,
    timestamp: DateTime<Utc>,
    steps: Vec<StepTiming>,
) -> Result<BuildRecord> {
    if project_id.trim().is_empty() {
        return Err(BlameError::InvalidTiming(
            "project id must not be empty".to_string(),
        ));
    }

    if steps.is_empty() {
        return Err(BlameError::InvalidTiming(format!(
            "build #{build_number} of '{project_id}' has no steps"
        )));
    }

    for step in &steps {
        validate_step(step)?;
    }

    let total_duration_seconds = steps
        .iter()
        .map(StepTiming::end_offset_seconds)
        .fold(0.0, f64::max);

    Ok(BuildRecord {
        project_id: project_id.to_string(),
        build_number,
        timestamp,
        total_duration_seconds,
        steps,
    })
}

fn validate_step(step: &StepTiming) -> Result<()> {
    if step.name.trim().is_empty() {
        return Err(BlameError::InvalidTiming(
            "step name must not be empty".to_string(),
        ));
    }

    if !step.duration_seconds.is_finite() || step.duration_seconds < 0.0 {
        return Err(BlameError::InvalidTiming(format!(
            "step '{}' has invalid duration {}",
            step.name, step.duration_seconds
        )));
    }

    if !step.start_offset_seconds.is_finite() || step.start_offset_seconds < 0.0 {
        return Err(BlameError::InvalidTiming(format!(
            "step '{}' has invalid start offset {}",
            step.name, step.start_offset_seconds
        )));
    }

    Ok(())
}
