mod baseline;

pub use baseline::{step_durations, BaselineStrategy};

use indexmap::IndexMap;
use log::{debug, info, warn};
use std::sync::Arc;

use crate::error::{BlameError, Result};
use crate::history::HistoryStore;
use crate::models::{BlameEntry, BlameReport, StepTrend, TrendReport};

pub struct BlameAggregator {
    store: Arc<HistoryStore>,
}

impl BlameAggregator {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }

    /// Attributes the timing change of one build, step by step, against a baseline.
    ///
    /// Entries are ranked by absolute delta, largest first, ties by step name.
    pub fn compute_blame(
        &self,
        project_id: &str,
        build_number: u64,
        strategy: BaselineStrategy,
    ) -> Result<BlameReport> {
        let required = strategy.required_builds();
        if required == 0 {
            return Err(BlameError::Config(
                "Rolling average window must be at least 1".to_string(),
            ));
        }

        let target = self
            .store
            .get(project_id, build_number)
            .ok_or_else(|| BlameError::BuildNotFound {
                project_id: project_id.to_string(),
                build_number,
            })?;

        let prior = self.store.builds_before(project_id, build_number, required);
        if prior.len() < required {
            return Err(BlameError::InsufficientHistory {
                project_id: project_id.to_string(),
                required,
                available: prior.len(),
            });
        }

        debug!(
            "Comparing build #{build_number} of '{project_id}' against {} build(s) ({strategy})",
            prior.len()
        );

        let entries = rank_deltas(&step_durations(&target), strategy.baseline(&prior));
        let total_delta_seconds: f64 = entries.iter().map(|e| e.delta_seconds).sum();

        info!(
            "Blame for build #{build_number} of '{project_id}': {} steps, {total_delta_seconds:+.1}s overall",
            entries.len()
        );

        Ok(BlameReport {
            project_id: project_id.to_string(),
            build_number,
            baseline: strategy.to_string(),
            baseline_builds: prior.iter().map(|r| r.build_number).collect(),
            entries,
            total_delta_seconds,
            unavailable_reason: None,
        })
    }

    /// Like [`Self::compute_blame`], but a missing build or short history yields an
    /// empty report carrying the reason instead of an error.
    pub fn blame_or_placeholder(
        &self,
        project_id: &str,
        build_number: u64,
        strategy: BaselineStrategy,
    ) -> Result<BlameReport> {
        match self.compute_blame(project_id, build_number, strategy) {
            Err(e) if e.is_unmet_precondition() => {
                warn!("No blame report for build #{build_number} of '{project_id}': {e}");
                Ok(BlameReport::unavailable(
                    project_id,
                    build_number,
                    strategy.to_string(),
                    e.to_string(),
                ))
            }
            result => result,
        }
    }

    /// Per-step durations across the last `limit` builds, oldest build first.
    pub fn trend(&self, project_id: &str, limit: usize) -> TrendReport {
        let history = self.store.fetch_history(project_id, limit);

        let series = history
            .iter()
            .rev()
            .flat_map(|record| {
                step_durations(record)
                    .into_iter()
                    .map(move |(step, duration)| (step, record.build_number, duration))
            })
            .fold(
                IndexMap::<String, Vec<(u64, f64)>>::new(),
                |mut series, (step, build_number, duration)| {
                    series.entry(step).or_default().push((build_number, duration));
                    series
                },
            );

        let steps = series
            .into_iter()
            .map(|(step, durations)| {
                #[allow(clippy::cast_precision_loss)]
                let avg_duration_seconds =
                    durations.iter().map(|d| d.1).sum::<f64>() / durations.len() as f64;
                let max_duration_seconds = durations.iter().map(|d| d.1).fold(0.0, f64::max);

                StepTrend {
                    step,
                    durations,
                    avg_duration_seconds,
                    max_duration_seconds,
                }
            })
            .collect();

        TrendReport {
            project_id: project_id.to_string(),
            builds_analyzed: history.len(),
            steps,
        }
    }
}

fn rank_deltas(
    target: &IndexMap<String, f64>,
    mut removed: IndexMap<String, f64>,
) -> Vec<BlameEntry> {
    let mut entries: Vec<BlameEntry> = target
        .iter()
        .map(|(step, &target_seconds)| {
            let baseline_seconds = removed.shift_remove(step).unwrap_or(0.0);
            BlameEntry {
                step: step.clone(),
                target_seconds,
                baseline_seconds,
                delta_seconds: target_seconds - baseline_seconds,
            }
        })
        .collect();

    // Steps that no longer run give back their whole baseline time
    entries.extend(removed.into_iter().map(|(step, baseline_seconds)| BlameEntry {
        step,
        target_seconds: 0.0,
        baseline_seconds,
        delta_seconds: -baseline_seconds,
    }));

    entries.sort_by(|a, b| {
        b.delta_seconds
            .abs()
            .total_cmp(&a.delta_seconds.abs())
            .then_with(|| a.step.cmp(&b.step))
    });

    entries
}
