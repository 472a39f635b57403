use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::BlameError;
use crate::models::BuildRecord;

/// What a build is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineStrategy {
    /// The closest earlier build.
    PreviousBuild,
    /// Per-step mean over the last `n` earlier builds.
    RollingAverage(usize),
}

impl BaselineStrategy {
    pub fn required_builds(self) -> usize {
        match self {
            Self::PreviousBuild => 1,
            Self::RollingAverage(n) => n,
        }
    }

    /// Baseline duration per step name.
    ///
    /// `prior` holds the earlier builds newest first and must contain at least
    /// `required_builds()` records; extra records are ignored.
    pub fn baseline(self, prior: &[Arc<BuildRecord>]) -> IndexMap<String, f64> {
        match self {
            Self::PreviousBuild => prior
                .first()
                .map(|record| step_durations(record))
                .unwrap_or_default(),
            Self::RollingAverage(n) => rolling_average(&prior[..n.min(prior.len())]),
        }
    }
}

impl fmt::Display for BaselineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreviousBuild => write!(f, "previous"),
            Self::RollingAverage(n) => write!(f, "rolling:{n}"),
        }
    }
}

impl FromStr for BaselineStrategy {
    type Err = BlameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_lowercase();

        if matches!(value.as_str(), "previous" | "previous-build") {
            return Ok(Self::PreviousBuild);
        }

        let window = value
            .strip_prefix("rolling:")
            .or_else(|| value.strip_prefix("rolling-average:"))
            .ok_or_else(|| {
                BlameError::Config(format!(
                    "Unknown baseline '{value}', expected 'previous' or 'rolling:N'"
                ))
            })?;

        match window.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Self::RollingAverage(n)),
            _ => Err(BlameError::Config(format!(
                "Rolling average window must be a positive integer, got '{window}'"
            ))),
        }
    }
}

/// Duration per step name; a step that ran several times counts once with the summed time.
pub fn step_durations(record: &BuildRecord) -> IndexMap<String, f64> {
    record
        .steps
        .iter()
        .fold(IndexMap::new(), |mut durations, step| {
            *durations.entry(step.name.clone()).or_insert(0.0) += step.duration_seconds;
            durations
        })
}

// Each step is averaged over the builds it appears in, not the whole window.
fn rolling_average(builds: &[Arc<BuildRecord>]) -> IndexMap<String, f64> {
    let totals = builds
        .iter()
        .flat_map(|record| step_durations(record))
        .fold(
            IndexMap::<String, (f64, usize)>::new(),
            |mut totals, (name, duration)| {
                let entry = totals.entry(name).or_insert((0.0, 0));
                entry.0 += duration;
                entry.1 += 1;
                totals
            },
        );

    totals
        .into_iter()
        .map(|(name, (sum, count))| {
            #[allow(clippy::cast_precision_loss)]
            let mean = sum / count as f64;
            (name, mean)
        })
        .collect()
}
