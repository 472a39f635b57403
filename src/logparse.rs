use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BlameError, Result};
use crate::models::StepTiming;

/// A console line pattern that marks the start of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPattern {
    pub label: String,
    pub pattern: String,
    #[serde(default)]
    pub only_first_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    pub steps: Vec<StepPattern>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                StepPattern {
                    label: "Job Started".to_string(),
                    pattern: "^Started by".to_string(),
                    only_first_match: true,
                },
                StepPattern {
                    label: "Finished".to_string(),
                    pattern: "^Finished: ".to_string(),
                    only_first_match: true,
                },
            ],
        }
    }
}

impl ReportConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        info!(
            "Loaded {} step patterns from {}",
            config.steps.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn compile(&self) -> Result<StepMatcher> {
        if self.steps.is_empty() {
            return Err(BlameError::Config(
                "Report configuration defines no step patterns".to_string(),
            ));
        }

        let patterns = self
            .steps
            .iter()
            .map(|step| {
                let regex = Regex::new(&step.pattern).map_err(|e| {
                    BlameError::Config(format!(
                        "Invalid pattern for step '{}': {e}",
                        step.label
                    ))
                })?;
                Ok(CompiledPattern {
                    label: step.label.clone(),
                    regex,
                    only_first_match: step.only_first_match,
                })
            })
            .collect::<Result<_>>()?;

        Ok(StepMatcher { patterns })
    }
}

struct CompiledPattern {
    label: String,
    regex: Regex,
    only_first_match: bool,
}

pub struct StepMatcher {
    patterns: Vec<CompiledPattern>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTimings {
    /// Time of the first timestamped line.
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepTiming>,
}

impl StepMatcher {
    /// Derives step timings from a console log of `[<RFC 3339>] message` lines.
    ///
    /// Each matching line opens a step that runs until the next match; the last
    /// step runs until the final timestamp in the log. Untimestamped lines
    /// inherit the previous line's time.
    pub fn extract(&self, log: &str) -> Result<ExtractedTimings> {
        let mut used = vec![false; self.patterns.len()];
        let mut marks: Vec<(String, DateTime<Utc>)> = Vec::new();
        let mut started_at = None;
        let mut current = None;

        for line in log.lines() {
            let message = match split_timestamp(line) {
                Some((time, message)) => {
                    started_at.get_or_insert(time);
                    current = Some(time);
                    message
                }
                None => line,
            };

            let Some(time) = current else {
                continue;
            };

            let matched = self
                .patterns
                .iter()
                .enumerate()
                .find(|(i, p)| !(p.only_first_match && used[*i]) && p.regex.is_match(message));

            if let Some((i, pattern)) = matched {
                used[i] = true;
                debug!("Step '{}' starts at {time}", pattern.label);
                marks.push((pattern.label.clone(), time));
            }
        }

        let (Some(started_at), Some(finished_at)) = (started_at, current) else {
            return Err(BlameError::InvalidTiming(
                "console log has no timestamped lines".to_string(),
            ));
        };

        let steps = marks
            .iter()
            .enumerate()
            .map(|(i, (label, start))| {
                let end = marks.get(i + 1).map_or(finished_at, |next| next.1);
                StepTiming::new(
                    label.clone(),
                    seconds_between(started_at, *start),
                    seconds_between(*start, end),
                )
            })
            .collect();

        Ok(ExtractedTimings { started_at, steps })
    }
}

fn split_timestamp(line: &str) -> Option<(DateTime<Utc>, &str)> {
    let rest = line.strip_prefix('[')?;
    let (stamp, message) = rest.split_once(']')?;
    let time = DateTime::parse_from_rfc3339(stamp.trim()).ok()?;
    Some((time.with_timezone(&Utc), message.trim_start()))
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let seconds = (to - from).num_milliseconds() as f64 / 1000.0;
    if seconds < 0.0 {
        warn!("Console timestamps go backwards ({from} -> {to}), clamping to 0");
        return 0.0;
    }
    seconds
}
