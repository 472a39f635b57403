use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::Token;
use crate::blame::{BaselineStrategy, BlameAggregator};
use crate::collector::{RecordOutcome, TimingCollector};
use crate::history::{FileBackend, HistoryStore};
use crate::logparse::ReportConfig;
use crate::models::BlameReport;
use crate::providers::gitlab::GitLabImporter;

#[derive(Parser)]
#[command(name = "buildblame")]
#[command(author, version, about = "Build time blame for CI projects", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the build history
    #[arg(
        short,
        long,
        global = true,
        env = "BUILDBLAME_STORE",
        default_value = ".buildblame"
    )]
    store: PathBuf,

    /// Output file path (defaults to stdout)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Pretty print JSON output
    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the step timings of a completed build
    Record {
        /// Project ID or path
        #[arg(short = 'P', long)]
        project: String,

        /// Build number
        #[arg(short, long)]
        build: u64,

        /// Step timing as NAME=SECONDS, in execution order (repeatable)
        #[arg(long = "step", value_parser = parse_step, required_unless_present = "from_json")]
        steps: Vec<(String, f64)>,

        /// Read steps from a JSON array of {"name", "duration_seconds"}
        #[arg(long, conflicts_with = "steps")]
        from_json: Option<PathBuf>,
    },
    /// Extract step timings from a timestamped console log and record them
    ParseLog {
        /// Project ID or path
        #[arg(short = 'P', long)]
        project: String,

        /// Build number
        #[arg(short, long)]
        build: u64,

        /// Console log with "[<RFC 3339 timestamp>] message" lines
        #[arg(long)]
        log: PathBuf,

        /// Step pattern configuration (JSON); built-in markers when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List the most recent builds of a project
    History {
        /// Project ID or path
        #[arg(short = 'P', long)]
        project: String,

        /// Number of builds to list
        #[arg(short, long, env = "BUILDBLAME_HISTORY_LIMIT", default_value_t = 20)]
        limit: usize,
    },
    /// Attribute a build's timing change to its steps
    Blame {
        /// Project ID or path
        #[arg(short = 'P', long)]
        project: String,

        /// Build number (defaults to the latest build)
        #[arg(short, long)]
        build: Option<u64>,

        /// Baseline: "previous" or "rolling:N"
        #[arg(long, env = "BUILDBLAME_BASELINE", default_value = "previous")]
        baseline: BaselineStrategy,
    },
    /// Per-step durations across recent builds
    Trend {
        /// Project ID or path
        #[arg(short = 'P', long)]
        project: String,

        /// Number of builds to include
        #[arg(short, long, env = "BUILDBLAME_HISTORY_LIMIT", default_value_t = 20)]
        limit: usize,
    },
    /// List projects with recorded builds
    Projects,
    /// Import finished pipelines from GitLab as builds
    ImportGitlab {
        /// GitLab API token (optional, required for private projects)
        #[arg(short, long, env = "GITLAB_TOKEN")]
        token: Option<String>,

        /// GitLab instance URL
        #[arg(short, long, default_value = "https://gitlab.com")]
        url: String,

        /// Project ID or path (e.g., "group/project")
        #[arg(short = 'P', long)]
        project: String,

        /// Number of pipelines to import
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Git ref to filter pipelines (optional)
        #[arg(short, long = "ref")]
        ref_: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct StepInput {
    name: String,
    duration_seconds: f64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum RecordResponse<'a> {
    Stored {
        project_id: &'a str,
        build_number: u64,
        steps: usize,
        total_duration_seconds: f64,
    },
    AlreadyRecorded {
        project_id: &'a str,
        build_number: u64,
    },
}

impl<'a> RecordResponse<'a> {
    fn from_outcome(project_id: &'a str, build_number: u64, outcome: &RecordOutcome) -> Self {
        match outcome {
            RecordOutcome::Stored(record) => Self::Stored {
                project_id,
                build_number,
                steps: record.steps.len(),
                total_duration_seconds: record.total_duration_seconds,
            },
            RecordOutcome::AlreadyRecorded { .. } => Self::AlreadyRecorded {
                project_id,
                build_number,
            },
        }
    }
}

fn parse_step(value: &str) -> std::result::Result<(String, f64), String> {
    let (name, seconds) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=SECONDS, got '{value}'"))?;
    let seconds = seconds
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid duration in '{value}': {e}"))?;
    Ok((name.trim().to_string(), seconds))
}

fn read_steps(path: &Path) -> Result<Vec<(String, f64)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read steps from {}", path.display()))?;
    let steps: Vec<StepInput> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid steps JSON in {}", path.display()))?;
    Ok(steps
        .into_iter()
        .map(|s| (s.name, s.duration_seconds))
        .collect())
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        let backend = FileBackend::new(&self.store)?;
        info!("Using history store at {}", backend.root().display());
        let store = Arc::new(HistoryStore::open(backend)?);

        match &self.command {
            Commands::Record {
                project,
                build,
                steps,
                from_json,
            } => {
                let steps = match from_json {
                    Some(path) => read_steps(path)?,
                    None => steps.clone(),
                };

                let collector = TimingCollector::new(store);
                let outcome = collector.record(project, *build, steps)?;
                self.emit(&RecordResponse::from_outcome(project, *build, &outcome))
            }
            Commands::ParseLog {
                project,
                build,
                log,
                config,
            } => {
                let config = match config {
                    Some(path) => ReportConfig::load(path)?,
                    None => ReportConfig::default(),
                };
                let content = std::fs::read_to_string(log)
                    .with_context(|| format!("Failed to read console log {}", log.display()))?;

                let timings = config.compile()?.extract(&content)?;
                info!(
                    "Matched {} steps in {}",
                    timings.steps.len(),
                    log.display()
                );

                let collector = TimingCollector::new(store);
                let outcome =
                    collector.record_timings(project, *build, timings.started_at, timings.steps)?;
                self.emit(&RecordResponse::from_outcome(project, *build, &outcome))
            }
            Commands::History { project, limit } => {
                let history = store.fetch_history(project, *limit);
                self.emit(&history.into_project_history(project))
            }
            Commands::Blame {
                project,
                build,
                baseline,
            } => {
                let target = build.or_else(|| {
                    store
                        .fetch_history(project, 1)
                        .iter()
                        .next()
                        .map(|record| record.build_number)
                });

                let report = match target {
                    Some(build) => BlameAggregator::new(store)
                        .blame_or_placeholder(project, build, *baseline)?,
                    None => {
                        warn!("No builds recorded for project '{project}'");
                        BlameReport::unavailable(
                            project,
                            0,
                            baseline.to_string(),
                            format!("no builds recorded for project '{project}'"),
                        )
                    }
                };
                self.emit(&report)
            }
            Commands::Trend { project, limit } => {
                let report = BlameAggregator::new(store).trend(project, *limit);
                self.emit(&report)
            }
            Commands::Projects => self.emit(&store.projects()),
            Commands::ImportGitlab {
                token,
                url,
                project,
                limit,
                ref_,
            } => {
                info!("Importing GitLab pipelines for project: {project}");

                let token = token.as_deref().and_then(Token::new);
                let importer = GitLabImporter::new(url, project.clone(), token)?;
                let builds = importer.fetch_builds(*limit, ref_.as_deref()).await?;

                let collector = TimingCollector::new(store);
                let summary = importer.import(&collector, builds);
                self.emit(&summary)
            }
        }
    }

    fn emit<T: Serialize>(&self, value: &T) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)?;
            info!("Output written to: {}", output_path.display());
        } else {
            println!("{json_output}");
        }

        Ok(())
    }
}
