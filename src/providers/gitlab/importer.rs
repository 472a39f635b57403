use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use log::{info, warn};
use serde::Serialize;

use super::client::{GitLabClient, GitLabJobDto, GitLabPipelineDto};
use crate::auth::Token;
use crate::collector::{RecordOutcome, TimingCollector};
use crate::error::{BlameError, Result};
use crate::models::StepTiming;

const CONCURRENCY: usize = 10;
const PER_PAGE: u32 = 100;

/// A finished pipeline translated into build timings.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedBuild {
    pub build_number: u64,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<StepTiming>,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub project_id: String,
    pub fetched: usize,
    pub recorded: usize,
    pub already_recorded: usize,
    pub rejected: usize,
}

pub struct GitLabImporter {
    client: GitLabClient,
    project_id: String,
}

impl GitLabImporter {
    pub fn new(base_url: &str, project_id: String, token: Option<Token>) -> Result<Self> {
        let client = GitLabClient::new(base_url, token)?;

        Ok(Self { client, project_id })
    }

    /// The most recent `limit` finished pipelines with their job timings, oldest first.
    pub async fn fetch_builds(
        &self,
        limit: usize,
        ref_: Option<&str>,
    ) -> Result<Vec<ImportedBuild>> {
        let pipelines = self.fetch_finished_pipelines(limit, ref_).await?;

        info!(
            "Fetching jobs for {} pipelines of '{}'...",
            pipelines.len(),
            self.project_id
        );

        let mut builds: Vec<ImportedBuild> = stream::iter(pipelines)
            .map(|pipeline| async move {
                let jobs = self
                    .client
                    .fetch_pipeline_jobs(&self.project_id, pipeline.id)
                    .await?;
                Ok::<_, BlameError>(to_build(&pipeline, jobs))
            })
            .buffer_unordered(CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        builds.sort_by_key(|b| b.build_number);
        Ok(builds)
    }

    async fn fetch_finished_pipelines(
        &self,
        limit: usize,
        ref_: Option<&str>,
    ) -> Result<Vec<GitLabPipelineDto>> {
        let mut pipelines = Vec::with_capacity(limit);
        let mut page = 1;

        while pipelines.len() < limit {
            let batch = self
                .client
                .fetch_pipeline_page(&self.project_id, page, PER_PAGE, ref_)
                .await?;

            if batch.is_empty() {
                info!("No more pipelines returned by API, stopping");
                break;
            }

            let remaining = limit - pipelines.len();
            pipelines.extend(
                batch
                    .into_iter()
                    .filter(GitLabPipelineDto::is_finished)
                    .take(remaining),
            );

            info!(
                "Page {page}: {} finished pipelines so far",
                pipelines.len()
            );
            page += 1;
        }

        Ok(pipelines)
    }

    /// Feeds fetched builds through the collector; builds already in history are skipped.
    pub fn import(
        &self,
        collector: &TimingCollector,
        builds: Vec<ImportedBuild>,
    ) -> ImportSummary {
        let mut summary = ImportSummary {
            project_id: self.project_id.clone(),
            fetched: builds.len(),
            ..ImportSummary::default()
        };

        for build in builds {
            match collector.record_timings(
                &self.project_id,
                build.build_number,
                build.created_at,
                build.steps,
            ) {
                Ok(RecordOutcome::Stored(_)) => summary.recorded += 1,
                Ok(RecordOutcome::AlreadyRecorded { .. }) => summary.already_recorded += 1,
                Err(e) => {
                    warn!(
                        "Skipping pipeline {} of '{}': {e}",
                        build.build_number, self.project_id
                    );
                    summary.rejected += 1;
                }
            }
        }

        info!(
            "Imported {} of {} pipelines for '{}' ({} already recorded)",
            summary.recorded, summary.fetched, self.project_id, summary.already_recorded
        );

        summary
    }
}

/// Jobs become steps ordered by start time; jobs that never ran are dropped.
fn to_build(pipeline: &GitLabPipelineDto, jobs: Vec<GitLabJobDto>) -> Option<ImportedBuild> {
    let mut timed: Vec<(DateTime<Utc>, String, f64)> = jobs
        .into_iter()
        .filter_map(|job| Some((job.started_at?, job.name, job.duration?)))
        .collect();

    if timed.is_empty() {
        warn!("Pipeline {} has no timed jobs, skipping", pipeline.id);
        return None;
    }

    timed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let first_start = timed[0].0;

    let steps = timed
        .into_iter()
        .map(|(started_at, name, duration)| {
            #[allow(clippy::cast_precision_loss)]
            let offset = (started_at - first_start).num_milliseconds() as f64 / 1000.0;
            StepTiming::new(name, offset, duration)
        })
        .collect();

    Some(ImportedBuild {
        build_number: pipeline.id,
        created_at: pipeline.created_at,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStore;
    use mockito::Matcher;
    use std::sync::Arc;

    const PIPELINES_PAGE: &str = r#"[
        {"id": 103, "status": "running", "created_at": "2024-07-01T12:00:00Z"},
        {"id": 102, "status": "success", "created_at": "2024-07-01T11:00:00Z"},
        {"id": 101, "status": "failed", "created_at": "2024-07-01T10:00:00Z"}
    ]"#;

    const JOBS_102: &str = r#"[
        {"name": "test", "duration": 42.5, "started_at": "2024-07-01T11:01:00Z"},
        {"name": "build", "duration": 60.0, "started_at": "2024-07-01T11:00:00Z"},
        {"name": "deploy", "duration": null, "started_at": null}
    ]"#;

    const JOBS_101: &str = r#"[
        {"name": "build", "duration": 55.0, "started_at": "2024-07-01T10:00:10Z"}
    ]"#;

    async fn mock_json(
        server: &mut mockito::Server,
        path: &str,
        query: Matcher,
        body: &str,
    ) -> mockito::Mock {
        server
            .mock("GET", path)
            .match_query(query)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    async fn mock_project(server: &mut mockito::Server) -> Vec<mockito::Mock> {
        vec![
            mock_json(
                server,
                "/api/v4/projects/42/pipelines",
                Matcher::UrlEncoded("page".into(), "1".into()),
                PIPELINES_PAGE,
            )
            .await,
            mock_json(
                server,
                "/api/v4/projects/42/pipelines",
                Matcher::UrlEncoded("page".into(), "2".into()),
                "[]",
            )
            .await,
            mock_json(
                server,
                "/api/v4/projects/42/pipelines/102/jobs",
                Matcher::Any,
                JOBS_102,
            )
            .await,
            mock_json(
                server,
                "/api/v4/projects/42/pipelines/101/jobs",
                Matcher::Any,
                JOBS_101,
            )
            .await,
        ]
    }

    #[tokio::test]
    async fn test_fetch_builds_translates_finished_pipelines() {
        let mut server = mockito::Server::new_async().await;
        let _mocks = mock_project(&mut server).await;
        let importer = GitLabImporter::new(&server.url(), "42".to_string(), None).unwrap();

        let builds = importer.fetch_builds(10, None).await.unwrap();

        let numbers: Vec<u64> = builds.iter().map(|b| b.build_number).collect();
        assert_eq!(numbers, vec![101, 102]);
        assert_eq!(
            builds[1].steps,
            vec![
                StepTiming::new("build", 0.0, 60.0),
                StepTiming::new("test", 60.0, 42.5),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_builds_honours_limit() {
        let mut server = mockito::Server::new_async().await;
        let _mocks = mock_project(&mut server).await;
        let importer = GitLabImporter::new(&server.url(), "42".to_string(), None).unwrap();

        let builds = importer.fetch_builds(1, None).await.unwrap();

        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].build_number, 102);
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let mut server = mockito::Server::new_async().await;
        let _mocks = mock_project(&mut server).await;
        let importer = GitLabImporter::new(&server.url(), "42".to_string(), None).unwrap();
        let store = Arc::new(HistoryStore::in_memory());
        let collector = TimingCollector::new(Arc::clone(&store));

        let first = importer.import(&collector, importer.fetch_builds(10, None).await.unwrap());
        let second = importer.import(&collector, importer.fetch_builds(10, None).await.unwrap());

        assert_eq!((first.recorded, first.already_recorded), (2, 0));
        assert_eq!((second.recorded, second.already_recorded), (0, 2));
        assert_eq!(store.fetch_history("42", 10).len(), 2);
    }

    #[tokio::test]
    async fn test_api_errors_propagate() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v4/projects/42/pipelines")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        let importer = GitLabImporter::new(&server.url(), "42".to_string(), None).unwrap();

        assert!(importer.fetch_builds(5, None).await.is_err());
    }

    #[test]
    fn test_pipeline_without_timed_jobs_is_skipped() {
        let pipeline = GitLabPipelineDto {
            id: 7,
            status: "success".to_string(),
            created_at: Utc::now(),
        };
        let jobs = vec![GitLabJobDto {
            name: "manual".to_string(),
            duration: None,
            started_at: None,
        }];

        assert!(to_build(&pipeline, jobs).is_none());
    }
}
