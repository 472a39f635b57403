use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::auth::Token;
use crate::error::{BlameError, Result};

pub struct GitLabClient {
    client: Client,
    api_url: Url,
    token: Option<Token>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabPipelineDto {
    pub id: u64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabJobDto {
    pub name: String,
    pub duration: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
}

// Only finished pipelines have settled job timings
const FINISHED_STATUSES: [&str; 2] = ["success", "failed"];

impl GitLabPipelineDto {
    pub fn is_finished(&self) -> bool {
        FINISHED_STATUSES.contains(&self.status.as_str())
    }
}

impl GitLabClient {
    pub fn new(base_url: &str, token: Option<Token>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("buildblame/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BlameError::Config(format!("Failed to create HTTP client: {e}")))?;

        let api_url = Url::parse(base_url)
            .map_err(|e| BlameError::Config(format!("Invalid base URL: {e}")))?
            .join("api/v4/")
            .map_err(|e| BlameError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            token,
        })
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    fn project_url(&self, project_id: &str, path: &str) -> Result<Url> {
        self.api_url
            .join(&format!("projects/{}/", urlencoding::encode(project_id)))
            .and_then(|url| url.join(path))
            .map_err(|e| BlameError::Config(format!("Invalid project URL: {e}")))
    }

    /// One page of the project's pipelines, newest first.
    pub async fn fetch_pipeline_page(
        &self,
        project_id: &str,
        page: u32,
        per_page: u32,
        ref_: Option<&str>,
    ) -> Result<Vec<GitLabPipelineDto>> {
        let url = self.project_url(project_id, "pipelines")?;

        let mut request = self
            .client
            .get(url)
            .query(&[("page", page), ("per_page", per_page)]);
        if let Some(ref_) = ref_ {
            request = request.query(&[("ref", ref_)]);
        }

        let response = self.auth_request(request).send().await?.error_for_status()?;
        Ok(response.json::<Vec<GitLabPipelineDto>>().await?)
    }

    /// All jobs of a pipeline (retried attempts excluded by the API).
    pub async fn fetch_pipeline_jobs(
        &self,
        project_id: &str,
        pipeline_id: u64,
    ) -> Result<Vec<GitLabJobDto>> {
        const PER_PAGE: u32 = 100;

        let url = self.project_url(project_id, &format!("pipelines/{pipeline_id}/jobs"))?;
        let mut jobs = Vec::new();
        let mut page = 1;

        loop {
            let request = self
                .client
                .get(url.clone())
                .query(&[("page", page), ("per_page", PER_PAGE)]);

            let response = self.auth_request(request).send().await?.error_for_status()?;
            let batch = response.json::<Vec<GitLabJobDto>>().await?;
            let full_page = batch.len() == PER_PAGE as usize;
            jobs.extend(batch);

            if !full_page {
                break;
            }
            page += 1;
        }

        Ok(jobs)
    }
}
