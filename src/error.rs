use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlameError {
    #[error("Invalid timing data: {0}")]
    InvalidTiming(String),

    #[error("Build #{build_number} of project '{project_id}' is already recorded")]
    DuplicateBuild {
        project_id: String,
        build_number: u64,
    },

    #[error(
        "Not enough history for project '{project_id}': {required} prior build(s) required, {available} available"
    )]
    InsufficientHistory {
        project_id: String,
        required: usize,
        available: usize,
    },

    #[error("Build #{build_number} of project '{project_id}' not found")]
    BuildNotFound {
        project_id: String,
        build_number: u64,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlameError {
    /// Aggregator preconditions that are reported as a placeholder instead of failing.
    pub fn is_unmet_precondition(&self) -> bool {
        matches!(
            self,
            Self::InsufficientHistory { .. } | Self::BuildNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BlameError>;
