mod client;
mod importer;

pub use importer::{GitLabImporter, ImportSummary, ImportedBuild};
