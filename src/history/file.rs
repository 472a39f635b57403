use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::backend::HistoryBackend;
use crate::error::{BlameError, Result};
use crate::models::BuildRecord;

const LOG_FILE: &str = "builds.jsonl";
const MAX_DIR_NAME_LEN: usize = 255;

/// Append-only JSON Lines log per project: `<root>/<encoded project id>/builds.jsonl`.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory name only has to be unique; records carry their own project id.
    fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
        let mut name = urlencoding::encode(project_id).into_owned();

        // "." and ".." would resolve to the root itself or its parent
        if name.bytes().all(|b| b == b'.') {
            name = name.replace('.', "%2E");
        }

        if name.len() > MAX_DIR_NAME_LEN {
            return Err(BlameError::InvalidTiming(format!(
                "project id is too long to store ({} bytes encoded, at most {MAX_DIR_NAME_LEN})",
                name.len()
            )));
        }

        Ok(self.root.join(name))
    }

    fn read_log(path: &Path) -> Result<Vec<BuildRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            // A torn trailing line is what a crash mid-append leaves behind
            match serde_json::from_str::<BuildRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable record at {}:{}: {e}",
                    path.display(),
                    index + 1
                ),
            }
        }

        Ok(records)
    }
}

impl HistoryBackend for FileBackend {
    fn load(&self) -> Result<Vec<BuildRecord>> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let path = entry.path().join(LOG_FILE);
            if !path.is_file() {
                continue;
            }

            let project_records = Self::read_log(&path)?;
            debug!(
                "Loaded {} records from {}",
                project_records.len(),
                path.display()
            );
            records.extend(project_records);
        }

        Ok(records)
    }

    fn persist(&self, record: &BuildRecord) -> Result<()> {
        let dir = self.project_dir(&record.project_id)?;
        fs::create_dir_all(&dir)?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .map_err(|e| {
                BlameError::Config(format!(
                    "Cannot open history log for project '{}': {e}",
                    record.project_id
                ))
            })?;

        if !ends_with_newline(&mut file)? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        Ok(())
    }
}

fn ends_with_newline(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
