mod backend;
mod file;

pub use backend::{HistoryBackend, MemoryBackend};
pub use file::FileBackend;

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BlameError, Result};
use crate::models::{BuildRecord, HistoryEntry, ProjectHistory};

type Builds = BTreeMap<u64, Arc<BuildRecord>>;

/// Per-project, append-only build history.
///
/// Each project owns its own lock: appends to one project are serialized while
/// other projects proceed independently. The project map lock is only held long
/// enough to find or create a project's slot.
pub struct HistoryStore {
    backend: Box<dyn HistoryBackend>,
    projects: RwLock<HashMap<String, Arc<RwLock<Builds>>>>,
}

impl HistoryStore {
    pub fn open(backend: impl HistoryBackend + 'static) -> Result<Self> {
        let store = Self {
            backend: Box::new(backend),
            projects: RwLock::new(HashMap::new()),
        };

        let records = store.backend.load()?;
        let loaded = records.len();

        for record in records {
            let slot = store.project_slot(&record.project_id);
            let mut builds = write(&slot);
            if builds.contains_key(&record.build_number) {
                warn!(
                    "Ignoring duplicate stored build #{} of project '{}'",
                    record.build_number, record.project_id
                );
                continue;
            }
            builds.insert(record.build_number, Arc::new(record));
        }

        info!("History store opened with {loaded} build records");
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend),
            projects: RwLock::new(HashMap::new()),
        }
    }

    fn project_slot(&self, project_id: &str) -> Arc<RwLock<Builds>> {
        if let Some(slot) = read(&self.projects).get(project_id) {
            return Arc::clone(slot);
        }

        Arc::clone(
            write(&self.projects)
                .entry(project_id.to_string())
                .or_default(),
        )
    }

    fn existing_slot(&self, project_id: &str) -> Option<Arc<RwLock<Builds>>> {
        read(&self.projects).get(project_id).cloned()
    }

    /// Adds a record to its project's history.
    ///
    /// The record is persisted before it becomes visible to readers.
    pub fn append(&self, record: BuildRecord) -> Result<Arc<BuildRecord>> {
        let slot = self.project_slot(&record.project_id);
        let mut builds = write(&slot);

        if builds.contains_key(&record.build_number) {
            return Err(BlameError::DuplicateBuild {
                project_id: record.project_id,
                build_number: record.build_number,
            });
        }

        self.backend.persist(&record)?;

        debug!(
            "Appended build #{} to project '{}' ({} steps)",
            record.build_number,
            record.project_id,
            record.steps.len()
        );

        let record = Arc::new(record);
        builds.insert(record.build_number, Arc::clone(&record));
        Ok(record)
    }

    /// The most recent `limit` builds, newest first. Unknown projects yield an empty view.
    pub fn fetch_history(&self, project_id: &str, limit: usize) -> HistoryView {
        let Some(slot) = self.existing_slot(project_id) else {
            return HistoryView::default();
        };

        let builds = read(&slot).values().rev().take(limit).cloned().collect();
        HistoryView { builds }
    }

    pub fn get(&self, project_id: &str, build_number: u64) -> Option<Arc<BuildRecord>> {
        let slot = self.existing_slot(project_id)?;
        let found = read(&slot).get(&build_number).cloned();
        found
    }

    /// Up to `limit` builds numbered below `build_number`, newest first.
    pub fn builds_before(
        &self,
        project_id: &str,
        build_number: u64,
        limit: usize,
    ) -> Vec<Arc<BuildRecord>> {
        let Some(slot) = self.existing_slot(project_id) else {
            return vec![];
        };

        let builds = read(&slot)
            .range(..build_number)
            .rev()
            .take(limit)
            .map(|(_, record)| Arc::clone(record))
            .collect();
        builds
    }

    /// Known projects with at least one build, sorted by id.
    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = read(&self.projects)
            .iter()
            .filter(|(_, slot)| !read(slot).is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        projects.sort();
        projects
    }
}

/// A consistent snapshot of a project's most recent builds, newest first.
///
/// Iterating never touches the store, so the view can be walked any number of times.
#[derive(Debug, Clone, Default)]
pub struct HistoryView {
    builds: Vec<Arc<BuildRecord>>,
}

impl HistoryView {
    pub fn iter(&self) -> HistoryIter<'_> {
        HistoryIter {
            inner: self.builds.iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.iter().map(BuildRecord::summary).collect()
    }

    pub fn into_project_history(self, project_id: &str) -> ProjectHistory {
        ProjectHistory {
            project_id: project_id.to_string(),
            builds: self.entries(),
        }
    }
}

impl<'a> IntoIterator for &'a HistoryView {
    type Item = &'a BuildRecord;
    type IntoIter = HistoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct HistoryIter<'a> {
    inner: std::slice::Iter<'a, Arc<BuildRecord>>,
}

impl<'a> Iterator for HistoryIter<'a> {
    type Item = &'a BuildRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|record| &**record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for HistoryIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|record| &**record)
    }
}

impl ExactSizeIterator for HistoryIter<'_> {}

// Writers only ever insert whole entries, so a poisoned lock still guards consistent data.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepTiming;
    use chrono::{TimeZone, Utc};
    use std::thread;

    fn record(project_id: &str, build_number: u64, steps: &[(&str, f64)]) -> BuildRecord {
        let mut offset = 0.0;
        let steps: Vec<StepTiming> = steps
            .iter()
            .map(|&(name, duration)| {
                let step = StepTiming::new(name, offset, duration);
                offset += duration;
                step
            })
            .collect();

        BuildRecord {
            project_id: project_id.to_string(),
            build_number,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 10, 8, 30, 0).unwrap(),
            total_duration_seconds: offset,
            steps,
        }
    }

    fn build_numbers(view: &HistoryView) -> Vec<u64> {
        view.iter().map(|r| r.build_number).collect()
    }

    #[test]
    fn test_append_then_fetch_returns_record_unchanged() {
        let store = HistoryStore::in_memory();
        let original = record("web", 1, &[("checkout", 3.0), ("test", 40.0)]);

        store.append(original.clone()).unwrap();

        let view = store.fetch_history("web", 1);
        assert_eq!(view.len(), 1);
        assert_eq!(view.iter().next(), Some(&original));
    }

    #[test]
    fn test_duplicate_append_keeps_single_record() {
        let store = HistoryStore::in_memory();
        store.append(record("web", 4, &[("build", 10.0)])).unwrap();

        let err = store
            .append(record("web", 4, &[("build", 99.0)]))
            .unwrap_err();

        assert!(matches!(
            err,
            BlameError::DuplicateBuild { ref project_id, build_number: 4 } if project_id == "web"
        ));
        let view = store.fetch_history("web", 10);
        assert_eq!(view.len(), 1);
        assert_eq!(view.iter().next().unwrap().steps[0].duration_seconds, 10.0);
    }

    #[test]
    fn test_unknown_project_yields_empty_history() {
        let store = HistoryStore::in_memory();

        let view = store.fetch_history("nope", 5);

        assert!(view.is_empty());
        assert_eq!(view.iter().count(), 0);
        assert!(store.projects().is_empty());
    }

    #[test]
    fn test_history_is_descending_regardless_of_insertion_order() {
        let store = HistoryStore::in_memory();
        for n in [3, 1, 7, 5, 2] {
            store.append(record("web", n, &[("build", 1.0)])).unwrap();
        }

        assert_eq!(build_numbers(&store.fetch_history("web", 10)), vec![7, 5, 3, 2, 1]);
        assert_eq!(build_numbers(&store.fetch_history("web", 2)), vec![7, 5]);
        assert!(store.fetch_history("web", 0).is_empty());
    }

    #[test]
    fn test_view_is_restartable() {
        let store = HistoryStore::in_memory();
        store.append(record("web", 1, &[("a", 1.0)])).unwrap();
        store.append(record("web", 2, &[("a", 2.0)])).unwrap();

        let view = store.fetch_history("web", 5);
        let first: Vec<u64> = (&view).into_iter().map(|r| r.build_number).collect();
        let second: Vec<u64> = (&view).into_iter().map(|r| r.build_number).collect();

        assert_eq!(first, second);
        assert_eq!(first, vec![2, 1]);
    }

    #[test]
    fn test_view_is_a_snapshot() {
        let store = HistoryStore::in_memory();
        store.append(record("web", 1, &[("a", 1.0)])).unwrap();

        let view = store.fetch_history("web", 5);
        store.append(record("web", 2, &[("a", 1.0)])).unwrap();

        assert_eq!(build_numbers(&view), vec![1]);
        assert_eq!(build_numbers(&store.fetch_history("web", 5)), vec![2, 1]);
    }

    #[test]
    fn test_builds_before_skips_target_and_later_builds() {
        let store = HistoryStore::in_memory();
        for n in [1, 2, 4, 8, 9] {
            store.append(record("web", n, &[("a", 1.0)])).unwrap();
        }

        let prior: Vec<u64> = store
            .builds_before("web", 8, 2)
            .iter()
            .map(|r| r.build_number)
            .collect();

        assert_eq!(prior, vec![4, 2]);
        assert!(store.builds_before("web", 1, 5).is_empty());
        assert!(store.builds_before("other", 8, 5).is_empty());
    }

    #[test]
    fn test_get_finds_exact_build() {
        let store = HistoryStore::in_memory();
        store.append(record("web", 2, &[("a", 1.0)])).unwrap();

        assert_eq!(store.get("web", 2).unwrap().build_number, 2);
        assert!(store.get("web", 3).is_none());
        assert!(store.get("api", 2).is_none());
    }

    #[test]
    fn test_reopened_file_store_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = HistoryStore::open(FileBackend::new(dir.path()).unwrap()).unwrap();
            store.append(record("web", 1, &[("a", 1.0)])).unwrap();
            store.append(record("web", 2, &[("a", 2.0)])).unwrap();
            store.append(record("api", 1, &[("b", 5.0)])).unwrap();
        }

        let store = HistoryStore::open(FileBackend::new(dir.path()).unwrap()).unwrap();

        assert_eq!(store.projects(), vec!["api".to_string(), "web".to_string()]);
        assert_eq!(build_numbers(&store.fetch_history("web", 10)), vec![2, 1]);
        assert!(matches!(
            store.append(record("web", 2, &[("a", 2.0)])),
            Err(BlameError::DuplicateBuild { .. })
        ));
    }

    #[test]
    fn test_concurrent_duplicate_appends_store_exactly_one() {
        let store = Arc::new(HistoryStore::in_memory());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let duration = f64::from(i);
                    store.append(record("web", 42, &[("build", duration)])).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(store.fetch_history("web", 10).len(), 1);
    }

    #[test]
    fn test_concurrent_appends_across_projects_all_succeed() {
        let store = Arc::new(HistoryStore::in_memory());

        let handles: Vec<_> = ["web", "api", "docs", "mobile"]
            .into_iter()
            .map(|project| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for n in (1..=25).rev() {
                        store.append(record(project, n, &[("build", 1.0)])).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for project in ["web", "api", "docs", "mobile"] {
            let numbers = build_numbers(&store.fetch_history(project, 100));
            assert_eq!(numbers, (1..=25).rev().collect::<Vec<u64>>());
        }
    }
}
