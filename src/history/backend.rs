use crate::error::Result;
use crate::models::BuildRecord;

/// Durable medium behind the history store.
///
/// `persist` is only ever called while the owning project's write lock is held,
/// so implementations never see two concurrent calls for the same project.
pub trait HistoryBackend: Send + Sync {
    /// Every record previously persisted, in any order.
    fn load(&self) -> Result<Vec<BuildRecord>>;

    /// Durably append one record. The store acknowledges the append only after this returns.
    fn persist(&self, record: &BuildRecord) -> Result<()>;
}

/// Keeps nothing; history lives only as long as the store.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl HistoryBackend for MemoryBackend {
    fn load(&self) -> Result<Vec<BuildRecord>> {
        Ok(vec![])
    }

    fn persist(&self, _record: &BuildRecord) -> Result<()> {
        Ok(())
    }
}
