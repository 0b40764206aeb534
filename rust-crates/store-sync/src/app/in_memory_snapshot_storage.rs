use crate::{
    app::snapshot_storage::{
        SnapshotStorage,
        StoreSnapshot,
    },
    store::RecordChange,
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};

/// Shared in-memory snapshot; clones observe the same state.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStorage {
    snapshot: Arc<Mutex<Option<StoreSnapshot>>>,
}

impl InMemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            snapshot: Arc::new(Mutex::new(Some(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Option<StoreSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SnapshotStorage for InMemorySnapshotStorage {
    fn load(&self) -> anyhow::Result<Option<StoreSnapshot>> {
        Ok(self.snapshot())
    }

    fn persist_batch(
        &mut self,
        block_number: u64,
        changes: &[RecordChange],
    ) -> anyhow::Result<()> {
        let mut guard = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .get_or_insert_with(StoreSnapshot::default)
            .apply_changes(block_number, changes);
        Ok(())
    }
}
