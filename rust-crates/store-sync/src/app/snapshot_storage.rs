use crate::{
    schema::TableId,
    store::{
        ChangeKind,
        Record,
        RecordChange,
    },
    value::RecordKey,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Persisted store contents as of `current_block`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub current_block: u64,
    pub records: Vec<Record>,
    pub tombstones: Vec<(TableId, RecordKey, u64)>,
}

impl StoreSnapshot {
    /// Folds one committed block into the snapshot.
    pub fn apply_changes(&mut self, block_number: u64, changes: &[RecordChange]) {
        for change in changes {
            self.records
                .retain(|record| !(record.table == change.table && record.key == change.key));
            self.tombstones
                .retain(|(table, key, _)| !(*table == change.table && *key == change.key));
            match (&change.kind, &change.current) {
                (ChangeKind::Deleted, _) => self.tombstones.push((
                    change.table.clone(),
                    change.key.clone(),
                    change.block_number,
                )),
                (_, Some(record)) => self.records.push(record.clone()),
                (_, None) => {}
            }
        }
        self.current_block = block_number;
    }
}

pub trait SnapshotStorage {
    /// retrieve the latest persisted store state, if any
    fn load(&self) -> anyhow::Result<Option<StoreSnapshot>>;

    /// write the changes of one block and mark it as the latest persisted block; must be
    /// all-or-nothing
    fn persist_batch(
        &mut self,
        block_number: u64,
        changes: &[RecordChange],
    ) -> anyhow::Result<()>;
}

/// Keeps nothing; sessions start from an empty store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshotStorage;

impl SnapshotStorage for NoSnapshotStorage {
    fn load(&self) -> anyhow::Result<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn persist_batch(
        &mut self,
        _block_number: u64,
        _changes: &[RecordChange],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
