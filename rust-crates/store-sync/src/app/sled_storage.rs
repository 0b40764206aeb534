// Sled-backed persistence cache. Records, tombstones and the current block share one tree
// so that a block is written with a single atomic `sled::Batch`.
use crate::{
    app::snapshot_storage::{
        SnapshotStorage,
        StoreSnapshot,
    },
    schema::TableId,
    store::{
        ChangeKind,
        Record,
        RecordChange,
    },
    value::RecordKey,
};
use anyhow::Context;
use serde::de::DeserializeOwned;
use sled::{
    Batch,
    Config,
    Db,
    Tree,
};
use std::path::Path;

const STORE_TREE: &str = "store";
const RECORD_PREFIX: &str = "r/";
const TOMBSTONE_PREFIX: &str = "t/";
const CURRENT_BLOCK_KEY: &[u8] = b"m/current_block";

#[derive(Clone)]
pub struct SledSnapshotStorage {
    tree: Tree,
}

impl SledSnapshotStorage {
    pub fn new(db: &Db) -> anyhow::Result<Self> {
        let tree = db.open_tree(STORE_TREE).context("open store tree")?;
        Ok(Self { tree })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Config::default().path(path);
        let db = config.open().context("open sled database")?;
        Self::new(&db)
    }

    /// Forget everything persisted so far.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.tree.clear().context("clear store tree")?;
        self.tree.flush().context("flush store tree")?;
        Ok(())
    }

    pub fn current_block(&self) -> anyhow::Result<Option<u64>> {
        match self
            .tree
            .get(CURRENT_BLOCK_KEY)
            .context("read current block")?
        {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .context("current block should be 8 bytes")?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn entry_key(prefix: &str, table: &TableId, key: &RecordKey) -> anyhow::Result<Vec<u8>> {
        let encoded = serde_json::to_string(key).context("serialize record key")?;
        Ok(format!("{prefix}{table}/{encoded}").into_bytes())
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        let mut entries = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (_, value) = entry.with_context(|| format!("iterate {prefix} entries"))?;
            entries.push(deserialize(value.as_ref())?);
        }
        Ok(entries)
    }
}

impl SnapshotStorage for SledSnapshotStorage {
    fn load(&self) -> anyhow::Result<Option<StoreSnapshot>> {
        let Some(current_block) = self.current_block()? else {
            return Ok(None);
        };
        let records: Vec<Record> = self.scan(RECORD_PREFIX)?;
        let tombstones: Vec<(TableId, RecordKey, u64)> = self.scan(TOMBSTONE_PREFIX)?;
        Ok(Some(StoreSnapshot {
            current_block,
            records,
            tombstones,
        }))
    }

    fn persist_batch(
        &mut self,
        block_number: u64,
        changes: &[RecordChange],
    ) -> anyhow::Result<()> {
        let mut batch = Batch::default();
        for change in changes {
            let record_key = Self::entry_key(RECORD_PREFIX, &change.table, &change.key)?;
            let tombstone_key =
                Self::entry_key(TOMBSTONE_PREFIX, &change.table, &change.key)?;
            match (&change.kind, &change.current) {
                (ChangeKind::Deleted, _) => {
                    batch.remove(record_key);
                    let tombstone = (&change.table, &change.key, change.block_number);
                    let bytes =
                        serde_json::to_vec(&tombstone).context("serialize tombstone")?;
                    batch.insert(tombstone_key, bytes);
                }
                (_, Some(record)) => {
                    batch.remove(tombstone_key);
                    let bytes = serde_json::to_vec(record).context("serialize record")?;
                    batch.insert(record_key, bytes);
                }
                (_, None) => {}
            }
        }
        batch.insert(CURRENT_BLOCK_KEY, block_number.to_be_bytes().as_slice());
        self.tree
            .apply_batch(batch)
            .with_context(|| format!("persist block {block_number}"))?;
        self.tree.flush().context("flush store tree")?;
        Ok(())
    }
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(bytes).context("deserialize sled entry")
}
