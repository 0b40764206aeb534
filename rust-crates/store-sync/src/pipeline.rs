// Log ingestion. Batches are decoded and staged in full before anything becomes
// visible; a batch either commits completely or leaves the store and the current block
// untouched and halts ingestion until `resume` is called.
use crate::{
    Result,
    SyncError,
    app::snapshot_storage::{
        NoSnapshotStorage,
        SnapshotStorage,
    },
    logs::{
        BlockLogBatch,
        DecodedLog,
    },
    progress::{
        ProgressTracker,
        SyncProgress,
    },
    schema::Schema,
    store::{
        RecordChange,
        RecordStore,
        StagedBatch,
        StoreReader,
    },
};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ReceivingHistorical,
    /// First reached the chain head.
    CaughtUp,
    /// Applying batches after having caught up.
    Streaming,
    Error,
}

impl PipelineState {
    pub fn is_live(&self) -> bool {
        matches!(self, PipelineState::CaughtUp | PipelineState::Streaming)
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Applied {
        block_number: u64,
        changes: Vec<RecordChange>,
    },
    /// Stale or duplicate batch; nothing was applied.
    Discarded { reason: SyncError },
}

pub struct IngestionPipeline<Snapshots = NoSnapshotStorage> {
    schema: Arc<Schema>,
    store: RecordStore,
    progress: ProgressTracker,
    snapshots: Snapshots,
    state: PipelineState,
    state_before_error: PipelineState,
    current_block: Option<u64>,
    latest_block: Option<u64>,
    halted: Option<String>,
}

impl IngestionPipeline {
    pub fn new(schema: Schema) -> Self {
        Self::with_snapshots(schema, NoSnapshotStorage)
    }
}

impl<Snapshots: SnapshotStorage> IngestionPipeline<Snapshots> {
    pub fn with_snapshots(schema: Schema, snapshots: Snapshots) -> Self {
        let store = RecordStore::new(&schema);
        Self {
            schema: Arc::new(schema),
            store,
            progress: ProgressTracker::default(),
            snapshots,
            state: PipelineState::Idle,
            state_before_error: PipelineState::Idle,
            current_block: None,
            latest_block: None,
            halted: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn reader(&self) -> StoreReader {
        self.store.reader()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn watch_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.watch()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Highest fully applied block, if any.
    pub fn current_block(&self) -> Option<u64> {
        self.current_block
    }

    pub fn latest_block(&self) -> Option<u64> {
        self.latest_block
    }

    /// First block the log source should deliver next.
    pub fn resume_from(&self) -> u64 {
        self.current_block.map_or(0, |block| block.saturating_add(1))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Loads persisted state into the store. Returns the restored block, if any.
    pub fn restore(&mut self) -> Result<Option<u64>> {
        let Some(snapshot) = self.snapshots.load().map_err(SyncError::Storage)? else {
            tracing::info!("no persisted snapshot, starting from an empty store");
            return Ok(None);
        };
        let block = snapshot.current_block;
        tracing::info!(
            block,
            records = snapshot.records.len(),
            tombstones = snapshot.tombstones.len(),
            "restoring persisted snapshot"
        );
        self.store.restore(snapshot.records, snapshot.tombstones)?;
        self.current_block = Some(block);
        self.progress.on_batch_applied(block);
        Ok(Some(block))
    }

    /// Records a chain head reported by the log source.
    pub fn observe_latest_block(&mut self, block_number: u64) {
        if self.latest_block.is_some_and(|latest| block_number < latest) {
            tracing::warn!(
                observed = block_number,
                latest = ?self.latest_block,
                "chain head regressed, ignoring"
            );
            return;
        }
        self.latest_block = Some(block_number);
        self.begin_sync();
        self.progress.on_latest_block_observed(block_number);
        self.check_live();
    }

    /// Applies one block atomically. Stale and duplicate blocks are discarded.
    pub fn apply_batch(&mut self, batch: BlockLogBatch) -> Result<BatchOutcome> {
        if let Some(reason) = &self.halted {
            return Err(SyncError::Halted {
                resume_from: self.resume_from(),
                reason: reason.clone(),
            });
        }
        let block_number = batch.block_number;
        if let Some(current) = self.current_block {
            if block_number <= current {
                tracing::warn!(
                    block = block_number,
                    current,
                    "discarding stale batch"
                );
                return Ok(BatchOutcome::Discarded {
                    reason: SyncError::OutOfOrderBatch {
                        block: block_number,
                        current,
                    },
                });
            }
        }

        let changes = match self.commit_batch(batch) {
            Ok(changes) => changes,
            Err(err) => {
                self.halt(&err, block_number);
                return Err(err);
            }
        };

        self.current_block = Some(block_number);
        self.begin_sync();
        if self.state == PipelineState::CaughtUp {
            self.state = PipelineState::Streaming;
        }
        self.progress.on_batch_applied(block_number);
        self.check_live();
        tracing::debug!(
            block = block_number,
            changes = changes.len(),
            "applied batch"
        );

        let failures = self.store.notify(block_number, &changes);
        if !failures.is_empty() {
            tracing::warn!(
                block = block_number,
                failed = failures.len(),
                "subscribers failed during notification"
            );
        }
        Ok(BatchOutcome::Applied {
            block_number,
            changes,
        })
    }

    fn commit_batch(&mut self, batch: BlockLogBatch) -> Result<Vec<RecordChange>> {
        let staged = self.stage(batch)?;
        self.snapshots
            .persist_batch(staged.block_number(), staged.changes())
            .map_err(SyncError::Storage)?;
        Ok(self.store.commit(staged))
    }

    fn stage(&self, batch: BlockLogBatch) -> Result<StagedBatch> {
        let block_number = batch.block_number;
        let decoded = self.decode(batch)?;
        let mut txn = self.store.begin();
        for log in decoded {
            txn.apply_log(log, block_number)?;
        }
        Ok(txn.finish(block_number))
    }

    /// Decodes every log in ascending log-index order before the store is touched.
    fn decode(&self, batch: BlockLogBatch) -> Result<Vec<DecodedLog>> {
        let mut logs = batch.logs;
        logs.sort_by_key(|log| log.log_index);
        let mut decoded: Vec<DecodedLog> = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.block_number != batch.block_number {
                return Err(SyncError::decode(
                    &log.table,
                    format!(
                        "log {} belongs to block {}, not batch block {}",
                        log.log_index, log.block_number, batch.block_number
                    ),
                ));
            }
            if decoded
                .last()
                .is_some_and(|previous| previous.log_index == log.log_index)
            {
                return Err(SyncError::decode(
                    &log.table,
                    format!(
                        "duplicate log index {} in block {}",
                        log.log_index, batch.block_number
                    ),
                ));
            }
            decoded.push(log.decode(&self.schema)?);
        }
        Ok(decoded)
    }

    fn begin_sync(&mut self) {
        if self.state == PipelineState::Idle {
            self.state = PipelineState::ReceivingHistorical;
        }
        self.progress.begin_sync();
    }

    fn check_live(&mut self) {
        if self.progress.is_live() {
            return;
        }
        let (Some(current), Some(latest)) = (self.current_block, self.latest_block) else {
            return;
        };
        if current < latest {
            return;
        }
        match self.state {
            PipelineState::Error => self.state_before_error = PipelineState::CaughtUp,
            _ => self.state = PipelineState::CaughtUp,
        }
        self.progress.mark_live();
    }

    fn halt(&mut self, err: &SyncError, block_number: u64) {
        tracing::error!(
            block = block_number,
            resume_from = self.resume_from(),
            error = %err,
            "batch failed, halting ingestion"
        );
        if self.state != PipelineState::Error {
            self.state_before_error = self.state;
        }
        self.state = PipelineState::Error;
        self.halted = Some(err.to_string());
        self.progress.set_error(err.to_string());
    }

    /// Clears a halt. The log source should re-deliver from [`Self::resume_from`].
    pub fn resume(&mut self) -> u64 {
        if self.halted.take().is_some() {
            self.state = self.state_before_error;
            self.progress.clear_error();
            tracing::info!(resume_from = self.resume_from(), "resuming ingestion");
        }
        self.resume_from()
    }

    /// Drops in-memory tombstones at or below `up_to_block`.
    pub fn purge_tombstones(&mut self, up_to_block: u64) -> usize {
        let purged = self.store.purge_tombstones(up_to_block);
        tracing::debug!(up_to_block, purged, "purged tombstones");
        purged
    }
}
