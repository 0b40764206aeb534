use crate::{
    Result,
    SyncError,
    app::{
        log_source::{
            LogSource,
            SourceEvent,
        },
        snapshot_storage::{
            NoSnapshotStorage,
            SnapshotStorage,
        },
    },
    pipeline::{
        BatchOutcome,
        IngestionPipeline,
    },
};
use tracing_subscriber::EnvFilter;

pub mod channel_log_source;
pub mod file_log_source;
pub mod in_memory_snapshot_storage;
pub mod log_source;
pub mod sled_storage;
pub mod snapshot_storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Continue,
    /// A batch failed; the pipeline waits for [`SyncSession::resume`].
    Halted,
    Exit,
}

/// Drives one ingestion pipeline from one log source. Dropping the session, or
/// resolving the interrupt passed to [`SyncSession::run`], stops consumption without
/// rolling back applied blocks.
pub struct SyncSession<Source, Snapshots = NoSnapshotStorage> {
    source: Source,
    pipeline: IngestionPipeline<Snapshots>,
}


pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

impl<Source, Snapshots> SyncSession<Source, Snapshots> {
    pub fn new(source: Source, pipeline: IngestionPipeline<Snapshots>) -> Self {
        Self { source, pipeline }
    }

    pub fn pipeline(&self) -> &IngestionPipeline<Snapshots> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut IngestionPipeline<Snapshots> {
        &mut self.pipeline
    }

    pub fn into_parts(self) -> (Source, IngestionPipeline<Snapshots>) {
        (self.source, self.pipeline)
    }
}

impl<Source: LogSource, Snapshots: SnapshotStorage> SyncSession<Source, Snapshots> {
    /// Restores persisted state. Returns the block the source should deliver next.
    pub fn start(&mut self) -> Result<u64> {
        match self.pipeline.restore()? {
            Some(block) => tracing::info!(
                block,
                resume_from = self.pipeline.resume_from(),
                "resuming from persisted snapshot"
            ),
            None => tracing::info!("starting sync from an empty store"),
        }
        Ok(self.pipeline.resume_from())
    }

    pub fn resume_from(&self) -> u64 {
        self.pipeline.resume_from()
    }

    /// Clears a halt after a failed batch; see [`IngestionPipeline::resume`].
    pub fn resume(&mut self) -> u64 {
        self.pipeline.resume()
    }

    /// Processes at most one source event.
    pub async fn run(&mut self, interrupt: impl Future<Output = ()>) -> Result<RunState> {
        if self.pipeline.is_halted() {
            return Ok(RunState::Halted);
        }
        tokio::select! {
            event = self.source.next_event() => {
                match event? {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::info!(
                            current_block = ?self.pipeline.current_block(),
                            "log source exhausted"
                        );
                        Ok(RunState::Exit)
                    }
                }
            }
            _ = interrupt => {
                tracing::info!(
                    resume_from = self.pipeline.resume_from(),
                    "sync session interrupted"
                );
                Ok(RunState::Exit)
            }
        }
    }

    /// Runs until the source is exhausted, the interrupt resolves or a batch fails.
    pub async fn run_to_end(
        &mut self,
        interrupt: impl Future<Output = ()>,
    ) -> Result<RunState> {
        tokio::pin!(interrupt);
        loop {
            match self.run(&mut interrupt).await? {
                RunState::Continue => continue,
                state => return Ok(state),
            }
        }
    }

    fn handle_event(&mut self, event: SourceEvent) -> Result<RunState> {
        match event {
            SourceEvent::LatestBlock { block_number } => {
                self.pipeline.observe_latest_block(block_number);
                Ok(RunState::Continue)
            }
            SourceEvent::Batch(batch) => match self.pipeline.apply_batch(batch) {
                Ok(BatchOutcome::Applied { .. } | BatchOutcome::Discarded { .. }) => {
                    Ok(RunState::Continue)
                }
                Err(err) if err.halts_ingestion() => Ok(RunState::Halted),
                Err(err @ SyncError::Halted { .. }) => {
                    tracing::debug!(error = %err, "batch rejected while halted");
                    Ok(RunState::Halted)
                }
                Err(err) => Err(err),
            },
        }
    }
}
