use crate::{
    Result,
    logs::BlockLogBatch,
};
use serde::{
    Deserialize,
    Serialize,
};

/// One message from the chain log collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEvent {
    Batch(BlockLogBatch),
    LatestBlock { block_number: u64 },
}

pub trait LogSource {
    /// Next event in delivery order; `None` once the source is exhausted.
    fn next_event(&mut self) -> impl Future<Output = Result<Option<SourceEvent>>>;
}
