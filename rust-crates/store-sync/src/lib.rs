pub mod app;

pub mod config;

pub mod error;

pub mod logs;

pub mod pipeline;

pub mod progress;

pub mod query;

pub mod schema;

pub mod store;

pub mod value;

pub use error::{
    Result,
    SyncError,
};
pub use pipeline::{
    BatchOutcome,
    IngestionPipeline,
    PipelineState,
};
pub use progress::{
    ProgressTracker,
    SyncProgress,
    SyncStep,
};
pub use query::{
    Projection,
    Selection,
};
pub use store::{
    KeyFilter,
    Record,
    RecordStore,
    StoreReader,
    Subscription,
};
