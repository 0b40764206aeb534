// Replays `SourceEvent`s stored as JSON lines. Blank lines and `#` comments are skipped.
use crate::{
    Result,
    SyncError,
    app::log_source::{
        LogSource,
        SourceEvent,
    },
};
use anyhow::Context;
use std::path::Path;
use tokio::{
    fs::File,
    io::{
        AsyncBufReadExt,
        BufReader,
    },
};
use tokio_stream::{
    StreamExt,
    wrappers::LinesStream,
};

pub struct FileLogSource {
    lines: LinesStream<BufReader<File>>,
    line_number: usize,
}

impl FileLogSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .with_context(|| format!("open log file {}", path.display()))
            .map_err(SyncError::Source)?;
        Ok(Self {
            lines: LinesStream::new(BufReader::new(file).lines()),
            line_number: 0,
        })
    }
}

impl LogSource for FileLogSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        while let Some(line) = self.lines.next().await {
            self.line_number += 1;
            let line = line
                .with_context(|| format!("read log file line {}", self.line_number))
                .map_err(SyncError::Source)?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let event = serde_json::from_str(trimmed)
                .with_context(|| format!("parse log file line {}", self.line_number))
                .map_err(SyncError::Source)?;
            return Ok(Some(event));
        }
        Ok(None)
    }
}
