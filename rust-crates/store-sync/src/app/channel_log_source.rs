// FIFO in front of the single ingestion consumer. Any number of producers may hold a
// `LogSender`; their events are consumed strictly in arrival order.
use crate::{
    Result,
    SyncError,
    app::log_source::{
        LogSource,
        SourceEvent,
    },
    config::SyncConfig,
    logs::BlockLogBatch,
};
use tokio::sync::mpsc;

pub struct ChannelLogSource {
    recv: mpsc::Receiver<SourceEvent>,
}

#[derive(Clone)]
pub struct LogSender {
    send: mpsc::Sender<SourceEvent>,
}

impl ChannelLogSource {
    pub fn new(capacity: usize) -> (Self, LogSender) {
        let (send, recv) = mpsc::channel(capacity.max(1));
        (Self { recv }, LogSender { send })
    }

    /// Queue bounded by the configured `queue_capacity`.
    pub fn from_config(config: &SyncConfig) -> (Self, LogSender) {
        Self::new(config.queue_capacity)
    }
}

impl LogSource for ChannelLogSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        Ok(self.recv.recv().await)
    }
}

impl LogSender {
    /// Waits for queue capacity, then enqueues `event`.
    pub async fn send(&self, event: SourceEvent) -> Result<()> {
        self.send.send(event).await.map_err(|_| {
            SyncError::Source(anyhow::anyhow!("ingestion consumer has shut down"))
        })
    }

    pub async fn send_batch(&self, batch: BlockLogBatch) -> Result<()> {
        self.send(SourceEvent::Batch(batch)).await
    }

    pub async fn send_latest_block(&self, block_number: u64) -> Result<()> {
        self.send(SourceEvent::LatestBlock { block_number }).await
    }

    pub fn is_closed(&self) -> bool {
        self.send.is_closed()
    }

    /// Drains `source` into the queue in order. Returns the number of events forwarded.
    pub async fn forward<Source: LogSource>(self, mut source: Source) -> Result<u64> {
        let mut forwarded = 0;
        while let Some(event) = source.next_event().await? {
            self.send(event).await?;
            forwarded += 1;
        }
        tracing::debug!(forwarded, "log source drained into ingestion queue");
        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSource {
        events: VecDeque<SourceEvent>,
    }

    impl LogSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
            Ok(self.events.pop_front())
        }
    }

    #[tokio::test]
    async fn from_config__bounds_queue_by_queue_capacity() {
        // given
        let config =
            SyncConfig::from_json_str(r#"{ "tables": [], "queue_capacity": 2 }"#).unwrap();

        // when
        let (_source, sender) = ChannelLogSource::from_config(&config);
        sender.send_latest_block(1).await.unwrap();
        sender.send_latest_block(2).await.unwrap();

        // then
        assert_eq!(sender.send.max_capacity(), 2);
        assert!(
            sender
                .send
                .try_send(SourceEvent::LatestBlock { block_number: 3 })
                .is_err()
        );
    }

    #[tokio::test]
    async fn forward__preserves_order_and_closes_queue() {
        // given
        let (mut source, sender) = ChannelLogSource::new(1);
        let upstream = ScriptedSource {
            events: (1..=3)
                .map(|block_number| SourceEvent::LatestBlock { block_number })
                .collect(),
        };

        // when
        let producer = tokio::spawn(sender.forward(upstream));
        let mut received = Vec::new();
        while let Some(event) = source.next_event().await.unwrap() {
            received.push(event);
        }

        // then
        assert_eq!(producer.await.unwrap().unwrap(), 3);
        assert_eq!(
            received,
            (1..=3)
                .map(|block_number| SourceEvent::LatestBlock { block_number })
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn forward__fails_once_consumer_is_gone() {
        // given
        let (source, sender) = ChannelLogSource::new(1);
        drop(source);
        let upstream = ScriptedSource {
            events: VecDeque::from([SourceEvent::LatestBlock { block_number: 1 }]),
        };

        // when
        let result = sender.forward(upstream).await;

        // then
        assert!(matches!(result, Err(SyncError::Source(_))));
    }
}
