//! Transport seams: the consumed change log and the emitted transaction
//! stream.
//!
//! The broker client itself lives outside this crate; what the replica needs
//! is an ordered stream of offset-tagged messages, a signal that the
//! historical backlog has drained, and a synchronous producer handle for
//! forwarded transactions. The in-process pair below backs the test suites
//! and any embedded deployment.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{ArchiveError, Result};

/// One message from the change topic.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub payload: Vec<u8>,
    pub offset: i64,
}

/// Consuming side of the change topic.
pub struct ChangeLogConsumer {
    topic: String,
    messages: mpsc::Receiver<LogMessage>,
    ready: watch::Receiver<bool>,
}

impl ChangeLogConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<LogMessage> {
        self.messages.recv().await
    }

    /// Watch handle for the backlog-drained signal, for callers that select
    /// over it alongside message consumption.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Resolves once the historical backlog is drained and the stream is
    /// live.
    pub async fn ready(&mut self) -> Result<()> {
        while !*self.ready.borrow() {
            self.ready
                .changed()
                .await
                .map_err(|_| ArchiveError::Transport("change log producer went away".into()))?;
        }
        Ok(())
    }
}

/// In-process producer feeding a [`ChangeLogConsumer`], assigning monotonic
/// offsets the way a broker partition would.
pub struct MockLogProducer {
    sender: mpsc::Sender<LogMessage>,
    ready: watch::Sender<bool>,
    next_offset: Mutex<i64>,
}

impl MockLogProducer {
    /// Emit one message, returning its assigned offset.
    pub async fn emit(&self, payload: Vec<u8>) -> Result<i64> {
        let offset = {
            let mut next = self.next_offset.lock();
            let offset = *next;
            *next += 1;
            offset
        };
        self.sender
            .send(LogMessage { payload, offset })
            .await
            .map_err(|_| ArchiveError::Transport("change log consumer went away".into()))?;
        Ok(offset)
    }

    /// Signal that the backlog is drained.
    pub fn mark_ready(&self) {
        let _ = self.ready.send(true);
    }
}

/// Channel-backed producer/consumer pair. `first_offset` seeds the offset
/// counter, mirroring a consumer that resumes mid-stream.
pub fn mock_log_pair(
    topic: &str,
    buffer: usize,
    first_offset: i64,
) -> (MockLogProducer, ChangeLogConsumer) {
    let (sender, messages) = mpsc::channel(buffer);
    let (ready_tx, ready_rx) = watch::channel(false);
    (
        MockLogProducer {
            sender,
            ready: ready_tx,
            next_offset: Mutex::new(first_offset),
        },
        ChangeLogConsumer {
            topic: topic.to_string(),
            messages,
            ready: ready_rx,
        },
    )
}

/// Synchronous producer for the transaction topic. Publication failures
/// surface to the RPC caller that submitted the transaction.
pub trait TransactionProducer: Send + Sync {
    fn emit(&self, payload: &[u8]) -> Result<()>;
}

/// Collects forwarded transactions in memory.
#[derive(Default)]
pub struct MockTransactionProducer {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockTransactionProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl TransactionProducer for MockTransactionProducer {
    fn emit(&self, payload: &[u8]) -> Result<()> {
        self.sent.lock().push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offsets_are_monotonic_from_the_seed() {
        let (producer, mut consumer) = mock_log_pair("chain", 8, 100);
        assert_eq!(producer.emit(b"one".to_vec()).await.unwrap(), 100);
        assert_eq!(producer.emit(b"two".to_vec()).await.unwrap(), 101);

        let first = consumer.recv().await.unwrap();
        assert_eq!(first.offset, 100);
        assert_eq!(first.payload, b"one");
    }

    #[tokio::test]
    async fn ready_blocks_until_marked() {
        let (producer, mut consumer) = mock_log_pair("chain", 8, 0);
        tokio::spawn(async move {
            producer.mark_ready();
            // Keep the producer alive past the signal.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        });
        consumer.ready().await.unwrap();
    }
}
