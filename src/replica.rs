//! The replica runtime: drives the applier off the change log and forwards
//! submitted transactions back to the authoritative writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::applier::OpProcessor;
use crate::archive::{ArchiveLayer, ArchiveStore};
use crate::blocks::BlockStore;
use crate::cdc::{self, Operation};
use crate::error::Result;
use crate::transport::{ChangeLogConsumer, TransactionProducer};
use crate::types::Hash;

const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Attempts after which transient-failure logging escalates to error level.
const RETRY_ESCALATION: u32 = 3;

pub struct Replica {
    archive: Arc<ArchiveStore>,
    blocks: Arc<BlockStore>,
    transactions: Arc<dyn TransactionProducer>,
    sync_interval: Duration,
}

impl Replica {
    pub fn new(
        archive: Arc<ArchiveStore>,
        blocks: Arc<BlockStore>,
        transactions: Arc<dyn TransactionProducer>,
    ) -> Self {
        Self {
            archive,
            blocks,
            transactions,
            sync_interval: Duration::from_secs(30),
        }
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn archive(&self) -> &Arc<ArchiveStore> {
        &self.archive
    }

    /// Read view bound to `root`, if that root has been applied.
    pub fn layer(&self, root: Hash) -> Result<Option<ArchiveLayer>> {
        ArchiveLayer::new(self.archive.clone(), root)
    }

    /// Publish a signed transaction to the writer's transaction topic.
    /// Failures surface to the submitting caller.
    pub fn forward_transaction(&self, payload: &[u8]) -> Result<()> {
        self.transactions.emit(payload)
    }

    /// Consume the change log until it closes or `shutdown` fires. Malformed
    /// events are skipped with the offset advanced; transient substrate
    /// failures retry in place without advancing it.
    pub async fn run(
        &self,
        mut consumer: ChangeLogConsumer,
        mut processor: OpProcessor,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let topic = consumer.topic().to_string();
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();
        let mut ready = consumer.ready_signal();
        let mut caught_up = *ready.borrow();

        info!(topic = %topic, "replica applier started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(pending = processor.pending_len(), "replica shutting down");
                    break;
                }
                changed = ready.changed(), if !caught_up => {
                    caught_up = changed.is_err() || *ready.borrow();
                    if *ready.borrow() {
                        info!(topic = %topic, "replica caught up with change log");
                    }
                }
                _ = ticker.tick() => {
                    self.log_sync_status(&topic);
                }
                message = consumer.recv() => {
                    let Some(message) = message else {
                        info!("change log closed");
                        break;
                    };
                    let op = match Operation::from_bytes(&message.payload, &topic, message.offset) {
                        Ok(op) => op,
                        Err(err) => {
                            warn!(offset = message.offset, %err, "skipping undecodable change event");
                            self.persist_offset(&topic, message.offset);
                            continue;
                        }
                    };
                    if self.apply_op(&mut processor, &op, &mut shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one event, retrying transient substrate failures with a
    /// bounded-noise escalation. Returns `Err` only when shutdown
    /// interrupted an in-flight retry.
    async fn apply_op(
        &self,
        processor: &mut OpProcessor,
        op: &Operation,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), ()> {
        let mut attempts = 0u32;
        loop {
            match processor.apply(op) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    if attempts < RETRY_ESCALATION {
                        warn!(offset = op.offset, attempts, %err, "substrate write failed, retrying");
                    } else {
                        error!(offset = op.offset, attempts, %err, "substrate write still failing");
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return Err(()),
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
                Err(err) => {
                    warn!(offset = op.offset, %err, "dropping unprocessable change event");
                    self.persist_offset(op.topic.as_str(), op.offset);
                    return Ok(());
                }
            }
        }
    }

    fn persist_offset(&self, topic: &str, offset: i64) {
        if let Err(err) = cdc::persist_offset(self.archive.db().as_ref(), topic, offset) {
            warn!(offset, %err, "failed to persist stream offset");
        }
    }

    fn log_sync_status(&self, topic: &str) {
        let offset = match cdc::read_offset(self.archive.db().as_ref(), topic) {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "failed to read stream offset");
                return;
            }
        };
        let head = self.blocks.head_block().unwrap_or(None);
        let now = chrono::Utc::now().timestamp();
        match offset {
            Some(record) => {
                let head_number = head.as_ref().map(|(number, _)| *number);
                info!(
                    offset = record.offset,
                    offset_age_secs = now.saturating_sub(record.timestamp),
                    head_number,
                    "replica sync"
                );
            }
            None => info!("replica sync: no offset recorded yet"),
        }
    }
}
