//! Incremental counter of `BidCanceled` events per bidder.
//!
//! Each cycle scans `[cursor, head]` in chunks of at most `max_block_span`
//! blocks. A chunk's counts and the cursor past it land in one atomic write
//! to the `sync:cancellations` hash, guarded by the cursor value the cycle
//! started from. A failed or lost write is either applied whole or not at
//! all, and a cycle that finds the cursor moved under it stops without
//! counting anything twice.

use std::{
    cmp::min,
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::{
    cache_keys,
    configuration::SyncConfig,
    error::Error,
    handler::{HeldLock, LockManager},
    model::SyncReport,
    provider::{rpc::topic_to_address, CacheStore, ChainRpc},
    types::Log,
};

#[derive(Debug, Clone)]
pub struct EventSyncer {
    store: Arc<dyn CacheStore>,
    rpc: Arc<dyn ChainRpc>,
    config: SyncConfig,
    locks: LockManager,
}

impl EventSyncer {
    pub fn new(
        store: Arc<dyn CacheStore>,
        rpc: Arc<dyn ChainRpc>,
        config: SyncConfig,
    ) -> Self {
        let locks = LockManager::new(store.clone());
        EventSyncer {
            store,
            rpc,
            config,
            locks,
        }
    }

    /// Fire-and-forget cycle; failures are logged, never returned.
    pub async fn sync(&self) {
        match self.try_sync().await {
            Ok(report) => debug!(?report, "cancellation sync finished"),
            Err(e) => error!("cancellation sync failed: {}", e),
        }
    }

    pub async fn try_sync(&self) -> Result<SyncReport, Error> {
        let Some(lock) = self
            .locks
            .acquire(cache_keys::CANCELLATIONS_LOCK, self.config.lock_ttl)
            .await?
        else {
            debug!("cancellation sync already running");
            return Ok(SyncReport::Skipped);
        };

        let outcome = AssertUnwindSafe(self.run(&lock)).catch_unwind().await;

        if let Err(e) = self.locks.release(&lock).await {
            warn!("unable to release sync lock: {}", e);
        }

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::TaskError(String::from(
                "cancellation sync panicked",
            ))),
        }
    }

    /// Drops the counters and the cursor so the next cycle rescans from
    /// `start_block`. Returns `false` when a sync cycle holds the lock.
    pub async fn reset(&self) -> Result<bool, Error> {
        let Some(lock) = self
            .locks
            .acquire(cache_keys::CANCELLATIONS_LOCK, self.config.lock_ttl)
            .await?
        else {
            warn!("cancellation sync running, reset skipped");
            return Ok(false);
        };

        let result = self.store.del(cache_keys::CANCELLATIONS).await;

        if let Err(e) = self.locks.release(&lock).await {
            warn!("unable to release sync lock: {}", e);
        }

        result?;
        info!("cancellation counters reset");
        Ok(true)
    }

    pub async fn counters(&self) -> Result<HashMap<String, u64>, Error> {
        let mut counters = self.store.hgetall(cache_keys::CANCELLATIONS).await?;
        counters.remove(cache_keys::CANCELLATIONS_CURSOR);
        Ok(counters)
    }

    async fn run(&self, lock: &HeldLock) -> Result<SyncReport, Error> {
        let mut cursor = self
            .store
            .hget(cache_keys::CANCELLATIONS, cache_keys::CANCELLATIONS_CURSOR)
            .await?;
        let from_block = cursor.unwrap_or(self.config.start_block);
        let head = self.rpc.block_number().await?;

        if from_block >= head {
            debug!(from_block, head, "cancellations up to date");
            return Ok(SyncReport::UpToDate {
                next_block: from_block,
                head,
            });
        }

        let topics = [self.config.topic.to_owned()];
        let span = self.config.max_block_span.max(1);
        let mut next_block = from_block;
        let mut chunks = 0;
        let mut events = 0;

        while next_block <= head {
            if chunks > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }

            if !self.locks.extend(lock, self.config.lock_ttl).await? {
                return Err(Error::SyncError(String::from(
                    "sync lock lost, stopping cycle",
                )));
            }

            let chunk_end = min(next_block.saturating_add(span - 1), head);
            let logs = self
                .rpc
                .get_logs(&self.config.contract, &topics, next_block, chunk_end)
                .await?;

            let counts = count_bidders(&logs, self.config.bidder_topic_index);
            let counted: u64 = counts.iter().map(|(_, count)| count).sum();

            let committed = self
                .store
                .hincr_advance(
                    cache_keys::CANCELLATIONS,
                    &counts,
                    cache_keys::CANCELLATIONS_CURSOR,
                    cursor,
                    chunk_end + 1,
                )
                .await?;

            if !committed {
                return Err(Error::SyncError(format!(
                    "cursor moved past {:?} by another cycle, chunk {}..{} dropped",
                    cursor, next_block, chunk_end
                )));
            }

            info!(
                from = next_block,
                to = chunk_end,
                events = counted,
                "cancellation chunk synced"
            );

            next_block = chunk_end + 1;
            cursor = Some(next_block);
            chunks += 1;
            events += counted;
        }

        Ok(SyncReport::Synced {
            from_block,
            next_block,
            chunks,
            events,
        })
    }
}

fn count_bidders(logs: &[Log], bidder_topic_index: usize) -> Vec<(String, u64)> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();

    for log in logs {
        if log.removed {
            debug!(tx = ?log.transaction_hash, "skipping removed log");
            continue;
        }

        let bidder = log
            .topics
            .get(bidder_topic_index)
            .and_then(|topic| topic_to_address(topic));

        match bidder {
            Some(bidder) => *counts.entry(bidder).or_insert(0) += 1,
            None => {
                warn!(tx = ?log.transaction_hash, topics = ?log.topics, "malformed cancellation log");
            },
        }
    }

    counts.into_iter().collect()
}
