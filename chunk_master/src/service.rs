//! Background scanner loops driving the control plane.
//!
//! Each loop follows the same shape: do one bounded pass under the master
//! lock, release it, then sleep or exit on shutdown. Errors inside a pass are
//! logged and backed off; the loops never terminate the process.

use crate::{seal_chunk_via_quorum, ChunkMaster, JournalQuorumClient, SealCandidate};
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically drain the refresh queue and the RF update queue.
pub async fn run_refresh_loop(master: Arc<Mutex<ChunkMaster>>, shutdown: CancellationToken) {
    let period = master.lock().config_refresh_period();
    loop {
        if shutdown.is_cancelled() {
            info!("chunk refresh loop shutdown");
            return;
        }

        {
            let mut master = master.lock();
            master.refresh_pass();
            master.rf_update_pass();
        }

        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

/// Periodically expire node leases. Runs only while this peer leads.
pub async fn run_lease_loop(
    master: Arc<Mutex<ChunkMaster>>,
    period: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("node lease loop shutdown");
            return;
        }

        master.lock().expire_node_leases();

        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

/// Periodically seal ready journal chunks through the quorum client.
///
/// Seal candidates are captured under the lock; the quorum I/O runs without
/// it, bounded by the seal semaphore. Failures requeue the chunk after the
/// configured backoff.
pub async fn run_seal_loop(
    master: Arc<Mutex<ChunkMaster>>,
    client: Arc<dyn JournalQuorumClient>,
    shutdown: CancellationToken,
) {
    let (period, backoff, max_concurrent) = {
        let master = master.lock();
        (
            master.config_refresh_period(),
            master.config_seal_backoff(),
            master.config_max_concurrent_seals(),
        )
    };
    let semaphore = async_core::AsyncSemaphore::new(max_concurrent);

    loop {
        if shutdown.is_cancelled() {
            info!("chunk seal loop shutdown");
            return;
        }

        let candidates = master.lock().seal_pass();
        for candidate in candidates {
            let Some(guard) = semaphore.try_acquire() else {
                // Out of seal slots; the chunk is re-queued for a later pass.
                master.lock().schedule_chunk_seal(candidate.chunk_id);
                break;
            };
            let master = Arc::clone(&master);
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let _guard = guard;
                seal_one(master, client, candidate, backoff).await;
            });
        }

        tokio::select!(
            _ = tokio::time::sleep(period) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

async fn seal_one(
    master: Arc<Mutex<ChunkMaster>>,
    client: Arc<dyn JournalQuorumClient>,
    candidate: SealCandidate,
    backoff: Duration,
) {
    // Transient quorum failures retry in place; once the sleep budget is
    // spent the chunk goes back onto the seal queue.
    let mut retry = backoff::Backoff::new(&backoff::BackoffConfig {
        init_backoff: backoff,
        max_backoff: backoff * 8,
        base: 2.0,
        deadline: Some(backoff * 20),
    });
    let sealed = retry
        .retry_all_errors("seal journal chunk", || {
            seal_chunk_via_quorum(&candidate, client.as_ref())
        })
        .await;

    match sealed {
        Ok(row_count) => {
            let result = master.lock().seal_chunk(candidate.chunk_id, row_count);
            if let Err(e) = result {
                warn!(chunk_id = %candidate.chunk_id, %e, "sealing mutation failed");
            }
        }
        Err(e) => {
            warn!(chunk_id = %candidate.chunk_id, %e, "error sealing journal chunk, re-queueing");
            master.lock().schedule_chunk_seal(candidate.chunk_id);
        }
    }
}

impl ChunkMaster {
    pub(crate) fn config_refresh_period(&self) -> Duration {
        self.config.chunk_refresh_period
    }

    pub(crate) fn config_seal_backoff(&self) -> Duration {
        self.config.sealer.chunk_seal_backoff
    }

    pub(crate) fn config_max_concurrent_seals(&self) -> usize {
        self.config.sealer.max_concurrent_chunk_seals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::test_fixture::TestMaster;
    use crate::Result;
    use async_trait::async_trait;
    use chunk_model::ChunkTreeRef;
    use data_types::{
        ChunkId, ChunkListKind, ChunkMeta, EntityKind, MiscExt, NodeId, ReplicaIndex,
        ReplicationPolicy, DEFAULT_MEDIUM,
    };

    #[derive(Debug)]
    struct FixedRowCountClient(i64);

    #[async_trait]
    impl JournalQuorumClient for FixedRowCountClient {
        async fn abort_sessions(
            &self,
            _chunk_id: ChunkId,
            _replicas: &[NodeId],
            _read_quorum: u8,
        ) -> Result<()> {
            Ok(())
        }

        async fn compute_quorum_row_count(
            &self,
            _chunk_id: ChunkId,
            _replicas: &[NodeId],
            _read_quorum: u8,
        ) -> Result<i64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn seal_loop_seals_ready_chunks() {
        let mut fixture = TestMaster::new();
        let a = fixture.online_node(1);
        let b = fixture.online_node(2);
        let chunk = fixture.master.create_chunk(
            EntityKind::JournalChunk,
            ReplicationPolicy::with_factor(2),
            2,
            2,
        );
        fixture
            .master
            .confirm_chunk(
                chunk,
                ChunkMeta {
                    misc: Some(MiscExt {
                        sealed: false,
                        ..Default::default()
                    }),
                    blocks: None,
                },
                vec![
                    (a, DEFAULT_MEDIUM, ReplicaIndex::GENERIC),
                    (b, DEFAULT_MEDIUM, ReplicaIndex::GENERIC),
                ],
            )
            .unwrap();
        let root = fixture.master.create_chunk_list(ChunkListKind::JournalRoot);
        fixture
            .master
            .attach(root, &[ChunkTreeRef::Chunk(chunk)])
            .unwrap();
        fixture.master.schedule_chunk_seal(chunk);

        let master = Arc::new(Mutex::new(fixture.master));
        let shutdown = CancellationToken::new();
        let loop_handle = tokio::spawn(run_seal_loop(
            Arc::clone(&master),
            Arc::new(FixedRowCountClient(77)),
            shutdown.clone(),
        ));

        // Wait for the loop to seal the chunk.
        for _ in 0..100 {
            if master.lock().forest().chunk(chunk).unwrap().is_sealed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        loop_handle.await.unwrap();

        let master = master.lock();
        let sealed = master.forest().chunk(chunk).unwrap();
        assert!(sealed.is_sealed());
        assert_eq!(sealed.row_count(), 77);
    }
}
