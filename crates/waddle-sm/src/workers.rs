//! Partitioned dispatch workers.
//!
//! Every packet is routed to the worker owning its connection id, so packets
//! of one connection are handled one at a time and in receipt order. There
//! is no ordering across connections.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use jid::Jid;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SmError;
use crate::packet::{Packet, Results};
use crate::session_manager::SessionManager;

enum Job {
    Dispatch {
        packet: Packet,
        connection_id: Option<Jid>,
        response: oneshot::Sender<Result<Results, SmError>>,
    },
    Close {
        connection_id: Jid,
        response: oneshot::Sender<Results>,
    },
}

/// Fixed set of tokio tasks draining bounded per-worker queues.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` tasks, each with a queue of `queue_size` jobs.
    pub fn spawn(manager: Arc<SessionManager>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let cancel = CancellationToken::new();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(queue_size.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                Arc::clone(&manager),
                rx,
                cancel.clone(),
            )));
        }

        info!(workers, queue_size, "Dispatch workers started");
        Self {
            senders,
            handles,
            cancel,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Worker owning a partition key.
    pub fn worker_for(&self, key: Option<&Jid>) -> usize {
        match key {
            Some(jid) => {
                let mut hasher = DefaultHasher::new();
                jid.hash(&mut hasher);
                (hasher.finish() % self.senders.len() as u64) as usize
            }
            None => 0,
        }
    }

    /// Queue a packet and return the receiver for its results.
    ///
    /// Waits for queue capacity, so a slow connection applies backpressure
    /// to its producer.
    pub async fn enqueue(
        &self,
        packet: Packet,
    ) -> Result<oneshot::Receiver<Result<Results, SmError>>, SmError> {
        let connection_id = packet.packet_from().cloned();
        let key = connection_id.clone().or_else(|| packet.stanza_from().cloned());
        let worker = self.worker_for(key.as_ref());
        let (response, receiver) = oneshot::channel();
        self.send(
            worker,
            Job::Dispatch {
                packet,
                connection_id,
                response,
            },
        )
        .await?;
        Ok(receiver)
    }

    /// Dispatch a packet on its worker and wait for the results.
    pub async fn submit(&self, packet: Packet) -> Result<Results, SmError> {
        self.enqueue(packet)
            .await?
            .await
            .map_err(|_| SmError::dispatch("worker terminated before responding"))?
    }

    /// Close a connection on its worker, after its queued packets.
    pub async fn close(&self, connection_id: Jid) -> Result<Results, SmError> {
        let worker = self.worker_for(Some(&connection_id));
        let (response, receiver) = oneshot::channel();
        self.send(
            worker,
            Job::Close {
                connection_id,
                response,
            },
        )
        .await?;
        receiver
            .await
            .map_err(|_| SmError::dispatch("worker terminated before responding"))
    }

    async fn send(&self, worker: usize, job: Job) -> Result<(), SmError> {
        let sender = self
            .senders
            .get(worker)
            .ok_or_else(|| SmError::dispatch(format!("no worker {}", worker)))?;
        sender
            .send(job)
            .await
            .map_err(|_| SmError::dispatch("worker pool is shut down"))
    }

    /// Stop all workers and wait for them to exit.
    ///
    /// Jobs still queued are dropped; their callers see a dispatch error.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch worker panicked");
            }
        }
        info!("Dispatch workers stopped");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.senders.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn run_worker(
    index: usize,
    manager: Arc<SessionManager>,
    mut jobs: mpsc::Receiver<Job>,
    cancel: CancellationToken,
) {
    debug!(worker = index, "Dispatch worker running");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        match job {
            Job::Dispatch {
                packet,
                connection_id,
                response,
            } => {
                let session = connection_id
                    .as_ref()
                    .and_then(|id| manager.sessions().get(id));
                let result = manager.dispatch(packet, session.as_ref()).await;
                if response.send(result).is_err() {
                    debug!(worker = index, "Dispatch caller went away");
                }
            }
            Job::Close {
                connection_id,
                response,
            } => {
                let results = manager.close_session(&connection_id).await;
                let _ = response.send(results);
            }
        }
    }
    debug!(worker = index, "Dispatch worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionManagerConfig;
    use crate::registry::ProcessorRegistry;
    use crate::repository::{MemoryRepository, NonAuthRepository};
    use crate::session::SessionRegistry;

    fn pool(workers: usize) -> WorkerPool {
        let sessions = Arc::new(SessionRegistry::new("example.com", "test"));
        let repo = Arc::new(NonAuthRepository::new(Arc::new(MemoryRepository::new())));
        let manager = Arc::new(SessionManager::new(
            ProcessorRegistry::new(),
            sessions,
            repo,
            &SessionManagerConfig::default(),
        ));
        WorkerPool::spawn(manager, workers, 8)
    }

    #[tokio::test]
    async fn test_partition_is_stable() {
        let pool = pool(4);
        let id = Jid::new("c2s@example.com/conn-1").unwrap();
        let first = pool.worker_for(Some(&id));
        assert!(first < 4);
        assert_eq!(pool.worker_for(Some(&id)), first);
        assert_eq!(pool.worker_for(None), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_to_closed_queue_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let pool = WorkerPool {
            senders: vec![tx],
            handles: Vec::new(),
            cancel: CancellationToken::new(),
        };
        let packet = Packet::new("<presence xmlns='jabber:client'/>".parse().unwrap()).unwrap();
        assert!(matches!(pool.submit(packet).await, Err(SmError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_close_unknown_connection() {
        let pool = pool(2);
        let results = pool
            .close(Jid::new("c2s@example.com/conn-9").unwrap())
            .await
            .unwrap();
        assert!(results.is_empty());
        pool.shutdown().await;
    }
}
