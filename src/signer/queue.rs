//! Rate-limited wrapper around a signer backend
//!
//! Each wrapped backend gets two queues, one for fetches and one for
//! updates and removals, each drained by its own worker. A worker runs
//! one operation at a time and starts the next only when doing so keeps
//! the number of operations completed in any one second window within
//! the queue's budget. Throttle replies from the backend make the worker
//! sleep for the hinted time and repeat the same operation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};

use super::{GatewayError, SignerBackend};
use crate::dns::protocol::{DnsRecord, QueryType};
use crate::engine::shutdown::ShutdownCoordinator;
use crate::store::Signer;

const QUEUE_CAPACITY: usize = 1024;

/// Per-second budgets of one rate-limited backend
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub fetch_per_sec: u32,
    pub update_per_sec: u32,
    /// Throttle replies tolerated for one operation before giving up
    pub throttle_retries: u32,
}

enum JobKind {
    Fetch {
        rrtype: QueryType,
    },
    Update {
        inserts: Vec<Vec<DnsRecord>>,
        removes: Vec<Vec<DnsRecord>>,
        /// What the backend asked to read first, fetched on the fetch queue
        current: Vec<(QueryType, Vec<DnsRecord>)>,
    },
    Remove {
        rrsets: Vec<Vec<DnsRecord>>,
    },
}

struct Job {
    signer: Signer,
    zone: String,
    owner: String,
    kind: JobKind,
    response: oneshot::Sender<Result<Vec<DnsRecord>, GatewayError>>,
}

impl Job {
    async fn run(&self, backend: &dyn SignerBackend) -> Result<Vec<DnsRecord>, GatewayError> {
        match self.kind {
            JobKind::Fetch { rrtype } => {
                backend
                    .fetch_rrset(&self.signer, &self.zone, &self.owner, rrtype)
                    .await
            }
            JobKind::Update {
                ref inserts,
                ref removes,
                ref current,
            } => backend
                .update_with(&self.signer, &self.zone, &self.owner, inserts, removes, current)
                .await
                .map(|_| Vec::new()),
            JobKind::Remove { ref rrsets } => backend
                .remove_rrset(&self.signer, &self.zone, &self.owner, rrsets)
                .await
                .map(|_| Vec::new()),
        }
    }
}

/// Sliding one-second window over completion times
struct Window {
    budget: usize,
    completed: VecDeque<Instant>,
}

impl Window {
    fn new(per_sec: u32) -> Window {
        let budget = per_sec.max(1) as usize;
        Window {
            budget,
            completed: VecDeque::with_capacity(budget + 1),
        }
    }

    /// Waits until one more completion cannot exceed the budget.
    async fn wait_turn(&self) {
        if self.completed.len() >= self.budget {
            if let Some(oldest) = self.completed.front() {
                sleep_until(*oldest + Duration::from_secs(1)).await;
            }
        }
    }

    fn record(&mut self, at: Instant) {
        self.completed.push_back(at);
        while self.completed.len() > self.budget {
            self.completed.pop_front();
        }
    }
}

struct Worker {
    name: String,
    queue: &'static str,
    backend: Arc<dyn SignerBackend>,
    window: Window,
    retries: u32,
    depth: Arc<AtomicUsize>,
}

impl Worker {
    async fn process(&mut self, job: Job) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        let mut throttled = 0;

        let result = loop {
            self.window.wait_turn().await;
            let result = job.run(&*self.backend).await;
            self.window.record(Instant::now());

            match result {
                Err(GatewayError::Throttled { retry_after }) if throttled < self.retries => {
                    throttled += 1;
                    let hold = retry_after.max(Duration::from_secs(1));
                    log::warn!(
                        "{} {} queue throttled by signer {}, retrying in {}s ({}/{})",
                        self.name,
                        self.queue,
                        job.signer.name,
                        hold.as_secs(),
                        throttled,
                        self.retries
                    );
                    sleep(hold).await;
                }
                other => break other,
            }
        };

        // The caller may have given up waiting.
        let _ = job.response.send(result);
    }

    /// Drains the queue until every sender is gone. A shutdown closes the
    /// queue to new work; operations already queued still run.
    async fn run(mut self, mut rx: mpsc::Receiver<Job>, mut shutdown: Option<broadcast::Receiver<()>>) {
        loop {
            let next = match shutdown.as_mut() {
                Some(signal) => {
                    tokio::select! {
                        job = rx.recv() => Some(job),
                        _ = signal.recv() => None,
                    }
                }
                None => Some(rx.recv().await),
            };

            let job = match next {
                Some(job) => job,
                None => {
                    log::info!(
                        "{} {} queue closing, draining {} operation(s)",
                        self.name,
                        self.queue,
                        self.depth.load(Ordering::Relaxed)
                    );
                    rx.close();
                    shutdown = None;
                    continue;
                }
            };

            match job {
                Some(job) => self.process(job).await,
                None => break,
            }
        }
        log::debug!("{} {} worker stopped", self.name, self.queue);
    }
}

/// A backend whose operations go through rate-limited queues
pub struct RateLimited {
    method: &'static str,
    fetch_tx: mpsc::Sender<Job>,
    update_tx: mpsc::Sender<Job>,
    fetch_depth: Arc<AtomicUsize>,
    update_depth: Arc<AtomicUsize>,
    inner: Arc<dyn SignerBackend>,
}

impl RateLimited {
    /// Wraps `inner` and registers it as `method`. Spawns the two
    /// workers, so it must be called from within a tokio runtime.
    pub fn new(
        method: &'static str,
        inner: Arc<dyn SignerBackend>,
        limits: QueueLimits,
        shutdown: Option<&ShutdownCoordinator>,
    ) -> RateLimited {
        let (fetch_tx, fetch_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (update_tx, update_rx) = mpsc::channel(QUEUE_CAPACITY);
        let fetch_depth = Arc::new(AtomicUsize::new(0));
        let update_depth = Arc::new(AtomicUsize::new(0));

        for (queue, rx, per_sec, depth) in [
            ("fetch", fetch_rx, limits.fetch_per_sec, fetch_depth.clone()),
            ("update", update_rx, limits.update_per_sec, update_depth.clone()),
        ] {
            let worker = Worker {
                name: method.to_string(),
                queue,
                backend: inner.clone(),
                window: Window::new(per_sec),
                retries: limits.throttle_retries,
                depth,
            };
            let signal = shutdown.map(|s| s.subscribe());
            let guard = shutdown.map(|s| s.register_worker());
            tokio::spawn(async move {
                worker.run(rx, signal).await;
                drop(guard);
            });
        }

        log::info!(
            "Rate-limited backend {} started: {} fetch/s, {} update/s",
            method,
            limits.fetch_per_sec,
            limits.update_per_sec
        );

        RateLimited {
            method,
            fetch_tx,
            update_tx,
            fetch_depth,
            update_depth,
            inner,
        }
    }

    async fn submit(
        &self,
        update_queue: bool,
        signer: &Signer,
        zone: &str,
        owner: &str,
        kind: JobKind,
    ) -> Result<Vec<DnsRecord>, GatewayError> {
        let (tx, depth) = if update_queue {
            (&self.update_tx, &self.update_depth)
        } else {
            (&self.fetch_tx, &self.fetch_depth)
        };
        let (response, rx) = oneshot::channel();
        let job = Job {
            signer: signer.clone(),
            zone: zone.to_string(),
            owner: owner.to_string(),
            kind,
            response,
        };

        depth.fetch_add(1, Ordering::Relaxed);
        if tx.send(job).await.is_err() {
            depth.fetch_sub(1, Ordering::Relaxed);
            return Err(GatewayError::Transport(format!(
                "{} queue is shut down",
                self.method
            )));
        }
        rx.await.map_err(|_| {
            GatewayError::Transport(format!("{} worker dropped the operation", self.method))
        })?
    }
}

#[async_trait]
impl SignerBackend for RateLimited {
    fn method(&self) -> &'static str {
        self.method
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> Result<Vec<DnsRecord>, GatewayError> {
        self.submit(false, signer, zone, owner, JobKind::Fetch { rrtype })
            .await
    }

    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        // Reads an update depends on count against the fetch budget.
        let mut current = Vec::new();
        for rrtype in self.inner.update_reads(inserts, removes) {
            let records = self
                .submit(false, signer, zone, owner, JobKind::Fetch { rrtype })
                .await?;
            current.push((rrtype, records));
        }
        let kind = JobKind::Update {
            inserts: inserts.to_vec(),
            removes: removes.to_vec(),
            current,
        };
        self.submit(true, signer, zone, owner, kind).await.map(|_| ())
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrsets: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        let kind = JobKind::Remove {
            rrsets: rrsets.to_vec(),
        };
        self.submit(true, signer, zone, owner, kind).await.map(|_| ())
    }

    async fn login(&self, signer: &Signer) -> Result<String, GatewayError> {
        self.inner.login(signer).await
    }

    async fn logout(&self, signer: &Signer) -> Result<String, GatewayError> {
        self.inner.logout(signer).await
    }

    fn queue_depths(&self) -> (usize, usize) {
        (
            self.fetch_depth.load(Ordering::Relaxed),
            self.update_depth.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::memory::MemoryBackend;
    use crate::signer::METHOD_MEMORY;

    fn signer() -> Signer {
        Signer {
            name: "h1".to_string(),
            method: "rlmemory".to_string(),
            auth: String::new(),
            address: String::new(),
            port: 443,
            usetcp: true,
            usetsig: false,
        }
    }

    fn max_in_any_second(times: &[Instant]) -> usize {
        let mut best = 0;
        for (i, start) in times.iter().enumerate() {
            let n = times[i..]
                .iter()
                .take_while(|t| **t < *start + Duration::from_secs(1))
                .count();
            best = best.max(n);
        }
        best
    }

    #[tokio::test]
    async fn test_fetch_budget_is_respected() {
        let memory = Arc::new(MemoryBackend::new());
        let limited = Arc::new(RateLimited::new(
            "rlmemory",
            memory.clone(),
            QueueLimits {
                fetch_per_sec: 2,
                update_per_sec: 1,
                throttle_retries: 5,
            },
            None,
        ));

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limited = limited.clone();
            handles.push(tokio::spawn(async move {
                limited
                    .fetch_rrset(&signer(), "example.com.", "example.com.", QueryType::Ns)
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert!(start.elapsed() < Duration::from_secs(6));
        let times = memory.call_times();
        assert_eq!(times.len(), 10);
        assert!(max_in_any_second(&times) <= 2);
    }

    #[tokio::test]
    async fn test_throttle_is_retried() {
        let memory = Arc::new(MemoryBackend::new());
        memory.throttle_next(2, Duration::from_secs(1));
        let limited = RateLimited::new(
            "rlmemory",
            memory.clone(),
            QueueLimits {
                fetch_per_sec: 2,
                update_per_sec: 2,
                throttle_retries: 5,
            },
            None,
        );

        let result = limited
            .fetch_rrset(&signer(), "example.com.", "example.com.", QueryType::Ns)
            .await;
        assert!(result.is_ok());
        assert_eq!(memory.call_times().len(), 3);
        assert_eq!(limited.queue_depths(), (0, 0));
    }

    #[tokio::test]
    async fn test_throttle_past_budget_is_surfaced() {
        let memory = Arc::new(MemoryBackend::new());
        memory.throttle_next(10, Duration::from_secs(1));
        let limited = RateLimited::new(
            "rlmemory",
            memory.clone(),
            QueueLimits {
                fetch_per_sec: 5,
                update_per_sec: 5,
                throttle_retries: 1,
            },
            None,
        );

        let result = limited
            .update(&signer(), "example.com.", "example.com.", &[], &[])
            .await;
        assert!(matches!(result, Err(GatewayError::Throttled { .. })));
        assert_eq!(memory.call_times().len(), 2);
        assert_eq!(memory.method(), METHOD_MEMORY);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(5));
        let memory = Arc::new(MemoryBackend::with_latency(Duration::from_millis(20)));
        let limited = Arc::new(RateLimited::new(
            "rlmemory",
            memory.clone(),
            QueueLimits {
                fetch_per_sec: 10,
                update_per_sec: 10,
                throttle_retries: 0,
            },
            Some(&shutdown),
        ));
        assert_eq!(shutdown.worker_count(), 2);

        let queued = {
            let limited = limited.clone();
            tokio::spawn(async move {
                limited
                    .fetch_rrset(&signer(), "example.com.", "example.com.", QueryType::Ns)
                    .await
            })
        };
        tokio::task::yield_now().await;

        drop(limited);
        shutdown.shutdown().await.unwrap();
        assert!(queued.await.unwrap().is_ok());
    }
}
