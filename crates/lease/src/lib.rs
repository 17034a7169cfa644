//! Lease heartbeat loop: renews one lease per tracked node on a fixed cadence,
//! independent of stage processing and bounded by its own worker limit.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use rustc_hash::FxHashSet;
use stagehand_apply::with_timeout;
use stagehand_core::{ClientError, EngineConfig, LeaseClient};
use stagehand_schedule::DelayQueue;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub holder: String,
    pub duration_secs: i32,
    pub interval: Duration,
    pub parallelism: usize,
    pub request_timeout: Duration,
}

impl LeaseConfig {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            holder: cfg.lease_holder.clone(),
            duration_secs: i32::try_from(cfg.lease_duration_secs).unwrap_or(i32::MAX),
            interval: cfg.lease_renew_interval(),
            parallelism: cfg.lease_parallelism.max(1),
            request_timeout: cfg.request_timeout,
        }
    }
}

enum Command {
    Track(String),
    Untrack(String),
}

/// Handle for adding and removing nodes.
#[derive(Clone)]
pub struct LeaseHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl LeaseHandle {
    pub fn track(&self, node: impl Into<String>) {
        let _ = self.tx.send(Command::Track(node.into()));
    }

    pub fn untrack(&self, node: impl Into<String>) {
        let _ = self.tx.send(Command::Untrack(node.into()));
    }
}

pub struct HeartbeatLoop {
    cfg: LeaseConfig,
    client: Arc<dyn LeaseClient>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl HeartbeatLoop {
    pub fn new(cfg: LeaseConfig, client: Arc<dyn LeaseClient>) -> (Self, LeaseHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { cfg, client, rx }, LeaseHandle { tx })
    }

    pub fn spawn(
        cfg: LeaseConfig,
        client: Arc<dyn LeaseClient>,
        shutdown: CancellationToken,
    ) -> (LeaseHandle, tokio::task::JoinHandle<()>) {
        let (lp, handle) = Self::new(cfg, client);
        (handle, tokio::spawn(lp.run(shutdown)))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let interval = self.cfg.interval.max(Duration::from_millis(1));
        let parallelism = self.cfg.parallelism.max(1);
        let mut tracked: FxHashSet<String> = FxHashSet::default();
        let mut ticks: DelayQueue<String, ()> = DelayQueue::new();
        let mut due = DueQueue::default();
        let mut inflight: FxHashSet<String> = FxHashSet::default();
        let mut workers: JoinSet<(String, Result<(), ClientError>)> = JoinSet::new();
        info!(interval_ms = interval.as_millis() as u64, parallelism, "lease loop started");
        loop {
            while workers.len() < parallelism {
                let Some(node) = due.pop() else { break };
                if !tracked.contains(&node) || !inflight.insert(node.clone()) {
                    continue;
                }
                let client = Arc::clone(&self.client);
                let holder = self.cfg.holder.clone();
                let duration = self.cfg.duration_secs;
                let timeout = self.cfg.request_timeout;
                workers.spawn(async move {
                    let res = AssertUnwindSafe(with_timeout(timeout, client.renew(&node, &holder, duration)))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            error!(node = %node, "lease renew panicked");
                            Err(ClientError::Other("renew panicked".into()))
                        });
                    (node, res)
                });
            }
            metrics::gauge!("lease_tracked_nodes", tracked.len() as f64);
            metrics::gauge!("lease_due_nodes", due.len() as f64);
            let deadline = ticks.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => match joined {
                    Ok((node, Ok(()))) => {
                        inflight.remove(&node);
                        metrics::counter!("lease_renew_total", 1u64, "result" => "ok");
                        debug!(node = %node, "lease renewed");
                    }
                    Ok((node, Err(e))) => {
                        inflight.remove(&node);
                        metrics::counter!("lease_renew_total", 1u64, "result" => "error");
                        warn!(node = %node, error = %e, "lease renew failed; retrying next tick");
                    }
                    Err(e) => warn!(error = %e, "lease worker aborted"),
                },
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Track(node)) => {
                        if tracked.insert(node.clone()) {
                            let offset = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
                            ticks.schedule(node, Instant::now() + Duration::from_millis(offset), ());
                        }
                    }
                    Some(Command::Untrack(node)) => {
                        tracked.remove(&node);
                        ticks.cancel(&node);
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    let now = Instant::now();
                    for (node, ()) in ticks.pop_due(now) {
                        ticks.schedule(node.clone(), now + interval, ());
                        if inflight.contains(&node) || !due.push(node.clone()) {
                            debug!(node = %node, "previous renew still pending; skipping tick");
                            metrics::counter!("lease_ticks_skipped_total", 1u64);
                        }
                    }
                }
            }
        }
        workers.shutdown().await;
        info!(nodes = tracked.len(), "lease loop stopped");
    }
}

/// FIFO of nodes waiting for a renew slot. A node is queued at most once.
#[derive(Default)]
struct DueQueue {
    order: VecDeque<String>,
    queued: FxHashSet<String>,
}

impl DueQueue {
    /// False when the node is already waiting.
    fn push(&mut self, node: String) -> bool {
        if !self.queued.insert(node.clone()) {
            return false;
        }
        self.order.push_back(node);
        true
    }

    fn pop(&mut self) -> Option<String> {
        let node = self.order.pop_front()?;
        self.queued.remove(&node);
        Some(node)
    }

    fn len(&self) -> usize { self.order.len() }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use stagehand_apply::memory::MemoryCluster;

    fn cfg() -> LeaseConfig {
        LeaseConfig {
            holder: "stagehand".into(),
            duration_secs: 40,
            interval: Duration::from_millis(100),
            parallelism: 2,
            request_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn engine_config_maps_to_quarter_interval() {
        let c = LeaseConfig::from_engine(&EngineConfig::default());
        assert_eq!(c.interval, Duration::from_secs(10));
        assert_eq!(c.duration_secs, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn renews_each_tracked_node_on_cadence() {
        let cluster = Arc::new(MemoryCluster::new());
        let shutdown = CancellationToken::new();
        let (handle, join) = HeartbeatLoop::spawn(cfg(), cluster.clone(), shutdown.clone());
        for n in ["n1", "n2", "n3"] {
            handle.track(n);
        }
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        for n in ["n1", "n2", "n3"] {
            let renewals = cluster.lease(n).map(|l| l.renewals).unwrap_or(0);
            assert!((9..=11).contains(&renewals), "{n}: {renewals}");
        }

        handle.untrack("n2");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let before = cluster.lease("n2").map(|l| l.renewals).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cluster.lease("n2").map(|l| l.renewals), Some(before));
        assert!(cluster.lease("n1").map(|l| l.renewals).unwrap_or(0) > before);

        shutdown.cancel();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_on_next_tick() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.inject_failure(ClientError::Transport("down".into()));
        let shutdown = CancellationToken::new();
        let (handle, _join) = HeartbeatLoop::spawn(cfg(), cluster.clone(), shutdown.clone());
        handle.track("n1");
        tokio::time::sleep(Duration::from_millis(350)).await;
        let renewals = cluster.lease("n1").map(|l| l.renewals).unwrap_or(0);
        assert!(renewals >= 2, "renewals={renewals}");
        shutdown.cancel();
    }

    #[test]
    fn due_queue_holds_each_node_once() {
        let mut q = DueQueue::default();
        assert!(q.push("n1".into()));
        assert!(!q.push("n1".into()));
        assert!(q.push("n2".into()));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().as_deref(), Some("n1"));
        assert!(q.push("n1".into()));
        assert_eq!(q.pop().as_deref(), Some("n2"));
        assert_eq!(q.pop().as_deref(), Some("n1"));
        assert_eq!(q.pop(), None);
    }

    /// Renews take `latency`; counts calls.
    struct SlowLeases {
        latency: Duration,
        calls: AtomicUsize,
        panic_first: AtomicBool,
    }

    #[async_trait::async_trait]
    impl LeaseClient for SlowLeases {
        async fn renew(&self, node: &str, _holder: &str, _duration_secs: i32) -> stagehand_core::ClientResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_first.swap(false, Ordering::SeqCst) {
                panic!("renew of {node} blew up");
            }
            tokio::time::sleep(self.latency).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_renewals_do_not_pile_up() {
        let leases = Arc::new(SlowLeases {
            latency: Duration::from_millis(350),
            calls: AtomicUsize::new(0),
            panic_first: AtomicBool::new(false),
        });
        let shutdown = CancellationToken::new();
        let (handle, _join) = HeartbeatLoop::spawn(cfg(), leases.clone(), shutdown.clone());
        handle.track("n1");
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        // one renew in flight at a time; ticks that land meanwhile are skipped
        let calls = leases.calls.load(Ordering::SeqCst);
        assert!((4..=7).contains(&calls), "calls={calls}");
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_renew_is_retried() {
        let leases = Arc::new(SlowLeases {
            latency: Duration::from_millis(1),
            calls: AtomicUsize::new(0),
            panic_first: AtomicBool::new(true),
        });
        let shutdown = CancellationToken::new();
        let (handle, _join) = HeartbeatLoop::spawn(cfg(), leases.clone(), shutdown.clone());
        handle.track("n1");
        tokio::time::sleep(Duration::from_millis(350)).await;
        let calls = leases.calls.load(Ordering::SeqCst);
        assert!(calls >= 3, "calls={calls}");
        shutdown.cancel();
    }
}
