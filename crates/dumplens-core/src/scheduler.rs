//! Named worker-pool queues with keyed lanes and interval jobs.
//!
//! Each queue owns a fixed number of tokio workers pulling from one FIFO
//! channel, so at most N jobs of a queue run at once and jobs start in
//! submission order. Jobs sharing a lane key run one after another.
//! Failed jobs are counted and logged, never retried.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::SchedulerError;

pub type Job = BoxFuture<'static, Result<()>>;

enum Work {
    Single(Job),
    Lane(String, Job),
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicUsize,
    running: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    peak: AtomicUsize,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub workers: usize,
    pub enqueued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    /// Highest number of jobs observed running at once.
    pub peak: usize,
}

struct Shared {
    pending: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Queue {
    name: String,
    workers: usize,
    sender: Mutex<Option<mpsc::UnboundedSender<Work>>>,
    lanes: Mutex<HashMap<String, VecDeque<Job>>>,
    counters: Counters,
}

impl Queue {
    fn submit(&self, work: Work, shared: &Shared) -> Result<(), SchedulerError> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(SchedulerError::ShutDown(self.name.clone()));
        };
        shared.pending.fetch_add(1, Ordering::SeqCst);
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        if tx.send(work).is_err() {
            self.counters.enqueued.fetch_sub(1, Ordering::SeqCst);
            shared.finish_one();
            return Err(SchedulerError::ShutDown(self.name.clone()));
        }
        Ok(())
    }

    async fn execute(&self, job: Job, shared: &Shared) {
        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(running, Ordering::SeqCst);

        let outcome = AssertUnwindSafe(job).catch_unwind().await;

        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(Ok(())) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(queue = %self.name, "job failed: {e:#}");
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(queue = %self.name, "job panicked");
            }
        }
        shared.finish_one();
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            workers: self.workers,
            enqueued: self.counters.enqueued.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            peak: self.counters.peak.load(Ordering::SeqCst),
        }
    }
}

async fn worker(
    queue: Arc<Queue>,
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Work>>>,
) {
    loop {
        let work = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(work) = work else { break };
        match work {
            Work::Single(job) => queue.execute(job, &shared).await,
            Work::Lane(key, job) => {
                let mut next = Some(job);
                while let Some(job) = next {
                    queue.execute(job, &shared).await;
                    next = {
                        let mut lanes = queue.lanes.lock();
                        let following = lanes.get_mut(&key).and_then(VecDeque::pop_front);
                        if following.is_none() {
                            lanes.remove(&key);
                        }
                        following
                    };
                }
            }
        }
    }
}

/// Resets the in-flight marker of a recurring job, even if the run panics.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct JobScheduler {
    queues: HashMap<String, Arc<Queue>>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl JobScheduler {
    /// Spawn the workers for every queue. Must be called inside a tokio runtime.
    pub fn new(queues: &BTreeMap<String, usize>) -> Self {
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut map = HashMap::new();

        for (name, workers) in queues {
            let workers = (*workers).max(1);
            let (tx, rx) = mpsc::unbounded_channel();
            let queue = Arc::new(Queue {
                name: name.clone(),
                workers,
                sender: Mutex::new(Some(tx)),
                lanes: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            });
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..workers {
                tasks.push(tokio::spawn(worker(
                    queue.clone(),
                    shared.clone(),
                    rx.clone(),
                )));
            }
            tracing::debug!(queue = %name, workers, "started queue");
            map.insert(name.clone(), queue);
        }

        Self {
            queues: map,
            shared,
            tasks: Mutex::new(tasks),
            stop_tx,
            stop_rx,
        }
    }

    fn queue(&self, name: &str) -> Result<&Arc<Queue>, SchedulerError> {
        self.queues
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownQueue(name.to_string()))
    }

    /// Submit a job; returns as soon as it is queued.
    pub fn enqueue<F>(&self, queue: &str, job: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.queue(queue)?
            .submit(Work::Single(job.boxed()), &self.shared)
    }

    /// Submit a job that must not overlap with other jobs of the same key.
    /// Jobs of one key start in submission order.
    pub fn enqueue_keyed<F>(
        &self,
        queue: &str,
        key: impl Into<String>,
        job: F,
    ) -> Result<(), SchedulerError>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let q = self.queue(queue)?;
        let key = key.into();
        let job = job.boxed();

        let mut lanes = q.lanes.lock();
        if let Some(lane) = lanes.get_mut(&key) {
            if q.sender.lock().is_none() {
                return Err(SchedulerError::ShutDown(q.name.clone()));
            }
            self.shared.pending.fetch_add(1, Ordering::SeqCst);
            q.counters.enqueued.fetch_add(1, Ordering::SeqCst);
            lane.push_back(job);
            return Ok(());
        }
        lanes.insert(key.clone(), VecDeque::new());
        if let Err(e) = q.submit(Work::Lane(key.clone(), job), &self.shared) {
            lanes.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Run `factory()` on `queue` every `period`, starting now. A tick is
    /// skipped while the previous run is still queued or running.
    pub fn schedule_recurring<F, Fut>(
        &self,
        name: &str,
        queue: &str,
        period: Duration,
        factory: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let q = self.queue(queue)?.clone();
        let shared = self.shared.clone();
        let mut stop = self.stop_rx.clone();
        if *stop.borrow() {
            return Err(SchedulerError::ShutDown(q.name.clone()));
        }
        let in_flight = Arc::new(AtomicBool::new(false));
        let name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                if in_flight.swap(true, Ordering::SeqCst) {
                    tracing::debug!(job = %name, "previous run still pending, skipping tick");
                    continue;
                }
                let guard = InFlight(in_flight.clone());
                let run = factory();
                let job = async move {
                    let _guard = guard;
                    run.await
                };
                if let Err(e) = q.submit(Work::Single(job.boxed()), &shared) {
                    tracing::debug!(job = %name, "stopping recurring job: {e}");
                    break;
                }
            }
        });
        self.tasks.lock().push(handle);
        tracing::debug!(queue, ?period, "scheduled recurring job");
        Ok(())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self.queues.values().map(|q| q.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats, SchedulerError> {
        Ok(self.queue(queue)?.stats())
    }

    /// Jobs queued or running across all queues.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Stop recurring timers, refuse new work and let workers drain what
    /// is already queued.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        for queue in self.queues.values() {
            queue.sender.lock().take();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn scheduler(queues: &[(&str, usize)]) -> JobScheduler {
        let map = queues
            .iter()
            .map(|(name, n)| (name.to_string(), *n))
            .collect();
        JobScheduler::new(&map)
    }

    #[tokio::test]
    async fn test_unknown_queue_is_rejected() {
        let s = scheduler(&[("analysis", 1)]);
        let err = s.enqueue("nope", async { Ok(()) }).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownQueue(q) if q == "nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_limit_is_respected() {
        let s = scheduler(&[("analysis", 2)]);
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let current = current.clone();
            let max_seen = max_seen.clone();
            s.enqueue("analysis", async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        s.wait_idle().await;

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        let stats = s.queue_stats("analysis").unwrap();
        assert_eq!(stats.enqueued, 10);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.running, 0);
        assert!(stats.peak <= 2 && stats.peak >= 1);
    }

    #[tokio::test]
    async fn test_single_worker_is_fifo() {
        let s = scheduler(&[("q", 1)]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            s.enqueue("q", async move {
                order.lock().push(i);
                Ok(())
            })
            .unwrap();
        }
        s.wait_idle().await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_keyed_jobs_never_overlap() {
        let s = scheduler(&[("analysis", 4)]);
        let active = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let active = active.clone();
            let overlaps = overlaps.clone();
            let order = order.clone();
            s.enqueue_keyed("analysis", "b:1", async move {
                if active.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.store(false, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
            s.enqueue_keyed("analysis", format!("other:{i}"), async { Ok(()) })
                .unwrap();
        }
        s.wait_idle().await;

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
        assert_eq!(s.queue_stats("analysis").unwrap().completed, 16);
    }

    #[tokio::test]
    async fn test_failed_job_is_not_retried() {
        let s = scheduler(&[("q", 1)]);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        s.enqueue("q", async move {
            r.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("boom")
        })
        .unwrap();
        let explode = true;
        s.enqueue("q", async move {
            if explode {
                panic!("worker must survive");
            }
            Ok(())
        })
        .unwrap();
        s.enqueue("q", async { Ok(()) }).unwrap();
        s.wait_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let stats = s.queue_stats("q").unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recurring_skips_while_in_flight() {
        let s = scheduler(&[("clustering", 2)]);
        let runs = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            s.schedule_recurring(
                "cluster",
                "clustering",
                Duration::from_millis(5),
                move || {
                    let runs = runs.clone();
                    let concurrent = concurrent.clone();
                    let max_concurrent = max_concurrent.clone();
                    async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .unwrap();
        }
        let started = Instant::now();
        while runs.load(Ordering::SeqCst) < 2 && started.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        s.shutdown().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let s = scheduler(&[("q", 1)]);
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        s.enqueue("q", async move {
            d.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        s.shutdown().await;

        assert!(done.load(Ordering::SeqCst), "queued work drains on shutdown");
        assert!(s.is_shut_down());
        assert!(matches!(
            s.enqueue("q", async { Ok(()) }),
            Err(SchedulerError::ShutDown(_))
        ));
        assert!(s.enqueue_keyed("q", "k", async { Ok(()) }).is_err());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let s = scheduler(&[("q", 1)]);
        s.wait_idle().await;
        assert_eq!(s.pending(), 0);
    }
}
