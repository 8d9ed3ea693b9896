//! Delayed task queue for certificate jobs
//!
//! Jobs are delivered at least once. A dispatcher task owns a `DelayQueue`
//! and hands due jobs to handler tasks, at most `workers` at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use sitehost_core::{Job, ScheduledJob};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::time::DelayQueue;

/// Longest delay a job may be queued with
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,

    #[error("Job delay of {0:?} exceeds the one year limit")]
    DelayTooLong(Duration),
}

/// Accepts jobs to run after a delay
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<ScheduledJob, QueueError>;
}

/// Runs jobs delivered by the dispatcher
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

/// In-process queue handle
#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<(ScheduledJob, Duration)>,
}

/// Receiving side of a [`MemoryQueue`]; consumed by [`Dispatcher::run`]
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<(ScheduledJob, Duration)>,
    workers: usize,
}

impl MemoryQueue {
    pub fn new(workers: usize) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            Dispatcher {
                rx,
                workers: workers.max(1),
            },
        )
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<ScheduledJob, QueueError> {
        if delay > MAX_DELAY {
            return Err(QueueError::DelayTooLong(delay));
        }
        let scheduled = ScheduledJob::new(job, delay);
        self.tx
            .send((scheduled.clone(), delay))
            .map_err(|_| QueueError::Closed)?;
        tracing::info!(
            "Enqueued {} as {} (runs at {})",
            scheduled.job,
            scheduled.id,
            scheduled.run_after.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(scheduled)
    }
}

impl Dispatcher {
    /// Deliver due jobs until every queue handle is dropped and no
    /// delayed job remains
    pub async fn run(mut self, handler: Arc<dyn JobHandler>) {
        let mut delayed: DelayQueue<ScheduledJob> = DelayQueue::new();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut open = true;

        tracing::info!("Task dispatcher started with {} workers", self.workers);

        loop {
            tokio::select! {
                msg = self.rx.recv(), if open => match msg {
                    Some((scheduled, delay)) => {
                        delayed.insert(scheduled, delay);
                    }
                    None => open = false,
                },
                Some(expired) = delayed.next() => {
                    let scheduled = expired.into_inner();
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let handler = handler.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        tracing::debug!("Running {} ({})", scheduled.job, scheduled.id);
                        if let Err(e) = handler.handle(scheduled.job.clone()).await {
                            tracing::error!(
                                "Job {} ({}) failed: {:#}",
                                scheduled.job,
                                scheduled.id,
                                e
                            );
                        }
                    });
                }
                else => break,
            }
        }

        // Wait for in-flight jobs
        let _ = permits.acquire_many(self.workers as u32).await;
        tracing::info!("Task dispatcher stopped");
    }
}

/// Queue that records jobs instead of running them
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<(Job, Duration)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(Job, Duration)> {
        self.jobs.lock().clone()
    }

    /// Remove and return everything recorded so far
    pub fn drain(&self) -> Vec<(Job, Duration)> {
        std::mem::take(&mut *self.jobs.lock())
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<ScheduledJob, QueueError> {
        self.jobs.lock().push((job.clone(), delay));
        Ok(ScheduledJob::new(job, delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitehost_core::TenantId;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) -> anyhow::Result<()> {
            let fail = matches!(job, Job::RenewAll);
            self.seen.lock().push(job);
            if fail {
                anyhow::bail!("renewal exploded");
            }
            Ok(())
        }
    }

    fn check(domain: &str) -> Job {
        Job::DnsCheck {
            tenant_id: TenantId::new(),
            domain: domain.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_in_due_order() {
        let (queue, dispatcher) = MemoryQueue::new(2);
        let recorder = Arc::new(Recorder::default());
        tokio::spawn(dispatcher.run(recorder.clone()));

        queue.enqueue(check("late.test"), Duration::from_secs(1800)).await.unwrap();
        queue.enqueue(check("early.test"), Duration::from_secs(300)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(recorder.seen.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.seen.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(1800)).await;
        let domains: Vec<String> = recorder
            .seen
            .lock()
            .iter()
            .filter_map(|j| j.domain().map(str::to_string))
            .collect();
        assert_eq!(domains, vec!["early.test", "late.test"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_does_not_stop_dispatcher() {
        let (queue, dispatcher) = MemoryQueue::new(1);
        let recorder = Arc::new(Recorder::default());
        tokio::spawn(dispatcher.run(recorder.clone()));

        queue.enqueue(Job::RenewAll, Duration::ZERO).await.unwrap();
        queue.enqueue(Job::SweepPending, Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_drains_then_stops() {
        let (queue, dispatcher) = MemoryQueue::new(1);
        let recorder = Arc::new(Recorder::default());
        let handle = tokio::spawn(dispatcher.run(recorder.clone()));

        queue.enqueue(Job::SweepPending, Duration::from_secs(60)).await.unwrap();
        drop(queue);

        handle.await.unwrap();
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_close() {
        let (queue, dispatcher) = MemoryQueue::new(1);
        drop(dispatcher);
        assert!(matches!(
            queue.enqueue(Job::RenewAll, Duration::ZERO).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_recording_queue() {
        let queue = RecordingQueue::new();
        queue.enqueue(Job::RenewAll, Duration::from_secs(1)).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain()[0].0, Job::RenewAll);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_delay_is_refused() {
        let (queue, _dispatcher) = MemoryQueue::new(1);
        let err = queue
            .enqueue(check("far.test"), Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DelayTooLong(_)));
        assert!(queue.enqueue(check("near.test"), MAX_DELAY).await.is_ok());
    }
}
