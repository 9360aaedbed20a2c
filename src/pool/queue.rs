//! Bounded priority queue of admitted jobs.
//!
//! Higher [`Priority`](crate::Priority) is served first; jobs of equal
//! priority are served in submission order via a monotonically increasing
//! sequence number.

use crate::job::{ConversionJob, JobId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

struct QueueEntry {
    seq: u64,
    job: ConversionJob,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then the lower sequence number.
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    closed: bool,
}

/// Why a push was refused. The job is handed back to the caller.
pub(crate) enum PushError {
    Full(ConversionJob),
    Closed(ConversionJob),
}

pub(crate) struct JobQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Enqueue `job`, returning the new queue depth.
    pub fn push(&self, job: ConversionJob) -> Result<usize, PushError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PushError::Closed(job));
        }
        if inner.heap.len() >= self.capacity {
            return Err(PushError::Full(job));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueEntry { seq, job });
        let depth = inner.heap.len();
        drop(inner);
        self.notify.notify_one();
        Ok(depth)
    }

    fn try_pop(&self) -> Option<Option<ConversionJob>> {
        let mut inner = self.lock();
        match inner.heap.pop() {
            Some(entry) => Some(Some(entry.job)),
            None if inner.closed => Some(None),
            None => None,
        }
    }

    /// Wait for the next job. `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<ConversionJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push or close in between is not missed.
            notified.as_mut().enable();
            if let Some(next) = self.try_pop() {
                if next.is_some() {
                    // Another job may be waiting for another worker.
                    self.notify.notify_one();
                }
                return next;
            }
            notified.await;
        }
    }

    /// Take a specific queued job out, if it is still queued.
    pub fn remove(&self, id: JobId) -> Option<ConversionJob> {
        let mut inner = self.lock();
        let mut entries = std::mem::take(&mut inner.heap).into_vec();
        let found = entries
            .iter()
            .position(|e| e.job.id == id)
            .map(|idx| entries.swap_remove(idx).job);
        inner.heap = BinaryHeap::from(entries);
        found
    }

    /// Remove every queued job, highest priority first.
    pub fn drain(&self) -> Vec<ConversionJob> {
        let mut inner = self.lock();
        let mut jobs = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            jobs.push(entry.job);
        }
        jobs
    }

    /// Refuse further pushes and wake every waiting worker.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SourceFormat, TargetFormat};
    use crate::job::{JobHandle, NewJob, Priority, QueueCancel};
    use crate::pipeline::input::ResolvedInput;
    use std::sync::{Arc, Weak};
    use std::time::{Duration, Instant};

    struct NoQueue;

    impl QueueCancel for NoQueue {
        fn cancel_queued(&self, _id: JobId) {}
    }

    fn job(priority: Priority) -> (ConversionJob, JobHandle) {
        let weak: Weak<dyn QueueCancel> = Weak::<NoQueue>::new();
        ConversionJob::create(
            NewJob {
                id: JobId::new(),
                label: format!("{priority}.txt"),
                input: ResolvedInput::InMemory {
                    name: "a.txt".into(),
                    data: b"a".to_vec(),
                },
                source_format: SourceFormat::Txt,
                target: TargetFormat::Pdf,
                priority,
                destination: None,
                post: Default::default(),
                submitted_at: Instant::now(),
                timeout: Duration::from_secs(60),
            },
            weak,
        )
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let q = JobQueue::new(10);
        let mut ids = Vec::new();
        for p in [Priority::Normal, Priority::Low, Priority::Urgent, Priority::Normal, Priority::High] {
            let (j, _h) = job(p);
            ids.push((p, j.id));
            q.push(j).ok().unwrap();
        }
        let order: Vec<JobId> = [
            q.pop().await.unwrap().id,
            q.pop().await.unwrap().id,
            q.pop().await.unwrap().id,
            q.pop().await.unwrap().id,
            q.pop().await.unwrap().id,
        ]
        .into();
        // urgent, high, normal (first), normal (second), low
        assert_eq!(order, vec![ids[2].1, ids[4].1, ids[0].1, ids[3].1, ids[1].1]);
    }

    #[test]
    fn full_queue_returns_the_job() {
        let q = JobQueue::new(1);
        q.push(job(Priority::Normal).0).ok().unwrap();
        let (j, _h) = job(Priority::Urgent);
        let id = j.id;
        match q.push(j) {
            Err(PushError::Full(back)) => assert_eq!(back.id, id),
            _ => panic!("expected Full"),
        }
    }

    #[test]
    fn remove_takes_only_that_job() {
        let q = JobQueue::new(4);
        let (a, _ha) = job(Priority::Normal);
        let (b, _hb) = job(Priority::Normal);
        let b_id = b.id;
        q.push(a).ok().unwrap();
        q.push(b).ok().unwrap();
        assert_eq!(q.remove(b_id).map(|j| j.id), Some(b_id));
        assert!(q.remove(b_id).is_none());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn close_wakes_waiting_workers() {
        let q = Arc::new(JobQueue::new(4));
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.pop().await.is_none() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert!(waiter.await.unwrap());
        assert!(matches!(q.push(job(Priority::Low).0), Err(PushError::Closed(_))));
    }

    #[tokio::test]
    async fn push_wakes_waiting_worker() {
        let q = Arc::new(JobQueue::new(4));
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.pop().await.map(|j| j.id) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (j, _h) = job(Priority::Normal);
        let id = j.id;
        q.push(j).ok().unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }
}
