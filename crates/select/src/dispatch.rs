use tokio::sync::mpsc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Decides where stream deliveries run, e.g. marshalled onto a UI thread.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs jobs on the publishing thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Dispatcher for Inline {
    fn dispatch(&self, job: Job) { job() }
}

/// Queues jobs for an owner loop to drain with [`JobQueue::run_pending`].
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

pub struct JobQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl QueueDispatcher {
    pub fn new() -> (Self, JobQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobQueue { rx })
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::trace!("dispatch: queue closed, job dropped");
        }
    }
}

impl JobQueue {
    /// Run every job queued so far; returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait for the next job and run it. `false` once every dispatcher is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn queue_defers_until_drained() {
        let (d, mut q) = QueueDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            d.dispatch(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(q.run_pending(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(q.run_pending(), 0);
    }

    #[tokio::test]
    async fn run_next_stops_once_dispatchers_are_gone() {
        let (d, mut q) = QueueDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.dispatch(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        drop(d);
        assert!(q.run_next().await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!q.run_next().await);
    }
}
