//! Threading Primitives
//!
//! Playback streams each run on a named [`Thread`]. Stopping one must never
//! block the caller, so the join is handed to a [`ThreadPool`] whose workers
//! wait a bounded time and move on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::{PlatformError, PlatformResult};

/// Queue depth of a pool; submissions beyond it fail instead of blocking
const POOL_QUEUE_DEPTH: usize = 1024;

/// Named thread that can be joined with a deadline
pub struct Thread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn `body` on a new thread called `name`
    pub fn spawn<F>(name: impl Into<String>, body: F) -> PlatformResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| PlatformError::Thread(format!("cannot start '{}': {}", name, e)))?;

        Ok(Self {
            name,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// Returns `true` if it finished and was joined. On timeout the thread is
    /// detached and left to notice its stop flag on its own.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::debug!("Detaching '{}' after {:?}", self.name, timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if handle.join().is_err() {
            log::warn!("Thread '{}' panicked", self.name);
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of workers draining a bounded job queue.
///
/// Dropping the pool closes the queue; workers finish every job already
/// queued before they exit.
pub struct ThreadPool {
    queue: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    outstanding: Arc<AtomicUsize>,
}

impl ThreadPool {
    /// Start `workers` threads named `<name>-<index>`
    pub fn new(name: &str, workers: usize) -> PlatformResult<Self> {
        let (queue, jobs) = bounded::<Job>(POOL_QUEUE_DEPTH);
        let outstanding = Arc::new(AtomicUsize::new(0));

        let workers = (0..workers.max(1))
            .map(|index| spawn_worker(format!("{}-{}", name, index), jobs.clone(), outstanding.clone()))
            .collect::<PlatformResult<Vec<_>>>()?;

        Ok(Self {
            queue: Some(queue),
            workers,
            outstanding,
        })
    }

    /// Queue a job without blocking.
    ///
    /// Fails when the queue is full or the workers are gone; the job is then
    /// dropped without running.
    pub fn submit<F>(&self, job: F) -> PlatformResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(queue) = &self.queue else {
            return Err(PlatformError::Thread("pool is shut down".into()));
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = queue.try_send(Box::new(job)) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            let reason = match err {
                TrySendError::Full(_) => "queue is full",
                TrySendError::Disconnected(_) => "workers are gone",
            };
            return Err(PlatformError::Thread(format!("cannot queue job: {}", reason)));
        }
        Ok(())
    }

    /// Jobs queued or running
    pub fn pending_tasks(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Block until every submitted job has run
    pub fn wait_all(&self) {
        while self.pending_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn spawn_worker(
    name: String,
    jobs: Receiver<Job>,
    outstanding: Arc<AtomicUsize>,
) -> PlatformResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            for job in jobs.iter() {
                job();
                outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        })
        .map_err(|e| PlatformError::Thread(format!("cannot start worker '{}': {}", name, e)))
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.queue.take();
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("pool worker").to_owned();
            if worker.join().is_err() {
                log::warn!("Worker '{}' panicked", name);
            }
        }
    }
}
