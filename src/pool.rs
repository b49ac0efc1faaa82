use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
    #[error("worker pool is stopped")]
    Stopped,
}

/// Runs submitted tasks with at most `max_workers` in flight.
///
/// The queue is unbounded, so [`WorkerPool::submit`] never blocks the
/// caller; concurrency is bounded only at the point tasks start.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Task>,
    stop: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let (queue, tasks) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(max_workers.clamp(1, Semaphore::MAX_PERMITS)));
        let dispatcher = tokio::spawn(dispatch(tasks, permits, stop.clone()));

        WorkerPool {
            queue,
            stop,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue
            .send(Box::pin(task))
            .map_err(|_| PoolError::Stopped)
    }

    /// Stops accepting work and waits until everything already queued or
    /// running has finished.
    pub async fn stop_wait(&self) {
        self.stop.cancel();
        let dispatcher = self.dispatcher.lock().await.take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!("worker pool dispatcher failed: {e}");
            }
        }
    }
}

async fn dispatch(
    mut tasks: mpsc::UnboundedReceiver<Task>,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
) {
    let mut running = JoinSet::new();

    loop {
        let task = tokio::select! {
            task = tasks.recv() => task,
            () = stop.cancelled() => {
                // refuse new submissions but keep draining what is queued
                tasks.close();
                tasks.recv().await
            }
        };
        let Some(task) = task else { break };
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        running.spawn(async move {
            task.await;
            drop(permit);
        });
        while let Some(finished) = running.try_join_next() {
            if let Err(e) = finished {
                error!("worker task failed: {e}");
            }
        }
    }

    while let Some(finished) = running.join_next().await {
        if let Err(e) = finished {
            error!("worker task failed: {e}");
        }
    }
    debug!("worker pool drained");
}
