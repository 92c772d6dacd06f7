//! Running workers.
//!
//! The executor is the seam between the coordinator and wherever workers actually run.  It maps
//! a batch of worker futures onto handles and later collects one trace per handle.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::{Error, Metrics, TimestampTrace, WorkerId};

/// A unit of work for the executor:  one worker's run, boxed so executors need not be generic.
pub struct WorkerTask {
    pub id: WorkerId,
    pub run: BoxFuture<'static, Result<TimestampTrace, Error>>,
}

impl std::fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WorkerTask").field("id", &self.id).finish()
    }
}

/// A handle to a worker that has been started.  Dropping the handle aborts the worker.
#[derive(Debug)]
pub struct TaskHandle {
    id: WorkerId,
    task: tokio::task::JoinHandle<Result<TimestampTrace, Error>>,
}

impl TaskHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Cancel the worker.  It stops at its next suspension point.
    pub fn abort(&self) {
        self.task.abort();
    }

    async fn join(&mut self) -> Result<TimestampTrace, Error> {
        match (&mut self.task).await {
            Ok(Ok(trace)) => Ok(trace),
            Ok(Err(err)) => Err(Error::WorkerFailed {
                worker: self.id,
                source: Box::new(err),
            }),
            Err(err) => Err(Error::Join(self.id, err.to_string())),
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait for the first of `handles` to exit and return why it did.  Use it while every worker is
/// expected to keep running; a worker that returns a trace is reported as a [Error::Join] because
/// it stopped early.  Never returns if `handles` is empty.  The handle that exited must not be
/// awaited again.
pub async fn first_exit(handles: &mut [TaskHandle]) -> Error {
    let mut pending = handles
        .iter_mut()
        .map(|handle| async move {
            let id = handle.id;
            match handle.join().await {
                Ok(_) => Error::Join(id, "exited before the burst began".to_string()),
                Err(err) => err,
            }
        })
        .collect::<FuturesUnordered<_>>();
    match pending.next().await {
        Some(err) => err,
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    /// Start every task in parallel.  Returns without waiting for any of them.
    fn map(&self, tasks: Vec<WorkerTask>) -> Vec<TaskHandle>;

    /// Wait for every task and return their traces in handle order.  The first failure fails the
    /// whole batch and cancels the tasks that are still running.
    async fn get_results(&self, handles: Vec<TaskHandle>) -> Result<Vec<TimestampTrace>, Error>;
}

/// Runs every worker as a task on the current tokio runtime.
#[derive(Debug, Default)]
pub struct TokioExecutor {
    metrics: Metrics,
}

impl TokioExecutor {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl Executor for TokioExecutor {
    fn map(&self, tasks: Vec<WorkerTask>) -> Vec<TaskHandle> {
        tasks
            .into_iter()
            .map(|WorkerTask { id, run }| TaskHandle {
                id,
                task: tokio::task::spawn(run),
            })
            .collect()
    }

    async fn get_results(&self, handles: Vec<TaskHandle>) -> Result<Vec<TimestampTrace>, Error> {
        let aborts = handles
            .iter()
            .map(|h| h.task.abort_handle())
            .collect::<Vec<_>>();
        let mut pending = handles
            .into_iter()
            .enumerate()
            .map(|(idx, mut handle)| async move { (idx, handle.id, handle.join().await) })
            .collect::<FuturesUnordered<_>>();
        let mut traces = vec![None; aborts.len()];
        while let Some((idx, id, joined)) = pending.next().await {
            let failure = match joined {
                Ok(trace) => {
                    traces[idx] = Some(trace);
                    continue;
                }
                Err(failure) => failure,
            };
            tracing::error!(worker = %id, code = ?failure.code(), "worker failed: {failure}");
            self.metrics.worker_failures.add(1, &[]);
            for abort in aborts.iter() {
                abort.abort();
            }
            return Err(failure);
        }
        // SAFETY:  Every index was filled or we returned early.
        Ok(traces.into_iter().map(|t| t.unwrap()).collect())
    }
}
