//! The coordinator side of a burst:  reset the store, gather every worker at the barrier, fire the
//! go signal, and collect traces.
//!
//! The collection and the exchange are scoped to a run.  Once [Coordinator::reset_store] has
//! succeeded, [Coordinator::run] deletes both on every exit path, whether the run succeeded, timed
//! out at the barrier, lost a worker, or was interrupted with ctrl-c.  Cleanup is best effort:  its
//! failures are logged and never replace the error that ended the run.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::aggregate::{aggregate, AggregatedSeries};
use crate::broker::{Broker, BrokerError, Route, Signal, Subscription};
use crate::config::BurstServiceConfig;
use crate::executor::{first_exit, Executor, TaskHandle, WorkerTask};
use crate::store::{reset_collection, DocumentStore};
use crate::worker::{Rendezvous, Worker, WorkerOptions};
use crate::{now, BurstConfig, Error, Metrics, Timestamp, TimestampTrace, WorkerId};

/// Everything a finished run produced.
#[derive(Clone, Debug)]
pub struct BurstReport {
    pub config: BurstConfig,
    /// The instant the go signal was published.
    pub zero_time: Timestamp,
    /// One trace per worker, in worker order.
    pub traces: Vec<TimestampTrace>,
    pub series: AggregatedSeries,
}

/// A handle on the freshly reset test collection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreHandle {
    pub collection: String,
}

#[derive(Debug)]
pub struct Coordinator {
    config: BurstConfig,
    service: BurstServiceConfig,
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn Executor>,
    metrics: Metrics,
}

impl Coordinator {
    pub fn new(
        config: BurstConfig,
        service: BurstServiceConfig,
        store: Arc<dyn DocumentStore>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn Executor>,
        metrics: Metrics,
    ) -> Self {
        Coordinator {
            config,
            service,
            store,
            broker,
            executor,
            metrics,
        }
    }

    pub fn config(&self) -> &BurstConfig {
        &self.config
    }

    /// Drop the test collection if it exists and create it empty.
    pub async fn reset_store(&self) -> Result<StoreHandle, Error> {
        let collection = self.service.database_name.clone();
        reset_collection(&*self.store, &collection).await?;
        tracing::info!(collection, "store reset");
        Ok(StoreHandle { collection })
    }

    /// Start `n` workers.  Returns as soon as they are spawned.
    pub fn start_workers(&self, n: usize, rendezvous: &Rendezvous) -> Vec<TaskHandle> {
        let options = WorkerOptions {
            settle_delay: self.service.settle_delay(),
            go_timeout: self.service.go_timeout(),
        };
        let tasks = (0..n)
            .map(|idx| {
                let worker = Worker::new(
                    WorkerId(idx),
                    self.config,
                    rendezvous.clone(),
                    options,
                    Arc::clone(&self.store),
                    Arc::clone(&self.broker),
                    self.metrics.clone(),
                );
                WorkerTask {
                    id: worker.id(),
                    run: Box::pin(worker.run()),
                }
            })
            .collect();
        tracing::info!(workers = n, "invoking workers");
        self.executor.map(tasks)
    }

    /// Wait until `n` distinct workers have announced readiness on `ready`.  A worker that
    /// announces twice is counted once.
    pub async fn await_all_ready(
        &self,
        ready: &mut Subscription,
        n: usize,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut seen = HashSet::with_capacity(n);
        let res = ready
            .consume_until(Some(timeout), |signal| match signal {
                Signal::Ready(worker) => {
                    if seen.insert(worker) {
                        self.metrics.ready.add(1, &[]);
                        tracing::debug!(worker = %worker, remaining = n - seen.len(), "worker ready");
                    } else {
                        tracing::debug!(worker = %worker, "duplicate ready signal");
                    }
                    (seen.len() >= n).then_some(())
                }
                Signal::Go => None,
            })
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(BrokerError::Timeout { timeout, .. }) => Err(Error::ReadyTimeout {
                ready: seen.len(),
                expected: n,
                timeout,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Like [Coordinator::await_all_ready], but fails as soon as any worker exits, with that
    /// worker's error.  A worker has no business exiting before go.
    pub async fn await_all_ready_or_failure(
        &self,
        ready: &mut Subscription,
        handles: &mut [TaskHandle],
        timeout: Duration,
    ) -> Result<(), Error> {
        let n = handles.len();
        tokio::select! {
            res = self.await_all_ready(ready, n, timeout) => res,
            failure = first_exit(handles) => {
                tracing::error!(code = ?failure.code(), "worker failed before the burst: {failure}");
                self.metrics.worker_failures.add(1, &[]);
                Err(failure)
            }
        }
    }

    /// Publish the go signal and return the instant it was published.
    pub async fn broadcast_go(&self) -> Result<Timestamp, Error> {
        self.broker
            .publish(Route::Exchange(&self.service.exchange_name), Signal::Go)
            .await?;
        let zero_time = now();
        self.metrics.go.add(1, &[]);
        tracing::info!(zero_time, "fire!");
        Ok(zero_time)
    }

    /// Wait for every worker and return their traces.  Any worker failure fails the run.
    pub async fn await_completion(
        &self,
        handles: Vec<TaskHandle>,
    ) -> Result<Vec<TimestampTrace>, Error> {
        self.executor.get_results(handles).await
    }

    /// Run a whole burst and aggregate the result.  Ctrl-c interrupts the run; the collection and
    /// the exchange are still removed.
    pub async fn run(&self) -> Result<BurstReport, Error> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("cannot listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run a whole burst, giving up with [Error::Interrupted] if `interrupt` completes first.
    pub async fn run_until(
        &self,
        interrupt: impl Future<Output = ()> + Send,
    ) -> Result<BurstReport, Error> {
        let span = tracing::info_span!(
            "burst",
            workers = self.config.worker_count(),
            seconds = self.config.burst_duration_seconds(),
            bytes = self.config.payload_size_bytes(),
            mode = self.config.mode().verb(),
        );
        async {
            let handle = self.reset_store().await?;
            let res = tokio::select! {
                res = self.run_scoped(&handle) => res,
                _ = interrupt => {
                    tracing::warn!("interrupted; cleaning up");
                    Err(Error::Interrupted)
                }
            };
            self.cleanup(&handle).await;
            let (zero_time, traces) = res?;
            let series = aggregate(&traces, zero_time, self.config.burst_duration());
            Ok(BurstReport {
                config: self.config,
                zero_time,
                traces,
                series,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_scoped(
        &self,
        handle: &StoreHandle,
    ) -> Result<(Timestamp, Vec<TimestampTrace>), Error> {
        self.broker
            .declare_exchange(&self.service.exchange_name)
            .await?;
        let mut ready = self.broker.declare_private_queue().await?;
        let rendezvous = Rendezvous {
            collection: handle.collection.clone(),
            exchange: self.service.exchange_name.clone(),
            ready_queue: ready.id().clone(),
        };
        // Dropping the handles on an early return aborts the workers.
        let mut handles = self.start_workers(self.config.worker_count(), &rendezvous);
        self.await_all_ready_or_failure(
            &mut ready,
            &mut handles,
            self.service.ready_timeout(),
        )
        .instrument(tracing::info_span!("await all ready"))
        .await?;
        tokio::time::sleep(self.service.go_delay()).await;
        let zero_time = self.broadcast_go().await?;
        let traces = self
            .await_completion(handles)
            .instrument(tracing::info_span!("await completion"))
            .await?;
        Ok((zero_time, traces))
    }

    async fn cleanup(&self, handle: &StoreHandle) {
        if let Err(err) = self.store.delete_collection(&handle.collection).await {
            tracing::warn!(collection = handle.collection, "could not drop collection: {err}");
        }
        if let Err(err) = self
            .broker
            .delete_exchange(&self.service.exchange_name)
            .await
        {
            tracing::warn!(
                exchange = self.service.exchange_name,
                "could not delete exchange: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::executor::TokioExecutor;
    use crate::store::MemoryStore;
    use crate::Mode;

    fn coordinator(
        workers: usize,
        broker: Arc<LocalBroker>,
    ) -> (Arc<MemoryStore>, Coordinator) {
        let store = Arc::new(MemoryStore::new());
        let service = BurstServiceConfig {
            settle_delay_ms: 0,
            go_delay_ms: 0,
            ready_timeout_ms: 2_000,
            ..BurstServiceConfig::default()
        };
        let coordinator = Coordinator::new(
            BurstConfig::new(workers, 1, 10, Mode::Write).unwrap(),
            service,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            broker,
            Arc::new(TokioExecutor::default()),
            Metrics::new(),
        );
        (store, coordinator)
    }

    #[tokio::test]
    async fn barrier_waits_for_every_worker() {
        let broker = Arc::new(LocalBroker::new());
        let (_, coordinator) = coordinator(3, Arc::clone(&broker));
        let mut ready = broker.declare_private_queue().await.unwrap();
        let id = ready.id().clone();
        for worker in [0, 1] {
            broker
                .publish(Route::Queue(&id), Signal::Ready(WorkerId(worker)))
                .await
                .unwrap();
        }
        let res = coordinator
            .await_all_ready(&mut ready, 3, Duration::from_millis(100))
            .await;
        assert!(matches!(
            res,
            Err(Error::ReadyTimeout {
                ready: 2,
                expected: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn barrier_deduplicates_ready_signals() {
        let broker = Arc::new(LocalBroker::with_redelivery(2));
        let (_, coordinator) = coordinator(2, Arc::clone(&broker));
        let mut ready = broker.declare_private_queue().await.unwrap();
        let id = ready.id().clone();
        broker
            .publish(Route::Queue(&id), Signal::Ready(WorkerId(0)))
            .await
            .unwrap();
        assert!(coordinator
            .await_all_ready(&mut ready, 2, Duration::from_millis(100))
            .await
            .is_err());
        broker
            .publish(Route::Queue(&id), Signal::Ready(WorkerId(1)))
            .await
            .unwrap();
        coordinator
            .await_all_ready(&mut ready, 1, Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn barrier_counts_distinct_workers() {
        let broker = Arc::new(LocalBroker::with_redelivery(3));
        let (_, coordinator) = coordinator(2, Arc::clone(&broker));
        let mut ready = broker.declare_private_queue().await.unwrap();
        let id = ready.id().clone();
        for worker in [0, 1] {
            broker
                .publish(Route::Queue(&id), Signal::Ready(WorkerId(worker)))
                .await
                .unwrap();
        }
        coordinator
            .await_all_ready(&mut ready, 2, Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reset_store_is_idempotent() {
        let broker = Arc::new(LocalBroker::new());
        let (store, coordinator) = coordinator(1, broker);
        let first = coordinator.reset_store().await.unwrap();
        store
            .put(&first.collection, "0", &serde_json::json!({"body": "x"}))
            .await
            .unwrap();
        let second = coordinator.reset_store().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(Some(0), store.len(&second.collection));
    }

    #[tokio::test]
    async fn run_cleans_up_after_success() {
        let broker = Arc::new(LocalBroker::new());
        let (store, coordinator) = coordinator(2, Arc::clone(&broker));
        let report = coordinator.run().await.unwrap();
        assert_eq!(2, report.traces.len());
        assert!(report.traces.iter().all(|t| !t.is_empty()));
        assert_eq!(2, report.series.per_worker.len());
        assert_eq!(
            report.traces.iter().map(|t| t.len() as u64).sum::<u64>(),
            report.series.total()
        );
        assert!(store.collections().is_empty());
        assert!(!broker.has_exchange("benchmark_fanout"));
    }
}
