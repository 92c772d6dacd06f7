//! The worker side of a burst.
//!
//! A worker walks `Connecting → AnnouncingReady → WaitingForGo → Bursting → Done`.  It binds its
//! go queue before it announces readiness, so a go published after the last ready signal always
//! reaches it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use crate::broker::{Broker, QueueId, Route, Signal, Subscription};
use crate::store::{Document, DocumentStore};
use crate::{now, BurstConfig, Error, Metrics, Mode, TimestampTrace, WorkerId};

/// The names a worker needs to find the coordinator and the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rendezvous {
    /// The collection every worker writes its document into.
    pub collection: String,
    /// The fanout exchange the go signal is published on.
    pub exchange: String,
    /// The coordinator's private queue for ready signals.
    pub ready_queue: QueueId,
}

/// Timing knobs for a worker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerOptions {
    /// How long to pause after connecting and before announcing readiness.
    pub settle_delay: Duration,
    /// How long to wait for go before failing.  `None` waits forever.
    pub go_timeout: Option<Duration>,
}

/// Where a worker is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Connecting,
    AnnouncingReady,
    WaitingForGo,
    Bursting,
    Done,
}

#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    config: BurstConfig,
    rendezvous: Rendezvous,
    options: WorkerOptions,
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn Broker>,
    metrics: Metrics,
    phase: Phase,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WorkerId,
        config: BurstConfig,
        rendezvous: Rendezvous,
        options: WorkerOptions,
        store: Arc<dyn DocumentStore>,
        broker: Arc<dyn Broker>,
        metrics: Metrics,
    ) -> Self {
        Worker {
            id,
            config,
            rendezvous,
            options,
            store,
            broker,
            metrics,
            phase: Phase::Connecting,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, phase: Phase) {
        tracing::debug!(worker = %self.id, from = ?self.phase, to = ?phase, "worker transition");
        self.phase = phase;
    }

    /// The document a writer upserts and a reader seeds.
    pub fn payload(&self) -> Document {
        serde_json::json!({ "body": "0".repeat(self.config.payload_size_bytes()) })
    }

    /// Run the worker to completion and return the timestamp of every operation of the burst.
    pub async fn run(self) -> Result<TimestampTrace, Error> {
        let span = tracing::info_span!("worker", worker = %self.id, mode = self.config.mode().verb());
        self.run_phases().instrument(span).await
    }

    async fn run_phases(mut self) -> Result<TimestampTrace, Error> {
        self.connect().await?;
        self.transition(Phase::AnnouncingReady);
        let mut go = self.announce_ready().await?;
        self.transition(Phase::WaitingForGo);
        self.wait_for_go(&mut go).await?;
        self.transition(Phase::Bursting);
        let trace = self.burst().await?;
        self.transition(Phase::Done);
        tracing::info!(operations = trace.len(), "burst complete");
        Ok(trace)
    }

    async fn connect(&self) -> Result<(), Error> {
        if self.config.mode() == Mode::Read {
            self.store
                .put(&self.rendezvous.collection, &self.id.key(), &self.payload())
                .await?;
        }
        if !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }
        Ok(())
    }

    async fn announce_ready(&self) -> Result<Subscription, Error> {
        let go = self.broker.declare_private_queue().await?;
        self.broker.bind(go.id(), &self.rendezvous.exchange).await?;
        self.broker
            .publish(
                Route::Queue(&self.rendezvous.ready_queue),
                Signal::Ready(self.id),
            )
            .await?;
        Ok(go)
    }

    async fn wait_for_go(&self, go: &mut Subscription) -> Result<(), Error> {
        let id = self.id;
        match go
            .consume_until(self.options.go_timeout, |signal| match signal {
                Signal::Go => Some(()),
                Signal::Ready(_) => None,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(crate::broker::BrokerError::Timeout { timeout, .. }) => {
                Err(Error::GoTimeout(id, timeout))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn burst(&self) -> Result<TimestampTrace, Error> {
        let duration = self.config.burst_duration();
        let collection = &self.rendezvous.collection;
        let key = self.id.key();
        let doc = self.payload();
        let mut trace = TimestampTrace::new();
        let start = Instant::now();
        while start.elapsed() < duration {
            match self.config.mode() {
                Mode::Write => {
                    self.store.put(collection, &key, &doc).await?;
                }
                Mode::Read => {
                    if self.store.get(collection, &key).await?.is_none() {
                        return Err(Error::DocumentMissing {
                            worker: self.id,
                            key,
                        });
                    }
                }
            }
            trace.push(now());
            // Abort only lands at a suspension point, and the memory store never suspends.
            tokio::task::yield_now().await;
        }
        let counter = match self.config.mode() {
            Mode::Write => &self.metrics.writes,
            Mode::Read => &self.metrics.reads,
        };
        counter.add(trace.len() as u64, &[]);
        Ok(trace)
    }
}
