//! Pub/sub signalling between the coordinator and its workers.
//!
//! The broker speaks in the vocabulary of an AMQP fanout:  named exchanges copy every message to
//! each bound queue, and private queues are owned exclusively by whoever declared them.  Messages
//! can also be published straight to a queue.  Delivery is at-least-once, so consumers must
//! tolerate duplicates.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::WorkerId;

//////////////////////////////////////////// BrokerError ///////////////////////////////////////////

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no such exchange: {0}")]
    NoSuchExchange(String),
    #[error("no such queue: {0}")]
    NoSuchQueue(QueueId),
    #[error("subscription {0} was closed")]
    Closed(QueueId),
    #[error("gave up waiting on {queue} after {timeout:?}")]
    Timeout { queue: QueueId, timeout: Duration },
}

////////////////////////////////////////////// Signal //////////////////////////////////////////////

/// The messages of the ready/go protocol.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Signal {
    /// A worker has connected, bound its go queue, and is about to wait for go.
    #[serde(rename = "ready")]
    Ready(WorkerId),
    /// Every worker is ready; start the burst.
    #[serde(rename = "go")]
    Go,
}

////////////////////////////////////////////// QueueId /////////////////////////////////////////////

/// The name of a queue.  Private queues get generated names.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct QueueId(pub String);

impl QueueId {
    fn generate() -> Self {
        QueueId(format!("amq.gen-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/////////////////////////////////////////////// Route //////////////////////////////////////////////

/// Where a published message goes.
#[derive(Clone, Copy, Debug)]
pub enum Route<'a> {
    /// Copy the message to every queue bound to the exchange.
    Exchange(&'a str),
    /// Deliver the message to exactly one queue.
    Queue(&'a QueueId),
}

/////////////////////////////////////////// Subscription ///////////////////////////////////////////

/// The receiving half of an exclusively-owned queue.  Dropping the subscription deletes the queue.
#[derive(Debug)]
pub struct Subscription {
    id: QueueId,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl Subscription {
    pub fn new(id: QueueId, rx: mpsc::UnboundedReceiver<Signal>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    /// Receive messages until `f` returns `Some`, and return that value.  Every message is offered
    /// to `f` exactly once; messages for which it returns `None` are dropped.  With a timeout,
    /// gives up once the deadline passes; without one, waits until the queue closes.
    pub async fn consume_until<T>(
        &mut self,
        timeout: Option<Duration>,
        mut f: impl FnMut(Signal) -> Option<T>,
    ) -> Result<T, BrokerError> {
        let deadline = timeout.map(|t| (tokio::time::Instant::now() + t, t));
        loop {
            let msg = match deadline {
                Some((deadline, timeout)) => {
                    match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                        Ok(msg) => msg,
                        Err(_) => {
                            return Err(BrokerError::Timeout {
                                queue: self.id.clone(),
                                timeout,
                            })
                        }
                    }
                }
                None => self.rx.recv().await,
            };
            let Some(msg) = msg else {
                return Err(BrokerError::Closed(self.id.clone()));
            };
            if let Some(t) = f(msg) {
                return Ok(t);
            }
        }
    }
}

////////////////////////////////////////////// Broker //////////////////////////////////////////////

#[async_trait::async_trait]
pub trait Broker: std::fmt::Debug + Send + Sync {
    /// Declare a fanout exchange.  Declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Delete an exchange and its bindings.  Bound queues survive.
    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a queue with a generated name, owned exclusively by the returned subscription.
    async fn declare_private_queue(&self) -> Result<Subscription, BrokerError>;

    /// Bind a queue to an exchange so that it receives a copy of everything published there.
    async fn bind(&self, queue: &QueueId, exchange: &str) -> Result<(), BrokerError>;

    /// Publish one message.
    async fn publish(&self, route: Route<'_>, signal: Signal) -> Result<(), BrokerError>;
}

//////////////////////////////////////////// LocalBroker ///////////////////////////////////////////

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, HashSet<QueueId>>,
    queues: HashMap<QueueId, mpsc::UnboundedSender<Signal>>,
}

impl BrokerState {
    fn deliver(&mut self, queue: &QueueId, signal: &Signal, copies: usize) -> bool {
        let Some(tx) = self.queues.get(queue) else {
            return false;
        };
        for _ in 0..copies {
            if tx.send(signal.clone()).is_err() {
                // The subscription was dropped, which deletes an exclusive queue.
                self.queues.remove(queue);
                for bound in self.exchanges.values_mut() {
                    bound.remove(queue);
                }
                return false;
            }
        }
        true
    }

    /// Forget every queue whose subscription has been dropped.
    fn reclaim_closed_queues(&mut self) {
        self.queues.retain(|_, tx| !tx.is_closed());
        let queues = &self.queues;
        for bound in self.exchanges.values_mut() {
            bound.retain(|queue| queues.contains_key(queue));
        }
    }
}

/// An in-process broker on tokio channels.
#[derive(Debug)]
pub struct LocalBroker {
    state: Mutex<BrokerState>,
    copies: usize,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::with_redelivery(1)
    }

    /// A broker that delivers every message `copies` times, to exercise consumers' duplicate
    /// handling.  A value of zero is treated as one.
    pub fn with_redelivery(copies: usize) -> Self {
        LocalBroker {
            state: Mutex::new(BrokerState::default()),
            copies: copies.max(1),
        }
    }

    /// True if the named exchange exists.
    pub fn has_exchange(&self, name: &str) -> bool {
        // SAFETY: Mutex poisoning.
        let state = self.state.lock().unwrap();
        state.exchanges.contains_key(name)
    }

    /// The number of live queues.
    pub fn queue_count(&self) -> usize {
        // SAFETY: Mutex poisoning.
        let state = self.state.lock().unwrap();
        state.queues.values().filter(|tx| !tx.is_closed()).count()
    }

    /// The number of queues the broker still holds, including closed ones not yet reclaimed.
    pub fn retained_queue_count(&self) -> usize {
        // SAFETY: Mutex poisoning.
        let state = self.state.lock().unwrap();
        state.queues.len()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for LocalBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        // SAFETY: Mutex poisoning.
        let mut state = self.state.lock().unwrap();
        state.reclaim_closed_queues();
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError> {
        // SAFETY: Mutex poisoning.
        let mut state = self.state.lock().unwrap();
        state.reclaim_closed_queues();
        state
            .exchanges
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NoSuchExchange(name.to_string()))
    }

    async fn declare_private_queue(&self) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = QueueId::generate();
        // SAFETY: Mutex poisoning.
        let mut state = self.state.lock().unwrap();
        state.reclaim_closed_queues();
        state.queues.insert(id.clone(), tx);
        Ok(Subscription::new(id, rx))
    }

    async fn bind(&self, queue: &QueueId, exchange: &str) -> Result<(), BrokerError> {
        // SAFETY: Mutex poisoning.
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NoSuchQueue(queue.clone()));
        }
        let Some(bound) = state.exchanges.get_mut(exchange) else {
            return Err(BrokerError::NoSuchExchange(exchange.to_string()));
        };
        bound.insert(queue.clone());
        Ok(())
    }

    async fn publish(&self, route: Route<'_>, signal: Signal) -> Result<(), BrokerError> {
        // SAFETY: Mutex poisoning.
        let mut state = self.state.lock().unwrap();
        match route {
            Route::Exchange(name) => {
                let Some(bound) = state.exchanges.get(name) else {
                    return Err(BrokerError::NoSuchExchange(name.to_string()));
                };
                let bound = bound.iter().cloned().collect::<Vec<_>>();
                for queue in bound {
                    state.deliver(&queue, &signal, self.copies);
                }
                Ok(())
            }
            Route::Queue(queue) => {
                if state.deliver(queue, &signal, self.copies) {
                    Ok(())
                } else {
                    Err(BrokerError::NoSuchQueue(queue.clone()))
                }
            }
        }
    }
}
