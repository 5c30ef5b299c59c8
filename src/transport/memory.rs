//! In-process broker with durable-queue semantics.
//!
//! Behaves like a RabbitMQ queue declared with `x-single-active-consumer`:
//! messages wait in FIFO order until a consumer is attached, only the
//! earliest-registered live consumer is fed, and anything it leaves unacked
//! goes back to the head of the queue for whoever takes over.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::QueueInfo;
use crate::error::TransportError;
use crate::transport::{Connector, Delivery, QueueChannel, QueueConsumer};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Bumped to drop every open connection at once.
    epoch: u64,
    next_consumer_id: u64,
    refusal: Option<String>,
    publish_faults: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    /// Registration order; the front consumer is the active one.
    consumers: VecDeque<u64>,
    unacked: BTreeMap<u64, (u64, Pending)>,
    next_tag: u64,
}

#[derive(Debug, Clone)]
struct Pending {
    payload: Vec<u8>,
    redelivered: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for a consumer.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Drop every open connection, as a broker restart would.
    pub fn sever_connections(&self) {
        self.shared.lock().epoch += 1;
        self.shared.notify.notify_waiters();
        tracing::debug!("Memory broker severed all connections");
    }

    /// Reject new connections with an access error until
    /// [`accept_connections`](Self::accept_connections) is called.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.shared.lock().refusal = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        self.shared.lock().refusal = None;
    }

    /// Make the next `count` publishes fail with a transient channel error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.lock().publish_faults = count;
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, queue: &QueueInfo) -> Result<Box<dyn QueueChannel>, TransportError> {
        let mut state = self.shared.lock();
        if let Some(reason) = &state.refusal {
            return Err(TransportError::Fatal(format!("ACCESS_REFUSED - {}", reason)));
        }
        state.queues.entry(queue.queue.clone()).or_default();
        Ok(Box::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            queue: queue.queue.clone(),
            epoch: state.epoch,
            closed: false,
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    queue: String,
    epoch: u64,
    closed: bool,
}

impl MemoryChannel {
    fn check(&self, state: &BrokerState) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else if state.epoch != self.epoch {
            Err(TransportError::Transient(
                "connection reset by broker".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueChannel for MemoryChannel {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            self.check(&state)?;
            if state.publish_faults > 0 {
                state.publish_faults -= 1;
                return Err(TransportError::Transient(
                    "channel closed during publish".to_string(),
                ));
            }
            state
                .queues
                .entry(self.queue.clone())
                .or_default()
                .ready
                .push_back(Pending {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn purge(&mut self) -> Result<u32, TransportError> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        let queue = state.queues.entry(self.queue.clone()).or_default();
        let purged = queue.ready.len() as u32;
        queue.ready.clear();
        Ok(purged)
    }

    async fn consume(
        &mut self,
        consumer_tag: &str,
    ) -> Result<Box<dyn QueueConsumer>, TransportError> {
        let mut state = self.shared.lock();
        self.check(&state)?;
        state.next_consumer_id += 1;
        let id = state.next_consumer_id;
        state
            .queues
            .entry(self.queue.clone())
            .or_default()
            .consumers
            .push_back(id);
        tracing::debug!(queue = %self.queue, consumer_tag, id, "Memory consumer registered");
        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            queue: self.queue.clone(),
            id,
            epoch: self.epoch,
            registered: true,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
    epoch: u64,
    registered: bool,
}

impl MemoryConsumer {
    fn try_take(&mut self) -> Result<Option<Delivery>, TransportError> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        if state.epoch != self.epoch || !self.registered {
            let released = self.release_locked(&mut state);
            drop(state);
            if released {
                shared.notify.notify_waiters();
            }
            return Err(TransportError::Transient(
                "connection reset by broker".to_string(),
            ));
        }

        let queue = state.queues.entry(self.queue.clone()).or_default();
        if queue.consumers.front() != Some(&self.id) {
            return Ok(None);
        }
        let Some(pending) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.next_tag += 1;
        let tag = queue.next_tag;
        queue.unacked.insert(tag, (self.id, pending.clone()));
        Ok(Some(Delivery {
            tag,
            payload: pending.payload,
            redelivered: pending.redelivered,
        }))
    }

    /// Deregister and return unacked messages to the head of the queue,
    /// preserving their order. Returns false if already released.
    fn release_locked(&mut self, state: &mut BrokerState) -> bool {
        if !self.registered {
            return false;
        }
        self.registered = false;
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.consumers.retain(|id| *id != self.id);
            let owned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in owned.into_iter().rev() {
                if let Some((_, mut pending)) = queue.unacked.remove(&tag) {
                    pending.redelivered = true;
                    queue.ready.push_front(pending);
                }
            }
        }
        true
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), TransportError> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        if state.epoch != self.epoch {
            let released = self.release_locked(&mut state);
            drop(state);
            if released {
                shared.notify.notify_waiters();
            }
            return Err(TransportError::Transient(
                "connection reset before ack".to_string(),
            ));
        }
        let queue = state.queues.entry(self.queue.clone()).or_default();
        match queue.unacked.get(&tag) {
            Some((owner, _)) if *owner == self.id => {
                queue.unacked.remove(&tag);
                Ok(())
            }
            _ => Err(TransportError::Transient(format!(
                "unknown delivery tag {}",
                tag
            ))),
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        let released = {
            let mut state = shared.lock();
            self.release_locked(&mut state)
        };
        if released {
            shared.notify.notify_waiters();
        }
    }
}
