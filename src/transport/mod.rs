//! Broker transport: durable byte-message publish/subscribe.
//!
//! The transport moves opaque payloads; what they mean is decided by the
//! interchange.
//!
//! # Components
//!
//! - [`Publisher`]: publishes to one queue, reconnecting on transient errors
//! - [`Subscriber`]: single active consumer on one durable queue, running on
//!   its own task and handing deliveries into a channel
//! - [`Connector`]: opens a [`QueueChannel`] against a concrete broker
//!   ([`MemoryBroker`] in-process, `AmqpConnector` for RabbitMQ)
//!
//! # Delivery guarantees
//!
//! A delivery is acknowledged only after a hand-off slot is reserved for it,
//! and handed off only after the ack succeeds. Anything delivered but not
//! acknowledged when a consumer goes away is returned to the head of the
//! queue and delivered to the next active consumer.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod backoff;
pub mod memory;
pub mod publisher;
pub mod subscriber;

use async_trait::async_trait;

use crate::config::QueueInfo;
use crate::error::TransportError;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use backoff::Backoff;
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use subscriber::{Subscriber, SubscriberHandle};

/// A message handed to a consumer, awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel bound to `queue`, declaring the queue if needed.
    async fn open(&self, queue: &QueueInfo) -> Result<Box<dyn QueueChannel>, TransportError>;
}

#[async_trait]
pub trait QueueChannel: Send {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Drop every ready message; returns how many were removed.
    async fn purge(&mut self) -> Result<u32, TransportError>;

    /// Register as a consumer of the bound queue.
    async fn consume(&mut self, consumer_tag: &str)
        -> Result<Box<dyn QueueConsumer>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next delivery. `Ok(None)` means the broker cancelled us.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&mut self, tag: u64) -> Result<(), TransportError>;
}
