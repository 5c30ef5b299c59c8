//! RabbitMQ transport over AMQP 0-9-1.

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_stream::StreamExt;

use crate::config::QueueInfo;
use crate::error::TransportError;
use crate::transport::{Connector, Delivery, QueueChannel, QueueConsumer};

const PERSISTENT: u8 = 2;

/// Opens AMQP channels against the broker named in each [`QueueInfo`].
///
/// Queues are declared durable with `x-single-active-consumer`, so the broker
/// itself enforces exclusive consumption and failover.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    prefetch: u16,
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self { prefetch: 1 }
    }
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        let message = err.to_string();
        let normalized = message.to_uppercase().replace(['-', '_', ' '], "");
        if normalized.contains("ACCESSREFUSED") || normalized.contains("NOTALLOWED") {
            TransportError::Fatal(message)
        } else {
            TransportError::Transient(message)
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, queue: &QueueInfo) -> Result<Box<dyn QueueChannel>, TransportError> {
        let connection =
            Connection::connect(&queue.connection_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let mut arguments = FieldTable::default();
        arguments.insert("x-single-active-consumer".into(), AMQPValue::Boolean(true));
        channel
            .queue_declare(
                &queue.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;

        tracing::debug!(queue = %queue.queue, "AMQP channel open");
        Ok(Box::new(AmqpChannel {
            connection,
            channel,
            queue: queue.clone(),
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    queue: QueueInfo,
}

#[async_trait]
impl QueueChannel for AmqpChannel {
    async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                &self.queue.exchange,
                self.queue.routing_key(),
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;
        if confirm.is_nack() {
            return Err(TransportError::Transient(
                "publish not confirmed by broker".to_string(),
            ));
        }
        Ok(())
    }

    async fn purge(&mut self) -> Result<u32, TransportError> {
        Ok(self
            .channel
            .queue_purge(&self.queue.queue, QueuePurgeOptions::default())
            .await?)
    }

    async fn consume(
        &mut self,
        consumer_tag: &str,
    ) -> Result<Box<dyn QueueConsumer>, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            consumer,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            self.channel.close(200, "interchange closing").await?;
        }
        if self.connection.status().connected() {
            self.connection.close(200, "interchange closing").await?;
        }
        Ok(())
    }
}

struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, TransportError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
            })),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }
}
