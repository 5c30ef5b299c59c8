use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueInfo, TransportConfig};
use crate::error::TransportError;
use crate::transport::{Backoff, Connector, QueueChannel, QueueConsumer};

/// How a consuming session ended without an error.
enum SessionEnd {
    Killed,
    HandOffClosed,
}

/// Consumes one durable queue and hands each delivery into `out`.
///
/// Runs on its own task so a stalled broker never blocks the caller.
/// A delivery is acknowledged only once a hand-off slot is reserved for it,
/// and handed off only once the ack succeeded. On kill or disconnect anything
/// not yet acknowledged stays with the broker.
pub struct Subscriber {
    connector: Arc<dyn Connector>,
    queue: QueueInfo,
    out: mpsc::Sender<Vec<u8>>,
    kill: CancellationToken,
    backoff: Backoff,
    consumer_tag: String,
}

impl Subscriber {
    pub fn new(
        connector: Arc<dyn Connector>,
        queue: QueueInfo,
        out: mpsc::Sender<Vec<u8>>,
        config: &TransportConfig,
    ) -> Self {
        let consumer_tag = format!("interchange-{}", uuid::Uuid::new_v4());
        Self {
            connector,
            queue,
            out,
            kill: CancellationToken::new(),
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            consumer_tag,
        }
    }

    /// Use an externally owned kill signal.
    pub fn with_kill_signal(mut self, kill: CancellationToken) -> Self {
        self.kill = kill;
        self
    }

    pub fn spawn(self) -> SubscriberHandle {
        let kill = self.kill.clone();
        let handle = tokio::spawn(self.run());
        SubscriberHandle { kill, handle }
    }

    /// Consume until killed, the hand-off is closed, or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), TransportError> {
        loop {
            if self.kill.is_cancelled() {
                return Ok(());
            }

            let opened = tokio::select! {
                biased;
                _ = self.kill.cancelled() => return Ok(()),
                opened = self.open_session() => opened,
            };

            let error = match opened {
                Ok((mut channel, consumer)) => {
                    self.backoff.reset();
                    tracing::info!(
                        queue = %self.queue.queue,
                        consumer_tag = %self.consumer_tag,
                        "Subscribed to queue"
                    );
                    let ended = self.consume(consumer).await;
                    if let Err(e) = channel.close().await {
                        tracing::debug!(error = %e, "Error closing subscriber channel");
                    }
                    match ended {
                        Ok(SessionEnd::Killed) => {
                            tracing::info!(queue = %self.queue.queue, "Subscriber disconnected");
                            return Ok(());
                        }
                        Ok(SessionEnd::HandOffClosed) => {
                            tracing::info!(queue = %self.queue.queue, "Hand-off closed, subscriber stopping");
                            return Ok(());
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if error.is_fatal() {
                tracing::error!(queue = %self.queue.queue, error = %error, "Subscriber failed");
                return Err(error);
            }

            let delay = self.backoff.next_delay();
            tracing::warn!(
                queue = %self.queue.queue,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Subscriber lost connection, reconnecting"
            );
            if self.sleep_or_kill(delay).await {
                return Ok(());
            }
        }
    }

    async fn open_session(
        &self,
    ) -> Result<(Box<dyn QueueChannel>, Box<dyn QueueConsumer>), TransportError> {
        let mut channel = self.connector.open(&self.queue).await?;
        let consumer = channel.consume(&self.consumer_tag).await?;
        Ok((channel, consumer))
    }

    async fn consume(
        &self,
        mut consumer: Box<dyn QueueConsumer>,
    ) -> Result<SessionEnd, TransportError> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.kill.cancelled() => return Ok(SessionEnd::Killed),
                delivery = consumer.next_delivery() => delivery?,
            };
            let Some(delivery) = delivery else {
                return Err(TransportError::Transient(
                    "consumer cancelled by broker".to_string(),
                ));
            };

            // Reserve, ack, then hand off: nothing is handed off unless its ack landed.
            let permit = tokio::select! {
                biased;
                _ = self.kill.cancelled() => return Ok(SessionEnd::Killed),
                permit = self.out.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(SessionEnd::HandOffClosed),
                },
            };
            consumer.ack(delivery.tag).await?;
            permit.send(delivery.payload);
        }
    }

    /// Returns true if killed while waiting.
    async fn sleep_or_kill(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.kill.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

/// Owner's view of a running [`Subscriber`].
pub struct SubscriberHandle {
    kill: CancellationToken,
    handle: JoinHandle<Result<(), TransportError>>,
}

impl SubscriberHandle {
    pub fn kill_signal(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Collect the outcome of a subscriber that has already stopped on its own.
    pub async fn join(self) -> Result<(), TransportError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Transient(format!("subscriber task failed: {}", e))),
        }
    }

    /// Signal the subscriber to disconnect and wait up to `timeout` for it.
    pub async fn stop(self, timeout: Duration) -> Result<(), TransportError> {
        self.kill.cancel();
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TransportError::Transient(format!("subscriber task failed: {}", e))),
            Err(_) => {
                tracing::warn!("Subscriber did not stop in time, aborting");
                handle.abort();
                Ok(())
            }
        }
    }
}
