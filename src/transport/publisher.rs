use std::sync::Arc;

use crate::config::{QueueInfo, TransportConfig};
use crate::error::TransportError;
use crate::transport::{Backoff, Connector, QueueChannel};

/// Publishes payloads to a single broker queue.
///
/// Transient channel errors are absorbed by reconnecting and retrying the same
/// payload, up to `publish_retries` extra attempts. Fatal errors are returned
/// immediately.
pub struct Publisher {
    connector: Arc<dyn Connector>,
    queue: QueueInfo,
    channel: Option<Box<dyn QueueChannel>>,
    retries: u32,
    backoff: Backoff,
    closed: bool,
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>, queue: QueueInfo, config: &TransportConfig) -> Self {
        Self {
            connector,
            queue,
            channel: None,
            retries: config.publish_retries.max(1),
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            closed: false,
        }
    }

    pub fn queue(&self) -> &QueueInfo {
        &self.queue
    }

    /// Open the channel now rather than on first publish.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.channel().await.map(|_| ())
    }

    async fn channel(&mut self) -> Result<&mut Box<dyn QueueChannel>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.channel.is_none() {
            let channel = self.connector.open(&self.queue).await?;
            tracing::debug!(queue = %self.queue.queue, "Publisher connected");
            self.channel = Some(channel);
        }
        self.channel.as_mut().ok_or(TransportError::Closed)
    }

    pub async fn publish(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut attempt = 0;
        loop {
            let result = match self.channel().await {
                Ok(channel) => channel.publish(payload).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    if attempt > 0 {
                        self.backoff.reset();
                    }
                    return Ok(());
                }
                Err(e @ (TransportError::Fatal(_) | TransportError::Closed)) => return Err(e),
                Err(e) if attempt >= self.retries => {
                    tracing::error!(
                        queue = %self.queue.queue,
                        attempts = attempt + 1,
                        error = %e,
                        "Publish failed, giving up"
                    );
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        queue = %self.queue.queue,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, reconnecting"
                    );
                    self.channel = None;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Empty the target queue. Meant for tests and isolation, not steady state.
    pub async fn queue_purge(&mut self) -> Result<u32, TransportError> {
        let purged = self.channel().await?.purge().await?;
        tracing::info!(queue = %self.queue.queue, purged, "Queue purged");
        Ok(purged)
    }

    /// Release the channel. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::debug!(queue = %self.queue.queue, error = %e, "Error closing publisher channel");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
