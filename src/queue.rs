// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message bus consumption.
//!
//! The worker core only ever touches the narrow [`JobSource`] and
//! [`Delivery`] contract: pull one message, then settle it with exactly
//! one of ack / nack-requeue / nack-drop. [`AmqpJobSource`] implements
//! the contract over an AMQP queue; tests substitute an in-memory
//! source.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from message bus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The bus client reported a protocol or transport failure.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// One message pulled from the bus.
///
/// Settling consumes the delivery, so the exactly-one-terminal-
/// acknowledgment invariant is enforced by the type system.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Raw message payload.
    fn payload(&self) -> &[u8];

    /// Acknowledge successful processing.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Reject the message, optionally returning it to the queue for
    /// redelivery to another worker.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A shared source of job deliveries.
///
/// One source is shared by every processor in the pool; deliveries are
/// exclusive per consumer-tag semantics of the bus.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pull the next delivery. Returns `Ok(None)` once the source is
    /// drained or closed; processors exit their loop on `None`.
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>>;

    /// Stop new deliveries without touching in-flight ones.
    ///
    /// Drain is monotonic: once called, `next` eventually returns
    /// `None` for every processor and never yields a message again.
    async fn drain(&self) -> Result<()>;
}

/// AMQP-backed job source.
pub struct AmqpJobSource {
    channel: Channel,
    consumer: Mutex<lapin::Consumer>,
    consumer_tag: String,
}

impl AmqpJobSource {
    /// Open a consumer on `queue`, declaring it durable if absent.
    ///
    /// Prefetch is bounded by the pool size so the bus never hands this
    /// worker more unacked messages than it has processors.
    pub async fn open(conn: &Connection, queue: &str, prefetch: usize) -> Result<Self> {
        let channel = conn.create_channel().await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_qos(prefetch.min(u16::MAX as usize) as u16, BasicQosOptions::default())
            .await?;

        let consumer_tag = format!("gantry-{}", uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Opened job consumer");

        Ok(Self {
            channel,
            consumer: Mutex::new(consumer),
            consumer_tag,
        })
    }
}

#[async_trait]
impl JobSource for AmqpJobSource {
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Box::new(AmqpDelivery { delivery }))),
            Some(Err(e)) => Err(e.into()),
            // Stream end: consumer cancelled (drain) or connection closed.
            None => Ok(None),
        }
    }

    async fn drain(&self) -> Result<()> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        debug!(consumer_tag = %self.consumer_tag, "Consumer cancelled, draining");
        Ok(())
    }
}

struct AmqpDelivery {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::Other("consumer gone".to_string());
        assert_eq!(err.to_string(), "consumer gone");
    }
}
