//! AMQP subscriptions

use crate::infrastructure::settings::Settings;
use crate::infrastructure::traits::{Acknowledger, Broker, Subscription};
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use log::{debug, info, warn};
use thiserror::Error;

pub const CONSUMER_TAG: &str = "chat-sync-consumer";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("couldn't open subscription to {queue}: {source}")]
    Connect {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("delivery stream of {queue} failed: {source}")]
    Stream {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("couldn't settle delivery: {0}")]
    Settle(#[source] lapin::Error),

    #[error("subscription to {0} was closed")]
    Closed(String),
}

/// One message pulled from a subscription. Must be settled exactly once.
pub struct Delivery {
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self { body, acker }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(BrokerError::Settle)
    }

    async fn nack(&self) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue: false,
                multiple: false,
            })
            .await
            .map_err(BrokerError::Settle)
    }
}

pub struct AmqpBroker {
    url: String,
    prefetch_count: u16,
}

#[injectable(Broker)]
impl AmqpBroker {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> AmqpBroker {
        AmqpBroker {
            url: settings.rabbit_url.clone(),
            prefetch_count: settings.prefetch_count,
        }
    }
}

impl AmqpBroker {
    async fn open_consumer(
        &self,
        channel: &Channel,
        queue: &str,
    ) -> Result<Consumer, lapin::Error> {
        if self.prefetch_count > 0 {
            channel
                .basic_qos(self.prefetch_count, BasicQosOptions::default())
                .await?;
        }

        let mut arguments = FieldTable::default();
        arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;

        channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let connect_error = |source| BrokerError::Connect {
            queue: queue.to_owned(),
            source,
        };

        let properties = ConnectionProperties::default().with_connection_name(queue.into());
        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(connect_error)?;

        let opened = match connection.create_channel().await {
            Ok(channel) => self
                .open_consumer(&channel, queue)
                .await
                .map(|consumer| (channel, consumer)),
            Err(e) => Err(e),
        };

        match opened {
            Ok((channel, consumer)) => {
                info!("subscribed to {queue}");
                Ok(Box::new(AmqpSubscription {
                    queue: queue.to_owned(),
                    connection,
                    channel,
                    consumer,
                }))
            }
            Err(e) => {
                if let Err(close_err) = connection.close(200, "setup failed").await {
                    debug!("closing half-open connection for {queue}: {close_err}");
                }
                Err(connect_error(e))
            }
        }
    }
}

struct AmqpSubscription {
    queue: String,
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(match next {
            Ok(delivery) => Ok(Delivery::new(
                delivery.data,
                Box::new(LapinAcker(delivery.acker)),
            )),
            Err(source) => Err(BrokerError::Stream {
                queue: self.queue.clone(),
                source,
            }),
        })
    }

    async fn close(self: Box<Self>) {
        let queue = &self.queue;
        if let Err(e) = self
            .channel
            .basic_cancel(CONSUMER_TAG, BasicCancelOptions::default())
            .await
        {
            debug!("cancelling consumer on {queue}: {e}");
        }
        if let Err(e) = self.channel.close(200, "shutting down").await {
            debug!("closing channel on {queue}: {e}");
        }
        if let Err(e) = self.connection.close(200, "shutting down").await {
            warn!("closing connection for {queue}: {e}");
        }
        info!("subscription to {queue} closed");
    }
}
