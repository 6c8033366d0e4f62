//! RabbitMQ broker
//!
//! Topology per queue name `Q`:
//! - `queue.messages`: durable direct exchange for immediate delivery
//! - `queue.messages.delayed`: durable `x-delayed-message` exchange honoring
//!   the `x-delay` header (requires the delayed message exchange plugin)
//! - durable queue `Q` bound to both exchanges with routing key `Q`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use crate::broker::{Acknowledger, Broker, BrokerChannel, RawDelivery};
use crate::Result;

pub const EXCHANGE: &str = "queue.messages";
pub const DELAYED_EXCHANGE: &str = "queue.messages.delayed";

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpBroker {
    connection: Arc<Connection>,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        info!("Connected to AMQP broker");
        Ok(Self::new(Arc::new(connection)))
    }

    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close(REPLY_SUCCESS, "shutdown").await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(AmqpChannel { channel }))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .exchange_declare(EXCHANGE, ExchangeKind::Direct, durable_exchange(), FieldTable::default())
            .await?;

        let mut delayed_args = FieldTable::default();
        delayed_args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));
        self.channel
            .exchange_declare(
                DELAYED_EXCHANGE,
                ExchangeKind::Custom("x-delayed-message".to_string()),
                durable_exchange(),
                delayed_args,
            )
            .await?;

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for exchange in [EXCHANGE, DELAYED_EXCHANGE] {
            self.channel
                .queue_bind(queue, exchange, queue, QueueBindOptions::default(), FieldTable::default())
                .await?;
        }

        debug!(queue = %queue, "Declared queue topology");
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        let mut headers = FieldTable::default();
        let exchange = if delay.is_zero() {
            EXCHANGE
        } else {
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            headers.insert("x-delay".into(), AMQPValue::LongLongInt(delay_ms));
            DELAYED_EXCHANGE
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(headers);

        self.channel
            .basic_publish(
                exchange,
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<RawDelivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;

        Ok(message.map(|message| {
            let delivery = message.delivery;
            RawDelivery {
                body: delivery.data,
                acker: Box::new(AmqpAcker {
                    acker: delivery.acker,
                    channel: Some(self.channel.clone()),
                }) as Box<dyn Acknowledger>,
            }
        }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

/// Acknowledges a `basic_get` delivery, then closes the channel it was
/// fetched on. Dropped unacknowledged, it closes the channel so the broker
/// requeues the delivery.
struct AmqpAcker {
    acker: Acker,
    // None once acknowledged
    channel: Option<Channel>,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let acked = this
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| crate::QueueError::Acknowledge(e.to_string()));
        if let Some(channel) = this.channel.take() {
            if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
                debug!(error = %e, "Failed to close channel after ack");
            }
        }
        acked
    }
}

impl Drop for AmqpAcker {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = channel.close(REPLY_SUCCESS, "unacknowledged").await {
                    debug!(error = %e, "Failed to close channel of unacknowledged delivery");
                }
            });
        }
    }
}
