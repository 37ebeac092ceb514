// ABOUTME: Exchange, queue and binding layout shared by the bridge and the applications it serves
// ABOUTME: Declared in a fixed order on every start; every step is idempotent on the broker side

use crate::broker::{BrokerChannel, BrokerError, ExchangeKind};
use crate::config::AmqpSettings;
use tracing::info;

/// Names the bridge consumes from and publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub send_queue: String,
    pub send_routing_key: String,
    pub receive_queue: String,
    pub receive_routing_key: String,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_queue: String,
}

impl Topology {
    pub fn from_settings(settings: &AmqpSettings) -> Topology {
        Topology {
            exchange: settings.exchange.clone(),
            send_queue: settings.send_queue.clone(),
            send_routing_key: settings.send_routing_key.clone(),
            receive_queue: settings.receive_queue.clone(),
            receive_routing_key: settings.receive_routing_key.clone(),
            dead_letter_exchange: settings.dead_letter_exchange.clone(),
            dead_letter_queue: settings.dead_letter_queue.clone(),
        }
    }

    /// Declare the direct exchange, both durable queues and their bindings.
    ///
    /// Order: exchange, send queue, receive queue, send binding, receive
    /// binding. Each step waits for the broker before the next is issued.
    /// When a dead-letter exchange is configured the send queue names it, and
    /// the fanout exchange, its queue and their binding are declared last.
    pub async fn declare<C: BrokerChannel>(&self, channel: &C) -> Result<(), BrokerError> {
        channel
            .declare_exchange(&self.exchange, ExchangeKind::Direct)
            .await?;
        info!(exchange = %self.exchange, "Declared exchange");

        channel
            .declare_queue(&self.send_queue, self.dead_letter_exchange.as_deref())
            .await?;
        info!(queue = %self.send_queue, "Declared send queue");

        channel.declare_queue(&self.receive_queue, None).await?;
        info!(queue = %self.receive_queue, "Declared receive queue");

        channel
            .bind_queue(&self.send_queue, &self.exchange, &self.send_routing_key)
            .await?;
        info!(
            "Bound {} to exchange {} with routing key {}",
            self.send_queue, self.exchange, self.send_routing_key
        );

        channel
            .bind_queue(
                &self.receive_queue,
                &self.exchange,
                &self.receive_routing_key,
            )
            .await?;
        info!(
            "Bound {} to exchange {} with routing key {}",
            self.receive_queue, self.exchange, self.receive_routing_key
        );

        if let Some(dead_letter_exchange) = &self.dead_letter_exchange {
            channel
                .declare_exchange(dead_letter_exchange, ExchangeKind::Fanout)
                .await?;
            channel.declare_queue(&self.dead_letter_queue, None).await?;
            channel
                .bind_queue(&self.dead_letter_queue, dead_letter_exchange, "")
                .await?;
            info!(
                exchange = %dead_letter_exchange,
                queue = %self.dead_letter_queue,
                "Declared dead-letter exchange"
            );
        }

        Ok(())
    }
}
