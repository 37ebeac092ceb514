// ABOUTME: RabbitMQ implementation of the broker traits on top of lapin (AMQP 0-9-1)
// ABOUTME: Maps handshake failures onto unreachable/access-refused so startup can report them precisely

use super::{Broker, BrokerChannel, BrokerConnection, BrokerError, Consumer, Delivery, ExchangeKind};
use crate::config::AmqpSettings;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, ConnectionProperties};
use tracing::debug;

/// Connects to a RabbitMQ (or any AMQP 0-9-1) broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker {
    connection_name: Option<String>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for this connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

fn amqp_uri(settings: &AmqpSettings) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = settings.host.clone();
    uri.authority.port = settings.port;
    uri.authority.userinfo.username = settings.username.clone();
    uri.authority.userinfo.password = settings.password.clone();
    uri.vhost = settings.vhost.clone();
    uri
}

fn handshake_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::IOError(io) => BrokerError::Unreachable(io.to_string()),
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
            ) =>
        {
            BrokerError::AccessRefused(amqp.to_string())
        }
        other => BrokerError::Amqp(other),
    }
}

fn queue_arguments(dead_letter_exchange: Option<&str>) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into()),
        );
    }
    arguments
}

impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self, settings: &AmqpSettings) -> Result<AmqpConnection, BrokerError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = lapin::Connection::connect_uri(amqp_uri(settings), properties)
            .await
            .map_err(handshake_error)?;

        debug!(
            host = %settings.host,
            port = settings.port,
            vhost = %settings.vhost,
            "AMQP handshake complete"
        );

        Ok(AmqpConnection { connection })
    }
}

pub struct AmqpConnection {
    connection: lapin::Connection,
}

impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&mut self) -> Result<AmqpChannel, BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(AmqpChannel { channel })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        // 200 is the AMQP reply code for a normal shutdown.
        self.connection.close(200, "bridge shutting down").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
}

impl BrokerChannel for AmqpChannel {
    type Consumer = AmqpConsumer;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(dead_letter_exchange),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<AmqpConsumer, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(AmqpConsumer { consumer })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        // multiple = false: acknowledge this delivery only.
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishNacked {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }
}

pub struct AmqpConsumer {
    consumer: lapin::Consumer,
}

impl Consumer for AmqpConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        match self.consumer.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(delivery)) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                data: delivery.data,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::{AMQPError, AMQPHardError};

    #[test]
    fn uri_carries_settings() {
        let settings = AmqpSettings {
            host: "rabbit.internal".to_string(),
            port: 5673,
            ..AmqpSettings::default()
        };
        let uri = amqp_uri(&settings);

        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "richmond");
        assert_eq!(uri.vhost, "/richmond");
    }

    #[test]
    fn only_access_refused_counts_as_bad_credentials() {
        let refused = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "ACCESS_REFUSED - Login was refused".into(),
        ));
        assert!(matches!(
            handshake_error(refused),
            BrokerError::AccessRefused(_)
        ));

        let vhost_missing = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED),
            "NOT_ALLOWED - vhost /richmond not found".into(),
        ));
        assert!(matches!(handshake_error(vhost_missing), BrokerError::Amqp(_)));
    }

    #[test]
    fn dead_letter_exchange_becomes_a_queue_argument() {
        assert!(queue_arguments(None).inner().is_empty());

        let arguments = queue_arguments(Some("richmond.dead"));
        assert_eq!(
            arguments.inner().get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("richmond.dead".into()))
        );
    }
}
