// ABOUTME: Ordered bridge startup and the steady-state loop multiplexing deliveries and inbound events
// ABOUTME: Each startup step runs only after the previous one succeeded; failures tear down what was built

use super::consumer::handle_delivery;
use super::error::BridgeError;
use super::publisher::InboundPublisher;
use super::topology::Topology;
use crate::broker::{Broker, BrokerChannel, BrokerConnection, Consumer};
use crate::config::BridgeConfig;
use crate::message::InboundEvent;
use crate::session::{InboundSink, ProtocolSession, SessionConnector};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const CONSUMER_TAG: &str = "ssmi-bridge";

/// How often the loop checks the session when nothing else is happening.
const READINESS_CHECK: Duration = Duration::from_secs(1);

type ChannelOf<N> = <N as BrokerConnection>::Channel;
type ConsumerOf<N> = <ChannelOf<N> as BrokerChannel>::Consumer;

/// A fully started bridge: topology declared, session logged in, consumer
/// registered and the inbound publisher active.
pub struct RunningBridge<N: BrokerConnection, S: ProtocolSession> {
    connection: N,
    channel: ChannelOf<N>,
    consumer: ConsumerOf<N>,
    session: S,
    publisher: InboundPublisher,
    topology: Topology,
}

/// Start the bridge.
///
/// 1. connect to the broker
/// 2. authenticate (part of the AMQP handshake)
/// 3. open a channel
/// 4. declare the topology
/// 5. log in to the SSMI gateway, wired to a not yet active publisher
/// 6. start consuming the send queue
/// 7. activate the publisher
///
/// A failure at any step is returned and everything opened before it is
/// closed again.
pub async fn start<B, C>(
    broker: &B,
    connector: &C,
    config: &BridgeConfig,
) -> Result<RunningBridge<B::Connection, C::Session>, BridgeError>
where
    B: Broker,
    C: SessionConnector,
{
    start_with_backlog(broker, connector, config, &mut VecDeque::new()).await
}

/// Like [`start`], carrying events a previous run could not publish.
///
/// `backlog` is only taken once startup succeeds, so a failed attempt
/// leaves it for the next one.
pub async fn start_with_backlog<B, C>(
    broker: &B,
    connector: &C,
    config: &BridgeConfig,
    backlog: &mut VecDeque<InboundEvent>,
) -> Result<RunningBridge<B::Connection, C::Session>, BridgeError>
where
    B: Broker,
    C: SessionConnector,
{
    let amqp = &config.amqp;
    info!(
        host = %amqp.host,
        port = amqp.port,
        vhost = %amqp.vhost,
        "Connecting to the broker"
    );

    let mut connection = broker.connect(amqp).await.map_err(|e| {
        let err =
            BridgeError::from_connect(&amqp.host, amqp.port, &amqp.username, &amqp.vhost, e);
        error!(host = %amqp.host, port = amqp.port, error = %err, "Broker connection failed");
        err
    })?;
    info!("Connected to the broker and authenticated");

    match establish(&mut connection, connector, config).await {
        Ok((channel, consumer, session, mut publisher, topology)) => {
            publisher.restore(std::mem::take(backlog));
            Ok(RunningBridge {
                connection,
                channel,
                consumer,
                session,
                publisher,
                topology,
            })
        }
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                debug!(error = %close_err, "Broker connection close failed");
            }
            Err(e)
        }
    }
}

#[allow(clippy::type_complexity)]
async fn establish<N, C>(
    connection: &mut N,
    connector: &C,
    config: &BridgeConfig,
) -> Result<
    (
        ChannelOf<N>,
        ConsumerOf<N>,
        C::Session,
        InboundPublisher,
        Topology,
    ),
    BridgeError,
>
where
    N: BrokerConnection,
    C: SessionConnector,
{
    let channel = connection
        .open_channel()
        .await
        .map_err(BridgeError::Channel)?;
    info!("Channel opened");

    let topology = Topology::from_settings(&config.amqp);
    topology
        .declare(&channel)
        .await
        .map_err(BridgeError::Topology)?;

    let (sink, events) = InboundSink::channel();
    let mut publisher = InboundPublisher::new(&topology, events);

    let ssmi = &config.ssmi;
    info!(host = %ssmi.host, port = ssmi.port, "Connecting to SSMI gateway");
    let mut session = connector.connect(ssmi, sink).await?;

    let consumer = match channel.consume(&topology.send_queue, CONSUMER_TAG).await {
        Ok(consumer) => consumer,
        Err(source) => {
            session.close().await;
            return Err(BridgeError::Consume {
                queue: topology.send_queue.clone(),
                source,
            });
        }
    };
    info!(queue = %topology.send_queue, "Registered the consumer");

    publisher.activate();
    info!(
        exchange = %topology.exchange,
        routing_key = %topology.receive_routing_key,
        "Inbound publisher active"
    );

    Ok((channel, consumer, session, publisher, topology))
}

impl<N, S> RunningBridge<N, S>
where
    N: BrokerConnection,
    S: ProtocolSession,
{
    /// Forward deliveries and publish inbound events until something breaks
    /// or `shutdown` flips to true.
    ///
    /// Returns `Ok(())` on shutdown. Any error means the bridge should be
    /// stopped and started again.
    pub async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BridgeError> {
        self.publisher.flush_backlog(&self.channel).await?;

        let mut readiness = tokio::time::interval(READINESS_CHECK);
        info!(queue = %self.topology.send_queue, "Waiting for messages");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        return Ok(());
                    }
                }

                event = self.publisher.recv() => match event {
                    Some(event) => self.publisher.publish(&self.channel, event).await?,
                    None => {
                        warn!("SSMI session stopped reporting events");
                        return Err(BridgeError::SessionUnavailable);
                    }
                },

                delivery = self.consumer.next_delivery() => match delivery {
                    Ok(Some(delivery)) => {
                        handle_delivery(&self.channel, &mut self.session, delivery).await?;
                    }
                    Ok(None) => {
                        let queue = self.topology.send_queue.clone();
                        return Err(BridgeError::ConsumerCancelled(queue));
                    }
                    Err(e) => return Err(BridgeError::Broker(e)),
                },

                _ = readiness.tick() => {
                    if !self.session.is_ready() {
                        warn!("SSMI session is down");
                        return Err(BridgeError::SessionUnavailable);
                    }
                }
            }
        }
    }

    /// Close the session and the broker connection.
    ///
    /// Returns every inbound event that was not published, oldest first.
    pub async fn stop(mut self) -> VecDeque<InboundEvent> {
        self.session.close().await;
        let pending = self.publisher.drain();
        if !pending.is_empty() {
            warn!(count = pending.len(), "Holding unpublished inbound events");
        }

        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "Broker connection close failed");
        }
        info!("Bridge stopped");
        pending
    }
}
