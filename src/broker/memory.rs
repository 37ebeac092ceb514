// ABOUTME: In-process broker with direct-exchange routing, manual acks and an operation journal
// ABOUTME: Lets the bridge run end to end in tests and reports every call made against it

use super::{Broker, BrokerChannel, BrokerConnection, BrokerError, Consumer, Delivery, ExchangeKind};
use crate::config::AmqpSettings;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// One call made against the broker, recorded in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Connect,
    OpenChannel,
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
    },
    DeclareQueue {
        name: String,
        dead_letter_exchange: Option<String>,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
    },
    Ack {
        delivery_tag: u64,
    },
    Reject {
        delivery_tag: u64,
        requeue: bool,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
    },
    Close,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    dead_letter_exchange: Option<String>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct Outstanding {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct State {
    refuse_connections: bool,
    credentials: Option<(String, String)>,
    fail_publishes: bool,
    /// Channels and consumers of a connection missing from here are dead.
    open_connections: HashSet<u64>,
    next_connection_id: u64,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    /// (exchange, routing_key, queue)
    bindings: BTreeSet<(String, String, String)>,
    unacked: HashMap<u64, Outstanding>,
    next_delivery_tag: u64,
    journal: Vec<BrokerOp>,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, data: &[u8]) {
        let fanout = self.exchanges.get(exchange) == Some(&ExchangeKind::Fanout);
        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: routing key names the queue.
            vec![routing_key.to_string()]
        } else {
            self.bindings
                .iter()
                .filter(|(e, k, _)| e == exchange && (fanout || k == routing_key))
                .map(|(_, _, q)| q.clone())
                .collect()
        };

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    data: data.to_vec(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
    }

    fn requeue(&mut self, outstanding: Outstanding) {
        if let Some(queue) = self.queues.get_mut(&outstanding.queue) {
            let mut message = outstanding.message;
            message.redelivered = true;
            queue.ready.push_front(message);
            queue.notify.notify_one();
        }
    }

    /// Drop a rejected delivery, or republish it to its queue's dead-letter
    /// exchange under the original routing key.
    fn discard(&mut self, outstanding: Outstanding) {
        let dead_letter_exchange = self
            .queues
            .get(&outstanding.queue)
            .and_then(|q| q.dead_letter_exchange.clone());
        if let Some(exchange) = dead_letter_exchange {
            let message = outstanding.message;
            self.route(&exchange, &message.routing_key, &message.data);
        }
    }

    /// Return every delivery outstanding on `connection` to its queue.
    fn requeue_connection(&mut self, connection: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, o)| o.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(outstanding) = self.unacked.remove(&tag) {
                self.requeue(outstanding);
            }
        }
    }

    fn check_open(&self, connection: u64) -> Result<(), BrokerError> {
        if self.open_connections.contains(&connection) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

/// Shared handle to an in-process broker.
///
/// Clones share state, so a test can keep one handle to inject messages and
/// inspect the journal while the bridge drives another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse every connection attempt, as a closed port would.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Only accept this username/password pair.
    pub fn require_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        self.lock().credentials = Some((username.into(), password.into()));
    }

    /// Make every publish fail with `ChannelClosed`.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Simulate the connection dropping: every open channel and consumer dies
    /// and outstanding deliveries go back to their queues.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        state.open_connections.clear();
        let outstanding: Vec<Outstanding> = state.unacked.drain().map(|(_, o)| o).collect();
        for o in outstanding {
            state.requeue(o);
        }
        for queue in state.queues.values() {
            queue.notify.notify_one();
        }
    }

    /// Publish as an external producer would. Not recorded in the journal.
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        self.lock().route(exchange, routing_key, payload);
    }

    pub fn journal(&self) -> Vec<BrokerOp> {
        self.lock().journal.clone()
    }

    /// Payloads published by clients to `exchange` with `routing_key`.
    pub fn published(&self, exchange: &str, routing_key: &str) -> Vec<Vec<u8>> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                BrokerOp::Publish {
                    exchange: e,
                    routing_key: k,
                    payload,
                } if e == exchange && k == routing_key => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.iter().cloned().collect()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in `queue`, not counting outstanding deliveries.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out but neither acked nor rejected.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Take the next ready message from `queue` directly, bypassing consumers.
    pub fn take(&self, queue: &str) -> Option<Vec<u8>> {
        self.lock()
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
            .map(|m| m.data)
    }
}

impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, settings: &AmqpSettings) -> Result<MemoryConnection, BrokerError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(BrokerError::Unreachable(format!(
                "connection refused: {}:{}",
                settings.host, settings.port
            )));
        }
        if let Some((username, password)) = &state.credentials {
            if *username != settings.username || *password != settings.password {
                return Err(BrokerError::AccessRefused(format!(
                    "login refused for user {:?}",
                    settings.username
                )));
            }
        }
        state.journal.push(BrokerOp::Connect);
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.open_connections.insert(id);

        Ok(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&mut self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.broker.lock();
        state.check_open(self.id)?;
        state.journal.push(BrokerOp::OpenChannel);

        Ok(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
        })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.journal.push(BrokerOp::Close);
        if state.open_connections.remove(&self.id) {
            state.requeue_connection(self.id);
            for queue in state.queues.values() {
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
}

impl MemoryChannel {
    fn live(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self.broker.lock();
        state.check_open(self.connection)?;
        Ok(state)
    }
}

impl BrokerChannel for MemoryChannel {
    type Consumer = MemoryConsumer;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.live()?;
        state.journal.push(BrokerOp::DeclareExchange {
            name: name.to_string(),
            kind,
        });

        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange {name:?} already declared as {}",
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<(), BrokerError> {
        let mut state = self.live()?;
        let dead_letter_exchange = dead_letter_exchange.map(str::to_string);
        state.journal.push(BrokerOp::DeclareQueue {
            name: name.to_string(),
            dead_letter_exchange: dead_letter_exchange.clone(),
        });

        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange != dead_letter_exchange => {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue {name:?} already declared with dead-letter exchange {:?}",
                    existing.dead_letter_exchange
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        dead_letter_exchange,
                        ..QueueState::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.live()?;
        state.journal.push(BrokerOp::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }
        state.bindings.insert((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<MemoryConsumer, BrokerError> {
        let mut state = self.live()?;
        state.journal.push(BrokerOp::Consume {
            queue: queue.to_string(),
        });

        let notify = state
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            })?;

        Ok(MemoryConsumer {
            broker: self.broker.clone(),
            connection: self.connection,
            queue: queue.to_string(),
            notify,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.live()?;
        state.journal.push(BrokerOp::Ack { delivery_tag });
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.live()?;
        state.journal.push(BrokerOp::Reject {
            delivery_tag,
            requeue,
        });
        let outstanding = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if requeue {
            state.requeue(outstanding);
        } else {
            state.discard(outstanding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.live()?;
        if state.fail_publishes {
            return Err(BrokerError::ChannelClosed);
        }
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }
        state.journal.push(BrokerOp::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });
        state.route(exchange, routing_key, payload);
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    connection: u64,
    queue: String,
    notify: Arc<Notify>,
}

impl Consumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            {
                let mut state = self.broker.lock();
                state.check_open(self.connection)?;

                let message = state
                    .queues
                    .get_mut(&self.queue)
                    .and_then(|q| q.ready.pop_front());

                if let Some(message) = message {
                    state.next_delivery_tag += 1;
                    let delivery_tag = state.next_delivery_tag;
                    let delivery = Delivery {
                        delivery_tag,
                        redelivered: message.redelivered,
                        data: message.data.clone(),
                    };
                    state.unacked.insert(
                        delivery_tag,
                        Outstanding {
                            connection: self.connection,
                            queue: self.queue.clone(),
                            message,
                        },
                    );
                    return Ok(Some(delivery));
                }
            }

            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> MemoryChannel {
        let mut connection = broker.connect(&AmqpSettings::default()).await.unwrap();
        connection.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_key() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;

        channel.declare_exchange("ex", ExchangeKind::Direct).await.unwrap();
        channel.declare_queue("a", None).await.unwrap();
        channel.declare_queue("b", None).await.unwrap();
        channel.bind_queue("a", "ex", "key.a").await.unwrap();
        channel.bind_queue("b", "ex", "key.b").await.unwrap();

        channel.publish("ex", "key.a", b"one").await.unwrap();

        assert_eq!(broker.queue_depth("a"), 1);
        assert_eq!(broker.queue_depth("b"), 0);
    }

    #[tokio::test]
    async fn rejected_with_requeue_is_redelivered_first() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", None).await.unwrap();
        broker.inject("", "q", b"first");
        broker.inject("", "q", b"second");

        let mut consumer = channel.consume("q", "test").await.unwrap();
        let first = consumer.next_delivery().await.unwrap().unwrap();
        channel.reject(first.delivery_tag, true).await.unwrap();

        let again = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.data, b"first");
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, first.delivery_tag);
    }

    #[tokio::test]
    async fn double_ack_is_an_error() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", None).await.unwrap();
        broker.inject("", "q", b"x");

        let mut consumer = channel.consume("q", "test").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert!(matches!(
            channel.ack(delivery.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", None).await.unwrap();
        let mut consumer = channel.consume("q", "test").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            producer.inject("", "q", b"late");
        });

        let wait = std::time::Duration::from_secs(2);
        let delivery = tokio::time::timeout(wait, consumer.next_delivery())
            .await
            .expect("consumer never woke")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.data, b"late");
    }

    #[tokio::test]
    async fn dropped_connection_requeues_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", None).await.unwrap();
        broker.inject("", "q", b"x");

        let mut consumer = channel.consume("q", "test").await.unwrap();
        consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count(), 1);

        broker.drop_connections();

        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth("q"), 1);
        assert!(matches!(
            consumer.next_delivery().await,
            Err(BrokerError::ChannelClosed)
        ));
        assert!(matches!(
            channel.declare_queue("q", None).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn closing_a_connection_requeues_its_deliveries() {
        let broker = MemoryBroker::new();
        let mut connection = broker.connect(&AmqpSettings::default()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.declare_queue("q", None).await.unwrap();
        broker.inject("", "q", b"x");

        let mut consumer = channel.consume("q", "test").await.unwrap();
        consumer.next_delivery().await.unwrap().unwrap();

        let other = self::channel(&broker).await;
        broker.inject("", "q", b"y");
        let mut other_consumer = other.consume("q", "test").await.unwrap();
        other_consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count(), 2);

        connection.close().await.unwrap();

        assert_eq!(broker.unacked_count(), 1);
        assert_eq!(broker.take("q"), Some(b"x".to_vec()));
        assert!(matches!(
            channel.ack(1).await,
            Err(BrokerError::ChannelClosed)
        ));
        assert!(matches!(
            consumer.next_delivery().await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn rejected_without_requeue_is_dead_lettered() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_exchange("dlx", ExchangeKind::Fanout).await.unwrap();
        channel.declare_queue("dead", None).await.unwrap();
        channel.bind_queue("dead", "dlx", "").await.unwrap();
        channel.declare_queue("q", Some("dlx")).await.unwrap();
        broker.inject("", "q", b"poison");

        let mut consumer = channel.consume("q", "test").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.take("dead"), Some(b"poison".to_vec()));
    }

    #[tokio::test]
    async fn rejected_without_dead_letter_exchange_is_dropped() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", None).await.unwrap();
        broker.inject("", "q", b"gone");

        let mut consumer = channel.consume("q", "test").await.unwrap();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn redeclaring_a_queue_with_other_arguments_fails() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue("q", None).await.unwrap();

        assert!(matches!(
            channel.declare_queue("q", Some("dlx")).await,
            Err(BrokerError::PreconditionFailed(_))
        ));
        channel.declare_queue("q", None).await.unwrap();
    }

    #[tokio::test]
    async fn credentials_are_checked() {
        let broker = MemoryBroker::new();
        broker.require_credentials("richmond", "secret");

        let result = broker.connect(&AmqpSettings::default()).await;
        assert!(matches!(result, Err(BrokerError::AccessRefused(_))));
        assert!(broker.journal().is_empty());
    }
}
